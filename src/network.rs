//! Message envelopes and the transport collaborator
//!
//! Nodes exchange JSON envelopes `{from, type, message}`. The node core only
//! needs broadcast, addressed send and a stream of inbound bytes; the
//! in-process [`LocalNetwork`] provides exactly that for tests and for the
//! standalone binary.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Block,
    Transaction,
    RequestHighest,
    Highest,
    RequestChain,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Block(Box<Block>),
    Transaction(Box<Transaction>),
    RequestHighest,
    /// Height of the sender's highest block, -1 when it has none.
    Highest(i64),
    RequestChain,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Block(_) => MessageKind::Block,
            Message::Transaction(_) => MessageKind::Transaction,
            Message::RequestHighest => MessageKind::RequestHighest,
            Message::Highest(_) => MessageKind::Highest,
            Message::RequestChain => MessageKind::RequestChain,
        }
    }

    fn body(&self) -> Result<Value, ChainError> {
        Ok(match self {
            Message::Block(block) => serde_json::to_value(block)?,
            Message::Transaction(transaction) => serde_json::to_value(transaction)?,
            Message::Highest(height) => Value::from(*height),
            Message::RequestHighest | Message::RequestChain => Value::Null,
        })
    }
}

/// The wire form of every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub message: Value,
}

impl Envelope {
    pub fn new(from: impl Into<String>, message: &Message) -> Result<Self, ChainError> {
        Ok(Envelope {
            from: from.into(),
            kind: message.kind(),
            message: message.body()?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decodes the body according to `kind`.
    pub fn into_message(self) -> Result<Message, ChainError> {
        Ok(match self.kind {
            MessageKind::Block => Message::Block(Box::new(serde_json::from_value(self.message)?)),
            MessageKind::Transaction => {
                Message::Transaction(Box::new(serde_json::from_value(self.message)?))
            }
            MessageKind::RequestHighest => Message::RequestHighest,
            MessageKind::Highest => Message::Highest(self.message.as_i64().ok_or_else(|| {
                ChainError::SerializationError("highest must carry an integer height".to_string())
            })?),
            MessageKind::RequestChain => Message::RequestChain,
        })
    }
}

/// Publish/subscribe plus addressed delivery.
pub trait Transport: Send + Sync {
    /// The name other nodes address this one by.
    fn identity(&self) -> &str;

    /// Sends to every other node.
    fn broadcast(&self, message: &Message) -> Result<(), ChainError>;

    /// Sends to one node.
    fn send(&self, recipient: &str, message: &Message) -> Result<(), ChainError>;
}

type Peers = HashMap<String, UnboundedSender<Vec<u8>>>;

/// An in-process network. Every joined node gets a receiver of raw envelope
/// bytes; delivery is unbounded and in order per sender.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    peers: Arc<Mutex<Peers>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `identity`, replacing any earlier node of the same name.
    pub fn join(&self, identity: impl Into<String>) -> (LocalTransport, UnboundedReceiver<Vec<u8>>) {
        let identity = identity.into();
        let (tx, rx) = unbounded_channel();
        self.peers.lock().insert(identity.clone(), tx);
        debug!("{} joined the local network", identity);
        (
            LocalTransport {
                identity,
                peers: Arc::clone(&self.peers),
            },
            rx,
        )
    }

    pub fn leave(&self, identity: &str) {
        self.peers.lock().remove(identity);
    }

    /// Delivers raw bytes to `recipient`, bypassing envelope encoding.
    pub fn inject(&self, recipient: &str, bytes: Vec<u8>) -> Result<(), ChainError> {
        let peers = self.peers.lock();
        let peer = peers
            .get(recipient)
            .ok_or_else(|| ChainError::NetworkError(format!("unknown node {}", recipient)))?;
        peer.send(bytes)
            .map_err(|_| ChainError::NetworkError(format!("{} is not listening", recipient)))
    }

    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.peers.lock().keys().cloned().collect();
        members.sort();
        members
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    identity: String,
    peers: Arc<Mutex<Peers>>,
}

impl LocalTransport {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, ChainError> {
        Envelope::new(&self.identity, message)?.encode()
    }
}

impl Transport for LocalTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn broadcast(&self, message: &Message) -> Result<(), ChainError> {
        let bytes = self.encode(message)?;
        let mut peers = self.peers.lock();
        // receivers that went away are forgotten
        peers.retain(|name, peer| name == &self.identity || !peer.is_closed());
        for (name, peer) in peers.iter() {
            if name != &self.identity {
                trace!("{} -> {}: {:?}", self.identity, name, message.kind());
                let _ = peer.send(bytes.clone());
            }
        }
        Ok(())
    }

    fn send(&self, recipient: &str, message: &Message) -> Result<(), ChainError> {
        let bytes = self.encode(message)?;
        let peers = self.peers.lock();
        let peer = peers
            .get(recipient)
            .ok_or_else(|| ChainError::NetworkError(format!("unknown node {}", recipient)))?;
        trace!("{} -> {}: {:?}", self.identity, recipient, message.kind());
        peer.send(bytes)
            .map_err(|_| ChainError::NetworkError(format!("{} is not listening", recipient)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn receive(rx: &mut UnboundedReceiver<Vec<u8>>) -> Envelope {
        Envelope::decode(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new("alice", &Message::Highest(4)).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"from": "alice", "type": "highest", "message": 4}));

        let request = Envelope::new("bob", &Message::RequestChain).unwrap();
        assert_eq!(serde_json::to_value(&request).unwrap()["type"], json!("request_chain"));
    }

    #[test]
    fn test_envelope_decodes_bodies() {
        let bytes = br#"{"from":"x","type":"transaction","message":{"splits":[]}}"#;
        let message = Envelope::decode(bytes).unwrap().into_message().unwrap();
        assert!(matches!(message, Message::Transaction(_)));

        let bad = br#"{"from":"x","type":"highest","message":"tall"}"#;
        assert!(Envelope::decode(bad).unwrap().into_message().is_err());
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"from":"x","type":"gossip"}"#).is_err());
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let network = LocalNetwork::new();
        let (alice, mut alice_rx) = network.join("alice");
        let (_bob, mut bob_rx) = network.join("bob");
        let (_carol, mut carol_rx) = network.join("carol");

        alice.broadcast(&Message::RequestHighest).unwrap();

        assert_eq!(receive(&mut bob_rx).kind, MessageKind::RequestHighest);
        assert_eq!(receive(&mut carol_rx).from, "alice");
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_is_addressed() {
        let network = LocalNetwork::new();
        let (alice, _alice_rx) = network.join("alice");
        let (_bob, mut bob_rx) = network.join("bob");
        let (_carol, mut carol_rx) = network.join("carol");

        alice.send("bob", &Message::Highest(-1)).unwrap();
        assert_eq!(receive(&mut bob_rx).message, json!(-1));
        assert!(carol_rx.try_recv().is_err());
        assert!(alice.send("dave", &Message::RequestChain).is_err());
    }

    #[test]
    fn test_closed_receivers_are_dropped() {
        let network = LocalNetwork::new();
        let (alice, _alice_rx) = network.join("alice");
        let (_bob, bob_rx) = network.join("bob");
        drop(bob_rx);

        alice.broadcast(&Message::RequestHighest).unwrap();
        assert_eq!(network.members(), vec!["alice".to_string()]);
    }
}
