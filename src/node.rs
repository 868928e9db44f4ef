//! The BYOB node
//!
//! One task owns the chain store, the mempool and the block being mined.
//! Inbound messages, solver answers and the chain sync timer are all turned
//! into events and handled one at a time on that task.

use crate::blockchain::{validate_block_deep, Accounts, Block, ChainStore, ParentRef};
use crate::config::{ChainParams, Config};
use crate::crypto::abbreviate;
use crate::error::ChainError;
use crate::keystore::KeyStore;
use crate::mempool::Mempool;
use crate::miner::{Compliment, Problem, SolveTicket, Solver};
use crate::network::{Envelope, Message, Transport};
use crate::persistence::{restore_chain, Persistence};
use crate::sync::ChainSync;
use crate::transaction::{exclude_invalid_transactions, validate_transaction, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOptions {
    pub mining: bool,
    pub sync_debounce: Duration,
    pub prune_depth: u64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for NodeOptions {
    fn from(config: &Config) -> Self {
        NodeOptions {
            mining: config.node.mining,
            sync_debounce: Duration::from_millis(config.node.sync_debounce_ms),
            prune_depth: config.node.prune_depth,
        }
    }
}

enum Event {
    Inbound(Vec<u8>),
    Solved(Problem, Option<Compliment>),
    SyncDue,
    Shutdown,
}

pub struct Node {
    params: ChainParams,
    options: NodeOptions,
    store: ChainStore,
    mempool: Mempool,
    candidate: Option<Block>,
    ticket: Option<SolveTicket>,
    solver: Solver,
    keystore: Arc<dyn KeyStore>,
    transport: Box<dyn Transport>,
    persistence: Box<dyn Persistence>,
    sync: ChainSync,
    height_tx: watch::Sender<i64>,
}

impl Node {
    /// Restores the persisted chain and makes sure there is a key to mine with.
    pub fn new(
        params: ChainParams,
        options: NodeOptions,
        keystore: Arc<dyn KeyStore>,
        transport: Box<dyn Transport>,
        persistence: Box<dyn Persistence>,
    ) -> Result<Self, ChainError> {
        if keystore.is_empty() {
            info!("Generating a key pair");
            let public = keystore.generate_key()?;
            info!("Generated {}", abbreviate(&public));
        }

        let mut store = ChainStore::new(params.block_reward);
        restore_chain(persistence.as_ref(), &mut store)?;

        let height = store.highest().map_or(-1, |s| s.height() as i64);
        let (height_tx, _) = watch::channel(height);

        Ok(Node {
            params,
            options,
            store,
            mempool: Mempool::new(),
            candidate: None,
            ticket: None,
            solver: Solver::new()?,
            keystore,
            transport,
            persistence,
            sync: ChainSync::new(options.sync_debounce),
            height_tx,
        })
    }

    pub fn identity(&self) -> &str {
        self.transport.identity()
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn candidate(&self) -> Option<&Block> {
        self.candidate.as_ref()
    }

    /// Height of the highest block, -1 for an empty chain.
    pub fn height(&self) -> i64 {
        self.store.highest().map_or(-1, |s| s.height() as i64)
    }

    /// Follows the height of the highest block.
    pub fn subscribe_height(&self) -> watch::Receiver<i64> {
        self.height_tx.subscribe()
    }

    fn highest_accounts(&mut self) -> Result<Accounts, ChainError> {
        match self.store.highest().map(|s| s.hash().to_string()) {
            Some(hash) => self.store.accounts(&hash),
            None => Ok(Accounts::new()),
        }
    }

    /// Asks the network for heights and starts mining.
    pub fn start(&mut self) {
        if let Err(e) = self.transport.broadcast(&Message::RequestHighest) {
            warn!("Failed to request highest blocks: {}", e);
        }
        self.mine();
    }

    /// Runs until `shutdown` flips or the inbound stream ends, then hands the
    /// node back.
    pub async fn run(
        mut self,
        mut inbound: UnboundedReceiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Node {
        self.start();

        loop {
            let due = self.sync.deadline().map(tokio::time::Instant::from_std);
            let event = tokio::select! {
                bytes = inbound.recv() => match bytes {
                    Some(bytes) => Event::Inbound(bytes),
                    None => Event::Shutdown,
                },
                (problem, compliment) = next_solution(&mut self.ticket) => Event::Solved(problem, compliment),
                _ = tokio::time::sleep_until(due.unwrap_or_else(tokio::time::Instant::now)), if due.is_some() => Event::SyncDue,
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Inbound(bytes) => self.handle(&bytes),
                Event::Solved(problem, compliment) => {
                    self.ticket = None;
                    self.on_solution(problem, compliment);
                }
                Event::SyncDue => self.request_chain_if_due(),
                Event::Shutdown => break,
            }
        }

        info!("Node {} stopping at height {}", abbreviate(self.identity()), self.height());
        self
    }

    /// Handles one inbound envelope. Malformed envelopes are dropped.
    pub fn handle(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope: {}", e);
                return;
            }
        };
        if envelope.from == self.identity() {
            return;
        }

        let from = envelope.from.clone();
        let message = match envelope.into_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", abbreviate(&from), e);
                return;
            }
        };

        match message {
            Message::Block(block) => {
                let _ = self.receive_block(*block, Some(&from));
            }
            Message::Transaction(transaction) => {
                let _ = self.receive_transaction(*transaction);
            }
            Message::RequestHighest => self.reply_with_highest(&from),
            Message::Highest(height) => self.receive_highest(&from, height),
            Message::RequestChain => self.reply_with_chain(&from),
        }
    }

    /// Adds a transaction to the pool if it is well formed and the pool with
    /// it still applies to the highest block's accounts. Returns whether the
    /// pool changed.
    pub fn receive_transaction(&mut self, transaction: Transaction) -> Result<bool, Vec<String>> {
        let label = transaction.label();
        let errors = validate_transaction(&transaction);
        if !errors.is_empty() {
            log_rejection("transaction", &label, &errors);
            return Err(errors);
        }

        let accounts = self.highest_accounts().map_err(|e| vec![e.to_string()])?;
        match self.mempool.add(transaction, &accounts) {
            Ok(true) => {
                info!("Received transaction {}", label);
                // the pool changed, so mine a new candidate
                self.mine();
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(errors) => {
                log_rejection("transaction", &label, &errors);
                Err(errors)
            }
        }
    }

    /// Validates and stores a block. Returns whether it was new.
    ///
    /// A block whose parent is unknown makes the node ask `from` for its chain.
    pub fn receive_block(&mut self, block: Block, from: Option<&str>) -> Result<bool, Vec<String>> {
        let Some(hash) = block.hash.clone() else {
            let errors = vec!["hash is required".to_string()];
            log_rejection("block", "<na>", &errors);
            return Err(errors);
        };
        if self.store.contains(&hash) {
            return Ok(false);
        }
        let label = block.label();

        let parent_known = block
            .parent
            .as_deref()
            .is_some_and(|p| self.store.contains(p));
        let parent_accounts = match block.parent.as_deref() {
            Some(parent) if parent_known => {
                Some(self.store.accounts(parent).map_err(|e| vec![e.to_string()])?)
            }
            _ => None,
        };
        let parent = match (block.parent.as_deref(), &parent_accounts) {
            (Some(parent), Some(accounts)) => self.store.get(parent).map(|stored| ParentRef {
                block: &stored.block,
                accounts,
            }),
            _ => None,
        };

        let errors = validate_block_deep(&block, parent, &self.params.target);
        if !errors.is_empty() {
            log_rejection("block", &label, &errors);
            if block.parent.is_some() && !parent_known {
                if let Some(from) = from {
                    info!("Requesting chain from {} for orphan {}", abbreviate(from), label);
                    if let Err(e) = self.transport.send(from, &Message::RequestChain) {
                        warn!("Failed to request chain: {}", e);
                    }
                }
            }
            return Err(errors);
        }

        let stored = match self.store.store(block) {
            Ok(stored) => stored.clone(),
            Err(e) => {
                error!("Failed to store block {}: {}", label, e);
                return Err(vec![e.to_string()]);
            }
        };
        if let Err(e) = self.persistence.save_block(&stored) {
            error!("Failed to persist block {}: {}", label, e);
        }
        info!("Received block {}", label);

        let is_highest = self.store.highest().map(|s| s.hash()) == Some(hash.as_str());
        if is_highest {
            info!("{} is the new highest block", label);
            self.mempool.remove_included(&stored.block.transactions);
            if let Some(accounts) = &stored.accounts {
                self.mempool.retain_valid(accounts);
            }
            self.prune();
            self.height_tx.send_replace(stored.height() as i64);
            self.mine();
        }

        Ok(true)
    }

    fn prune(&mut self) {
        if self.options.prune_depth == 0 {
            return;
        }
        let removed = self.store.prune_forks(self.options.prune_depth);
        if removed.is_empty() {
            return;
        }
        let hashes: Vec<String> = removed.iter().map(|s| s.hash().to_string()).collect();
        info!("Pruned {} blocks from abandoned forks", hashes.len());
        if let Err(e) = self.persistence.remove_blocks(&hashes) {
            error!("Failed to remove pruned blocks: {}", e);
        }
    }

    fn reply_with_highest(&mut self, from: &str) {
        let height = self.height();
        debug!("Sending highest block of {} to {}", height, abbreviate(from));
        if let Err(e) = self.transport.send(from, &Message::Highest(height)) {
            warn!("Failed to reply with highest block: {}", e);
        }
    }

    fn reply_with_chain(&mut self, from: &str) {
        let Some(highest) = self.store.highest() else {
            return;
        };
        let chain = match self.store.chain_to(highest.hash()) {
            Ok(chain) => chain,
            Err(e) => {
                error!("Failed to walk the chain: {}", e);
                return;
            }
        };

        info!("Sending {} blocks to {}", chain.len(), abbreviate(from));
        for stored in chain {
            let message = Message::Block(Box::new(stored.block.clone()));
            if let Err(e) = self.transport.send(from, &message) {
                warn!("Failed to send chain: {}", e);
                return;
            }
        }
    }

    fn receive_highest(&mut self, from: &str, height: i64) {
        let my_height = self.height();
        if self.sync.report(from, height, my_height, Instant::now()) {
            debug!("Received highest block report of {} from {}", height, abbreviate(from));
        }
    }

    fn request_chain_if_due(&mut self) {
        let my_height = self.height();
        if let Some(peer) = self.sync.take_due(my_height, Instant::now()) {
            info!("Sending chain request to {}", abbreviate(&peer));
            if let Err(e) = self.transport.send(&peer, &Message::RequestChain) {
                warn!("Failed to request chain: {}", e);
            }
        }
    }

    /// Builds the block to mine on top of the highest block.
    fn assemble_candidate(&mut self) -> Result<Block, ChainError> {
        let highest = self
            .store
            .highest()
            .map(|s| (s.hash().to_string(), s.height()));
        let accounts = self.highest_accounts()?;

        let (height, parent) = match highest {
            Some((hash, height)) => (height + 1, Some(hash)),
            None => (0, None),
        };
        let transactions = if parent.is_some() {
            exclude_invalid_transactions(self.mempool.transactions(), &accounts)
        } else {
            Vec::new()
        };

        let keys = self.keystore.public_keys();
        if keys.is_empty() {
            return Err(ChainError::ConfigError("The key store holds no keys to author blocks with".to_string()));
        }
        let author = keys[(height % keys.len() as u64) as usize].clone();

        Block::new(transactions, height, parent, author)
    }

    /// Replaces the candidate and asks the solver for it. The previous
    /// request is superseded.
    pub fn mine(&mut self) {
        if !self.options.mining {
            return;
        }

        let candidate = match self.assemble_candidate() {
            Ok(candidate) => candidate,
            Err(e) => {
                error!("Failed to assemble a block: {}", e);
                return;
            }
        };
        let hash = match candidate.hash_bytes() {
            Ok(hash) => hash,
            Err(e) => {
                error!("Candidate block has no usable hash: {}", e);
                return;
            }
        };

        debug!("Mining for block {}", candidate.label());
        let ticket = match self.solver.solve(hash, self.params.target) {
            Ok(ticket) => Ok(ticket),
            Err(e) => {
                warn!("Solver failed ({}), restarting it", e);
                self.solver
                    .restart()
                    .and_then(|_| self.solver.solve(hash, self.params.target))
            }
        };

        match ticket {
            Ok(ticket) => {
                self.candidate = Some(candidate);
                self.ticket = Some(ticket);
            }
            Err(e) => error!("Unable to mine: {}", e),
        }
    }

    /// Submits the candidate if the solution still belongs to it.
    fn on_solution(&mut self, problem: Problem, compliment: Option<Compliment>) {
        let Some(compliment) = compliment else {
            return;
        };
        let current = self.candidate.as_ref().and_then(|c| c.hash_bytes().ok());
        if current != Some(problem.hash) {
            debug!("Discarding solution for a stale candidate");
            self.mine();
            return;
        }

        info!("Block solution found");
        if let Err(e) = self.submit_block(&compliment) {
            error!("Failed to submit block: {}", e);
            self.mine();
        }
    }

    /// Signs the candidate with `compliment`, stores it and broadcasts it.
    pub fn submit_block(&mut self, compliment: &Compliment) -> Result<(), ChainError> {
        let candidate = self
            .candidate
            .take()
            .ok_or_else(|| ChainError::InvalidBlock("no block is being mined".to_string()))?;
        let author = candidate
            .author
            .clone()
            .ok_or_else(|| ChainError::InvalidBlock("author is required".to_string()))?;

        let signer = self.keystore.signer(&[author])?;
        let block = candidate.finalize(compliment, &signer)?;

        match self.receive_block(block.clone(), None) {
            Ok(_) => {
                debug!("Broadcasting signed block {}", block.label());
                self.transport.broadcast(&Message::Block(Box::new(block)))
            }
            Err(errors) => Err(ChainError::InvalidBlock(errors.join(". "))),
        }
    }
}

async fn next_solution(ticket: &mut Option<SolveTicket>) -> (Problem, Option<Compliment>) {
    match ticket.as_mut() {
        Some(ticket) => {
            let problem = ticket.problem;
            let compliment = ticket.await;
            (problem, compliment)
        }
        None => std::future::pending().await,
    }
}

fn log_rejection(kind: &str, label: &str, errors: &[String]) {
    warn!("There were problems with the received {} {}:", kind, label);
    for e in errors {
        warn!("  {}", e);
    }
}
