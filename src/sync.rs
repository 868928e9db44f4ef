//! Chain synchronization bookkeeping
//!
//! Peers announce the height of their highest block. The best announcement
//! above our own height is remembered, and once no better one has arrived
//! for the debounce window the node asks that peer for its chain.

use std::time::{Duration, Instant};
use tracing::debug;

/// The best height report seen so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightReport {
    pub peer: String,
    pub height: i64,
    pub received: Instant,
}

#[derive(Debug, Clone)]
pub struct ChainSync {
    debounce: Duration,
    best: Option<HeightReport>,
}

impl ChainSync {
    pub fn new(debounce: Duration) -> Self {
        ChainSync {
            debounce,
            best: None,
        }
    }

    pub fn best(&self) -> Option<&HeightReport> {
        self.best.as_ref()
    }

    /// Records a peer's height. Reports at or below our height, or below the
    /// best report so far, are ignored. A better report restarts the window.
    pub fn report(&mut self, peer: &str, height: i64, my_height: i64, now: Instant) -> bool {
        if height <= my_height {
            return false;
        }
        if let Some(best) = &self.best {
            if height <= best.height {
                return false;
            }
        }

        debug!("{} reports height {}", peer, height);
        self.best = Some(HeightReport {
            peer: peer.to_string(),
            height,
            received: now,
        });
        true
    }

    /// When the pending chain request becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.best.as_ref().map(|b| b.received + self.debounce)
    }

    /// Takes the peer to request the chain from, if the window has passed.
    /// A report we have caught up with in the meantime is dropped.
    pub fn take_due(&mut self, my_height: i64, now: Instant) -> Option<String> {
        let best = self.best.as_ref()?;
        if best.height <= my_height {
            self.best = None;
            return None;
        }
        if now < best.received + self.debounce {
            return None;
        }
        self.best.take().map(|b| b.peer)
    }
}
