//! Periodic repair of the successor link.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No successor yet, nothing to ask.
    Idle,
    Unchanged,
    SuccessorChanged,
    /// The successor could not be reached.
    Failed { consecutive: u32 },
    /// Too many failures in a row; the next successor took over.
    FellBack,
}

pub struct Stabilizer {
    peer: Arc<Peer>,
    failures: u32,
}

impl Stabilizer {
    pub fn new(peer: Arc<Peer>) -> Self {
        Self { peer, failures: 0 }
    }

    /// One pass. Errors never escape; they only count towards the fallback.
    pub async fn tick(&mut self) -> Tick {
        if self.peer.successor().await.is_none() {
            return Tick::Idle;
        }
        match self.peer.stabilize().await {
            Ok(changed) => {
                self.failures = 0;
                if !changed {
                    return Tick::Unchanged;
                }
                let table = self.peer.ring_state().await.fingers.print();
                debug!(peer = %self.peer.id(), "finger table\n{table}");
                Tick::SuccessorChanged
            }
            Err(e) => {
                self.failures += 1;
                warn!(peer = %self.peer.id(), error = %e, failures = self.failures, "stabilization failed");
                if self.failures >= self.peer.config().max_stabilize_failures
                    && self.peer.promote_next_successor().await
                {
                    self.failures = 0;
                    return Tick::FellBack;
                }
                Tick::Failed { consecutive: self.failures }
            }
        }
    }

    /// Run `tick` every stabilize interval until the task is aborted.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.peer.config().stabilize_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let outcome = self.tick().await;
                debug!(peer = %self.peer.id(), ?outcome, "stabilize tick");
            }
        })
    }
}
