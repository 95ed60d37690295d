use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use super::{next_id, RefId};

/// Error reported by the client while settling a future.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("client error: {0}")]
pub struct RemoteError(pub String);

pub type Settlement = Result<Value, RemoteError>;

/// Pending futures the client settles through the `post` route.
#[derive(Debug, Default)]
pub struct FutureRegistry {
    pending: HashMap<RefId, oneshot::Sender<Settlement>>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> (RefId, oneshot::Receiver<Settlement>) {
        let (tx, rx) = oneshot::channel();
        let id = next_id();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Settle with a value. Returns `false` when the id is unknown or was
    /// already settled.
    pub fn resolve(&mut self, id: RefId, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    pub fn reject(&mut self, id: RefId, error: impl Into<String>) -> bool {
        self.settle(id, Err(RemoteError(error.into())))
    }

    fn settle(&mut self, id: RefId, outcome: Settlement) -> bool {
        match self.pending.remove(&id) {
            // A dropped receiver still counts as settled: the id is gone.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
