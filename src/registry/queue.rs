use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use super::{next_id, RefError, RefId};

/// Streams the client feeds through the `queue` route.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: HashMap<RefId, mpsc::UnboundedSender<Value>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&mut self) -> (RefId, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = next_id();
        self.queues.insert(id, tx);
        (id, rx)
    }

    /// Push a value. Queues whose receiver is gone are forgotten and
    /// reported as missing.
    pub fn put(&mut self, id: RefId, value: Value) -> Result<(), RefError> {
        let tx = self
            .queues
            .get(&id)
            .ok_or_else(|| RefError::NotFound(id.to_string()))?;
        if tx.send(value).is_err() {
            self.queues.remove(&id);
            return Err(RefError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn close(&mut self, id: RefId) -> bool {
        self.queues.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
