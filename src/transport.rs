//! Queues between the application and the browser socket.

use std::collections::VecDeque;
use std::ops::Deref;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::Command;

/// Unbounded FIFO with an async `pop` and a `push_front` for requeueing.
///
/// Producers never block. `pop` is cancel safe: a dropped `pop` never
/// loses an item.
#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
    emptied: Notify,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            emptied: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Put an item back at the head, ahead of everything queued.
    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        if items.is_empty() {
            self.emptied.notify_waiters();
        }
        item
    }

    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Wait until the queue has been drained.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One socket message worth of commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub commands: Vec<Command>,
    /// Whether the message is appended to the replay history once sent.
    pub retain: bool,
}

impl Outbound {
    pub fn new(commands: Vec<Command>, retain: bool) -> Self {
        Self { commands, retain }
    }

    pub fn single(command: Command, retain: bool) -> Self {
        Self::new(vec![command], retain)
    }
}

/// An item taken off a queue for sending. Unless marked delivered it goes
/// back to the head of the queue when dropped, so a failed or interrupted
/// send never loses or reorders it.
pub struct InFlight<'a, T> {
    queue: &'a Queue<T>,
    item: Option<T>,
}

impl<'a, T> InFlight<'a, T> {
    pub fn new(queue: &'a Queue<T>, item: T) -> Self {
        Self {
            queue,
            item: Some(item),
        }
    }

    pub fn delivered(mut self) -> Option<T> {
        self.item.take()
    }
}

impl<T> Deref for InFlight<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `delivered` takes the item, and it consumes the guard.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.push_front(item);
        }
    }
}

/// Serialized messages already sent, replayed in order after a reload.
#[derive(Debug, Default)]
pub struct History {
    entries: VecDeque<String>,
    limit: Option<usize>,
}

impl History {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, entry: String) {
        self.entries.push_back(entry);
        if let Some(limit) = self.limit {
            while self.entries.len() > limit {
                self.entries.pop_front();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
