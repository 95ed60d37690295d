//! Reference registries.
//!
//! The browser never sees server objects directly. Callbacks, values,
//! files, in-memory files, pending futures and queues are all handed out
//! as opaque ids or URL-safe names and looked up again when a request
//! comes back in.

mod file;
mod future;
mod object;
mod queue;
mod vfile;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub use file::{FileRegistry, ANCHOR_MARKER};
pub use future::{FutureRegistry, RemoteError, Settlement};
pub use object::{
    Anchor, CallArgs, CallResult, Callback, ObjectRegistry, RefObject, RefPolicy,
    StrongRotatingRegistry, WeakRegistry,
};
pub use queue::QueueRegistry;
pub use vfile::{VFileRegistry, VirtualFile};

/// Opaque id handed to the client for a registered object, future or queue.
pub type RefId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh id. Ids are unique and increasing for the whole process.
pub fn next_id() -> RefId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Errors raised by the reference registries.
#[derive(Debug, thiserror::Error)]
pub enum RefError {
    #[error("no reference registered under {0}")]
    NotFound(String),
    #[error("object has no anchor and cannot be held weakly")]
    NotWeakable,
    #[error("reference registry is full ({keep} entries) and does not rotate")]
    Overflow { keep: usize },
}

/// Hex digest used for content addressed names.
pub(crate) fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// The per-session bundle of registries.
#[derive(Clone)]
pub struct Registries {
    pub objects: Arc<Mutex<ObjectRegistry>>,
    pub files: Arc<Mutex<FileRegistry>>,
    pub vfiles: Arc<Mutex<VFileRegistry>>,
    pub futures: Arc<Mutex<FutureRegistry>>,
    pub queues: Arc<Mutex<QueueRegistry>>,
}

impl Registries {
    pub fn new(references: &crate::config::ReferenceConfig) -> Self {
        Self {
            objects: Arc::new(Mutex::new(ObjectRegistry::new(references))),
            files: Arc::new(Mutex::new(FileRegistry::new())),
            vfiles: Arc::new(Mutex::new(VFileRegistry::new())),
            futures: Arc::new(Mutex::new(FutureRegistry::new())),
            queues: Arc::new(Mutex::new(QueueRegistry::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_increasing() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }

    #[test]
    fn content_hash_is_stable_and_short() {
        let a = content_hash(b"hello");
        assert_eq!(a, content_hash(b"hello"));
        assert_ne!(a, content_hash(b"hello!"));
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
