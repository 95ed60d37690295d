//! livepage - server-driven live pages
//!
//! A long-running async handler per browser session drives the page's DOM
//! over a WebSocket. Sessions survive reloads and reconnects by replaying
//! their command history, and server objects handed to the browser
//! (callbacks, futures, queues, files) are addressed through per-session
//! reference registries.

pub mod api;
pub mod config;
pub mod manager;
pub mod node;
pub mod page;
pub mod plugins;
pub mod protocol;
pub mod registry;
pub mod representer;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use manager::{SessionEvent, SessionManager};
pub use node::{Element, Node, Resource};
pub use page::Page;
pub use registry::{Anchor, CallArgs, CallResult, Callback, VirtualFile};
pub use session::{handler, Handler};
