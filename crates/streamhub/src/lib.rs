//! In-memory registry of per-session streaming state.
//!
//! Decouples LLM-side producers (the Tool Loop driving a provider stream)
//! from client-side consumers (WebSocket connections subscribed to a
//! session) so a turn survives client disconnects and supports mid-stream
//! reconnection via [`StreamEntry::snapshot`].

pub mod cancel;
pub mod entry;
pub mod event;
pub mod registry;

pub use cancel::CancelToken;
pub use entry::{EntrySnapshot, StreamEntry, Subscriber};
pub use event::StreamEvent;
pub use registry::{StreamRegistry, DEFAULT_REMOVAL_DELAY};
