use std::sync::Arc;

use cc_domain::error::ErrorClass;
use cc_domain::stream::Usage;
use cc_domain::tool::ToolCall;
use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::event::StreamEvent;

/// A subscriber callback. Invoked synchronously, in registration order,
/// for every event pushed to the entry it is registered against.
pub type Subscriber = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// The mutable state a Stream Entry accumulates over one round of
/// streaming. Reset by `continue_turn`, preserved across `push` calls.
#[derive(Default)]
struct EntryState {
    content: String,
    tool_calls: Vec<ToolCall>,
    done: bool,
    has_tool_calls: bool,
    error: Option<(ErrorClass, String)>,
    usage: Option<Usage>,
    request_payload: Option<serde_json::Value>,
}

/// A snapshot of an entry's accumulated state, returned by `get` and used
/// to build the `snapshot` event sent to late subscribers on reconnect.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub session_id: String,
    pub assistant_id: String,
    pub model: String,
    pub generation: u64,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
    pub has_tool_calls: bool,
    pub aborted: bool,
    pub error: Option<(ErrorClass, String)>,
    pub usage: Option<Usage>,
    pub request_payload: Option<serde_json::Value>,
}

/// The in-memory streaming state for one session's active turn.
///
/// Stream entries are owned by the [`crate::registry::StreamRegistry`] for
/// their lifetime. A new `create` atomically replaces the prior entry for
/// the session; within a single session at most one entry is ever current.
pub struct StreamEntry {
    pub session_id: String,
    pub generation: u64,
    assistant_id: Mutex<String>,
    model: Mutex<String>,
    state: Mutex<EntryState>,
    aborted: std::sync::atomic::AtomicBool,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_subscriber_id: std::sync::atomic::AtomicU64,
    cancel: CancelToken,
}

impl StreamEntry {
    pub(crate) fn new(session_id: String, assistant_id: String, model: String, generation: u64) -> Self {
        Self {
            session_id,
            generation,
            assistant_id: Mutex::new(assistant_id),
            model: Mutex::new(model),
            state: Mutex::new(EntryState::default()),
            aborted: std::sync::atomic::AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: std::sync::atomic::AtomicU64::new(0),
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn assistant_id(&self) -> String {
        self.assistant_id.lock().clone()
    }

    /// Register a subscriber, returning a token that `unsubscribe` accepts.
    /// Safe to call concurrently with `push` (copy-on-iterate fan-out).
    pub fn subscribe(&self, callback: Subscriber) -> u64 {
        let id = self
            .next_subscriber_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        EntrySnapshot {
            session_id: self.session_id.clone(),
            assistant_id: self.assistant_id(),
            model: self.model.lock().clone(),
            generation: self.generation,
            content: state.content.clone(),
            tool_calls: state.tool_calls.clone(),
            done: state.done,
            has_tool_calls: state.has_tool_calls,
            aborted: self.is_aborted(),
            error: state.error.clone(),
            usage: state.usage,
            request_payload: state.request_payload.clone(),
        }
    }

    /// Apply an event's side effect to accumulated state, then fan it out
    /// to every currently-registered subscriber in insertion order. A
    /// subscriber callback is expected not to panic; this method does not
    /// guard against it (matching the copy-on-iterate contract: one bad
    /// subscriber must not prevent delivery to the rest is the caller's
    /// responsibility to uphold by keeping callbacks panic-free).
    pub(crate) fn apply_and_broadcast(&self, event: StreamEvent) {
        let aborted = self.is_aborted();
        {
            let mut state = self.state.lock();
            match &event {
                StreamEvent::Token { text } => {
                    if !aborted {
                        state.content.push_str(text);
                    }
                }
                StreamEvent::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    state.tool_calls.push(ToolCall {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: arguments.clone(),
                    });
                    state.has_tool_calls = true;
                }
                StreamEvent::ToolResult { .. } => {}
                StreamEvent::Usage { usage } => {
                    state.usage = Some(*usage);
                }
                StreamEvent::Debug { request } => {
                    state.request_payload = Some(request.clone());
                }
                StreamEvent::Done { has_tool_calls } => {
                    // First terminal event wins: once done, later done/error
                    // events must not overwrite the recorded outcome.
                    if !state.done && state.error.is_none() {
                        state.done = true;
                        state.has_tool_calls = *has_tool_calls;
                    }
                }
                StreamEvent::Error { class, message } => {
                    if !state.done && state.error.is_none() {
                        state.done = true;
                        state.error = Some((*class, message.clone()));
                    }
                }
                StreamEvent::Snapshot { .. } => {}
            }
        }

        // Copy-on-iterate: subscribers may register/unregister concurrently
        // with this broadcast without the lock being held across callbacks.
        let subs: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in subs {
            cb(&event);
        }
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, std::sync::atomic::Ordering::Release);
        self.cancel.cancel();
    }

    /// Reset round-scoped fields while preserving subscribers, `aborted`,
    /// and the cancellation signal. Used by `continue_turn`.
    pub(crate) fn reset_for_continue(&self, new_assistant_id: String) {
        *self.assistant_id.lock() = new_assistant_id;
        let mut state = self.state.lock();
        *state = EntryState::default();
    }
}
