use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cc_domain::trace::TraceEvent;
use parking_lot::RwLock;

use crate::entry::{EntrySnapshot, StreamEntry, Subscriber};
use crate::event::StreamEvent;

/// Default grace period before a terminated entry is actually removed,
/// giving a reconnecting client a chance to `chat.subscribe` and observe
/// the final snapshot.
pub const DEFAULT_REMOVAL_DELAY: Duration = Duration::from_secs(5);

/// In-memory, session-keyed registry of active Stream Entries.
///
/// Enforces at-most-one entry per session: `create` atomically replaces
/// whatever was previously registered. A process-wide generation counter
/// is stamped on every entry so a `scheduleRemoval` timer armed against a
/// stale entry becomes a no-op once a newer one has taken its place.
///
/// The registry never performs I/O; it only holds state and fans events
/// out to subscriber callbacks.
pub struct StreamRegistry {
    entries: RwLock<HashMap<String, Arc<StreamEntry>>>,
    generation: AtomicU64,
    removal_delay: Duration,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            removal_delay: DEFAULT_REMOVAL_DELAY,
        }
    }

    pub fn with_removal_delay(delay: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            removal_delay: delay,
        }
    }

    /// Create a fresh entry for `session_id`, replacing any prior one. The
    /// replaced entry (if any) is simply dropped from the map; a Tool Loop
    /// still driving it observes its generation going stale on its next
    /// `get` and must stop mutating shared state.
    pub fn create(&self, session_id: &str, assistant_id: &str, model: &str) -> Arc<StreamEntry> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Arc::new(StreamEntry::new(
            session_id.to_string(),
            assistant_id.to_string(),
            model.to_string(),
            generation,
        ));
        let old_run_id = self
            .entries
            .write()
            .insert(session_id.to_string(), entry.clone())
            .map(|old| old.assistant_id());
        if let Some(old_run_id) = old_run_id {
            TraceEvent::TurnSuperseded {
                session_id: session_id.to_string(),
                old_run_id,
                new_run_id: assistant_id.to_string(),
            }
            .emit();
        }
        TraceEvent::TurnStarted {
            session_id: session_id.to_string(),
            run_id: assistant_id.to_string(),
            generation,
        }
        .emit();
        entry
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<StreamEntry>> {
        self.entries.read().get(session_id).cloned()
    }

    /// Push an event into the session's entry, applying its state effect
    /// and fanning it out to subscribers in `push` call order. A no-op if
    /// no entry is registered for the session.
    pub fn push(&self, session_id: &str, event: StreamEvent) {
        if let Some(entry) = self.get(session_id) {
            entry.apply_and_broadcast(event);
        }
    }

    /// Begin a new round on the same entry: resets round-scoped state but
    /// keeps subscribers, the `aborted` flag, and the cancellation signal.
    /// Returns `None` if no entry exists for the session.
    pub fn continue_turn(&self, session_id: &str, new_assistant_id: &str) -> Option<Arc<StreamEntry>> {
        let entry = self.get(session_id)?;
        entry.reset_for_continue(new_assistant_id.to_string());
        Some(entry)
    }

    /// Remove the entry for a session immediately, clearing its
    /// subscriber list. A no-op if no entry is registered.
    pub fn remove(&self, session_id: &str) {
        self.entries.write().remove(session_id);
    }

    /// Arm a deferred removal: the entry for `session_id` is removed after
    /// the registry's removal delay, but only if no newer `create` has
    /// superseded it in the meantime (checked by comparing generations at
    /// fire time against the generation captured now).
    pub fn schedule_removal(self: &Arc<Self>, session_id: &str) {
        self.schedule_removal_after(session_id, self.removal_delay);
    }

    pub fn schedule_removal_after(self: &Arc<Self>, session_id: &str, delay: Duration) {
        let Some(entry) = self.get(session_id) else {
            return;
        };
        let captured_generation = entry.generation;
        let registry = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = registry
                .entries
                .read()
                .get(&session_id)
                .map(|e| e.generation == captured_generation)
                .unwrap_or(false);
            if still_current {
                registry.entries.write().remove(&session_id);
            }
        });
    }

    pub fn mark_aborted(&self, session_id: &str) {
        if let Some(entry) = self.get(session_id) {
            entry.set_aborted();
        }
    }

    pub fn subscribe(&self, session_id: &str, callback: Subscriber) -> Option<u64> {
        self.get(session_id).map(|entry| entry.subscribe(callback))
    }

    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        if let Some(entry) = self.get(session_id) {
            entry.unsubscribe(subscriber_id);
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Option<EntrySnapshot> {
        self.get(session_id).map(|entry| entry.snapshot())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_domain::error::ErrorClass;
    use parking_lot::Mutex;
    use std::sync::Arc as StdArc;

    fn collecting_subscriber() -> (Subscriber, StdArc<Mutex<Vec<StreamEvent>>>) {
        let log = StdArc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let cb: Subscriber = StdArc::new(move |ev: &StreamEvent| {
            log2.lock().push(ev.clone());
        });
        (cb, log)
    }

    #[test]
    fn create_replaces_prior_entry_for_same_session() {
        let reg = StreamRegistry::new();
        let first = reg.create("s1", "a1", "gpt");
        let second = reg.create("s1", "a2", "gpt");
        assert_ne!(first.generation, second.generation);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("s1").unwrap().generation, second.generation);
    }

    #[test]
    fn push_to_absent_session_is_noop() {
        let reg = StreamRegistry::new();
        reg.push("ghost", StreamEvent::Token { text: "hi".into() });
        assert!(reg.get("ghost").is_none());
    }

    #[test]
    fn remove_on_absent_session_is_noop() {
        let reg = StreamRegistry::new();
        reg.remove("ghost");
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn push_accumulates_content_in_order() {
        let reg = StreamRegistry::new();
        reg.create("s1", "a1", "gpt");
        reg.push("s1", StreamEvent::Token { text: "hi ".into() });
        reg.push("s1", StreamEvent::Token { text: "there".into() });
        let snap = reg.snapshot("s1").unwrap();
        assert_eq!(snap.content, "hi there");
    }

    #[test]
    fn subscribers_observe_events_in_push_order() {
        let reg = StreamRegistry::new();
        reg.create("s1", "a1", "gpt");
        let (cb, log) = collecting_subscriber();
        reg.subscribe("s1", cb);
        reg.push("s1", StreamEvent::Token { text: "a".into() });
        reg.push("s1", StreamEvent::Token { text: "b".into() });
        reg.push("s1", StreamEvent::Done { has_tool_calls: false });

        let observed = log.lock();
        assert_eq!(observed.len(), 3);
        match &observed[0] {
            StreamEvent::Token { text } => assert_eq!(text, "a"),
            _ => panic!("wrong order"),
        }
        match &observed[2] {
            StreamEvent::Done { has_tool_calls } => assert!(!has_tool_calls),
            _ => panic!("expected done last"),
        }
    }

    #[test]
    fn first_terminal_event_wins_on_out_of_order_arrival() {
        let reg = StreamRegistry::new();
        reg.create("s1", "a1", "gpt");
        reg.push("s1", StreamEvent::Done { has_tool_calls: true });
        reg.push(
            "s1",
            StreamEvent::Error {
                class: ErrorClass::Unknown,
                message: "late error".into(),
            },
        );
        let snap = reg.snapshot("s1").unwrap();
        assert!(snap.done);
        assert!(snap.error.is_none());
        assert!(snap.has_tool_calls);
    }

    #[test]
    fn push_while_aborted_ignores_token_but_still_notifies() {
        let reg = StreamRegistry::new();
        reg.create("s1", "a1", "gpt");
        let (cb, log) = collecting_subscriber();
        reg.subscribe("s1", cb);
        reg.mark_aborted("s1");
        reg.push("s1", StreamEvent::Token { text: "ignored".into() });
        let snap = reg.snapshot("s1").unwrap();
        assert_eq!(snap.content, "");
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn continue_turn_resets_content_but_keeps_subscribers_and_aborted() {
        let reg = StreamRegistry::new();
        reg.create("s1", "a1", "gpt");
        let (cb, log) = collecting_subscriber();
        reg.subscribe("s1", cb);
        reg.push("s1", StreamEvent::Token { text: "round one".into() });
        reg.mark_aborted("s1");

        let entry = reg.continue_turn("s1", "a2").unwrap();
        assert_eq!(entry.assistant_id(), "a2");
        let snap = entry.snapshot();
        assert_eq!(snap.content, "");
        assert!(snap.aborted, "aborted flag must survive continue_turn");
        assert_eq!(entry.subscriber_count(), 1);

        reg.push("s1", StreamEvent::Token { text: "ignored: aborted".into() });
        assert_eq!(log.lock().len(), 2, "subscriber survives continue_turn");
    }

    #[test]
    fn continue_turn_on_absent_session_returns_none() {
        let reg = StreamRegistry::new();
        assert!(reg.continue_turn("ghost", "a1").is_none());
    }

    #[tokio::test]
    async fn schedule_removal_is_noop_if_superseded_before_fire() {
        let reg = StdArc::new(StreamRegistry::with_removal_delay(Duration::from_millis(30)));
        reg.create("s1", "a1", "gpt");
        reg.schedule_removal("s1");
        // A newer create before the timer fires must survive it.
        reg.create("s1", "a2", "gpt");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(reg.get("s1").is_some(), "newer generation must survive stale removal");
        assert_eq!(reg.get("s1").unwrap().assistant_id(), "a2");
    }

    #[tokio::test]
    async fn schedule_removal_fires_when_generation_unchanged() {
        let reg = StdArc::new(StreamRegistry::with_removal_delay(Duration::from_millis(20)));
        reg.create("s1", "a1", "gpt");
        reg.schedule_removal("s1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(reg.get("s1").is_none());
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let reg = StreamRegistry::new();
        reg.create("s1", "a1", "gpt");
        let (cb, log) = collecting_subscriber();
        let id = reg.subscribe("s1", cb).unwrap();
        reg.push("s1", StreamEvent::Token { text: "a".into() });
        reg.unsubscribe("s1", id);
        reg.push("s1", StreamEvent::Token { text: "b".into() });
        assert_eq!(log.lock().len(), 1);
    }
}
