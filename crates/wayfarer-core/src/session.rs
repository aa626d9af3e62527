//! Live per-user sessions.
//!
//! The manager owns one [`Session`] per user id. A session holds the bounded
//! in-memory history window and a FIFO turn gate; the window itself sits behind
//! a short synchronous lock that is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use uuid::Uuid;
use wayfarer_memory::{ConversationStore, MessageRole, StoredMessage, ToolCallRecord};
use wayfarer_provider::LlmMessage;

/// One record of the in-memory window. Mirrors a persisted message row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
    pub tool_call: Option<ToolCallRecord>,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn tool(record: ToolCallRecord) -> Self {
        let status = if record.ok { "ok" } else { "error" };
        Self {
            role: MessageRole::Tool,
            content: format!("{} ({status})", record.tool),
            tool_call: Some(record),
        }
    }
}

impl From<StoredMessage> for HistoryEntry {
    fn from(m: StoredMessage) -> Self {
        Self {
            role: m.role,
            content: m.content,
            tool_call: m.tool_call,
        }
    }
}

/// Render window records as model messages.
///
/// Tool records become a bracketed note at the head of the assistant message
/// that follows them; system records are dropped (the system prompt is sent
/// separately); leading assistant records are skipped so the context opens
/// with a user message.
pub fn to_model_messages(entries: &[HistoryEntry]) -> Vec<LlmMessage> {
    let mut out = Vec::with_capacity(entries.len());
    let mut notes: Vec<String> = Vec::new();
    for entry in entries {
        match entry.role {
            MessageRole::User => {
                notes.clear();
                out.push(LlmMessage::user(entry.content.clone()));
            }
            MessageRole::Tool => notes.push(format!("[tool {}]", entry.content)),
            MessageRole::Assistant => {
                if out.is_empty() {
                    notes.clear();
                    continue;
                }
                let text = if notes.is_empty() {
                    entry.content.clone()
                } else {
                    format!("{}\n{}", notes.join(" "), entry.content)
                };
                notes.clear();
                out.push(LlmMessage::assistant(text));
            }
            MessageRole::System => {}
        }
    }
    out
}

struct SessionState {
    conversation_id: Option<Uuid>,
    window: VecDeque<HistoryEntry>,
    last_access: Instant,
    degraded: bool,
}

pub struct Session {
    user_id: String,
    window_size: usize,
    /// True once history has been loaded from the store.
    hydrated: tokio::sync::Mutex<bool>,
    load_attempts: AtomicU64,
    state: Mutex<SessionState>,
    turn_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Held for the duration of one turn. Dropping it admits the next queued turn.
pub struct TurnGuard {
    _permit: OwnedMutexGuard<()>,
}

impl Session {
    fn new(user_id: &str, window_size: usize) -> Self {
        Self {
            user_id: user_id.to_string(),
            window_size,
            hydrated: tokio::sync::Mutex::new(false),
            load_attempts: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                conversation_id: None,
                window: VecDeque::with_capacity(window_size),
                last_access: Instant::now(),
                degraded: false,
            }),
            turn_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A panic while holding the lock leaves the window in a consistent
        // (if stale) shape, so recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.state().conversation_id
    }

    pub fn set_conversation_id(&self, id: Uuid) {
        let mut state = self.state();
        state.conversation_id = Some(id);
        state.degraded = false;
    }

    /// True while the history load is failing; the window then holds only
    /// this process's turns.
    pub fn is_degraded(&self) -> bool {
        self.state().degraded
    }

    /// Wait for this user's previous turns to finish. Waiters are admitted in
    /// arrival order.
    pub async fn begin_turn(&self) -> TurnGuard {
        TurnGuard {
            _permit: self.turn_gate.clone().lock_owned().await,
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state().window.iter().cloned().collect()
    }

    pub fn model_messages(&self) -> Vec<LlmMessage> {
        let state = self.state();
        let entries: Vec<HistoryEntry> = state.window.iter().cloned().collect();
        drop(state);
        to_model_messages(&entries)
    }

    /// Append a completed turn's records and trim to the window size.
    pub fn commit(&self, entries: impl IntoIterator<Item = HistoryEntry>) {
        let mut state = self.state();
        state.window.extend(entries);
        while state.window.len() > self.window_size {
            state.window.pop_front();
        }
        state.last_access = Instant::now();
    }

    pub fn touch(&self) {
        self.state().last_access = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.state().last_access)
    }

    /// Load persisted history once. A failed load leaves the session degraded
    /// and is retried by the next caller; callers that queued behind the
    /// failed attempt do not pile on.
    async fn hydrate(&self, store: &dyn ConversationStore) {
        let seen = self.load_attempts.load(Ordering::SeqCst);
        let mut hydrated = self.hydrated.lock().await;
        if *hydrated || self.load_attempts.load(Ordering::SeqCst) != seen {
            return;
        }
        self.load_attempts.fetch_add(1, Ordering::SeqCst);

        match load_history(store, &self.user_id, self.window_size).await {
            Ok((conversation_id, messages)) => {
                let mut state = self.state();
                let was_degraded = state.degraded;
                let persisted: Vec<HistoryEntry> =
                    messages.into_iter().map(HistoryEntry::from).collect();
                let live: Vec<HistoryEntry> = state.window.drain(..).collect();
                state.window = merge_history(persisted, live, self.window_size);
                state.conversation_id = Some(conversation_id);
                state.degraded = false;
                *hydrated = true;
                tracing::debug!(
                    user_id = %self.user_id,
                    %conversation_id,
                    loaded = state.window.len(),
                    recovered = was_degraded,
                    "session hydrated"
                );
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    error = %e,
                    "history unavailable, continuing with the live window"
                );
                self.state().degraded = true;
            }
        }
    }
}

/// Persisted history followed by the live entries it does not already hold.
/// The overlap is the longest tail of `persisted` that equals a head of `live`.
fn merge_history(
    mut persisted: Vec<HistoryEntry>,
    live: Vec<HistoryEntry>,
    window_size: usize,
) -> VecDeque<HistoryEntry> {
    let max = persisted.len().min(live.len());
    let overlap = (0..=max)
        .rev()
        .find(|&k| persisted[persisted.len() - k..] == live[..k])
        .unwrap_or(0);
    persisted.extend(live.into_iter().skip(overlap));
    let excess = persisted.len().saturating_sub(window_size);
    persisted.drain(..excess);
    persisted.into()
}

async fn load_history(
    store: &dyn ConversationStore,
    user_id: &str,
    limit: usize,
) -> anyhow::Result<(Uuid, Vec<StoredMessage>)> {
    let conversation = store.get_or_create_conversation(user_id).await?;
    let messages = store.fetch_last_messages(conversation.id, limit).await?;
    Ok((conversation.id, messages))
}

pub struct SessionManager {
    store: Arc<dyn ConversationStore>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    window_size: usize,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ConversationStore>, window_size: usize) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            window_size: window_size.max(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// The user's live session, created and hydrated on first contact.
    /// Concurrent callers for one user share a single instance and a single
    /// history load.
    pub async fn get_or_create(&self, user_id: &str) -> Arc<Session> {
        let session = {
            let mut sessions = self.sessions();
            sessions
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Session::new(user_id, self.window_size)))
                .clone()
        };
        session.hydrate(self.store.as_ref()).await;
        session.touch();
        session
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions().get(user_id).cloned()
    }

    /// Drop sessions idle for at least `max_idle`. A session referenced
    /// anywhere outside the map (a turn in flight or queued) is kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|user_id, session| {
            let in_use = Arc::strong_count(session) > 1;
            let keep = in_use || session.idle_for() < max_idle;
            if !keep {
                tracing::debug!(user_id = %user_id, "evicting idle session");
            }
            keep
        });
        before - sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Snapshot of every live session.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use wayfarer_memory::{Conversation, NewMessage, SqliteConversationStore};

    use super::*;

    fn sqlite() -> Arc<dyn ConversationStore> {
        Arc::new(SqliteConversationStore::open_in_memory().unwrap())
    }

    /// Counts loads; the first `failures` loads fail.
    struct CountingStore {
        inner: SqliteConversationStore,
        loads: AtomicUsize,
        failures: usize,
    }

    impl CountingStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: SqliteConversationStore::open_in_memory().unwrap(),
                loads: AtomicUsize::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl ConversationStore for CountingStore {
        async fn get_or_create_conversation(&self, user_id: &str) -> anyhow::Result<Conversation> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if attempt < self.failures {
                anyhow::bail!("database is locked");
            }
            self.inner.get_or_create_conversation(user_id).await
        }

        async fn get_conversation(&self, user_id: &str) -> anyhow::Result<Option<Conversation>> {
            self.inner.get_conversation(user_id).await
        }

        async fn append_message(&self, message: NewMessage) -> anyhow::Result<StoredMessage> {
            self.inner.append_message(message).await
        }

        async fn fetch_last_messages(
            &self,
            conversation_id: Uuid,
            limit: usize,
        ) -> anyhow::Result<Vec<StoredMessage>> {
            self.inner.fetch_last_messages(conversation_id, limit).await
        }

        async fn update_context(
            &self,
            conversation_id: Uuid,
            context: serde_json::Value,
        ) -> anyhow::Result<()> {
            self.inner.update_context(conversation_id, context).await
        }
    }

    #[tokio::test]
    async fn concurrent_first_contact_loads_once() {
        let store = Arc::new(CountingStore::new(0));
        let manager = Arc::new(SessionManager::new(store.clone(), 20));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get_or_create("ana").await }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }

        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn hydrates_recent_history_in_order() {
        let store = sqlite();
        let conv = store.get_or_create_conversation("ben").await.unwrap();
        for i in 0..5 {
            let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            store
                .append_message(NewMessage::text(conv.id, role, format!("m{i}")))
                .await
                .unwrap();
        }

        let manager = SessionManager::new(store, 3);
        let session = manager.get_or_create("ben").await;
        let contents: Vec<_> = session.history().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(session.conversation_id(), Some(conv.id));
        assert!(!session.is_degraded());
    }

    #[tokio::test]
    async fn store_failure_yields_empty_degraded_session() {
        let store = Arc::new(CountingStore::new(usize::MAX));
        let manager = SessionManager::new(store.clone(), 20);
        let session = manager.get_or_create("cy").await;
        assert!(session.history().is_empty());
        assert!(session.conversation_id().is_none());
        assert!(session.is_degraded());

        // Still failing: the next contact tries again and stays degraded.
        manager.get_or_create("cy").await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
        assert!(session.is_degraded());
    }

    #[tokio::test]
    async fn degraded_session_recovers_persisted_history() {
        let store = Arc::new(CountingStore::new(1));
        let conv = store.inner.get_or_create_conversation("gus").await.unwrap();
        for (role, text) in [
            (MessageRole::User, "old question"),
            (MessageRole::Assistant, "old answer"),
        ] {
            store
                .inner
                .append_message(NewMessage::text(conv.id, role, text))
                .await
                .unwrap();
        }

        let manager = SessionManager::new(store.clone(), 20);
        let session = manager.get_or_create("gus").await;
        assert!(session.is_degraded());
        assert!(session.history().is_empty());
        session.commit([
            HistoryEntry::user("new question"),
            HistoryEntry::assistant("new answer"),
        ]);

        let again = manager.get_or_create("gus").await;
        assert!(Arc::ptr_eq(&session, &again));
        assert!(!again.is_degraded());
        assert_eq!(again.conversation_id(), Some(conv.id));
        let contents: Vec<_> = again.history().into_iter().map(|e| e.content).collect();
        assert_eq!(
            contents,
            vec!["old question", "old answer", "new question", "new answer"]
        );

        // Once loaded, later contacts do not hit the store again.
        manager.get_or_create("gus").await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn merge_skips_entries_already_persisted() {
        let entries = |names: &[&str]| -> Vec<HistoryEntry> {
            names.iter().map(|n| HistoryEntry::user(*n)).collect()
        };
        let contents = |window: VecDeque<HistoryEntry>| -> Vec<String> {
            window.into_iter().map(|e| e.content).collect()
        };

        let merged = merge_history(entries(&["a", "b", "c"]), entries(&["b", "c", "d"]), 10);
        assert_eq!(contents(merged), vec!["a", "b", "c", "d"]);

        let merged = merge_history(entries(&["a", "b", "c"]), entries(&["b", "c", "d"]), 3);
        assert_eq!(contents(merged), vec!["b", "c", "d"]);

        let merged = merge_history(entries(&["a"]), vec![], 10);
        assert_eq!(contents(merged), vec!["a"]);
    }

    #[tokio::test]
    async fn commit_trims_to_window() {
        let manager = SessionManager::new(sqlite(), 2);
        let session = manager.get_or_create("dee").await;
        session.commit([
            HistoryEntry::user("a"),
            HistoryEntry::assistant("b"),
            HistoryEntry::user("c"),
        ]);
        let contents: Vec<_> = session.history().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_skips_sessions_in_use() {
        let manager = SessionManager::new(sqlite(), 20);
        let held = manager.get_or_create("busy").await;
        drop(manager.get_or_create("idle").await);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(manager.evict_idle(Duration::from_secs(60)), 1);
        assert!(manager.get("busy").is_some());
        assert!(manager.get("idle").is_none());

        drop(held);
        assert_eq!(manager.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recently_touched_sessions_survive() {
        let manager = SessionManager::new(sqlite(), 20);
        drop(manager.get_or_create("fresh").await);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.evict_idle(Duration::from_secs(60)), 0);
    }

    #[tokio::test]
    async fn turns_are_admitted_in_order() {
        let manager = SessionManager::new(sqlite(), 20);
        let session = manager.get_or_create("eve").await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = session.begin_turn().await;
        let mut handles = Vec::new();
        for i in 0..4 {
            let session = session.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _turn = session.begin_turn().await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn model_messages_fold_tool_records() {
        let entries = vec![
            HistoryEntry::assistant("orphan"),
            HistoryEntry::user("convert 10 km"),
            HistoryEntry::tool(ToolCallRecord {
                tool: "convert_units".into(),
                args_summary: "{}".into(),
                ok: true,
                result_preview: "6.21 mi".into(),
            }),
            HistoryEntry::assistant("About 6.2 miles."),
        ];
        let messages = to_model_messages(&entries);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], LlmMessage::user("convert 10 km"));
        assert_eq!(
            messages[1],
            LlmMessage::assistant("[tool convert_units (ok)]\nAbout 6.2 miles.")
        );
    }
}
