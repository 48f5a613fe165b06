use crate::error::{ChatError, ValidationError};
use crate::session::{
    derive_title, ChatSession, Message, MessagePatch, MessageRole, NewMessage, SessionExport,
    SessionSummary,
};
use crate::sse::StreamEvent;
use crate::store::SessionStorage;
use crate::transport::{ApiClient, ChatQuery, Feedback};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

pub const MAX_MESSAGE_CHARS: usize = 10_000;
pub const FALLBACK_REPLY: &str =
    "Sorry, I encountered an error while processing your request. Please try again.";
const CANCELLED: &str = "Response cancelled";

/// Point-in-time copy of the store, for rendering.
#[derive(Debug, Clone)]
pub struct ChatState {
    pub current_session: Option<ChatSession>,
    pub sessions: Vec<ChatSession>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub is_connected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub location: Option<String>,
    pub abort: Option<AbortSignal>,
}

impl SendOptions {
    pub fn at(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            abort: None,
        }
    }

    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }
}

/// Owner side of a stream cancellation pair.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortHandle {
    pub fn pair() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the paired handle aborts. Never resolves if the handle
    /// is dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Default)]
struct InnerState {
    sessions: Vec<ChatSession>,
    current_session: Option<Uuid>,
    is_loading: bool,
    error: Option<String>,
    is_connected: bool,
}

impl InnerState {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    fn current_index(&self) -> Option<usize> {
        self.current_session.and_then(|id| self.position(id))
    }

    /// Moves the session at `index` to the front of the list.
    fn promote(&mut self, index: usize) {
        if index > 0 {
            let session = self.sessions.remove(index);
            self.sessions.insert(0, session);
        }
    }

    fn insert_current(&mut self, session: ChatSession) -> Uuid {
        let id = session.id;
        self.sessions.retain(|s| s.id != id);
        self.sessions.insert(0, session);
        self.current_session = Some(id);
        id
    }

    fn patch_message(&mut self, session_id: Uuid, message_id: Uuid, patch: MessagePatch) -> bool {
        let Some(index) = self.position(session_id) else {
            return false;
        };
        let session = &mut self.sessions[index];
        let Some(position) = session.messages.iter().position(|m| m.id == message_id) else {
            return false;
        };
        if patch.is_loading == Some(true) {
            clear_loading(&mut session.messages);
        }
        patch.apply(&mut session.messages[position]);
        session.touch();
        self.promote(index);
        true
    }
}

/// At most one message per session is loading at a time.
fn clear_loading(messages: &mut [Message]) {
    for message in messages.iter_mut().filter(|m| m.is_loading) {
        message.is_loading = false;
    }
}

/// The placeholder a send workflow is filling in.
struct Exchange {
    session_id: Uuid,
    placeholder_id: Uuid,
    query: ChatQuery,
}

enum StreamStep {
    Event(Option<StreamEvent>),
    Aborted,
}

#[derive(Deserialize)]
struct ImportedSession {
    #[serde(default)]
    title: Option<String>,
    messages: Vec<Message>,
    #[serde(default)]
    location: Option<String>,
}

/// Process-wide chat state. Every operation is one commit under the write
/// lock; observers never see a half-applied change.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<InnerState>>,
    storage: SessionStorage,
    api: ApiClient,
    revision: Arc<watch::Sender<u64>>,
}

impl SessionStore {
    pub fn new(storage: SessionStorage, api: ApiClient) -> Self {
        let loaded = match storage.load() {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(%err, "failed to load stored sessions; starting empty");
                Vec::new()
            }
        };
        let mut seen = HashSet::new();
        let mut sessions: Vec<ChatSession> =
            loaded.into_iter().filter(|s| seen.insert(s.id)).collect();
        let repaired: usize = sessions.iter_mut().map(ChatSession::finalize_interrupted).sum();
        if repaired > 0 {
            tracing::info!(repaired, "finalized interrupted responses from a previous run");
        }
        tracing::debug!(count = sessions.len(), "rehydrated sessions");
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(InnerState {
                sessions,
                is_connected: true,
                ..InnerState::default()
            })),
            storage,
            api,
            revision: Arc::new(revision),
        }
    }

    pub fn in_memory(api: ApiClient) -> Self {
        Self::new(SessionStorage::in_memory(), api)
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    /// Receiver that ticks after every committed change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        let inner = self.inner.read();
        ChatState {
            current_session: inner.current_index().map(|i| inner.sessions[i].clone()),
            sessions: inner.sessions.clone(),
            is_loading: inner.is_loading,
            error: inner.error.clone(),
            is_connected: inner.is_connected,
        }
    }

    pub fn current_session(&self) -> Option<ChatSession> {
        let inner = self.inner.read();
        inner.current_index().map(|i| inner.sessions[i].clone())
    }

    pub fn session_summaries(&self) -> Vec<SessionSummary> {
        self.inner
            .read()
            .sessions
            .iter()
            .map(SessionSummary::from)
            .collect()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.read().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().is_connected
    }

    fn commit<R>(&self, persist: bool, change: impl FnOnce(&mut InnerState) -> R) -> R {
        let result = {
            let mut inner = self.inner.write();
            let result = change(&mut inner);
            if persist {
                if let Err(err) = self.storage.save(&inner.sessions) {
                    tracing::warn!(%err, "failed to persist sessions");
                }
            }
            result
        };
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
        result
    }

    /// Like `commit`, but persists and notifies only when `change` reports
    /// that it modified something.
    fn commit_when<R>(&self, change: impl FnOnce(&mut InnerState) -> (bool, R)) -> R {
        let (changed, result) = {
            let mut inner = self.inner.write();
            let (changed, result) = change(&mut inner);
            if changed {
                if let Err(err) = self.storage.save(&inner.sessions) {
                    tracing::warn!(%err, "failed to persist sessions");
                }
            }
            (changed, result)
        };
        if changed {
            self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
        }
        result
    }

    fn fail_locally(&self, err: ChatError) -> ChatError {
        let message = err.to_string();
        self.commit(false, |inner| inner.error = Some(message));
        err
    }

    pub fn create_session(&self) -> Uuid {
        let id = self.commit(true, |inner| inner.insert_current(ChatSession::new()));
        tracing::info!(session = %id, "created session");
        id
    }

    pub fn load_session(&self, id: &str) -> Result<(), ChatError> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(self.fail_locally(ChatError::InvalidArgument(
                "session id is empty".to_string(),
            )));
        }
        let wanted = Uuid::parse_str(trimmed).ok();
        self.commit(false, |inner| {
            match wanted.and_then(|id| inner.position(id)) {
                Some(index) => {
                    inner.current_session = Some(inner.sessions[index].id);
                    inner.error = None;
                    Ok(())
                }
                None => {
                    let err = ChatError::NotFound(format!("session {trimmed}"));
                    inner.error = Some(err.to_string());
                    Err(err)
                }
            }
        })
    }

    pub fn clear_current_session(&self) {
        self.commit(false, |inner| {
            inner.current_session = None;
            inner.error = None;
        });
    }

    pub fn delete_session(&self, id: Uuid) {
        let removed = self.commit(true, |inner| {
            let before = inner.sessions.len();
            inner.sessions.retain(|s| s.id != id);
            if inner.current_session == Some(id) {
                inner.current_session = None;
            }
            before != inner.sessions.len()
        });
        if removed {
            tracing::info!(session = %id, "deleted session");
        }
    }

    pub fn clear_all_sessions(&self) {
        self.commit(true, |inner| {
            inner.sessions.clear();
            inner.current_session = None;
            inner.error = None;
        });
        tracing::info!("cleared all sessions");
    }

    pub fn clear_error(&self) {
        self.commit(false, |inner| inner.error = None);
    }

    pub fn mark_connected(&self) {
        self.commit(false, |inner| {
            inner.is_connected = true;
            inner.error = None;
        });
    }

    pub fn mark_disconnected(&self, message: impl Into<String>) {
        let message = message.into();
        self.commit(false, |inner| {
            inner.is_connected = false;
            inner.error = Some(message);
        });
    }

    /// Appends to the current session. Returns `None` when there is none.
    pub fn add_message(&self, message: NewMessage) -> Option<Uuid> {
        self.commit(true, |inner| {
            let index = inner.current_index()?;
            let session = &mut inner.sessions[index];
            if message.is_loading {
                clear_loading(&mut session.messages);
            }
            let message = message.into_message();
            let id = message.id;
            session.messages.push(message);
            session.touch();
            inner.promote(index);
            Some(id)
        })
    }

    pub fn update_message(&self, id: Uuid, patch: MessagePatch) {
        self.commit(true, |inner| {
            if let Some(session_id) = inner.current_session {
                inner.patch_message(session_id, id, patch);
            }
        });
    }

    pub fn delete_message(&self, id: Uuid) {
        self.commit(true, |inner| {
            let Some(index) = inner.current_index() else {
                return;
            };
            let session = &mut inner.sessions[index];
            let before = session.messages.len();
            session.messages.retain(|m| m.id != id);
            if session.messages.len() != before {
                session.touch();
                inner.promote(index);
            }
        });
    }

    /// Single-shot send: the placeholder is filled once the reply arrives.
    pub async fn send_message(&self, content: &str, options: SendOptions) -> Result<(), ChatError> {
        let exchange = self.begin_exchange(content, &options)?;
        tracing::debug!(session = %exchange.session_id, "sending chat message");
        match self.api.send_chat_message(&exchange.query).await {
            Ok(reply) => {
                let metadata = reply.metadata();
                self.commit(true, |inner| {
                    let mut patch = MessagePatch::default()
                        .content(reply.response)
                        .loading(false)
                        .error(None);
                    if !metadata.is_empty() {
                        patch = patch.metadata(metadata);
                    }
                    inner.patch_message(exchange.session_id, exchange.placeholder_id, patch);
                    inner.is_loading = false;
                });
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, code = err.code(), "chat request failed");
                self.fail_exchange(&exchange, "", err.to_string());
                Err(err.into())
            }
        }
    }

    /// Streaming send: the placeholder shows the running total as chunks arrive.
    pub async fn stream_message(
        &self,
        content: &str,
        options: SendOptions,
    ) -> Result<(), ChatError> {
        let exchange = self.begin_exchange(content, &options)?;
        tracing::debug!(session = %exchange.session_id, "opening chat stream");
        let mut events = self.api.stream_chat_message(&exchange.query).await;
        let mut accumulated = String::new();

        loop {
            let step = match &options.abort {
                Some(signal) => tokio::select! {
                    event = events.next() => StreamStep::Event(event),
                    _ = signal.aborted() => StreamStep::Aborted,
                },
                None => StreamStep::Event(events.next().await),
            };
            match step {
                StreamStep::Event(Some(StreamEvent::Chunk(text))) => {
                    accumulated.push_str(&text);
                    let running = accumulated.clone();
                    // Written to disk once the stream settles.
                    self.commit(false, |inner| {
                        inner.patch_message(
                            exchange.session_id,
                            exchange.placeholder_id,
                            MessagePatch::default().content(running),
                        );
                    });
                }
                StreamStep::Event(Some(StreamEvent::Metadata(metadata))) => {
                    self.commit(false, |inner| {
                        inner.patch_message(
                            exchange.session_id,
                            exchange.placeholder_id,
                            MessagePatch::default().metadata(metadata),
                        );
                    });
                }
                StreamStep::Event(Some(StreamEvent::Error(err))) => {
                    tracing::warn!(%err, code = err.code(), "chat stream failed");
                    self.fail_exchange(&exchange, &accumulated, err.to_string());
                    return Err(err.into());
                }
                StreamStep::Event(Some(StreamEvent::Done)) | StreamStep::Event(None) => {
                    self.commit(true, |inner| {
                        inner.patch_message(
                            exchange.session_id,
                            exchange.placeholder_id,
                            MessagePatch::default().loading(false),
                        );
                        inner.is_loading = false;
                    });
                    return Ok(());
                }
                StreamStep::Aborted => {
                    drop(events);
                    tracing::info!(session = %exchange.session_id, "chat stream abandoned");
                    self.abandon_exchange(&exchange, accumulated);
                    return Ok(());
                }
            }
        }
    }

    /// Resends the last user message after dropping its failed reply.
    pub async fn retry_last_message(&self) -> Result<(), ChatError> {
        let Some(content) = self.rewind_failed_exchange() else {
            return Ok(());
        };
        tracing::info!("retrying last message");
        self.send_message(&content, SendOptions::default()).await
    }

    /// Removes the trailing failed (or stuck) assistant reply and, when it is
    /// left trailing, the user message it answered. Returns that user content
    /// so it can be sent again.
    pub fn rewind_failed_exchange(&self) -> Option<String> {
        self.commit_when(|inner| {
            let Some(index) = inner.current_index() else {
                return (false, None);
            };
            let session = &mut inner.sessions[index];
            if session.messages.len() < 2 {
                return (false, None);
            }
            let Some(user_pos) = session
                .messages
                .iter()
                .rposition(|m| m.role == MessageRole::User)
            else {
                return (false, None);
            };
            let content = session.messages[user_pos].content.clone();
            let before = session.messages.len();
            if let Some(last) = session.messages.last() {
                if last.role == MessageRole::Assistant && (last.is_failed() || last.is_loading) {
                    session.messages.pop();
                }
            }
            if session.messages.len() == user_pos + 1 {
                session.messages.pop();
            }
            let changed = session.messages.len() != before;
            if changed {
                session.touch();
                inner.promote(index);
            }
            (changed, Some(content))
        })
    }

    pub fn export_session(&self) -> Option<SessionExport> {
        self.current_session().map(SessionExport::new)
    }

    pub fn export_session_json(&self) -> Result<Option<String>, ChatError> {
        self.export_session()
            .map(|export| {
                serde_json::to_string_pretty(&export)
                    .map_err(|err| ChatError::InvalidFormat(err.to_string()))
            })
            .transpose()
    }

    pub fn import_session(&self, payload: &str) -> Result<Uuid, ChatError> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|err| self.fail_locally(ChatError::InvalidFormat(err.to_string())))?;
        self.import_session_value(&value)
    }

    /// Accepts `{ "session": { "messages": [...] } }`; the imported session
    /// gets a fresh id and timestamps and becomes current.
    pub fn import_session_value(&self, value: &Value) -> Result<Uuid, ChatError> {
        let session_value = value
            .get("session")
            .filter(|session| session.get("messages").is_some_and(Value::is_array))
            .ok_or_else(|| {
                self.fail_locally(ChatError::InvalidFormat(
                    "expected an object with session.messages as a list".to_string(),
                ))
            })?;
        let imported: ImportedSession = serde_json::from_value(session_value.clone())
            .map_err(|err| self.fail_locally(ChatError::InvalidFormat(err.to_string())))?;

        let mut session = ChatSession::new();
        session.messages = imported.messages;
        session.location = imported.location;
        session.finalize_interrupted();
        session.title = match imported.title.map(|t| t.trim().to_string()) {
            Some(title) if !title.is_empty() => title,
            _ => session
                .messages
                .iter()
                .find(|m| m.role == MessageRole::User)
                .map(|m| derive_title(&m.content))
                .unwrap_or_else(|| session.title.clone()),
        };
        let id = self.commit(true, |inner| {
            inner.error = None;
            inner.insert_current(session)
        });
        tracing::info!(session = %id, "imported session");
        Ok(id)
    }

    /// Rates the latest assistant reply in the current session.
    pub async fn rate_last_response(&self, rating: u8) -> Result<(), ChatError> {
        let target = {
            let inner = self.inner.read();
            inner.current_index().and_then(|index| {
                let session = &inner.sessions[index];
                session
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::Assistant && !m.is_loading)
                    .map(|m| (session.id, m.id))
            })
        };
        let Some((session_id, message_id)) = target else {
            return Err(self.fail_locally(ChatError::NotFound(
                "no assistant response to rate".to_string(),
            )));
        };
        let mut feedback = Feedback::uniform(message_id.to_string(), rating);
        feedback.session_id = Some(session_id.to_string());
        feedback
            .validate()
            .map_err(|detail| self.fail_locally(ChatError::InvalidArgument(detail)))?;
        if let Err(err) = self.api.submit_feedback(&feedback).await {
            let message = err.to_string();
            self.commit(false, |inner| inner.error = Some(message));
            return Err(err.into());
        }
        Ok(())
    }

    fn begin_exchange(&self, content: &str, options: &SendOptions) -> Result<Exchange, ChatError> {
        if let Err(err) = validate_content(content) {
            return Err(self.fail_locally(err.into()));
        }
        let text = content.trim().to_string();
        let location = options.location.clone();
        Ok(self.commit(true, |inner| {
            let index = match inner.current_index() {
                Some(index) => index,
                None => {
                    inner.insert_current(ChatSession::new());
                    0
                }
            };
            let session = &mut inner.sessions[index];
            if location.is_some() {
                session.location = location;
            }
            if session.user_message_count() == 0 {
                session.title = derive_title(&text);
            }
            clear_loading(&mut session.messages);
            let placeholder = NewMessage::assistant_placeholder().into_message();
            let placeholder_id = placeholder.id;
            session.messages.push(NewMessage::user(text.clone()).into_message());
            session.messages.push(placeholder);
            session.touch();
            let exchange = Exchange {
                session_id: session.id,
                placeholder_id,
                query: ChatQuery {
                    text,
                    location: session.location.clone(),
                    session_id: Some(session.id.to_string()),
                },
            };
            inner.promote(index);
            inner.is_loading = true;
            inner.error = None;
            exchange
        }))
    }

    fn fail_exchange(&self, exchange: &Exchange, partial: &str, message: String) {
        let content = if partial.is_empty() {
            FALLBACK_REPLY.to_string()
        } else {
            partial.to_string()
        };
        self.commit(true, |inner| {
            inner.patch_message(
                exchange.session_id,
                exchange.placeholder_id,
                MessagePatch::default()
                    .content(content)
                    .loading(false)
                    .error(Some(message.clone())),
            );
            inner.is_loading = false;
            inner.error = Some(message);
        });
    }

    fn abandon_exchange(&self, exchange: &Exchange, partial: String) {
        let patch = if partial.is_empty() {
            MessagePatch::default()
                .loading(false)
                .error(Some(CANCELLED.to_string()))
        } else {
            MessagePatch::default().content(partial).loading(false)
        };
        self.commit(true, |inner| {
            inner.patch_message(exchange.session_id, exchange.placeholder_id, patch);
            inner.is_loading = false;
        });
    }
}

pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let actual = trimmed.chars().count();
    if actual > MAX_MESSAGE_CHARS {
        return Err(ValidationError::TooLong {
            max: MAX_MESSAGE_CHARS,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::mock::MockTransport;
    use std::sync::Mutex;

    fn store_with_mock() -> (SessionStore, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::default());
        let store = SessionStore::in_memory(ApiClient::mock(mock.clone()));
        (store, mock)
    }

    #[test]
    fn rejects_empty_and_oversized_content() {
        assert_eq!(validate_content("   \n"), Err(ValidationError::Empty));
        assert!(validate_content(&"x".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert!(matches!(
            validate_content(&"x".repeat(MAX_MESSAGE_CHARS + 1)),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_content_sets_error_without_touching_sessions() {
        let (store, mock) = store_with_mock();
        let err = store
            .send_message("  ", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(ValidationError::Empty)));
        let state = store.snapshot();
        assert!(state.sessions.is_empty());
        assert!(state.error.is_some());
        assert_eq!(mock.sends(), 0);

        store.create_session();
        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(store
            .stream_message(&long, SendOptions::default())
            .await
            .is_err());
        assert!(store.current_session().expect("session").messages.is_empty());
        assert_eq!(mock.stream_opens(), 0);
    }

    #[tokio::test]
    async fn placeholder_is_visible_before_the_reply() {
        let (store, mock) = store_with_mock();
        let observed = Arc::new(Mutex::new(None));
        let probe_store = store.clone();
        let sink = observed.clone();
        mock.set_probe(move |_| {
            let session = probe_store.current_session().expect("session");
            let shape: Vec<(MessageRole, bool)> = session
                .messages
                .iter()
                .map(|m| (m.role, m.is_loading))
                .collect();
            *sink.lock().expect("lock") = Some((shape, probe_store.is_loading()));
        });

        store
            .send_message("  How do I renew a passport?  ", SendOptions::at("Pune"))
            .await
            .expect("send");

        let (shape, loading) = observed.lock().expect("lock").take().expect("probe ran");
        assert_eq!(
            shape,
            vec![(MessageRole::User, false), (MessageRole::Assistant, true)]
        );
        assert!(loading);

        let session = store.current_session().expect("session");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "How do I renew a passport?");
        assert_eq!(session.title, "How do I renew a passport?");
        assert_eq!(session.location.as_deref(), Some("Pune"));
        let reply = &session.messages[1];
        assert!(!reply.is_loading);
        assert!(reply.content.contains("near Pune"));
        let metadata = reply.metadata.as_ref().expect("metadata");
        assert_eq!(metadata.confidence_score, Some(0.9));
        assert_eq!(metadata.context_sources.len(), 1);
        assert!(!store.is_loading());

        let queries = mock.queries();
        assert_eq!(queries[0].session_id, Some(session.id.to_string()));
    }

    #[tokio::test]
    async fn failed_send_keeps_apology_and_error() {
        let (store, mock) = store_with_mock();
        mock.push_reply(Err(TransportError::server(
            500,
            "INTERNAL_ERROR",
            "backend exploded",
        )));
        let err = store
            .send_message("hello", SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transport());

        let state = store.snapshot();
        let session = state.current_session.expect("session");
        assert_eq!(session.messages.len(), 2);
        let reply = &session.messages[1];
        assert_eq!(reply.content, FALLBACK_REPLY);
        assert!(!reply.is_loading);
        assert_eq!(reply.error, state.error);
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn retry_replaces_the_failed_exchange() {
        let (store, mock) = store_with_mock();
        mock.push_reply(Err(TransportError::network("offline")));
        assert!(store.send_message("a", SendOptions::default()).await.is_err());

        store.retry_last_message().await.expect("retry");

        let session = store.current_session().expect("session");
        let roles: Vec<MessageRole> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(session.messages[0].content, "a");
        assert!(!session.messages[1].is_failed());
        assert_eq!(mock.sends(), 2);
        assert_eq!(mock.queries()[1].text, "a");
    }

    #[tokio::test]
    async fn rewinding_a_successful_exchange_changes_nothing() {
        let (store, _) = store_with_mock();
        store
            .send_message("a", SendOptions::default())
            .await
            .expect("send");
        let before = store.current_session().expect("session");
        let mut revisions = store.subscribe();
        revisions.borrow_and_update();

        assert_eq!(store.rewind_failed_exchange().as_deref(), Some("a"));

        assert!(!revisions.has_changed().expect("store alive"));
        assert_eq!(store.current_session().expect("session"), before);
    }

    #[tokio::test]
    async fn retry_without_history_is_a_no_op() {
        let (store, mock) = store_with_mock();
        store.retry_last_message().await.expect("no session");
        store.create_session();
        store.add_message(NewMessage::user("lonely"));
        store.retry_last_message().await.expect("one message");
        assert_eq!(mock.sends(), 0);
        assert_eq!(store.current_session().expect("session").messages.len(), 1);
    }

    #[test]
    fn add_message_requires_a_current_session() {
        let (store, _) = store_with_mock();
        assert!(store.add_message(NewMessage::user("hi")).is_none());
        assert!(store.snapshot().sessions.is_empty());

        let session_id = store.create_session();
        let message_id = store.add_message(NewMessage::user("hi")).expect("added");
        store.update_message(message_id, MessagePatch::default().content("edited"));
        let session = store.current_session().expect("session");
        assert_eq!(session.id, session_id);
        assert_eq!(session.messages[0].content, "edited");

        store.delete_message(message_id);
        store.delete_message(message_id);
        assert!(store.current_session().expect("session").messages.is_empty());
    }

    #[test]
    fn updates_keep_a_single_loading_message() {
        let (store, _) = store_with_mock();
        store.create_session();
        let placeholder = store
            .add_message(NewMessage::assistant_placeholder())
            .expect("placeholder");
        store.add_message(NewMessage::user("question"));
        let answer = store
            .add_message(NewMessage::new(MessageRole::Assistant, "answer"))
            .expect("answer");

        store.update_message(placeholder, MessagePatch::default().loading(true));
        store.update_message(answer, MessagePatch::default().loading(true));
        let session = store.current_session().expect("session");
        let loading: Vec<_> = session
            .messages
            .iter()
            .filter(|m| m.is_loading)
            .map(|m| m.id)
            .collect();
        assert_eq!(loading, vec![answer]);
    }

    #[test]
    fn touched_sessions_move_to_the_front() {
        let (store, _) = store_with_mock();
        let older = store.create_session();
        let newer = store.create_session();
        assert_eq!(store.session_summaries()[0].id, newer);

        store.load_session(&older.to_string()).expect("load");
        store.add_message(NewMessage::user("bump"));
        let ids: Vec<Uuid> = store.session_summaries().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![older, newer]);
    }

    #[test]
    fn delete_session_is_idempotent() {
        let (store, _) = store_with_mock();
        let keep = store.create_session();
        let doomed = store.create_session();
        store.delete_session(doomed);
        let once: Vec<Uuid> = store.session_summaries().iter().map(|s| s.id).collect();
        store.delete_session(doomed);
        let twice: Vec<Uuid> = store.session_summaries().iter().map(|s| s.id).collect();
        assert_eq!(once, twice);
        assert_eq!(once, vec![keep]);
        assert!(store.current_session().is_none());
    }

    #[test]
    fn load_session_reports_missing_and_empty_ids() {
        let (store, _) = store_with_mock();
        assert!(matches!(
            store.load_session(""),
            Err(ChatError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.load_session(&Uuid::new_v4().to_string()),
            Err(ChatError::NotFound(_))
        ));
        assert!(store.error().is_some());

        let id = store.create_session();
        store.clear_current_session();
        store.load_session(&id.to_string()).expect("load");
        assert!(store.error().is_none());
        assert_eq!(store.current_session().map(|s| s.id), Some(id));
    }

    #[tokio::test]
    async fn export_then_import_copies_messages_under_a_new_id() {
        let (store, _) = store_with_mock();
        store
            .send_message("What documents do I need for a ration card?", SendOptions::default())
            .await
            .expect("send");
        let original = store.current_session().expect("session");
        let exported = store
            .export_session_json()
            .expect("serialize")
            .expect("current session");
        assert!(exported.contains("\"version\": \"1.0\""));

        let imported_id = store.import_session(&exported).expect("import");
        assert_ne!(imported_id, original.id);
        let imported = store.current_session().expect("imported");
        assert_eq!(imported.id, imported_id);
        assert_eq!(imported.messages, original.messages);
        assert_eq!(imported.title, original.title);
        assert_eq!(store.session_summaries().len(), 2);
    }

    #[test]
    fn import_rejects_payloads_without_messages() {
        let (store, _) = store_with_mock();
        for payload in [
            "not json",
            r#"{"session": {"title": "x"}}"#,
            r#"{"session": {"messages": "nope"}}"#,
            r#"{"messages": []}"#,
        ] {
            assert!(matches!(
                store.import_session(payload),
                Err(ChatError::InvalidFormat(_))
            ));
        }
        assert!(store.snapshot().sessions.is_empty());
        assert!(store.error().is_some());
    }

    #[test]
    fn clear_all_resets_sessions_and_error() {
        let (store, _) = store_with_mock();
        store.create_session();
        store.mark_disconnected("Connection lost");
        store.clear_all_sessions();
        let state = store.snapshot();
        assert!(state.sessions.is_empty());
        assert!(state.current_session.is_none());
        assert!(state.error.is_none());
        assert!(!state.is_connected);
    }

    #[tokio::test]
    async fn rating_submits_feedback_for_the_last_reply() {
        let (store, mock) = store_with_mock();
        assert!(matches!(
            store.rate_last_response(5).await,
            Err(ChatError::NotFound(_))
        ));
        store
            .send_message("hi", SendOptions::default())
            .await
            .expect("send");
        assert!(matches!(
            store.rate_last_response(9).await,
            Err(ChatError::InvalidArgument(_))
        ));
        store.rate_last_response(4).await.expect("rate");

        let session = store.current_session().expect("session");
        let feedback = mock.feedback();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].query_id, session.messages[1].id.to_string());
        assert_eq!(feedback[0].rating, 4);
    }
}
