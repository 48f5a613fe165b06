use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Chat";
pub const EXPORT_VERSION: &str = "1.0";
const TITLE_WORDS: usize = 6;

static LAST_TICK_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Wall-clock time that never runs backwards within the process.
pub fn now() -> DateTime<Utc> {
    let wall = Utc::now();
    let candidate = wall.timestamp_micros();
    let previous = LAST_TICK_MICROS.fetch_max(candidate, Ordering::SeqCst);
    if previous <= candidate {
        return wall;
    }
    DateTime::from_timestamp_micros(previous).unwrap_or(wall)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Summary of a knowledge-base document the answer drew on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSource {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "confidence_score")]
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(default, alias = "sources", skip_serializing_if = "Vec::is_empty")]
    pub context_sources: Vec<ContextSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.confidence_score.is_none()
            && self.risk_assessment.is_none()
            && self.context_sources.is_empty()
            && self.processing_time.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// A message before the store has given it an identity.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
            is_loading: false,
            error: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant_placeholder() -> Self {
        Self {
            is_loading: true,
            ..Self::new(MessageRole::Assistant, String::new())
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Assigns a fresh id and timestamp.
    pub fn into_message(self) -> Message {
        Message {
            id: Uuid::new_v4(),
            role: self.role,
            content: self.content,
            timestamp: now(),
            metadata: self.metadata,
            is_loading: self.is_loading,
            error: self.error,
        }
    }
}

/// Shallow field overwrite applied by `update_message`.
///
/// `metadata` replaces the whole metadata block; it is never merged.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub metadata: Option<MessageMetadata>,
    pub is_loading: Option<bool>,
    pub error: Option<Option<String>>,
}

impl MessagePatch {
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn loading(mut self, is_loading: bool) -> Self {
        self.is_loading = Some(is_loading);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub(crate) fn apply(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(metadata) = self.metadata {
            message.metadata = Some(metadata);
        }
        if let Some(is_loading) = self.is_loading {
            message.is_loading = is_loading;
        }
        if let Some(error) = self.error {
            message.error = error;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ChatSession {
    pub fn new() -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            location: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn user_message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count()
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
    }

    /// Clears loading flags left behind by a run that never finished.
    pub(crate) fn finalize_interrupted(&mut self) -> usize {
        let mut repaired = 0;
        for message in self.messages.iter_mut().filter(|m| m.is_loading) {
            message.is_loading = false;
            if message.error.is_none() {
                message.error = Some("Response was interrupted".to_string());
            }
            repaired += 1;
        }
        repaired
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&ChatSession> for SessionSummary {
    fn from(session: &ChatSession) -> Self {
        Self {
            id: session.id,
            title: session.title.clone(),
            updated_at: session.updated_at,
            message_count: session.messages.len(),
        }
    }
}

/// File format produced by `export_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: ChatSession,
    pub exported_at: DateTime<Utc>,
    pub version: String,
}

impl SessionExport {
    pub fn new(session: ChatSession) -> Self {
        Self {
            session,
            exported_at: now(),
            version: EXPORT_VERSION.to_string(),
        }
    }
}

/// Title for a session, taken from the opening user message.
pub fn derive_title(content: &str) -> String {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let mut title = words
        .iter()
        .take(TITLE_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > TITLE_WORDS {
        title.push_str("...");
    }
    title
}
