use crate::config::{ClientConfig, TransportKind};
use crate::error::TransportError;
use crate::mock::MockTransport;
use crate::session::{ContextSource, MessageMetadata, RiskAssessment};
use crate::sse::{decode_event_stream, EventStream, StreamEvent};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const HEALTH_PATH: &str = "health";
const CHAT_PATH: &str = "api/v1/chat";
const STREAM_PATH: &str = "api/v1/chat/stream";
const HISTORY_PATH: &str = "api/v1/chat/history/";
const SESSION_PATH: &str = "api/v1/chat/session";
const FEEDBACK_PATH: &str = "api/v1/feedback";
const MAX_FEEDBACK_COMMENT: usize = 1000;

/// Body of the single-shot and streaming chat endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatQuery {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            location: None,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponseData {
    #[serde(default)]
    pub query: String,
    #[serde(alias = "message")]
    pub response: String,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(default, alias = "sources")]
    pub context_sources: Vec<ContextSource>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl ChatResponseData {
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            confidence_score: self.confidence_score,
            risk_assessment: self.risk_assessment.clone(),
            context_sources: self.context_sources.clone(),
            processing_time: self.processing_time,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    #[serde(default)]
    pub success: Option<bool>,
    pub status: HealthState,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub checks: Option<Value>,
}

impl HealthStatus {
    pub fn healthy(version: impl Into<String>) -> Self {
        Self {
            success: Some(true),
            status: HealthState::Healthy,
            timestamp: None,
            version: Some(version.into()),
            checks: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.success != Some(false) && self.status != HealthState::Unhealthy
    }
}

/// Rating of an answer, posted to the feedback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub query_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub rating: u8,
    pub helpfulness: u8,
    pub accuracy: u8,
    pub clarity: u8,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub would_recommend: Option<bool>,
}

impl Feedback {
    /// Uniform rating across every axis.
    pub fn uniform(query_id: impl Into<String>, rating: u8) -> Self {
        Self {
            query_id: query_id.into(),
            session_id: None,
            rating,
            helpfulness: rating,
            accuracy: rating,
            clarity: rating,
            categories: Vec::new(),
            comment: None,
            would_recommend: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("rating", self.rating),
            ("helpfulness", self.helpfulness),
            ("accuracy", self.accuracy),
            ("clarity", self.clarity),
        ] {
            if !(1..=5).contains(&value) {
                return Err(format!("{field} must be between 1 and 5"));
            }
        }
        if let Some(comment) = &self.comment {
            if comment.chars().count() > MAX_FEEDBACK_COMMENT {
                return Err(format!(
                    "comment must be at most {MAX_FEEDBACK_COMMENT} characters"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
    #[serde(default)]
    error: Option<crate::error::ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
}

/// The backend collaborator, seen from the client.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn health_check(&self) -> Result<HealthStatus, TransportError>;

    async fn send_chat_message(&self, query: &ChatQuery)
        -> Result<ChatResponseData, TransportError>;

    /// Opens a response stream. Failures to open surface as a single
    /// terminal `Error` event so consumers only handle one shape.
    async fn stream_chat_message(&self, query: &ChatQuery) -> EventStream;

    async fn chat_history(&self, session_id: &str)
        -> Result<Vec<ChatResponseData>, TransportError>;

    async fn create_session(&self) -> Result<String, TransportError>;

    async fn submit_feedback(&self, feedback: &Feedback) -> Result<(), TransportError>;
}

/// Cloneable handle over whichever transport the configuration selected.
#[derive(Clone)]
pub struct ApiClient {
    kind: TransportKind,
    transport: Arc<dyn ChatTransport>,
}

impl ApiClient {
    pub fn new(kind: TransportKind, transport: Arc<dyn ChatTransport>) -> Self {
        Self { kind, transport }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        match config.transport {
            TransportKind::Http => {
                let transport = HttpTransport::new(config)?;
                Ok(Self::new(TransportKind::Http, Arc::new(transport)))
            }
            TransportKind::Mock => Ok(Self::fake()),
        }
    }

    pub fn fake() -> Self {
        Self::mock(Arc::new(MockTransport::default()))
    }

    pub fn mock(transport: Arc<MockTransport>) -> Self {
        Self::new(TransportKind::Mock, transport)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub async fn health_check(&self) -> Result<HealthStatus, TransportError> {
        self.transport.health_check().await
    }

    pub async fn send_chat_message(
        &self,
        query: &ChatQuery,
    ) -> Result<ChatResponseData, TransportError> {
        self.transport.send_chat_message(query).await
    }

    pub async fn stream_chat_message(&self, query: &ChatQuery) -> EventStream {
        self.transport.stream_chat_message(query).await
    }

    pub async fn chat_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatResponseData>, TransportError> {
        self.transport.chat_history(session_id).await
    }

    pub async fn create_remote_session(&self) -> Result<String, TransportError> {
        self.transport.create_session().await
    }

    pub async fn submit_feedback(&self, feedback: &Feedback) -> Result<(), TransportError> {
        self.transport.submit_feedback(feedback).await
    }
}

/// reqwest-backed transport talking to the chat API.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        // No client-wide timeout: it would also cap long-lived stream bodies.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|err| {
                TransportError::unknown(0, format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self {
            client,
            base_url: normalize_base(config.api_base_url.clone()),
            request_timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::unknown(0, format!("invalid endpoint {path}: {err}")))
    }

    async fn open_stream(&self, query: &ChatQuery) -> Result<EventStream, TransportError> {
        let url = self.endpoint(STREAM_PATH)?;
        let response = self
            .client
            .post(url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .json(query)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_response(status.as_u16(), &body));
        }
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from_reqwest));
        Ok(decode_event_stream(bytes, status.as_u16()))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn health_check(&self) -> Result<HealthStatus, TransportError> {
        let response = self
            .client
            .get(self.endpoint(HEALTH_PATH)?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let (status, body) = read_body(response).await?;
        let health: HealthStatus = serde_json::from_str(&body)
            .map_err(|err| TransportError::parse(status, format!("invalid health body: {err}")))?;
        if !health.is_usable() {
            return Err(TransportError::server(
                status,
                "UNHEALTHY",
                "Service reported itself unhealthy",
            ));
        }
        debug!(status = ?health.status, "health check succeeded");
        Ok(health)
    }

    async fn send_chat_message(
        &self,
        query: &ChatQuery,
    ) -> Result<ChatResponseData, TransportError> {
        let response = self
            .client
            .post(self.endpoint(CHAT_PATH)?)
            .timeout(self.request_timeout)
            .json(query)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let (status, body) = read_body(response).await?;
        decode_payload(status, &body)
    }

    async fn stream_chat_message(&self, query: &ChatQuery) -> EventStream {
        match self.open_stream(query).await {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, "failed to open chat stream");
                Box::pin(stream::once(async move { StreamEvent::Error(err) }))
            }
        }
    }

    async fn chat_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatResponseData>, TransportError> {
        let url = self.endpoint(&format!("{HISTORY_PATH}{session_id}"))?;
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let (status, body) = read_body(response).await?;
        decode_payload(status, &body)
    }

    async fn create_session(&self) -> Result<String, TransportError> {
        let response = self
            .client
            .post(self.endpoint(SESSION_PATH)?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let (status, body) = read_body(response).await?;
        let created: SessionCreated = decode_payload(status, &body)?;
        Ok(created.session_id)
    }

    async fn submit_feedback(&self, feedback: &Feedback) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoint(FEEDBACK_PATH)?)
            .timeout(self.request_timeout)
            .json(feedback)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        read_body(response).await.map(|_| ())
    }
}

/// Reads the body, turning non-success statuses into typed errors.
async fn read_body(response: Response) -> Result<(u16, String), TransportError> {
    let status = response.status().as_u16();
    let success = response.status().is_success();
    let body = response.text().await.map_err(TransportError::from_reqwest)?;
    if !success {
        return Err(TransportError::from_response(status, &body));
    }
    Ok((status, body))
}

/// Decodes a success body that is either the `{success, data, error}`
/// envelope or the bare payload.
pub fn decode_payload<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, TransportError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| TransportError::parse(status, format!("invalid JSON body: {err}")))?;
    let enveloped = value
        .as_object()
        .map(|object| object.contains_key("data") || object.contains_key("error"))
        .unwrap_or(false);
    if !enveloped {
        return serde_json::from_value(value)
            .map_err(|err| TransportError::parse(status, err.to_string()));
    }
    let envelope: ApiEnvelope<T> = serde_json::from_value(value)
        .map_err(|err| TransportError::parse(status, err.to_string()))?;
    if let Some(error) = envelope.error {
        return Err(TransportError::server(
            status,
            error.machine_code(),
            error.message,
        ));
    }
    match (envelope.success, envelope.data) {
        (Some(false), _) => Err(TransportError::server(
            status,
            "REQUEST_FAILED",
            "Server reported failure without details",
        )),
        (_, Some(data)) => Ok(data),
        (_, None) => Err(TransportError::parse(status, "response envelope carried no data")),
    }
}

fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
