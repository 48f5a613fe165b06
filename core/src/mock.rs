use crate::error::TransportError;
use crate::session::{ContextSource, RiskAssessment, RiskLevel};
use crate::sse::{EventStream, StreamEvent};
use crate::transport::{ChatQuery, ChatResponseData, ChatTransport, Feedback, HealthStatus};
use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use uuid::Uuid;

type QueryProbe = Box<dyn Fn(&ChatQuery) + Send + Sync>;

/// Scripted body for one `stream_chat_message` call.
pub enum MockStream {
    Events(Vec<StreamEvent>),
    Channel(UnboundedReceiver<StreamEvent>),
}

/// In-process stand-in for the chat API.
///
/// Replies are taken from the scripted queues first; when a queue is empty a
/// synthetic echo of the query is produced instead.
pub struct MockTransport {
    healthy: AtomicBool,
    health_script: Mutex<VecDeque<bool>>,
    replies: Mutex<VecDeque<Result<ChatResponseData, TransportError>>>,
    streams: Mutex<VecDeque<MockStream>>,
    queries: Mutex<Vec<ChatQuery>>,
    feedback: Mutex<Vec<Feedback>>,
    probe: Mutex<Option<QueryProbe>>,
    health_checks: AtomicUsize,
    sends: AtomicUsize,
    stream_opens: AtomicUsize,
    latency: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::with_latency(Duration::ZERO)
    }
}

impl MockTransport {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            health_script: Mutex::new(VecDeque::new()),
            replies: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
            feedback: Mutex::new(Vec::new()),
            probe: Mutex::new(None),
            health_checks: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            stream_opens: AtomicUsize::new(0),
            latency,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Outcomes for the next health checks, ahead of the steady-state flag.
    pub fn script_health(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.health_script.lock().extend(outcomes);
    }

    pub fn push_reply(&self, reply: Result<ChatResponseData, TransportError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_stream(&self, stream: MockStream) {
        self.streams.lock().push_back(stream);
    }

    /// Called with each chat query as the request starts, before any reply.
    pub fn set_probe(&self, probe: impl Fn(&ChatQuery) + Send + Sync + 'static) {
        *self.probe.lock() = Some(Box::new(probe));
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<ChatQuery> {
        self.queries.lock().clone()
    }

    pub fn feedback(&self) -> Vec<Feedback> {
        self.feedback.lock().clone()
    }

    fn record(&self, query: &ChatQuery) {
        self.queries.lock().push(query.clone());
        if let Some(probe) = self.probe.lock().as_ref() {
            probe(query);
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn health_check(&self) -> Result<HealthStatus, TransportError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let scripted = self.health_script.lock().pop_front();
        let healthy = scripted.unwrap_or_else(|| self.healthy.load(Ordering::SeqCst));
        if healthy {
            Ok(HealthStatus::healthy("mock"))
        } else {
            Err(TransportError::network("mock backend is unreachable"))
        }
    }

    async fn send_chat_message(
        &self,
        query: &ChatQuery,
    ) -> Result<ChatResponseData, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.record(query);
        self.simulate_latency().await;
        let scripted = self.replies.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(synthetic_reply(query)))
    }

    async fn stream_chat_message(&self, query: &ChatQuery) -> EventStream {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        self.record(query);
        self.simulate_latency().await;
        let scripted = self.streams.lock().pop_front();
        match scripted {
            Some(MockStream::Events(events)) => Box::pin(stream::iter(events)),
            Some(MockStream::Channel(rx)) => Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })),
            None => {
                let reply = synthetic_reply(query);
                let mut events: Vec<StreamEvent> = reply
                    .response
                    .split_inclusive(' ')
                    .map(|word| StreamEvent::Chunk(word.to_string()))
                    .collect();
                events.push(StreamEvent::Metadata(reply.metadata()));
                events.push(StreamEvent::Done);
                Box::pin(stream::iter(events))
            }
        }
    }

    async fn chat_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatResponseData>, TransportError> {
        self.simulate_latency().await;
        let queries = self.queries.lock().clone();
        Ok(queries
            .iter()
            .filter(|query| query.session_id.as_deref() == Some(session_id))
            .map(synthetic_reply)
            .collect())
    }

    async fn create_session(&self) -> Result<String, TransportError> {
        self.simulate_latency().await;
        Ok(format!("sess_{}", Uuid::new_v4().simple()))
    }

    async fn submit_feedback(&self, feedback: &Feedback) -> Result<(), TransportError> {
        self.simulate_latency().await;
        self.feedback.lock().push(feedback.clone());
        Ok(())
    }
}

/// Echo reply used when nothing has been scripted.
pub fn synthetic_reply(query: &ChatQuery) -> ChatResponseData {
    let location = query
        .location
        .as_deref()
        .map(|loc| format!(" near {loc}"))
        .unwrap_or_default();
    ChatResponseData {
        query: query.text.clone(),
        response: format!("[Mock] You asked{location}: '{}'.", query.text),
        confidence_score: Some(0.9),
        risk_assessment: Some(RiskAssessment {
            overall_risk: RiskLevel::Low,
            recommendation: Some("Verify with the official office before acting.".to_string()),
            safety_score: Some(0.95),
            warnings: Vec::new(),
        }),
        context_sources: vec![ContextSource {
            id: "mock_doc_001".to_string(),
            title: "Mock knowledge base entry".to_string(),
            relevance_score: 0.8,
        }],
        processing_time: Some(0.02),
        session_id: query.session_id.clone(),
        timestamp: None,
    }
}
