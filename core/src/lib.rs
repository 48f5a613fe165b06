pub mod config;
pub mod error;
pub mod mock;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod sse;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;


pub use config::{ClientConfig, ConfigError, MonitorSettings, RetryPolicy, TransportKind};
pub use error::{ChatError, TransportError, ValidationError};
pub use mock::{MockStream, MockTransport};
pub use monitor::{ConnectionMonitor, RECONNECTING_MESSAGE};
pub use orchestrator::{SendMode, SendOrchestrator};
pub use session::{
    ChatSession, Message, MessageMetadata, MessagePatch, MessageRole, NewMessage, RiskLevel,
    SessionExport, SessionSummary,
};
pub use sse::StreamEvent;
pub use state::{AbortHandle, AbortSignal, ChatState, SendOptions, SessionStore};
pub use store::SessionStorage;
pub use transport::{ApiClient, ChatQuery, ChatTransport, Feedback, HttpTransport};
