use chrono::{DateTime, Local, Utc};
use jugaad_core::session::{
    ChatSession, Message, MessageMetadata, MessageRole, RiskLevel, SessionSummary,
};
use jugaad_core::state::ChatState;
use uuid::Uuid;

const SHORT_ID_LEN: usize = 8;

pub fn role_badge(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "System",
        MessageRole::User => "You",
        MessageRole::Assistant => "Jugaad",
    }
}

pub fn risk_label(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
        RiskLevel::Critical => "critical",
    }
}

pub fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(SHORT_ID_LEN).collect()
}

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    let local: DateTime<Local> = DateTime::from(time);
    local.format("%b %e, %H:%M").to_string()
}

/// One-line summary such as `confidence 92% | risk low | 2 sources | 1.20s`.
pub fn render_metadata(metadata: &MessageMetadata) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(confidence) = metadata.confidence_score {
        parts.push(format!("confidence {:.0}%", confidence * 100.0));
    }
    if let Some(risk) = &metadata.risk_assessment {
        parts.push(format!("risk {}", risk_label(risk.overall_risk)));
    }
    match metadata.context_sources.len() {
        0 => {}
        1 => parts.push("1 source".to_string()),
        n => parts.push(format!("{n} sources")),
    }
    if let Some(seconds) = metadata.processing_time {
        parts.push(format!("{seconds:.2}s"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

fn annotations(message: &Message, show_metadata: bool) -> String {
    let mut out = String::new();
    if let Some(error) = &message.error {
        out.push_str(&format!("\n  ! {error}"));
    }
    if !show_metadata {
        return out;
    }
    let Some(metadata) = &message.metadata else {
        return out;
    };
    if let Some(line) = render_metadata(metadata) {
        out.push_str(&format!("\n  [{line}]"));
    }
    if let Some(risk) = &metadata.risk_assessment {
        if let Some(recommendation) = &risk.recommendation {
            out.push_str(&format!("\n  tip: {recommendation}"));
        }
        for warning in &risk.warnings {
            out.push_str(&format!("\n  warning: {warning}"));
        }
    }
    for source in &metadata.context_sources {
        out.push_str(&format!(
            "\n  source: {} ({:.0}%)",
            source.title,
            source.relevance_score * 100.0
        ));
    }
    out
}

pub fn render_message(message: &Message, show_metadata: bool) -> String {
    let body = if message.is_loading && message.content.is_empty() {
        "..."
    } else {
        message.content.as_str()
    };
    format!(
        "{}: {}{}",
        role_badge(message.role),
        body,
        annotations(message, show_metadata)
    )
}

pub fn render_transcript(session: &ChatSession, show_metadata: bool) -> String {
    let mut out = format!("# {} ({})", session.title, short_id(session.id));
    if let Some(location) = &session.location {
        out.push_str(&format!(" @ {location}"));
    }
    for message in &session.messages {
        out.push_str("\n\n");
        out.push_str(&render_message(message, show_metadata));
    }
    out
}

pub fn render_session_list(sessions: &[SessionSummary], current: Option<Uuid>) -> String {
    if sessions.is_empty() {
        return "No saved chats.".to_string();
    }
    sessions
        .iter()
        .map(|summary| {
            let marker = if Some(summary.id) == current { '*' } else { ' ' };
            format!(
                "{marker} {}  {}  ({} messages, {})",
                short_id(summary.id),
                summary.title,
                summary.message_count,
                format_timestamp(summary.updated_at)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_status(state: &ChatState) -> String {
    let mut lines = vec![
        format!(
            "connection: {}",
            if state.is_connected { "online" } else { "offline" }
        ),
        format!("saved chats: {}", state.sessions.len()),
    ];
    match &state.current_session {
        Some(session) => lines.push(format!(
            "current: {} ({}, {} messages)",
            session.title,
            short_id(session.id),
            session.messages.len()
        )),
        None => lines.push("current: none".to_string()),
    }
    if state.is_loading {
        lines.push("waiting for a reply".to_string());
    }
    if let Some(error) = &state.error {
        lines.push(format!("error: {error}"));
    }
    lines.join("\n")
}

/// Incremental terminal writer for a reply that is still being filled in.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    message: Option<Uuid>,
    printed: String,
}

impl StreamPrinter {
    /// Text to write so the terminal catches up with `message`.
    pub fn advance(&mut self, message: &Message) -> String {
        let mut out = String::new();
        if self.message != Some(message.id) {
            if self.message.is_some() {
                out.push('\n');
            }
            out.push_str(role_badge(message.role));
            out.push_str(": ");
            self.message = Some(message.id);
            self.printed.clear();
        }
        match message.content.strip_prefix(self.printed.as_str()) {
            Some(delta) => out.push_str(delta),
            None => {
                out.push('\n');
                out.push_str(&message.content);
            }
        }
        self.printed.clone_from(&message.content);
        out
    }

    /// Final catch-up plus the error and metadata lines.
    pub fn finish(&mut self, message: &Message, show_metadata: bool) -> String {
        let mut out = self.advance(message);
        out.push_str(&annotations(message, show_metadata));
        out.push('\n');
        *self = Self::default();
        out
    }
}
