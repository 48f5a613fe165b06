use crate::config::{save_cli_settings, CliSettings};
use crate::render::{self, StreamPrinter};
use anyhow::Result;
use jugaad_core::error::ChatError;
use jugaad_core::orchestrator::{SendMode, SendOrchestrator};
use jugaad_core::session::{Message, MessageRole};
use jugaad_core::state::{AbortHandle, SendOptions, SessionStore};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

const HELP: &str = "\
Type a question to ask Jugaad. Commands:
  /new                 start a new chat
  /sessions            list saved chats
  /load <id>           switch to a chat (id prefix is enough)
  /delete <id>         delete a chat
  /retry               resend the last message
  /export <path>       write the current chat to a file
  /import <path>       load a chat exported earlier
  /clear-all           delete every saved chat
  /rate <1-5>          rate the last answer
  /stream on|off       stream answers as they are written
  /status              connection and chat status
  /help                this text
  /quit                leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    Sessions,
    Load(String),
    Delete(String),
    Retry,
    Export(PathBuf),
    Import(PathBuf),
    ClearAll,
    Rate(u8),
    Stream(bool),
    Status,
    Help,
    Quit,
    Invalid(String),
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Some(Command::Send(trimmed.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match (name, arg) {
        ("new", _) => Command::New,
        ("sessions" | "list", _) => Command::Sessions,
        ("load", id) if !id.is_empty() => Command::Load(id.to_string()),
        ("delete", id) if !id.is_empty() => Command::Delete(id.to_string()),
        ("retry", _) => Command::Retry,
        ("export", path) if !path.is_empty() => Command::Export(PathBuf::from(path)),
        ("import", path) if !path.is_empty() => Command::Import(PathBuf::from(path)),
        ("clear-all", _) => Command::ClearAll,
        ("rate", value) => match value.parse::<u8>() {
            Ok(rating) => Command::Rate(rating),
            Err(_) => Command::Invalid("usage: /rate <1-5>".to_string()),
        },
        ("stream", "on") => Command::Stream(true),
        ("stream", "off") => Command::Stream(false),
        ("stream", _) => Command::Invalid("usage: /stream on|off".to_string()),
        ("status", _) => Command::Status,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit" | "q", _) => Command::Quit,
        (name @ ("load" | "delete" | "export" | "import"), _) => {
            Command::Invalid(format!("usage: /{name} <argument>"))
        }
        (other, _) => Command::Invalid(format!("unknown command /{other}; try /help")),
    };
    Some(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Terminal chat loop over the send orchestrator.
pub struct ChatApp<W: Write> {
    orchestrator: Arc<SendOrchestrator>,
    settings: CliSettings,
    settings_path: Option<PathBuf>,
    out: W,
    interrupts: Option<mpsc::UnboundedReceiver<()>>,
}

enum Input {
    Line(Option<String>),
    Interrupt,
}

impl<W: Write> ChatApp<W> {
    pub fn new(
        orchestrator: Arc<SendOrchestrator>,
        settings: CliSettings,
        settings_path: Option<PathBuf>,
        out: W,
    ) -> Self {
        Self {
            orchestrator,
            settings,
            settings_path,
            out,
            interrupts: None,
        }
    }

    /// Uses `interrupts` in place of Ctrl-C. Each `()` counts as one press.
    pub fn with_interrupts(mut self, interrupts: mpsc::UnboundedReceiver<()>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub fn store(&self) -> &SessionStore {
        self.orchestrator.store()
    }

    pub fn settings(&self) -> &CliSettings {
        &self.settings
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Reads stdin until EOF, `/quit` or Ctrl-C at the prompt, with the
    /// connection monitor running.
    pub async fn run(&mut self) -> Result<()> {
        self.run_with_input(BufReader::new(tokio::io::stdin())).await
    }

    pub async fn run_with_input<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        let listener = if self.interrupts.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.interrupts = Some(rx);
            Some(tokio::spawn(forward_ctrl_c(tx)))
        } else {
            None
        };
        let result = self.read_loop(input).await;
        if let Some(listener) = listener {
            listener.abort();
        }
        self.orchestrator.monitor().shutdown();
        result
    }

    async fn read_loop<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        writeln!(self.out, "Jugaad chat. Type /help for commands.")?;
        if !self.orchestrator.monitor().start().await {
            writeln!(self.out, "! {}", jugaad_core::RECONNECTING_MESSAGE)?;
        }
        let mut lines = input.lines();
        loop {
            write!(self.out, "> ")?;
            self.out.flush()?;
            let next = tokio::select! {
                line = lines.next_line() => Input::Line(line?),
                () = next_interrupt(&mut self.interrupts) => Input::Interrupt,
            };
            let line = match next {
                Input::Line(Some(line)) => line,
                Input::Line(None) => break,
                Input::Interrupt => {
                    writeln!(self.out)?;
                    break;
                }
            };
            let Some(command) = parse_command(&line) else {
                continue;
            };
            if self.execute(command).await? == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    pub async fn execute(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Send(text) => self.send(text).await?,
            Command::New => {
                let id = self.store().create_session();
                writeln!(self.out, "Started a new chat ({}).", render::short_id(id))?;
            }
            Command::Sessions => {
                let current = self.store().current_session().map(|s| s.id);
                let summaries = self.store().session_summaries();
                let listing = render::render_session_list(&summaries, current);
                writeln!(self.out, "{listing}")?;
            }
            Command::Load(id) => {
                let id = self.resolve_session_id(&id);
                match self.store().load_session(&id) {
                    Ok(()) => {
                        if let Some(session) = self.store().current_session() {
                            let transcript =
                                render::render_transcript(&session, self.settings.show_metadata);
                            writeln!(self.out, "{transcript}")?;
                        }
                    }
                    Err(err) => self.report(&err)?,
                }
            }
            Command::Delete(id) => {
                let resolved = self.resolve_session_id(&id);
                match resolved.parse() {
                    Ok(uuid) => {
                        self.store().delete_session(uuid);
                        writeln!(self.out, "Deleted.")?;
                    }
                    Err(_) => self.report(&ChatError::NotFound(format!("session {id}")))?,
                }
            }
            Command::Retry => {
                let store = self.store().clone();
                self.drive(async move { store.retry_last_message().await }, None)
                    .await?;
            }
            Command::Export(path) => self.export(path).await?,
            Command::Import(path) => match tokio::fs::read_to_string(&path).await {
                Ok(payload) => match self.store().import_session(&payload) {
                    Ok(id) => writeln!(
                        self.out,
                        "Imported chat {} from {}.",
                        render::short_id(id),
                        path.display()
                    )?,
                    Err(err) => self.report(&err)?,
                },
                Err(err) => writeln!(self.out, "! cannot read {}: {err}", path.display())?,
            },
            Command::ClearAll => {
                self.store().clear_all_sessions();
                writeln!(self.out, "All chats deleted.")?;
            }
            Command::Rate(rating) => match self.store().rate_last_response(rating).await {
                Ok(()) => writeln!(self.out, "Thanks for the feedback.")?,
                Err(err) => self.report(&err)?,
            },
            Command::Stream(enabled) => {
                self.settings.stream = enabled;
                self.persist_settings().await;
                writeln!(
                    self.out,
                    "Streaming {}.",
                    if enabled { "on" } else { "off" }
                )?;
            }
            Command::Status => {
                let status = render::render_status(&self.store().snapshot());
                writeln!(self.out, "{status}")?;
            }
            Command::Help => writeln!(self.out, "{HELP}")?,
            Command::Quit => return Ok(Flow::Quit),
            Command::Invalid(message) => writeln!(self.out, "{message}")?,
        }
        self.out.flush()?;
        Ok(Flow::Continue)
    }

    async fn send(&mut self, text: String) -> Result<()> {
        let mode = if self.settings.stream {
            SendMode::Streaming
        } else {
            SendMode::Blocking
        };
        let mut options = SendOptions {
            location: self.settings.location.clone(),
            abort: None,
        };
        let mut abort = None;
        if mode == SendMode::Streaming {
            let (handle, signal) = AbortHandle::pair();
            options = options.with_abort(signal);
            abort = Some(handle);
        }
        let orchestrator = self.orchestrator.clone();
        self.drive(
            async move { orchestrator.send(&text, options, mode).await },
            abort,
        )
        .await
    }

    /// Runs a send, echoing the reply as the store fills it in. Ctrl-C
    /// abandons a streaming reply; a blocking request always runs to the end.
    async fn drive<F>(&mut self, send: F, abort: Option<AbortHandle>) -> Result<()>
    where
        F: Future<Output = Result<(), ChatError>>,
    {
        let previous = self.last_reply().map(|reply| reply.id);
        let mut revisions = self.store().subscribe();
        let mut printer = StreamPrinter::default();
        let mut interrupts = self.interrupts.take();
        tokio::pin!(send);

        let outcome: Result<Result<(), ChatError>> = loop {
            tokio::select! {
                outcome = &mut send => break Ok(outcome),
                Ok(()) = revisions.changed() => {
                    if let Err(err) = self.echo_progress(&mut printer, previous) {
                        break Err(err);
                    }
                }
                () = next_interrupt(&mut interrupts) => match &abort {
                    Some(handle) => handle.abort(),
                    None => {
                        if let Err(err) = writeln!(self.out, "\n(waiting for the reply)") {
                            break Err(err.into());
                        }
                    }
                },
            }
        };
        self.interrupts = interrupts;
        let outcome = outcome?;

        if let Some(reply) = self.fresh_reply(previous) {
            let text = printer.finish(&reply, self.settings.show_metadata);
            write!(self.out, "{text}")?;
        }
        if let Err(err) = outcome {
            if !err.is_transport() {
                self.report(&err)?;
            }
        }
        Ok(())
    }

    fn echo_progress(
        &mut self,
        printer: &mut StreamPrinter,
        previous: Option<Uuid>,
    ) -> Result<()> {
        if let Some(reply) = self.fresh_reply(previous) {
            let text = printer.advance(&reply);
            write!(self.out, "{text}")?;
            self.out.flush()?;
        }
        Ok(())
    }

    fn last_reply(&self) -> Option<Message> {
        self.store()
            .current_session()
            .and_then(|session| session.messages.last().cloned())
            .filter(|message| message.role == MessageRole::Assistant)
    }

    /// The trailing reply, unless it is the one that was there before the send.
    fn fresh_reply(&self, previous: Option<Uuid>) -> Option<Message> {
        self.last_reply().filter(|reply| Some(reply.id) != previous)
    }

    async fn export(&mut self, path: PathBuf) -> Result<()> {
        match self.store().export_session_json() {
            Ok(Some(json)) => match tokio::fs::write(&path, json).await {
                Ok(()) => writeln!(self.out, "Exported to {}.", path.display())?,
                Err(err) => writeln!(self.out, "! cannot write {}: {err}", path.display())?,
            },
            Ok(None) => writeln!(self.out, "No chat is open.")?,
            Err(err) => self.report(&err)?,
        }
        Ok(())
    }

    async fn persist_settings(&self) {
        let Some(path) = &self.settings_path else {
            return;
        };
        if let Err(err) = save_cli_settings(path, &self.settings).await {
            tracing::warn!(%err, "failed to save cli settings");
        }
    }

    /// Expands a unique id prefix to the full session id.
    fn resolve_session_id(&self, prefix: &str) -> String {
        let prefix = prefix.trim();
        let matches: Vec<String> = self
            .store()
            .session_summaries()
            .iter()
            .map(|summary| summary.id.to_string())
            .filter(|id| id.starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [only] => only.clone(),
            _ => prefix.to_string(),
        }
    }

    fn report(&mut self, err: &ChatError) -> Result<()> {
        writeln!(self.out, "! {err}")?;
        Ok(())
    }
}

async fn forward_ctrl_c(tx: mpsc::UnboundedSender<()>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if tx.send(()).is_err() {
            break;
        }
    }
}

/// Resolves on the next interrupt; never resolves once the source is gone.
async fn next_interrupt(interrupts: &mut Option<mpsc::UnboundedReceiver<()>>) {
    if let Some(rx) = interrupts {
        if rx.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}
