use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use jugaad::render::{render_message, render_session_list, short_id};
use jugaad::{build_orchestrator, cli_settings_path, load_cli_settings, ChatApp};
use jugaad_core::config::{ClientConfig, TransportKind};
use jugaad_core::orchestrator::SendMode;
use jugaad_core::state::SendOptions;
use jugaad_core::telemetry;
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "Jugaad", version, about = "Chat with the Jugaad assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Backend base URL, overriding jugaad.yaml and JUGAAD_API_URL.
    #[arg(long, global = true)]
    api_url: Option<Url>,
    /// Use the in-process mock backend.
    #[arg(long, global = true)]
    mock: bool,
    /// Directory holding chat-storage.json.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat (the default).
    Chat,
    /// Ask a single question and print the answer.
    Ask {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        stream: bool,
        #[arg(long)]
        location: Option<String>,
    },
    /// Probe the backend health endpoint.
    Health,
    /// List saved chats.
    Sessions,
    Export {
        #[arg(long)]
        out: PathBuf,
        /// Chat id or unique prefix; defaults to the most recent chat.
        #[arg(long)]
        session: Option<String>,
    },
    Import {
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        telemetry::filter_from_env("warn")
    };
    telemetry::init_tracing(filter)?;

    let mut config = ClientConfig::load().map_err(|err| anyhow!(err.user_message()))?;
    if let Some(url) = cli.api_url.clone() {
        config.api_base_url = url;
    }
    if cli.mock {
        config.transport = TransportKind::Mock;
    }
    if let Some(dir) = cli.data_dir.clone() {
        config.storage_path = Some(dir);
    }

    let runtime = Runtime::new()?;
    runtime.block_on(run(cli.command.unwrap_or(Command::Chat), config))
}

async fn run(command: Command, config: ClientConfig) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&config)?;
    let store = orchestrator.store().clone();

    match command {
        Command::Chat => {
            let settings_path = cli_settings_path();
            let settings = load_cli_settings(&settings_path).await?;
            let mut app = ChatApp::new(
                orchestrator,
                settings,
                Some(settings_path),
                std::io::stdout(),
            );
            app.run().await?;
        }
        Command::Ask {
            text,
            stream,
            location,
        } => {
            let mode = if stream {
                SendMode::Streaming
            } else {
                SendMode::Blocking
            };
            let options = SendOptions {
                location,
                abort: None,
            };
            let outcome = orchestrator.send(&text.join(" "), options, mode).await;
            if let Some(reply) = store
                .current_session()
                .and_then(|session| session.messages.last().cloned())
            {
                println!("{}", render_message(&reply, true));
            }
            outcome?;
        }
        Command::Health => {
            let health = store.api().health_check().await?;
            println!(
                "{:?} (version {})",
                health.status,
                health.version.as_deref().unwrap_or("unknown")
            );
        }
        Command::Sessions => {
            println!("{}", render_session_list(&store.session_summaries(), None));
        }
        Command::Export { out, session } => {
            let summaries = store.session_summaries();
            let target = match session {
                Some(prefix) => summaries
                    .iter()
                    .find(|summary| summary.id.to_string().starts_with(prefix.trim()))
                    .map(|summary| summary.id.to_string())
                    .unwrap_or(prefix),
                None => summaries
                    .first()
                    .map(|summary| summary.id.to_string())
                    .ok_or_else(|| anyhow!("no saved chats to export"))?,
            };
            store.load_session(&target)?;
            let json = store
                .export_session_json()?
                .ok_or_else(|| anyhow!("no chat selected"))?;
            tokio::fs::write(&out, json)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Exported to {}", out.display());
        }
        Command::Import { file } => {
            let payload = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let id = store.import_session(&payload)?;
            println!("Imported chat {}", short_id(id));
        }
    }

    Ok(())
}
