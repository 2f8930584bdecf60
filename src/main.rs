use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use chatsync::config::{default_config_path, load_effective_config};
use chatsync::events::{ClientEvent, EventSink};
use chatsync::stream_parser::Utf8Decoder;
use chatsync::tool_dispatcher::{ConfirmationPrompter, ConfirmationRequest};
use chatsync::{ClientState, StreamChunkParser, WireFormat};

#[derive(Parser)]
#[command(name = "chatsync", version, about = "Streaming chat client and conversation sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a captured response body and print its events as JSON lines
    Parse {
        file: PathBuf,
        /// Wire format of the capture (json or sse)
        #[arg(long, default_value = "json")]
        format: WireFormat,
        /// Feed the parser this many bytes at a time (0 = whole file)
        #[arg(long, default_value_t = 0)]
        chunk: usize,
    },
    /// Send one prompt and stream the reply
    Chat {
        prompt: String,
        #[arg(long)]
        conversation: Option<String>,
        /// Wait for the server to title the conversation before exiting
        #[arg(long)]
        sync_title: bool,
    },
}

/// Asks on the terminal; anything but y/yes denies
struct StdinPrompter;

#[async_trait]
impl ConfirmationPrompter for StdinPrompter {
    async fn confirm(&self, request: ConfirmationRequest) -> bool {
        eprint!(
            "\nAllow `{}` to read {:?} ({})? [y/N] ",
            request.tool_name, request.family, request.input
        );
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Parse {
            file,
            format,
            chunk,
        } => cmd_parse(&file, format, chunk),
        Commands::Chat {
            prompt,
            conversation,
            sync_title,
        } => {
            let config_path = cli.config.unwrap_or_else(default_config_path);
            cmd_chat(config_path, prompt, conversation, sync_title).await
        }
    }
}

fn cmd_parse(file: &Path, format: WireFormat, chunk: usize) -> Result<(), String> {
    let bytes = std::fs::read(file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let chunk = if chunk == 0 { bytes.len().max(1) } else { chunk };

    let mut parser = StreamChunkParser::new(format);
    let mut decoder = Utf8Decoder::new();
    let mut events = Vec::new();
    for piece in bytes.chunks(chunk) {
        events.extend(parser.feed(&decoder.decode(piece)));
    }
    events.extend(parser.feed(&decoder.finish()));
    events.extend(parser.finish());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in &events {
        let line = serde_json::to_string(event).map_err(|e| e.to_string())?;
        writeln!(out, "{line}").map_err(|e| e.to_string())?;
    }

    for error in parser.errors() {
        tracing::warn!(%error, "skipped frame");
    }
    tracing::info!(
        events = events.len(),
        errors = parser.errors().len(),
        "parse finished"
    );
    Ok(())
}

async fn cmd_chat(
    config_path: PathBuf,
    prompt: String,
    conversation: Option<String>,
    sync_title: bool,
) -> Result<(), String> {
    let config = load_effective_config(&config_path);
    tracing::info!(backend = %config.backend_url, format = ?config.wire_format, "starting chat");

    let (events, mut rx) = EventSink::channel();
    let state = ClientState::from_config(config, Arc::new(StdinPrompter), events)
        .map_err(|e| format!("failed to build http client: {e}"))?;

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ClientEvent::ChatUpdate(update) => {
                    print!("{}", update.delta);
                    let _ = std::io::stdout().flush();
                }
                ClientEvent::Toast(toast) => eprintln!("\n[backend] {}", toast.message),
                ClientEvent::HistorySettled(settled) => {
                    tracing::info!(title = %settled.title, "conversation titled");
                }
                other => tracing::debug!(event = other.name(), "client event"),
            }
        }
    });

    let conversation_id = conversation.unwrap_or_else(|| Uuid::new_v4().to_string());
    let result = {
        let send = state.send(Some(&conversation_id), &prompt);
        tokio::pin!(send);
        tokio::select! {
            res = &mut send => res,
            _ = tokio::signal::ctrl_c() => {
                state.stop(&conversation_id);
                (&mut send).await
            }
        }
    };
    let outcome = result.map_err(|e| e.to_string())?;
    println!();

    if outcome.message.error.is_some() {
        eprintln!("{}", outcome.message.content);
    }
    for pending in state.integrations.drain() {
        let line = serde_json::to_string(&pending).map_err(|e| e.to_string())?;
        println!("{line}");
    }

    if sync_title {
        state.history.wait_idle().await;
        if let Some(title) = state.store.title(&conversation_id) {
            println!("title: {title}");
        }
    }

    tracing::info!(conversation_id = %conversation_id, state = ?outcome.message.state, "done");
    state.shutdown();
    drop(state);
    let _ = printer.await;
    Ok(())
}
