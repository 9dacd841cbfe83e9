//! CLI binary for focus-voice.

use clap::{Parser, Subcommand};
use focus_voice::audio::{AudioOutput, MemoryOutput};
use focus_voice::{FocusConfig, RuntimeEvent, SpeechBackend, TurnCoordinator};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Speak assistant answers sentence by sentence as they stream in.
#[derive(Parser)]
#[command(name = "focus-voice", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep audio in memory instead of playing it.
    #[arg(long, global = true)]
    silent: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask one question and wait for the spoken answer.
    Ask {
        question: String,
        #[arg(long)]
        persona: Option<String>,
    },

    /// Interactive conversation on stdin.
    Chat {
        #[arg(long)]
        persona: Option<String>,
    },

    /// Upload an audio file for transcription.
    Transcribe {
        file: PathBuf,
        /// Ask the transcript as a question.
        #[arg(long)]
        ask: bool,
    },

    /// List output devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so streamed answer text on stdout stays clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("focus_voice=info,reqwest=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Ask { question, persona } => run_ask(config, cli.silent, &question, persona).await,
        Command::Chat { persona } => run_chat(config, cli.silent, persona).await,
        Command::Transcribe { file, ask } => run_transcribe(config, cli.silent, &file, ask).await,
        Command::Devices => list_devices(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FocusConfig> {
    if let Some(path) = path {
        return Ok(FocusConfig::from_file(path)?);
    }
    let default_path = FocusConfig::default_config_path();
    if default_path.exists() {
        info!("loading config from {}", default_path.display());
        Ok(FocusConfig::from_file(&default_path)?)
    } else {
        Ok(FocusConfig::default())
    }
}

fn build_output(config: &FocusConfig, silent: bool) -> Arc<dyn AudioOutput> {
    if silent {
        return Arc::new(MemoryOutput::new());
    }
    speaker_output(config)
}

#[cfg(feature = "speaker")]
fn speaker_output(config: &FocusConfig) -> Arc<dyn AudioOutput> {
    Arc::new(focus_voice::audio::SpeakerOutput::new(
        config.playback.output_device.clone(),
    ))
}

#[cfg(not(feature = "speaker"))]
fn speaker_output(_config: &FocusConfig) -> Arc<dyn AudioOutput> {
    warn!("built without the `speaker` feature; audio is not played");
    Arc::new(MemoryOutput::new())
}

fn build_coordinator(config: FocusConfig, silent: bool) -> anyhow::Result<Arc<TurnCoordinator>> {
    let output = build_output(&config, silent);
    let (tx, rx) = broadcast::channel(focus_voice::runtime::RUNTIME_EVENT_CAPACITY);
    tokio::spawn(render_events(rx));
    Ok(Arc::new(TurnCoordinator::new(config, output)?.with_runtime_events(tx)))
}

/// Print streamed answer text and status lines as they happen.
async fn render_events(mut rx: broadcast::Receiver<RuntimeEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("terminal output skipped {n} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            RuntimeEvent::AnswerDelta { text, .. } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            RuntimeEvent::TurnFinished { .. } => println!(),
            RuntimeEvent::SessionTitle { title, .. } => eprintln!("[session] {title}"),
            RuntimeEvent::Status { message } => eprintln!("[status] {message}"),
            _ => {}
        }
    }
}

async fn ask_and_wait(coordinator: &TurnCoordinator, question: &str) {
    tokio::select! {
        result = async {
            let report = coordinator.ask(question).await?;
            coordinator.wait_idle().await;
            Ok::<_, focus_voice::FocusError>(report)
        } => {
            if let Err(e) = result {
                eprintln!("[error] {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, stopping playback");
            coordinator.stop();
        }
    }
}

async fn run_ask(
    config: FocusConfig,
    silent: bool,
    question: &str,
    persona: Option<String>,
) -> anyhow::Result<()> {
    let coordinator = build_coordinator(config, silent)?;
    if persona.is_some() {
        coordinator.set_persona(persona)?;
    }
    println!("> {question}");
    ask_and_wait(&coordinator, question).await;
    Ok(())
}

async fn run_chat(
    config: FocusConfig,
    silent: bool,
    persona: Option<String>,
) -> anyhow::Result<()> {
    println!("focus-voice v{}", env!("CARGO_PKG_VERSION"));
    println!("Type a question. Commands: /persona NAME, /new, /voice remote|device, /quit\n");

    let coordinator = build_coordinator(config, silent)?;
    if persona.is_some() {
        coordinator.set_persona(persona)?;
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit" | "/exit", _) => break,
            ("/new", _) => {
                coordinator.new_chat();
                println!("[new conversation]");
            }
            ("/persona", name) => {
                let name = name.trim();
                coordinator.set_persona((!name.is_empty()).then(|| name.to_owned()))?;
                println!("[persona: {}]", if name.is_empty() { "default" } else { name });
            }
            ("/voice", backend) => match backend.parse::<SpeechBackend>() {
                Ok(backend) => {
                    coordinator.set_speech_backend(backend)?;
                    println!("[voice: {backend:?}]");
                }
                Err(e) => eprintln!("[error] {e}"),
            },
            _ => ask_and_wait(&coordinator, line).await,
        }
    }
    coordinator.stop();
    Ok(())
}

async fn run_transcribe(
    config: FocusConfig,
    silent: bool,
    file: &Path,
    ask: bool,
) -> anyhow::Result<()> {
    let audio = tokio::fs::read(file).await?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("recording.webm")
        .to_owned();
    let mime = mime_for(file);

    let coordinator = build_coordinator(config, silent)?;
    if ask {
        tokio::select! {
            result = coordinator.handle_recording(audio, &file_name, mime) => {
                result?;
                coordinator.wait_idle().await;
            }
            _ = tokio::signal::ctrl_c() => coordinator.stop(),
        }
    } else {
        let transcript = coordinator.client().transcribe(audio, &file_name, mime).await?;
        println!("{transcript}");
    }
    Ok(())
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg" | "oga") => "audio/ogg",
        Some("m4a" | "mp4") => "audio/mp4",
        _ => "audio/webm",
    }
}

#[cfg(feature = "speaker")]
fn list_devices() -> anyhow::Result<()> {
    println!("Output devices:");
    for name in focus_voice::audio::SpeakerOutput::list_output_devices()? {
        println!("  - {name}");
    }
    Ok(())
}

#[cfg(not(feature = "speaker"))]
fn list_devices() -> anyhow::Result<()> {
    println!("Built without the `speaker` feature; no output devices to list.");
    Ok(())
}
