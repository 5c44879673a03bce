use std::io::Write;

mod audio_capture;
mod config;
mod container;
mod dispatcher;
mod download;
mod error;
mod local_engine;
mod recording_orchestrator;
mod voice_gate;

use clap::Parser;
use config::{read_app_config, BackendMode};
use recording_orchestrator::{PipelineEvent, RecordingOrchestrator};

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Streaming microphone transcription with remote or local Whisper backends")]
#[command(version)]
struct Args {
    /// Backend to use: remote, remote-vad, or local
    #[arg(long)]
    backend: Option<String>,

    /// Whisper model tier for the local backend (tiny, base, small, medium, large)
    #[arg(long)]
    model: Option<String>,

    /// Language hint, or "auto" for detection
    #[arg(long)]
    language: Option<String>,

    /// Skip the full-session transcription pass when recording stops
    #[arg(long)]
    no_auto_transcribe: bool,

    /// Stop automatically after the idle timeout once speech ends
    #[arg(long)]
    non_stop: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("Loading configuration...");
    let mut app_config = read_app_config();

    if let Some(backend) = &args.backend {
        app_config.orchestrator.backend = match backend.as_str() {
            "remote" => BackendMode::Remote,
            "remote-vad" | "vad" => BackendMode::RemoteVad,
            "local" => BackendMode::Local,
            other => anyhow::bail!("unknown backend '{}'", other),
        };
    }
    if let Some(model) = args.model {
        app_config.local.model_tier = model;
    }
    if let Some(language) = args.language {
        app_config.orchestrator.language = language;
    }
    if args.no_auto_transcribe {
        app_config.orchestrator.auto_transcribe = false;
    }
    if args.non_stop {
        app_config.orchestrator.non_stop = true;
    }

    let backend = app_config.orchestrator.backend;
    let mut orchestrator = RecordingOrchestrator::new(app_config);

    if backend == BackendMode::RemoteVad {
        println!("Initializing voice activity model...");
        match download::init_silero_model().await {
            Ok(path) => orchestrator.set_silero_model(path),
            Err(e) => eprintln!("Silero VAD unavailable, using energy detector: {}", e),
        }
    }

    let mut events = orchestrator.subscribe();

    println!("Starting recording ({} backend)...", backend);
    orchestrator.start_recording().await?;
    println!("Listening. Press Ctrl+C to stop.");
    println!("=====================================");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PipelineEvent::Transcription { text, language }) => {
                    match language {
                        Some(lang) => print!("[{}] {} ", lang, text),
                        None => print!("{} ", text),
                    }
                    std::io::stdout().flush()?;
                }
                Ok(PipelineEvent::SpeechStarted) => {}
                Ok(PipelineEvent::SpeechEnded) => {}
                Ok(PipelineEvent::Error { message }) => {
                    eprintln!("\nerror: {}", message);
                }
                Ok(PipelineEvent::Stopped) => {
                    println!("\nRecording stopped.");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("\nDropped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                orchestrator.stop_recording().await;
                break;
            }
        }
    }

    if let Some(transcript) = orchestrator.transcript().text {
        println!("=====================================");
        println!("{}", transcript);
    }

    orchestrator.shutdown().await;
    Ok(())
}
