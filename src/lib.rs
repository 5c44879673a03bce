pub mod audio_capture;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod local_engine;
pub mod recording_orchestrator;
pub mod voice_gate;

// Re-export key components for easier access
pub use audio_capture::{AudioCaptureSession, CaptureState, ChunkSlicer};
pub use config::{read_app_config, AppConfig, BackendMode};
pub use container::{merge, AudioChunk, MergedContainer, WavFormat};
pub use dispatcher::{DispatchOutcome, Transcript, TranscriptionDispatcher};
pub use error::PipelineError;
pub use local_engine::{EngineState, LocalInferenceEngine};
pub use recording_orchestrator::{PipelineEvent, RecordingOrchestrator};
pub use voice_gate::{SpeechEvent, VoiceActivityGate};
