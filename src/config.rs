use serde::{Deserialize, Serialize};

/// Which transcription backend the orchestrator routes audio to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Remote API, interval-driven chunk flushing, no speech gating
    Remote,

    /// Remote API with voice-activity-gated speech spans
    #[serde(alias = "remote-vad", alias = "vad")]
    RemoteVad,

    /// In-process whisper.cpp engine fed directly from the microphone
    Local,
}

impl Default for BackendMode {
    fn default() -> Self {
        BackendMode::RemoteVad
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendMode::Remote => write!(f, "remote"),
            BackendMode::RemoteVad => write!(f, "remote_vad"),
            BackendMode::Local => write!(f, "local"),
        }
    }
}

/// Microphone constraints and chunk slicing parameters.
///
/// These are caller-supplied configuration, not hardcoded policy: the
/// capture session forwards them when opening the device stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested sample rate in Hz (16000 or 44100 are the usual choices)
    pub sample_rate: u32,
    /// Requested channel count (1 = mono)
    pub channels: u16,
    /// Ask the host audio stack for echo cancellation where supported
    pub echo_cancellation: bool,
    /// Ask the host audio stack for noise suppression where supported
    pub noise_suppression: bool,
    /// Emit one header-bearing chunk per this many milliseconds of audio
    pub slice_interval_ms: u64,
    /// When false, a single chunk is emitted at stop time instead
    pub streaming: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            slice_interval_ms: 1000,
            streaming: true,
        }
    }
}

/// Voice activity detection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Probability threshold for speech onset (0.0-1.0)
    pub threshold: f32,
    /// Lower threshold for speech continuation (hysteresis)
    pub speech_end_threshold: f32,
    /// Size of analysis frames in samples
    pub frame_size: usize,
    /// Frames above threshold before confirming speech
    pub hangbefore_frames: usize,
    /// Frames below threshold before ending speech
    pub hangover_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            speech_end_threshold: 0.15,
            frame_size: 512, // 32ms window at 16kHz
            hangbefore_frames: 3,
            hangover_frames: 20,
        }
    }
}

/// Remote transcription API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteApiConfig {
    /// Endpoint accepting multipart `file`/`model`/`response_format`
    pub endpoint: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Bearer token; empty disables the auth header
    pub api_key: String,
    /// Run the ffmpeg silence-removal pre-pass before dispatch
    pub remove_silence: bool,
    /// Trimmed output below this size is treated as "no speech detected"
    pub min_file_bytes: u64,
}

impl Default for RemoteApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            model: "whisper-1".to_string(),
            api_key: String::new(),
            remove_silence: false,
            min_file_bytes: 1024,
        }
    }
}

/// Local whisper.cpp engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEngineConfig {
    /// Model size tier: tiny, base, small, medium or large
    pub model_tier: String,
    /// Seconds of audio buffered before each inference pass
    pub chunk_duration_secs: f32,
    /// Engine input sample rate; whisper models expect 16kHz mono
    pub sample_rate: u32,
    /// Inference threads
    pub threads: usize,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            model_tier: "tiny".to_string(),
            chunk_duration_secs: 3.0,
            sample_rate: 16000,
            threads: num_cpus::get().min(4),
        }
    }
}

/// Orchestrator-level policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Which backend receives the audio
    pub backend: BackendMode,
    /// Language hint for transcription ("auto" lets the backend detect)
    pub language: String,
    /// Flush an interim transcript this often while speech is ongoing.
    /// Independent of `capture.slice_interval_ms`; the two are unrelated
    /// constants and are configured separately on purpose.
    pub interim_flush_interval_ms: u64,
    /// Arm the idle-stop timer: the recording auto-stops after
    /// `stop_timeout_ms` of silence. Off by default, so recording runs
    /// until stopped explicitly.
    pub non_stop: bool,
    /// Idle period after speech-end before recording stops (non_stop only)
    pub stop_timeout_ms: u64,
    /// Transcribe the whole session when recording stops
    pub auto_transcribe: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: BackendMode::default(),
            language: "auto".to_string(),
            interim_flush_interval_ms: 2000,
            non_stop: false,
            stop_timeout_ms: 5000,
            auto_transcribe: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub remote: RemoteApiConfig,
    pub local: LocalEngineConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Helper function to read the application configuration
pub fn read_app_config() -> AppConfig {
    match std::fs::read_to_string("config.toml") {
        Ok(config_str) => match toml::from_str(&config_str) {
            Ok(config) => config,
            Err(e) => {
                println!(
                    "Failed to parse config.toml: {}. Using default configuration.",
                    e
                );
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_slice_and_flush_intervals_independent() {
        let config = AppConfig::default();
        assert_eq!(config.capture.slice_interval_ms, 1000);
        assert_eq!(config.orchestrator.interim_flush_interval_ms, 2000);
    }

    #[test]
    fn backend_mode_aliases_parse() {
        let config: AppConfig =
            toml::from_str("[orchestrator]\nbackend = \"remote-vad\"\n").unwrap();
        assert_eq!(config.orchestrator.backend, BackendMode::RemoteVad);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig = toml::from_str("[local]\nmodel_tier = \"base\"\n").unwrap();
        assert_eq!(config.local.model_tier, "base");
        assert_eq!(config.local.sample_rate, 16000);
        assert!(config.orchestrator.auto_transcribe);
    }
}
