//! Local in-process inference engine
//!
//! Runs Whisper GGML models through whisper-rs instead of calling a remote
//! API. The engine owns a small lifecycle: models are fetched into the
//! cache on first use, loaded once, then fed fixed-duration sample chunks
//! from the microphone while streaming.
//!
//! Model fetching and the inference runtime sit behind traits so the
//! lifecycle logic is testable without a network, an audio device, or a
//! multi-hundred-megabyte model file.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

use crate::audio_capture::AudioCaptureSession;
use crate::config::{CaptureConfig, LocalEngineConfig};
use crate::download::{models_dir, ModelFetcher, ModelTier};
use crate::error::PipelineError;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Streaming,
    Disposed,
}

/// A loaded model that turns samples into text.
pub trait InferenceRuntime: Send {
    fn transcribe(&mut self, samples: &[f32], language: &str) -> Result<String, PipelineError>;
}

/// Seam over model loading so tests never touch a real GGML file.
pub trait RuntimeLoader: Send + Sync {
    fn load(
        &self,
        model_path: &Path,
        language: &str,
    ) -> Result<Box<dyn InferenceRuntime>, PipelineError>;
}

pub type TranscriptionCallback = Box<dyn Fn(String, String) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(PipelineError) + Send + Sync>;

/// whisper.cpp runtime via whisper-rs.
pub struct WhisperRuntime {
    /// Kept alive for the lifetime of `state`.
    _context: WhisperContext,
    state: WhisperState,
    threads: usize,
}

impl WhisperRuntime {
    pub fn new(model_path: &Path, threads: usize) -> Result<Self, PipelineError> {
        let ctx_params = WhisperContextParameters::default();

        let model_path_str = model_path.to_str().ok_or_else(|| {
            PipelineError::Initialization("model path contains invalid UTF-8".to_string())
        })?;

        let context = WhisperContext::new_with_params(model_path_str, ctx_params).map_err(|e| {
            PipelineError::Initialization(format!("failed to load GGML model: {:?}", e))
        })?;

        println!("whisper.cpp model loaded successfully!");
        println!("  Model is multilingual: {}", context.is_multilingual());

        // One state reused across transcriptions.
        let state = context.create_state().map_err(|e| {
            PipelineError::Initialization(format!("failed to create whisper state: {:?}", e))
        })?;

        Ok(Self {
            _context: context,
            state,
            threads,
        })
    }
}

impl InferenceRuntime for WhisperRuntime {
    fn transcribe(&mut self, samples: &[f32], language: &str) -> Result<String, PipelineError> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        params.set_n_threads(self.threads as i32);
        params.set_language(Some(language));

        // Console output stays ours.
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_single_segment(true);

        self.state.full(params, samples).map_err(|e| {
            PipelineError::Initialization(format!("transcription failed: {:?}", e))
        })?;

        let mut full_text = String::new();
        for segment in self.state.as_iter() {
            let segment_text = segment.to_str().map_err(|e| {
                PipelineError::Initialization(format!("failed to extract segment text: {:?}", e))
            })?;
            full_text.push_str(segment_text);
        }

        Ok(full_text)
    }
}

pub struct WhisperLoader {
    threads: usize,
}

impl WhisperLoader {
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }
}

impl RuntimeLoader for WhisperLoader {
    fn load(
        &self,
        model_path: &Path,
        _language: &str,
    ) -> Result<Box<dyn InferenceRuntime>, PipelineError> {
        Ok(Box::new(WhisperRuntime::new(model_path, self.threads)?))
    }
}

/// Accumulates microphone blocks into fixed-size inference chunks.
pub struct StreamBuffer {
    samples: Vec<f32>,
    target: usize,
}

impl StreamBuffer {
    pub fn new(target: usize) -> Self {
        Self {
            samples: Vec::with_capacity(target),
            target,
        }
    }

    /// Append a block; returns a full chunk once the target is reached.
    pub fn push(&mut self, block: &[f32]) -> Option<Vec<f32>> {
        self.samples.extend_from_slice(block);
        if self.samples.len() >= self.target {
            Some(std::mem::take(&mut self.samples))
        } else {
            None
        }
    }

    /// Drain whatever is buffered, full chunk or not.
    pub fn take_remaining(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Monotone progress reporting: percentages only ever move forward.
struct ProgressTracker {
    cb: Box<dyn FnMut(f32) + Send>,
    last: f32,
}

impl ProgressTracker {
    fn new(cb: Box<dyn FnMut(f32) + Send>) -> Self {
        Self { cb, last: -1.0 }
    }

    fn report(&mut self, pct: f32) {
        let pct = pct.clamp(0.0, 100.0);
        if pct > self.last {
            self.last = pct;
            (self.cb)(pct);
        }
    }
}

pub struct LocalInferenceEngine {
    config: LocalEngineConfig,
    language: String,
    fetcher: Arc<dyn ModelFetcher>,
    loader: Arc<dyn RuntimeLoader>,
    state: Arc<Mutex<EngineState>>,
    runtime: Arc<Mutex<Option<Box<dyn InferenceRuntime>>>>,
    capture: Option<AudioCaptureSession>,
    worker: Option<tokio::task::JoinHandle<()>>,
    model_dir_override: Option<PathBuf>,
}

impl LocalInferenceEngine {
    pub fn new(config: LocalEngineConfig, language: &str) -> Self {
        let threads = config.threads;
        Self::with_parts(
            config,
            language,
            Arc::new(crate::download::HttpModelFetcher),
            Arc::new(WhisperLoader::new(threads)),
        )
    }

    pub fn with_parts(
        config: LocalEngineConfig,
        language: &str,
        fetcher: Arc<dyn ModelFetcher>,
        loader: Arc<dyn RuntimeLoader>,
    ) -> Self {
        Self {
            config,
            language: language.to_string(),
            fetcher,
            loader,
            state: Arc::new(Mutex::new(EngineState::Uninitialized)),
            runtime: Arc::new(Mutex::new(None)),
            capture: None,
            worker: None,
            model_dir_override: None,
        }
    }

    /// Redirect the model cache, used by tests.
    pub fn set_model_dir(&mut self, dir: PathBuf) {
        self.model_dir_override = Some(dir);
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Fetch (if needed) and load the model for `tier_name`.
    ///
    /// Unknown tiers are rejected before any filesystem or network work.
    /// Calling again while Initializing, Ready, or Streaming is a no-op,
    /// so the model is only ever fetched once per engine.
    pub async fn initialize(
        &self,
        tier_name: &str,
        on_progress: impl FnMut(f32) + Send + 'static,
    ) -> Result<(), PipelineError> {
        let tier: ModelTier = tier_name.parse()?;

        {
            let mut state = self.state.lock();
            match *state {
                EngineState::Ready | EngineState::Streaming | EngineState::Initializing => {
                    return Ok(())
                }
                EngineState::Disposed => {
                    return Err(PipelineError::Initialization(
                        "engine has been disposed".to_string(),
                    ))
                }
                EngineState::Uninitialized => *state = EngineState::Initializing,
            }
        }

        let progress = Arc::new(Mutex::new(ProgressTracker::new(Box::new(on_progress))));
        let result = self.initialize_inner(tier, progress).await;

        let mut state = self.state.lock();
        *state = match &result {
            Ok(()) => EngineState::Ready,
            Err(_) => EngineState::Uninitialized,
        };
        result
    }

    async fn initialize_inner(
        &self,
        tier: ModelTier,
        progress: Arc<Mutex<ProgressTracker>>,
    ) -> Result<(), PipelineError> {
        let dir = match &self.model_dir_override {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => models_dir()?,
        };
        let model_path = dir.join(tier.file_name());

        // Clear any leftover partial download.
        let temp_path = model_path.with_extension("downloading");
        if let Err(e) = std::fs::remove_file(&temp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let cached = std::fs::metadata(&model_path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        if cached {
            println!("Model {} already cached at {:?}", tier, model_path);
        } else {
            println!(
                "Fetching model {} (~{} MB)",
                tier,
                tier.approx_size_mb()
            );
            let approx_total = tier.approx_size_mb() * 1024 * 1024;
            let tracker = progress.clone();
            self.fetcher
                .fetch(
                    &tier.download_url(),
                    &model_path,
                    Box::new(move |downloaded, total| {
                        let denom = if total > 0 { total } else { approx_total };
                        if denom > 0 {
                            let pct = (downloaded as f64 / denom as f64 * 100.0) as f32;
                            tracker.lock().report(pct.min(99.0));
                        }
                    }),
                )
                .await?;
        }

        let loader = self.loader.clone();
        let language = if self.language == "auto" {
            // whisper.cpp init wants a concrete language; detection still
            // happens per chunk at transcription time.
            "en".to_string()
        } else {
            self.language.clone()
        };
        let load_path = model_path.clone();
        let runtime = tokio::task::spawn_blocking(move || loader.load(&load_path, &language))
            .await
            .map_err(|e| {
                PipelineError::Initialization(format!("model load task failed: {}", e))
            })??;

        *self.runtime.lock() = Some(runtime);
        progress.lock().report(100.0);
        Ok(())
    }

    /// Open the microphone and stream transcriptions until stopped.
    pub fn start_streaming(
        &mut self,
        on_transcription: TranscriptionCallback,
        on_error: ErrorCallback,
    ) -> Result<(), PipelineError> {
        {
            let state = self.state.lock();
            match *state {
                EngineState::Streaming => return Err(PipelineError::AlreadyStreaming),
                EngineState::Ready => {}
                _ => {
                    return Err(PipelineError::Initialization(
                        "engine is not initialized".to_string(),
                    ))
                }
            }
        }

        let capture_config = CaptureConfig {
            sample_rate: self.config.sample_rate,
            channels: 1,
            ..CaptureConfig::default()
        };
        let (block_tx, block_rx) = mpsc::channel(64);
        let mut session = AudioCaptureSession::new(capture_config);
        session.start(block_tx)?;
        self.capture = Some(session);

        self.start_worker(block_rx, on_transcription, on_error);
        *self.state.lock() = EngineState::Streaming;
        Ok(())
    }

    /// Streaming loop over an externally supplied block source.
    ///
    /// `start_streaming` wires the microphone in; tests feed blocks
    /// straight through the channel.
    pub fn start_streaming_with_blocks(
        &mut self,
        block_rx: mpsc::Receiver<Vec<f32>>,
        on_transcription: TranscriptionCallback,
        on_error: ErrorCallback,
    ) -> Result<(), PipelineError> {
        {
            let state = self.state.lock();
            match *state {
                EngineState::Streaming => return Err(PipelineError::AlreadyStreaming),
                EngineState::Ready => {}
                _ => {
                    return Err(PipelineError::Initialization(
                        "engine is not initialized".to_string(),
                    ))
                }
            }
        }

        self.start_worker(block_rx, on_transcription, on_error);
        *self.state.lock() = EngineState::Streaming;
        Ok(())
    }

    fn start_worker(
        &mut self,
        mut block_rx: mpsc::Receiver<Vec<f32>>,
        on_transcription: TranscriptionCallback,
        on_error: ErrorCallback,
    ) {
        let runtime = self.runtime.clone();
        let language = self.language.clone();
        let target =
            (self.config.chunk_duration_secs * self.config.sample_rate as f32) as usize;

        let handle = tokio::spawn(async move {
            let mut buffer = StreamBuffer::new(target.max(1));
            while let Some(block) = block_rx.recv().await {
                if let Some(chunk) = buffer.push(&block) {
                    run_inference(&runtime, chunk, &language, &on_transcription, &on_error)
                        .await;
                }
            }
            // Channel closed: flush whatever is left.
            let rest = buffer.take_remaining();
            if !rest.is_empty() {
                run_inference(&runtime, rest, &language, &on_transcription, &on_error).await;
            }
        });
        self.worker = Some(handle);
    }

    /// Pause the microphone without tearing down the streaming worker.
    pub fn pause_streaming(&mut self) {
        if let Some(session) = self.capture.as_mut() {
            if let Err(e) = session.pause() {
                eprintln!("Failed to pause capture: {}", e);
            }
        }
    }

    pub fn resume_streaming(&mut self) {
        if let Some(session) = self.capture.as_mut() {
            if let Err(e) = session.resume() {
                eprintln!("Failed to resume capture: {}", e);
            }
        }
    }

    /// Idempotent. Closes the microphone; the worker drains its channel
    /// and winds down on its own.
    pub fn stop_streaming(&mut self) {
        if let Some(mut session) = self.capture.take() {
            if let Err(e) = session.stop() {
                eprintln!("Error stopping capture: {}", e);
            }
        }
        self.worker.take();

        let mut state = self.state.lock();
        if *state == EngineState::Streaming {
            *state = EngineState::Ready;
        }
    }

    /// Terminal teardown; the engine cannot be reinitialized afterwards.
    pub fn dispose(&mut self) {
        self.stop_streaming();
        *self.runtime.lock() = None;
        *self.state.lock() = EngineState::Disposed;
    }
}

impl Drop for LocalInferenceEngine {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

async fn run_inference(
    runtime: &Arc<Mutex<Option<Box<dyn InferenceRuntime>>>>,
    samples: Vec<f32>,
    language: &str,
    on_transcription: &TranscriptionCallback,
    on_error: &ErrorCallback,
) {
    let runtime = runtime.clone();
    let language = language.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = runtime.lock();
        match guard.as_mut() {
            Some(rt) => rt.transcribe(&samples, &language),
            None => Err(PipelineError::Initialization(
                "inference runtime is gone".to_string(),
            )),
        }
    })
    .await;

    match result {
        Ok(Ok(text)) => {
            let text = text.trim();
            if !text.is_empty() {
                on_transcription(text.to_string(), "auto".to_string());
            }
        }
        Ok(Err(e)) => on_error(e),
        Err(e) => on_error(PipelineError::Initialization(format!(
            "inference task failed: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeFetcher {
        calls: Arc<AtomicUsize>,
    }

    impl ModelFetcher for FakeFetcher {
        fn fetch<'a>(
            &'a self,
            _url: &'a str,
            output_path: &'a std::path::Path,
            mut progress: crate::download::ProgressFn,
        ) -> BoxFuture<'a, Result<(), PipelineError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = output_path.to_path_buf();
            Box::pin(async move {
                progress(25, 100);
                progress(50, 100);
                progress(100, 100);
                std::fs::write(&path, b"ggml")?;
                Ok(())
            })
        }
    }

    struct FakeLoader;

    impl RuntimeLoader for FakeLoader {
        fn load(
            &self,
            _model_path: &std::path::Path,
            _language: &str,
        ) -> Result<Box<dyn InferenceRuntime>, PipelineError> {
            Ok(Box::new(FakeRuntime))
        }
    }

    struct FakeRuntime;

    impl InferenceRuntime for FakeRuntime {
        fn transcribe(&mut self, samples: &[f32], _language: &str) -> Result<String, PipelineError> {
            Ok(format!("heard {} samples", samples.len()))
        }
    }

    fn test_engine(calls: Arc<AtomicUsize>) -> LocalInferenceEngine {
        let config = LocalEngineConfig {
            model_tier: "tiny".to_string(),
            chunk_duration_secs: 1.0,
            sample_rate: 8,
            threads: 1,
        };
        let mut engine = LocalInferenceEngine::with_parts(
            config,
            "auto",
            Arc::new(FakeFetcher { calls }),
            Arc::new(FakeLoader),
        );
        let unique = format!(
            "murmur-engine-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        );
        engine.set_model_dir(std::env::temp_dir().join(unique));
        engine
    }

    #[tokio::test]
    async fn initialize_twice_fetches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = test_engine(calls.clone());

        engine.initialize("tiny", |_| {}).await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        engine.initialize("tiny", |_| {}).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_tier_rejected_before_any_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = test_engine(calls.clone());

        let err = engine.initialize("huge", |_| {}).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedModel(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn progress_is_monotone_and_ends_at_hundred() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = test_engine(calls.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .initialize("tiny", move |pct| sink.lock().push(pct))
            .await
            .unwrap();

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn streaming_requires_ready_and_rejects_double_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = test_engine(calls.clone());

        let (_tx, rx) = mpsc::channel(4);
        let err = engine
            .start_streaming_with_blocks(rx, Box::new(|_, _| {}), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Initialization(_)));

        engine.initialize("tiny", |_| {}).await.unwrap();

        let (_tx, rx) = mpsc::channel(4);
        engine
            .start_streaming_with_blocks(rx, Box::new(|_, _| {}), Box::new(|_| {}))
            .unwrap();

        let (_tx2, rx2) = mpsc::channel(4);
        let err = engine
            .start_streaming_with_blocks(rx2, Box::new(|_, _| {}), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStreaming));

        engine.stop_streaming();
        engine.stop_streaming(); // idempotent
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn streaming_emits_one_transcription_per_full_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = test_engine(calls.clone());
        engine.initialize("tiny", |_| {}).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let heard: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = heard.clone();
        engine
            .start_streaming_with_blocks(
                rx,
                Box::new(move |text, lang| sink.lock().push((text, lang))),
                Box::new(|e| panic!("unexpected error: {}", e)),
            )
            .unwrap();

        // chunk_duration 1.0s at 8 Hz: a full chunk is 8 samples.
        tx.send(vec![0.0; 5]).await.unwrap();
        tx.send(vec![0.0; 5]).await.unwrap();
        drop(tx); // remainder (2 samples) flushes on close

        for _ in 0..50 {
            if heard.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let heard = heard.lock();
        assert_eq!(heard.len(), 2);
        assert_eq!(heard[0], ("heard 10 samples".to_string(), "auto".to_string()));
        assert_eq!(heard[1], ("heard 2 samples".to_string(), "auto".to_string()));
    }

    struct EchoLoader {
        languages: Arc<Mutex<Vec<String>>>,
    }

    impl RuntimeLoader for EchoLoader {
        fn load(
            &self,
            _model_path: &std::path::Path,
            _language: &str,
        ) -> Result<Box<dyn InferenceRuntime>, PipelineError> {
            Ok(Box::new(EchoRuntime {
                languages: self.languages.clone(),
            }))
        }
    }

    struct EchoRuntime {
        languages: Arc<Mutex<Vec<String>>>,
    }

    impl InferenceRuntime for EchoRuntime {
        fn transcribe(&mut self, _samples: &[f32], language: &str) -> Result<String, PipelineError> {
            self.languages.lock().push(language.to_string());
            Ok("hello".to_string())
        }
    }

    #[tokio::test]
    async fn configured_language_reaches_the_model() {
        let languages = Arc::new(Mutex::new(Vec::new()));
        let config = LocalEngineConfig {
            model_tier: "tiny".to_string(),
            chunk_duration_secs: 1.0,
            sample_rate: 8,
            threads: 1,
        };
        let mut engine = LocalInferenceEngine::with_parts(
            config,
            "en",
            Arc::new(FakeFetcher {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(EchoLoader {
                languages: languages.clone(),
            }),
        );
        let unique = format!(
            "murmur-engine-lang-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        );
        engine.set_model_dir(std::env::temp_dir().join(unique));
        engine.initialize("tiny", |_| {}).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let heard: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = heard.clone();
        engine
            .start_streaming_with_blocks(
                rx,
                Box::new(move |text, lang| sink.lock().push((text, lang))),
                Box::new(|e| panic!("unexpected error: {}", e)),
            )
            .unwrap();

        tx.send(vec![0.0; 8]).await.unwrap();
        drop(tx);

        for _ in 0..50 {
            if !heard.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The model runs with the configured language; the emitted tag
        // stays "auto" until the backend reports one.
        assert_eq!(languages.lock().as_slice(), ["en"]);
        assert_eq!(heard.lock()[0].1, "auto");
    }

    #[test]
    fn stream_buffer_releases_at_target() {
        let mut buffer = StreamBuffer::new(4);
        assert!(buffer.push(&[0.0; 3]).is_none());
        let chunk = buffer.push(&[0.0; 3]).unwrap();
        assert_eq!(chunk.len(), 6);
        assert!(buffer.is_empty());
        assert!(buffer.push(&[0.0; 2]).is_none());
        assert_eq!(buffer.take_remaining().len(), 2);
    }
}
