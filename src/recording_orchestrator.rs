//! Recording orchestrator
//!
//! Ties the capture session, voice gate, chunk accumulation, and
//! transcription dispatch into one recording lifecycle. The orchestrator
//! runs a single worker task per recording; spans are drained
//! synchronously inside that task and their transcription futures are
//! spawned, so audio keeps flowing while a backend call is in flight and
//! no span is ever flushed twice.

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::audio_capture::{AudioCaptureSession, ChunkSlicer};
use crate::config::{AppConfig, BackendMode};
use crate::container::{merge, AudioChunk, WavFormat};
use crate::dispatcher::{
    CustomTranscriber, DispatchOutcome, Transcript, TranscriptionDispatcher,
};
use crate::error::PipelineError;
use crate::local_engine::LocalInferenceEngine;
use crate::voice_gate::{EnergyDetector, SileroDetector, SpeechEvent, VoiceActivityGate};

/// Events broadcast to observers (the CLI, tests).
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SpeechStarted,
    SpeechEnded,
    Transcription { text: String, language: Option<String> },
    Error { message: String },
    Stopped,
}

/// What one batch of ingested samples produced.
#[derive(Default)]
pub struct IngestReport {
    pub events: Vec<SpeechEvent>,
    /// A merged container ready for dispatch, present when a speech span
    /// just closed.
    pub flush: Option<Vec<u8>>,
}

/// Pure span accumulation: samples in, merged WAV containers out.
///
/// Chunks always land in the session buffer; they only join the current
/// span while the gate reports speech (or unconditionally when the gate
/// is disabled). Span flushes drain synchronously, so a span's chunks
/// appear in exactly one container.
pub struct SpanPipeline {
    slicer: ChunkSlicer,
    gate: VoiceActivityGate,
    vad_gated: bool,
    speaking: bool,
    span: Vec<AudioChunk>,
    all_chunks: Vec<AudioChunk>,
}

impl SpanPipeline {
    pub fn new(slicer: ChunkSlicer, gate: VoiceActivityGate, vad_gated: bool) -> Self {
        let mut gate = gate;
        if vad_gated {
            gate.start();
        }
        Self {
            slicer,
            gate,
            vad_gated,
            speaking: false,
            span: Vec::new(),
            all_chunks: Vec::new(),
        }
    }

    pub fn is_speaking(&self) -> bool {
        !self.vad_gated || self.speaking
    }

    pub fn pause_gate(&mut self) {
        if self.vad_gated {
            self.gate.pause();
        }
    }

    pub fn resume_gate(&mut self) {
        if self.vad_gated {
            self.gate.start();
        }
    }

    pub fn ingest(&mut self, samples: &[f32]) -> Result<IngestReport, PipelineError> {
        let mut report = IngestReport::default();

        for chunk in self.slicer.push(samples)? {
            if self.is_speaking() {
                self.span.push(chunk.clone());
            }
            self.all_chunks.push(chunk);
        }

        if self.vad_gated {
            for event in self.gate.process(samples)? {
                match event {
                    SpeechEvent::Started => {
                        self.speaking = true;
                    }
                    SpeechEvent::Ended => {
                        self.speaking = false;
                        // Close out the partial chunk so the tail of the
                        // span is not lost to the slice cadence.
                        if let Some(chunk) = self.slicer.flush()? {
                            self.span.push(chunk.clone());
                            self.all_chunks.push(chunk);
                        }
                        report.flush = self.flush_span()?;
                    }
                }
                report.events.push(event);
            }
        }

        Ok(report)
    }

    /// Merge and drain the current span. `None` when the span is empty,
    /// meaning nothing gets dispatched.
    pub fn flush_span(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        if self.span.is_empty() {
            return Ok(None);
        }
        let merged = merge(&self.span)?;
        self.span.clear();
        Ok(Some(merged.bytes))
    }

    /// Periodic mid-span flush while speech keeps running.
    pub fn interim_flush(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        self.flush_span()
    }

    /// End of recording: drain the slicer remainder, then the span.
    pub fn finish(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        if let Some(chunk) = self.slicer.flush()? {
            if self.is_speaking() {
                self.span.push(chunk.clone());
            }
            self.all_chunks.push(chunk);
        }
        self.flush_span()
    }

    /// Every chunk of the session merged into one container.
    pub fn session_container(&self) -> Result<Option<Vec<u8>>, PipelineError> {
        if self.all_chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(merge(&self.all_chunks)?.bytes))
    }

    pub fn session_chunk_count(&self) -> usize {
        self.all_chunks.len()
    }
}

enum WorkerCommand {
    Pause,
    Resume,
    Stop,
}

struct WorkerPolicy {
    non_stop: bool,
    stop_timeout: Duration,
    interim_interval: Duration,
    auto_transcribe: bool,
}

/// Shared by the worker and its spawned dispatch tasks.
struct DispatchContext {
    dispatcher: Arc<TranscriptionDispatcher>,
    /// In-flight dispatch count; `transcribing` clears only when the last
    /// one finishes.
    jobs: AtomicUsize,
    transcribing: Arc<AtomicBool>,
    transcript: Arc<RwLock<Transcript>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl DispatchContext {
    /// Send one container to the backend and fold the result into the
    /// running transcript. `final_pass` containers carry the whole
    /// session, so their text replaces the interim accumulation.
    async fn dispatch(&self, wav: Vec<u8>, final_pass: bool) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        self.transcribing.store(true, Ordering::SeqCst);

        match self.dispatcher.send(wav).await {
            Ok(DispatchOutcome::Transcribed(result)) => {
                {
                    let mut acc = self.transcript.write();
                    if final_pass {
                        acc.merge_from(result.clone());
                    } else {
                        match (&mut acc.text, result.text.clone()) {
                            (Some(existing), Some(new)) => {
                                existing.push(' ');
                                existing.push_str(&new);
                            }
                            (slot @ None, Some(new)) => *slot = Some(new),
                            _ => {}
                        }
                        if acc.language.is_none() {
                            acc.language = result.language.clone();
                        }
                    }
                }
                if let Some(text) = result.text {
                    if !text.is_empty() {
                        let _ = self.events.send(PipelineEvent::Transcription {
                            text,
                            language: result.language,
                        });
                    }
                }
            }
            Ok(DispatchOutcome::NoSpeech { .. }) => {
                println!("No audible speech in span, skipping dispatch");
            }
            Err(e) => {
                eprintln!("Transcription dispatch failed: {}", e);
                let _ = self.events.send(PipelineEvent::Error {
                    message: e.user_message().to_string(),
                });
            }
        }

        if self.jobs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.transcribing.store(false, Ordering::SeqCst);
        }
    }

    fn report_error(&self, e: PipelineError) {
        eprintln!("Pipeline error: {}", e);
        let _ = self.events.send(PipelineEvent::Error {
            message: e.user_message().to_string(),
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    mut pipeline: SpanPipeline,
    policy: WorkerPolicy,
    ctx: Arc<DispatchContext>,
    recording: Arc<AtomicBool>,
    speaking: Arc<AtomicBool>,
    recorded_audio: Arc<Mutex<Option<Vec<u8>>>>,
    mut block_rx: mpsc::Receiver<Vec<f32>>,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    mut capture: Option<AudioCaptureSession>,
) {
    let mut interim =
        tokio::time::interval(policy.interim_interval.max(Duration::from_millis(1)));
    interim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interim.tick().await; // first tick fires immediately, skip it

    // Single idle-stop deadline, armed only under the non_stop policy:
    // cleared on speech start, re-armed on speech end, never two timers
    // at once. Without non_stop the recording runs until stopped.
    let mut deadline: Option<Instant> = if policy.non_stop {
        Some(Instant::now() + policy.stop_timeout)
    } else {
        None
    };

    let mut paused = false;
    let mut flushes = tokio::task::JoinSet::new();

    loop {
        // Option<Instant> is Copy, so the future owns its snapshot and
        // the arm bodies stay free to re-arm the deadline.
        let idle = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Biased: queued audio is always drained before a command or
        // timer is honored, so a stop never loses tail samples.
        tokio::select! {
            biased;
            maybe_block = block_rx.recv() => {
                let Some(samples) = maybe_block else { break };
                if paused {
                    continue;
                }
                match pipeline.ingest(&samples) {
                    Ok(report) => {
                        for event in &report.events {
                            match event {
                                SpeechEvent::Started => {
                                    speaking.store(true, Ordering::SeqCst);
                                    deadline = None;
                                    let _ = ctx.events.send(PipelineEvent::SpeechStarted);
                                }
                                SpeechEvent::Ended => {
                                    speaking.store(false, Ordering::SeqCst);
                                    if policy.non_stop {
                                        deadline = Some(Instant::now() + policy.stop_timeout);
                                    }
                                    let _ = ctx.events.send(PipelineEvent::SpeechEnded);
                                }
                            }
                        }
                        if let Some(wav) = report.flush {
                            let ctx = ctx.clone();
                            flushes.spawn(async move { ctx.dispatch(wav, false).await });
                        }
                    }
                    Err(e) => ctx.report_error(e),
                }
            }
            maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                Some(WorkerCommand::Pause) => {
                    if let Some(session) = capture.as_mut() {
                        if let Err(e) = session.pause() {
                            eprintln!("Failed to pause capture: {}", e);
                        }
                    }
                    pipeline.pause_gate();
                    paused = true;
                }
                Some(WorkerCommand::Resume) => {
                    if let Some(session) = capture.as_mut() {
                        if let Err(e) = session.resume() {
                            eprintln!("Failed to resume capture: {}", e);
                        }
                    }
                    pipeline.resume_gate();
                    paused = false;
                }
                Some(WorkerCommand::Stop) | None => break,
            },
            _ = interim.tick() => {
                if !paused {
                    match pipeline.interim_flush() {
                        Ok(Some(wav)) => {
                            let ctx = ctx.clone();
                            flushes.spawn(async move { ctx.dispatch(wav, false).await });
                        }
                        Ok(None) => {}
                        Err(e) => ctx.report_error(e),
                    }
                }
            }
            _ = idle => {
                println!("No speech for {:?}, stopping recording", policy.stop_timeout);
                break;
            }
        }
    }

    if let Some(mut session) = capture.take() {
        if let Err(e) = session.stop() {
            eprintln!("Error stopping capture: {}", e);
        }
    }

    // Interim results must land in the transcript before the final pass.
    while flushes.join_next().await.is_some() {}

    match pipeline.finish() {
        Ok(Some(wav)) => ctx.dispatch(wav, false).await,
        Ok(None) => {}
        Err(e) => ctx.report_error(e),
    }

    match pipeline.session_container() {
        Ok(Some(session_wav)) => {
            *recorded_audio.lock() = Some(session_wav.clone());
            if policy.auto_transcribe {
                ctx.dispatch(session_wav, true).await;
            }
        }
        Ok(None) => {}
        Err(e) => ctx.report_error(e),
    }

    recording.store(false, Ordering::SeqCst);
    speaking.store(false, Ordering::SeqCst);
    let _ = ctx.events.send(PipelineEvent::Stopped);
}

pub struct RecordingOrchestrator {
    config: AppConfig,
    custom_transcriber: Option<CustomTranscriber>,
    silero_model: Option<PathBuf>,
    engine: Option<LocalInferenceEngine>,
    recording: Arc<AtomicBool>,
    speaking: Arc<AtomicBool>,
    transcribing: Arc<AtomicBool>,
    transcript: Arc<RwLock<Transcript>>,
    recorded_audio: Arc<Mutex<Option<Vec<u8>>>>,
    events: broadcast::Sender<PipelineEvent>,
    worker: Option<tokio::task::JoinHandle<()>>,
    cmd_tx: Option<mpsc::Sender<WorkerCommand>>,
    paused: bool,
    shut_down: bool,
}

impl RecordingOrchestrator {
    pub fn new(config: AppConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            custom_transcriber: None,
            silero_model: None,
            engine: None,
            recording: Arc::new(AtomicBool::new(false)),
            speaking: Arc::new(AtomicBool::new(false)),
            transcribing: Arc::new(AtomicBool::new(false)),
            transcript: Arc::new(RwLock::new(Transcript::default())),
            recorded_audio: Arc::new(Mutex::new(None)),
            events,
            worker: None,
            cmd_tx: None,
            paused: false,
            shut_down: false,
        }
    }

    /// Route dispatches through an in-process transcriber instead of the
    /// remote API. Takes effect on the next `start_recording`.
    pub fn set_custom_transcriber(&mut self, transcriber: CustomTranscriber) {
        self.custom_transcriber = Some(transcriber);
    }

    /// Point the voice gate at a downloaded Silero VAD model. Without
    /// this the gate falls back to the energy detector.
    pub fn set_silero_model(&mut self, path: PathBuf) {
        self.silero_model = Some(path);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcribing.load(Ordering::SeqCst)
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.read().clone()
    }

    /// The full recorded session as one WAV container, available after
    /// the recording stops.
    pub fn recorded_audio(&self) -> Option<Vec<u8>> {
        self.recorded_audio.lock().clone()
    }

    /// Begin a recording session. A no-op while one is already running.
    pub async fn start_recording(&mut self) -> Result<(), PipelineError> {
        if self.shut_down {
            return Err(PipelineError::Initialization(
                "orchestrator has been shut down".to_string(),
            ));
        }
        if self.recording.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.reset_session();

        match self.config.orchestrator.backend {
            BackendMode::Local => self.start_local().await,
            BackendMode::Remote | BackendMode::RemoteVad => {
                let (block_tx, block_rx) = mpsc::channel(64);
                let mut session = AudioCaptureSession::new(self.config.capture.clone());
                session.start(block_tx)?;
                self.spawn_worker(block_rx, Some(session))?;
                self.recording.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Run the remote pipeline over an externally supplied block source.
    ///
    /// `start_recording` wires the microphone in; tests feed blocks
    /// straight through the channel.
    pub fn start_with_blocks(
        &mut self,
        block_rx: mpsc::Receiver<Vec<f32>>,
    ) -> Result<(), PipelineError> {
        if self.shut_down {
            return Err(PipelineError::Initialization(
                "orchestrator has been shut down".to_string(),
            ));
        }
        if self.recording.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.reset_session();
        self.spawn_worker(block_rx, None)?;
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Suspend capture and gating without ending the session. Idempotent;
    /// a no-op while not recording.
    pub fn pause_recording(&mut self) {
        if !self.is_recording() || self.paused {
            return;
        }
        if let Some(engine) = &mut self.engine {
            engine.pause_streaming();
        }
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.try_send(WorkerCommand::Pause);
        }
        self.paused = true;
    }

    /// Resume a paused session. Idempotent; a no-op while not paused.
    pub fn resume_recording(&mut self) {
        if !self.is_recording() || !self.paused {
            return;
        }
        if let Some(engine) = &mut self.engine {
            engine.resume_streaming();
        }
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.try_send(WorkerCommand::Resume);
        }
        self.paused = false;
    }

    async fn start_local(&mut self) -> Result<(), PipelineError> {
        let tier = self.config.local.model_tier.clone();
        let local_config = self.config.local.clone();
        let language = self.config.orchestrator.language.clone();
        let engine = self
            .engine
            .get_or_insert_with(|| LocalInferenceEngine::new(local_config, &language));

        engine
            .initialize(&tier, |pct| {
                println!("Model download: {:.1}%", pct);
            })
            .await?;

        let events = self.events.clone();
        let transcript = self.transcript.clone();
        let error_events = self.events.clone();

        engine.start_streaming(
            Box::new(move |text, language| {
                {
                    let mut acc = transcript.write();
                    match &mut acc.text {
                        Some(existing) => {
                            existing.push(' ');
                            existing.push_str(&text);
                        }
                        slot @ None => *slot = Some(text.clone()),
                    }
                }
                let _ = events.send(PipelineEvent::Transcription {
                    text,
                    language: Some(language),
                });
            }),
            Box::new(move |e| {
                let _ = error_events.send(PipelineEvent::Error {
                    message: e.user_message().to_string(),
                });
            }),
        )?;

        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_worker(
        &mut self,
        block_rx: mpsc::Receiver<Vec<f32>>,
        capture: Option<AudioCaptureSession>,
    ) -> Result<(), PipelineError> {
        let pipeline = self.build_pipeline()?;

        let mut dispatcher = TranscriptionDispatcher::new(self.config.remote.clone());
        if let Some(custom) = &self.custom_transcriber {
            dispatcher.set_custom_transcriber(custom.clone());
        }

        let orch = &self.config.orchestrator;
        let policy = WorkerPolicy {
            non_stop: orch.non_stop,
            stop_timeout: Duration::from_millis(orch.stop_timeout_ms),
            interim_interval: Duration::from_millis(orch.interim_flush_interval_ms),
            auto_transcribe: orch.auto_transcribe,
        };
        let ctx = Arc::new(DispatchContext {
            dispatcher: Arc::new(dispatcher),
            jobs: AtomicUsize::new(0),
            transcribing: self.transcribing.clone(),
            transcript: self.transcript.clone(),
            events: self.events.clone(),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        self.cmd_tx = Some(cmd_tx);
        self.worker = Some(tokio::spawn(run_worker(
            pipeline,
            policy,
            ctx,
            self.recording.clone(),
            self.speaking.clone(),
            self.recorded_audio.clone(),
            block_rx,
            cmd_rx,
            capture,
        )));
        Ok(())
    }

    fn build_pipeline(&self) -> Result<SpanPipeline, PipelineError> {
        let format = WavFormat {
            channels: self.config.capture.channels,
            sample_rate: self.config.capture.sample_rate,
            bits_per_sample: 16,
        };
        let slicer = ChunkSlicer::new(
            format,
            self.config.capture.slice_interval_ms,
            self.config.capture.streaming,
        );

        let vad_gated = self.config.orchestrator.backend == BackendMode::RemoteVad;
        let gate = if !vad_gated {
            VoiceActivityGate::new(self.config.vad.clone())
        } else {
            match &self.silero_model {
                Some(path) => match SileroDetector::new(
                    path,
                    self.config.capture.sample_rate,
                    self.config.vad.frame_size,
                ) {
                    Ok(detector) => {
                        VoiceActivityGate::with_detector(self.config.vad.clone(), Box::new(detector))
                    }
                    Err(e) => {
                        eprintln!("Silero VAD unavailable, using energy detector: {}", e);
                        VoiceActivityGate::with_detector(
                            self.config.vad.clone(),
                            Box::new(EnergyDetector::default()),
                        )
                    }
                },
                None => VoiceActivityGate::with_detector(
                    self.config.vad.clone(),
                    Box::new(EnergyDetector::default()),
                ),
            }
        };

        Ok(SpanPipeline::new(slicer, gate, vad_gated))
    }

    fn reset_session(&mut self) {
        *self.transcript.write() = Transcript::default();
        *self.recorded_audio.lock() = None;
        self.speaking.store(false, Ordering::SeqCst);
        self.transcribing.store(false, Ordering::SeqCst);
        self.paused = false;
    }

    /// Stop the current recording and wait for the final flush and the
    /// full-session transcription to complete. Idempotent.
    pub async fn stop_recording(&mut self) {
        if let Some(engine) = &mut self.engine {
            engine.stop_streaming();
            self.recording.store(false, Ordering::SeqCst);
        }
        if let Some(tx) = self.cmd_tx.take() {
            // Dropping the sender also ends the worker once commands and
            // queued audio are drained.
            let _ = tx.try_send(WorkerCommand::Stop);
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                eprintln!("Recording worker panicked: {}", e);
            }
        }
        self.paused = false;
    }

    /// Single-shot teardown: a second call is a no-op.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.stop_recording().await;
        if let Some(mut engine) = self.engine.take() {
            engine.dispose();
        }
    }
}
