//! Microphone capture session
//!
//! Owns one input stream and its lifecycle. The cpal stream is not `Send`,
//! so it lives on a dedicated capture thread; the session handle keeps the
//! tracked lifecycle state plus a command channel into that thread and can
//! be held safely from async tasks.

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use crate::config::CaptureConfig;
use crate::container::{AudioChunk, WavFormat};
use crate::error::PipelineError;

/// Lifecycle of one microphone acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

enum CaptureCommand {
    Pause,
    Resume,
    Stop,
}

/// One active microphone acquisition: device stream on its own thread,
/// raw f32 sample blocks forwarded over `block_tx`.
pub struct AudioCaptureSession {
    config: CaptureConfig,
    state: CaptureState,
    cmd_tx: Option<std_mpsc::Sender<CaptureCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioCaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: CaptureState::Idle,
            cmd_tx: None,
            thread: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Requests the input device and starts streaming sample blocks.
    ///
    /// Fails with [`PipelineError::Permission`] when no input device exists
    /// or the stream cannot be opened. Calling on a session that is not
    /// `Idle` is a no-op.
    pub fn start(&mut self, block_tx: mpsc::Sender<Vec<f32>>) -> Result<(), PipelineError> {
        if self.state != CaptureState::Idle {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let config = self.config.clone();

        let handle = thread::spawn(move || {
            capture_thread(config, block_tx, cmd_rx, ready_tx);
        });

        // The thread reports stream-open success or failure once.
        match ready_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(())) => {
                self.cmd_tx = Some(cmd_tx);
                self.thread = Some(handle);
                self.state = CaptureState::Recording;
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                drop(cmd_tx);
                let _ = handle.join();
                Err(PipelineError::Permission(
                    "timed out waiting for the audio device".to_string(),
                ))
            }
        }
    }

    /// Pauses the stream. Only valid from `Recording`; otherwise a no-op.
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        if self.state != CaptureState::Recording {
            return Ok(());
        }
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(CaptureCommand::Pause);
        }
        self.state = CaptureState::Paused;
        Ok(())
    }

    /// Resumes a paused stream. Only valid from `Paused`; otherwise a no-op.
    pub fn resume(&mut self) -> Result<(), PipelineError> {
        if self.state != CaptureState::Paused {
            return Ok(());
        }
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(CaptureCommand::Resume);
        }
        self.state = CaptureState::Recording;
        Ok(())
    }

    /// Stops the stream and releases the device. Idempotent: a second call
    /// observes `Stopped` and performs no device work, so the OS recording
    /// indicator cannot be left lit.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        if self.state == CaptureState::Stopped {
            return Ok(());
        }
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(CaptureCommand::Stop);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                eprintln!("Capture thread panicked during shutdown");
            }
        }
        self.state = CaptureState::Stopped;
        Ok(())
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn capture_thread(
    config: CaptureConfig,
    block_tx: mpsc::Sender<Vec<f32>>,
    cmd_rx: std_mpsc::Receiver<CaptureCommand>,
    ready_tx: std_mpsc::Sender<Result<(), PipelineError>>,
) {
    let stream = match open_stream(&config, block_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(PipelineError::Permission(format!(
            "failed to start input stream: {}",
            e
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Stream stays alive for the life of this loop; dropping it on exit
    // releases the device.
    while let Ok(command) = cmd_rx.recv() {
        match command {
            CaptureCommand::Pause => {
                if let Err(e) = stream.pause() {
                    eprintln!("Failed to pause input stream: {}", e);
                }
            }
            CaptureCommand::Resume => {
                if let Err(e) = stream.play() {
                    eprintln!("Failed to resume input stream: {}", e);
                }
            }
            CaptureCommand::Stop => break,
        }
    }
}

fn open_stream(
    config: &CaptureConfig,
    block_tx: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, PipelineError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        PipelineError::Permission("no default input device available".to_string())
    })?;

    let default_config = device.default_input_config().map_err(|e| {
        PipelineError::Permission(format!("failed to query input configuration: {}", e))
    })?;
    let sample_format = default_config.sample_format();

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // Echo cancellation / noise suppression are requested constraints; cpal
    // exposes no portable control for them, so they are logged as hints.
    println!(
        "Opening capture stream: {} Hz, {} ch (echo_cancellation={}, noise_suppression={})",
        config.sample_rate, config.channels, config.echo_cancellation, config.noise_suppression
    );

    let err_fn = |err| eprintln!("Input stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                forward_block(data.to_vec(), &block_tx);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let scale = 1.0 / i16::MAX as f32;
                let block = data.iter().map(|&s| s as f32 * scale).collect();
                forward_block(block, &block_tx);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                const MIDPOINT: f32 = 32768.0;
                let block = data.iter().map(|&s| (s as f32 - MIDPOINT) / MIDPOINT).collect();
                forward_block(block, &block_tx);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(PipelineError::Permission(format!(
                "input sample format {:?} is not supported",
                other
            )))
        }
    };

    stream.map_err(|e| PipelineError::Permission(format!("failed to open input stream: {}", e)))
}

fn forward_block(block: Vec<f32>, block_tx: &mpsc::Sender<Vec<f32>>) {
    match block_tx.try_send(block) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            eprintln!("Audio channel full, dropping a capture block");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Converts raw sample blocks into header-bearing WAV chunks.
///
/// In streaming mode one chunk is emitted per `slice_interval_ms` worth of
/// samples (sample-count driven, so slicing is deterministic); otherwise
/// everything accumulates until [`ChunkSlicer::flush`] at stop time.
pub struct ChunkSlicer {
    format: WavFormat,
    samples_per_slice: usize,
    streaming: bool,
    pending: Vec<f32>,
}

impl ChunkSlicer {
    pub fn new(format: WavFormat, slice_interval_ms: u64, streaming: bool) -> Self {
        let per_channel = (format.sample_rate as u64 * slice_interval_ms / 1000) as usize;
        Self {
            format,
            samples_per_slice: (per_channel * format.channels as usize).max(1),
            streaming,
            pending: Vec::new(),
        }
    }

    /// Feed a block of samples; returns every chunk completed by it.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<AudioChunk>, PipelineError> {
        self.pending.extend_from_slice(samples);
        if !self.streaming {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::new();
        while self.pending.len() >= self.samples_per_slice {
            let slice: Vec<f32> = self.pending.drain(..self.samples_per_slice).collect();
            chunks.push(AudioChunk::from_samples(&slice, &self.format)?);
        }
        Ok(chunks)
    }

    /// Encode whatever remains buffered as a final chunk.
    pub fn flush(&mut self) -> Result<Option<AudioChunk>, PipelineError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let rest = std::mem::take(&mut self.pending);
        Ok(Some(AudioChunk::from_samples(&rest, &self.format)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_before_start_is_a_noop() {
        let mut session = AudioCaptureSession::new(CaptureConfig::default());
        assert!(session.pause().is_ok());
        assert_eq!(session.state(), CaptureState::Idle);
        assert!(session.resume().is_ok());
        assert_eq!(session.state(), CaptureState::Idle);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut session = AudioCaptureSession::new(CaptureConfig::default());
        assert!(session.stop().is_ok());
        assert_eq!(session.state(), CaptureState::Stopped);
        // Second stop observes Stopped and does no device work.
        assert!(session.stop().is_ok());
        assert_eq!(session.state(), CaptureState::Stopped);
    }

    #[test]
    fn slicer_emits_one_chunk_per_interval() {
        let mut slicer = ChunkSlicer::new(WavFormat::mono(16000), 1000, true);
        // 16000 samples per slice at 16kHz/1000ms.
        assert!(slicer.push(&vec![0.0; 8000]).unwrap().is_empty());
        let chunks = slicer.push(&vec![0.0; 8000]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload().unwrap().len(), 16000 * 2);

        let chunks = slicer.push(&vec![0.0; 40000]).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn non_streaming_mode_emits_only_on_flush() {
        let mut slicer = ChunkSlicer::new(WavFormat::mono(16000), 1000, false);
        assert!(slicer.push(&vec![0.1; 50000]).unwrap().is_empty());
        let chunk = slicer.flush().unwrap().expect("buffered audio");
        assert_eq!(chunk.payload().unwrap().len(), 50000 * 2);
        assert!(slicer.flush().unwrap().is_none());
    }
}
