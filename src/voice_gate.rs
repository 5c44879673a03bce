//! Voice activity gate
//!
//! Classifies the live sample stream as speech/non-speech and emits
//! speech-start / speech-end events the orchestrator uses to cut span
//! boundaries. The probability source sits behind [`SpeechDetector`]: the
//! production detector is the Silero VAD ONNX model, with an RMS energy
//! detector available before the model download completes and for tests.

use ndarray::{Array, Array2, ArrayBase, ArrayD, Dim, IxDynImpl, OwnedRepr};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputs};
use ort::value::Tensor;
use std::path::Path;

use crate::config::VadConfig;
use crate::error::PipelineError;

/// Voice activity detection states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadState {
    Silence,
    PossibleSpeech,
    Speech,
    PossibleSilence,
}

/// Boundary events emitted as the gate confirms transitions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeechEvent {
    Started,
    Ended,
}

/// A per-frame speech probability source
pub trait SpeechDetector: Send {
    /// Probability (0.0-1.0) that `frame` contains speech.
    fn speech_prob(&mut self, frame: &[f32]) -> Result<f32, PipelineError>;

    /// Clear any internal recurrent state.
    fn reset(&mut self) {}
}

/// RMS-threshold detector: no model, instant readiness.
///
/// Used while the Silero download is still in flight and by the test suite.
pub struct EnergyDetector {
    rms_floor: f32,
}

impl EnergyDetector {
    pub fn new(rms_floor: f32) -> Self {
        Self { rms_floor }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self { rms_floor: 0.01 }
    }
}

impl SpeechDetector for EnergyDetector {
    fn speech_prob(&mut self, frame: &[f32]) -> Result<f32, PipelineError> {
        if frame.is_empty() {
            return Ok(0.0);
        }
        let mean_square: f32 =
            frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        let rms = mean_square.sqrt();
        // Hard decision is fine here; hysteresis lives in the gate.
        Ok(if rms >= self.rms_floor { 0.9 } else { 0.05 })
    }
}

/// Silero VAD ONNX detector
pub struct SileroDetector {
    session: Session,
    sample_rate: ArrayBase<OwnedRepr<i64>, Dim<[usize; 1]>>,
    state: ArrayBase<OwnedRepr<f32>, Dim<IxDynImpl>>,
    frame_buffer: Array2<f32>,
}

impl SileroDetector {
    pub fn new(
        model_path: impl AsRef<Path>,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<Self, PipelineError> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| {
                PipelineError::Initialization(format!("failed to load Silero VAD model: {}", e))
            })?;

        let state = ArrayD::<f32>::zeros([2, 1, 128].as_slice());
        let sample_rate_arr =
            Array::from_shape_vec([1], vec![sample_rate as i64]).expect("shape [1] always fits");
        let frame_buffer = Array2::<f32>::zeros((1, frame_size));

        Ok(Self {
            session,
            sample_rate: sample_rate_arr,
            state,
            frame_buffer,
        })
    }
}

impl SileroDetector {
    fn run_model(&mut self) -> Result<f32, ort::Error> {
        let frame_tensor = Tensor::from_array(self.frame_buffer.to_owned())?;
        let state_tensor = Tensor::from_array(std::mem::take(&mut self.state))?;
        let sample_rate_tensor = Tensor::from_array(self.sample_rate.to_owned())?;

        let inps = ort::inputs![frame_tensor, state_tensor, sample_rate_tensor,];
        let res = self.session.run(SessionInputs::ValueSlice::<3>(&inps))?;

        self.state = res["stateN"].try_extract_array()?.to_owned();
        let output = res["output"].try_extract_tensor::<f32>()?;
        Ok(output.1[0])
    }
}

impl SpeechDetector for SileroDetector {
    fn speech_prob(&mut self, frame: &[f32]) -> Result<f32, PipelineError> {
        // The model expects frames of exactly the configured size; shorter
        // input is zero-padded.
        let frame_len = frame.len().min(self.frame_buffer.ncols());
        for i in 0..self.frame_buffer.ncols() {
            self.frame_buffer[[0, i]] = if i < frame_len { frame[i] } else { 0.0 };
        }

        self.run_model()
            .map_err(|e| PipelineError::Initialization(format!("VAD inference failed: {}", e)))
    }

    fn reset(&mut self) {
        self.state = ArrayD::<f32>::zeros([2, 1, 128].as_slice());
    }
}

/// Gates the live stream into speech spans.
///
/// State machine with hysteresis: entering speech requires `threshold` for
/// `hangbefore_frames` consecutive frames, leaving requires dropping below
/// `speech_end_threshold` for `hangover_frames`. Raw probability drives
/// onset (fast reaction), an exponential moving average drives continuation
/// (noise robustness).
pub struct VoiceActivityGate {
    detector: Option<Box<dyn SpeechDetector>>,
    config: VadConfig,
    active: bool,
    state: VadState,
    frames_in_state: usize,
    smoothed_prob: f32,
    pending: Vec<f32>,
}

const SPEECH_PROB_SMOOTHING: f32 = 0.3;

impl VoiceActivityGate {
    /// A gate with no detector installed yet: processing drops samples
    /// without error until [`install_detector`](Self::install_detector).
    pub fn new(config: VadConfig) -> Self {
        Self {
            detector: None,
            config,
            active: false,
            state: VadState::Silence,
            frames_in_state: 0,
            smoothed_prob: 0.0,
            pending: Vec::new(),
        }
    }

    pub fn with_detector(config: VadConfig, detector: Box<dyn SpeechDetector>) -> Self {
        let mut gate = Self::new(config);
        gate.detector = Some(detector);
        gate
    }

    /// Install (or replace) the detector once its model has loaded.
    pub fn install_detector(&mut self, detector: Box<dyn SpeechDetector>) {
        self.detector = Some(detector);
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_some()
    }

    /// Idempotent; safe before the detector is ready.
    pub fn start(&mut self) {
        self.active = true;
    }

    /// Idempotent; safe before the detector is ready.
    pub fn pause(&mut self) {
        self.active = false;
    }

    /// True from confirmed speech until the hangover expires.
    pub fn is_speaking(&self) -> bool {
        self.state == VadState::Speech || self.state == VadState::PossibleSilence
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Feed raw samples; returns the boundary events they confirmed.
    ///
    /// While paused, or before a detector is installed, input is dropped
    /// and no events are produced.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<SpeechEvent>, PipelineError> {
        if !self.active || self.detector.is_none() {
            return Ok(Vec::new());
        }

        self.pending.extend_from_slice(samples);
        let frame_size = self.config.frame_size;
        let mut events = Vec::new();

        while self.pending.len() >= frame_size {
            let frame: Vec<f32> = self.pending.drain(..frame_size).collect();
            let raw_prob = match self.detector.as_mut() {
                Some(detector) => detector.speech_prob(&frame)?,
                None => break,
            };

            self.smoothed_prob = SPEECH_PROB_SMOOTHING * raw_prob
                + (1.0 - SPEECH_PROB_SMOOTHING) * self.smoothed_prob;

            if let Some(event) = self.update_state(raw_prob, self.smoothed_prob) {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Drop buffered samples and return to silence.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.state = VadState::Silence;
        self.frames_in_state = 0;
        self.smoothed_prob = 0.0;
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
    }

    fn update_state(&mut self, raw_prob: f32, smoothed_prob: f32) -> Option<SpeechEvent> {
        // Raw probability for onset, smoothed for continuation.
        let detection_prob = if self.state == VadState::Silence {
            raw_prob
        } else {
            smoothed_prob
        };

        let is_starting = detection_prob > self.config.threshold;
        let is_continuing = detection_prob > self.config.speech_end_threshold;

        match self.state {
            VadState::Silence => {
                if is_starting {
                    self.state = VadState::PossibleSpeech;
                    self.frames_in_state = 1;
                    if self.frames_in_state >= self.config.hangbefore_frames {
                        self.state = VadState::Speech;
                        self.frames_in_state = 0;
                        return Some(SpeechEvent::Started);
                    }
                }
            }
            VadState::PossibleSpeech => {
                if is_starting {
                    self.frames_in_state += 1;
                    if self.frames_in_state >= self.config.hangbefore_frames {
                        self.state = VadState::Speech;
                        self.frames_in_state = 0;
                        return Some(SpeechEvent::Started);
                    }
                } else if !is_continuing {
                    self.state = VadState::Silence;
                    self.frames_in_state = 0;
                }
                // Between the two thresholds: hold position.
            }
            VadState::Speech => {
                if !is_continuing {
                    self.state = VadState::PossibleSilence;
                    self.frames_in_state = 1;
                }
            }
            VadState::PossibleSilence => {
                if is_continuing {
                    self.state = VadState::Speech;
                    self.frames_in_state = 0;
                } else {
                    self.frames_in_state += 1;
                    if self.frames_in_state >= self.config.hangover_frames {
                        self.state = VadState::Silence;
                        self.frames_in_state = 0;
                        return Some(SpeechEvent::Ended);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VadConfig {
        VadConfig {
            threshold: 0.2,
            speech_end_threshold: 0.15,
            frame_size: 4,
            hangbefore_frames: 2,
            hangover_frames: 3,
        }
    }

    fn gate() -> VoiceActivityGate {
        let mut gate = VoiceActivityGate::with_detector(
            test_config(),
            Box::new(EnergyDetector::default()),
        );
        gate.start();
        gate
    }

    const LOUD: [f32; 4] = [0.5, -0.5, 0.5, -0.5];
    const QUIET: [f32; 4] = [0.0; 4];

    #[test]
    fn speech_start_requires_hangbefore_confirmation() {
        let mut gate = gate();
        assert!(gate.process(&LOUD).unwrap().is_empty());
        assert!(!gate.is_speaking());

        let events = gate.process(&LOUD).unwrap();
        assert_eq!(events, vec![SpeechEvent::Started]);
        assert!(gate.is_speaking());
    }

    #[test]
    fn speech_end_fires_after_hangover() {
        let mut gate = gate();
        gate.process(&LOUD).unwrap();
        gate.process(&LOUD).unwrap();
        // Extra loud frames keep the EMA high enough that continuation holds.
        gate.process(&LOUD).unwrap();
        gate.process(&LOUD).unwrap();

        let mut events = Vec::new();
        for _ in 0..12 {
            events.extend(gate.process(&QUIET).unwrap());
        }
        assert_eq!(events, vec![SpeechEvent::Ended]);
        assert!(!gate.is_speaking());
    }

    #[test]
    fn gate_without_detector_drops_samples_without_error() {
        let mut gate = VoiceActivityGate::new(test_config());
        gate.start();
        assert!(gate.process(&LOUD).unwrap().is_empty());
        assert!(gate.process(&LOUD).unwrap().is_empty());
        assert!(!gate.is_speaking());
    }

    #[test]
    fn paused_gate_ignores_input() {
        let mut gate = gate();
        gate.pause();
        gate.pause(); // idempotent
        assert!(gate.process(&LOUD).unwrap().is_empty());
        assert!(gate.process(&LOUD).unwrap().is_empty());
        assert!(!gate.is_speaking());

        gate.start();
        gate.start(); // idempotent
        gate.process(&LOUD).unwrap();
        assert_eq!(gate.process(&LOUD).unwrap(), vec![SpeechEvent::Started]);
    }
}
