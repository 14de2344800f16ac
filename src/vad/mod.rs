//! Voice Activity Detection & Segmentation: converts a stream of 16 kHz
//! mono PCM frames into an event stream of utterance boundaries.

use std::fmt;
use std::path::Path;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::frame_counter::TriggerCounter;
use crate::preroll_ring::PrerollRing;

const EXPECTED_SAMPLE_RATE: u32 = 16_000;
const VAD_WINDOW_BYTES: usize = 1024; // 32ms @ 16kHz, 16-bit samples
const STATE_SHAPE: [i64; 3] = [2, 1, 64];
const STATE_LEN: usize = 2 * 1 * 64;

#[derive(Debug)]
pub enum VadError {
    InvalidSampleRate { got: u32 },
    Inference(String),
}

impl fmt::Display for VadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VadError::InvalidSampleRate { got } => {
                write!(f, "VAD requires 16000 Hz input, got {got}")
            }
            VadError::Inference(msg) => write!(f, "VAD inference failed: {msg}"),
        }
    }
}

impl std::error::Error for VadError {}

impl From<ort::Error> for VadError {
    fn from(e: ort::Error) -> Self {
        VadError::Inference(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    JustStarted,
    InUtterance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    SilenceHangover,
    MaxLength,
}

#[derive(Debug, Clone)]
pub struct Utterance {
    pub start_time_ms: u64,
    pub bytes: Vec<u8>,
    pub terminal: TerminalReason,
}

#[derive(Debug, Clone)]
pub enum VadEvent {
    SentenceBegin,
    SentenceCompleted(Utterance),
}

#[derive(Debug, Clone)]
pub struct VadConfig {
    pub threshold: f32,
    pub start_threshold_ms: u64,
    pub end_threshold_ms: u64,
    pub pre_speech_ring_ms: u64,
    pub max_speech_length_ms: u64,
    /// Whether recurrent hidden/cell state is zeroed at SentenceCompleted.
    /// Not reset by default, matching the reference (spec.md §9 open question).
    pub reset_state_between_utterances: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            start_threshold_ms: 500,
            end_threshold_ms: 550,
            pre_speech_ring_ms: 1200,
            max_speech_length_ms: 7000,
            reset_state_between_utterances: false,
        }
    }
}

fn ceil_div(ms: u64, frame_ms: u64) -> u32 {
    (((ms + frame_ms - 1) / frame_ms).max(1)) as u32
}

/// Seam around the speech-probability inference step, so the state
/// machine above it (the actual subject of spec.md §4.1) is testable
/// without a committed ONNX session. `OnnxSileroModel` is the production
/// implementation; tests inject a canned-probability double.
pub trait SpeechProbabilityModel: Send {
    fn infer(&mut self, samples_32ms: &[f32]) -> Result<f32, VadError>;

    /// Zero recurrent state between utterances. Default no-op; models with
    /// no internal state (or test doubles) don't need to override it.
    fn reset(&mut self) {}
}

pub struct OnnxSileroModel {
    session: Session,
    state: Vec<f32>,
}

impl OnnxSileroModel {
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, VadError> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_inter_threads(1)?
            .commit_from_file(model_path)?;
        Ok(Self {
            session,
            state: vec![0.0; STATE_LEN],
        })
    }

    fn reset_state(&mut self) {
        self.state = vec![0.0; STATE_LEN];
    }
}

impl SpeechProbabilityModel for OnnxSileroModel {
    fn infer(&mut self, samples: &[f32]) -> Result<f32, VadError> {
        let frame_tensor = Tensor::from_array(([1usize, samples.len()], samples.to_vec()))?;
        let state_tensor = Tensor::from_array((STATE_SHAPE, std::mem::take(&mut self.state)))?;
        let sample_rate_tensor = Tensor::from_array(([1usize], vec![EXPECTED_SAMPLE_RATE as i64]))?;

        let outputs = self.session.run(ort::inputs![
            "input" => frame_tensor,
            "state" => state_tensor,
            "sr" => sample_rate_tensor,
        ])?;

        let (_, state_data) = outputs["stateN"].try_extract_tensor::<f32>()?;
        self.state = state_data.to_vec();

        let (_, output_data) = outputs["output"].try_extract_tensor::<f32>()?;
        Ok(output_data.first().copied().unwrap_or(0.0))
    }

    fn reset(&mut self) {
        self.reset_state();
    }
}

pub struct VadSegmenter<M: SpeechProbabilityModel = OnnxSileroModel> {
    model: M,
    config: VadConfig,
    frame_ms: u64,

    ring: PrerollRing,
    start_counter: TriggerCounter,
    end_counter: TriggerCounter,

    vad_state: State,
    buffer: Vec<u8>,
    utterance_start_ms: u64,
    elapsed_ms: u64,
}

impl VadSegmenter<OnnxSileroModel> {
    pub fn new(
        config: VadConfig,
        model_path: impl AsRef<Path>,
        frame_ms: u64,
    ) -> Result<Self, VadError> {
        let model = OnnxSileroModel::load(model_path)?;
        Ok(Self::with_model(config, model, frame_ms))
    }
}

impl<M: SpeechProbabilityModel> VadSegmenter<M> {
    pub fn with_model(config: VadConfig, model: M, frame_ms: u64) -> Self {
        let pre_speech_frames = ceil_div(config.pre_speech_ring_ms, frame_ms) as usize;
        let ring_capacity_bytes = pre_speech_frames * (frame_ms as usize * 32);

        let start_counter = TriggerCounter::new(ceil_div(config.start_threshold_ms, frame_ms));
        let end_counter = TriggerCounter::new(ceil_div(config.end_threshold_ms, frame_ms));

        Self {
            model,
            config,
            frame_ms,
            ring: PrerollRing::new(ring_capacity_bytes),
            start_counter,
            end_counter,
            vad_state: State::Idle,
            buffer: Vec::new(),
            utterance_start_ms: 0,
            elapsed_ms: 0,
        }
    }

    /// Ingest one frame and emit zero or more VAD events via `on_event`.
    pub fn push_frame(
        &mut self,
        frame_bytes: &[u8],
        sample_rate: u32,
        frame_len_ms: u64,
        now_ms: u64,
        mut on_event: impl FnMut(VadEvent),
    ) -> Result<(), VadError> {
        if sample_rate != EXPECTED_SAMPLE_RATE {
            return Err(VadError::InvalidSampleRate { got: sample_rate });
        }

        let expected_bytes = (frame_len_ms as usize) * 32;
        let frame = normalize_frame(frame_bytes, expected_bytes);

        self.ring.push(&frame);
        let window = self.ring.tail_window(VAD_WINDOW_BYTES);
        let samples = bytes_to_f32(&window);
        let prob = self.model.infer(&samples)?;
        let is_speech = prob >= self.config.threshold;

        match self.vad_state {
            State::Idle => {
                if self.start_counter.observe(is_speech) {
                    self.end_counter.reset();
                    self.buffer = self.ring.snapshot();
                    self.utterance_start_ms = now_ms;
                    // Count the pre-roll already sitting in `buffer` towards
                    // max_speech_length_ms, or a max-length completion would
                    // run preroll + max_speech_length_ms past the §8 bound.
                    self.elapsed_ms = self.buffer.len() as u64 / 32;
                    on_event(VadEvent::SentenceBegin);
                    self.vad_state = State::JustStarted;
                } else if !is_speech {
                    self.start_counter.reset();
                }
            }
            State::JustStarted => {
                // one-frame guard: the triggering frame is already in the
                // buffer from the pre-speech ring snapshot above.
                self.vad_state = State::InUtterance;
                self.append_and_check(&frame, is_speech, frame_len_ms, &mut on_event);
            }
            State::InUtterance => {
                self.append_and_check(&frame, is_speech, frame_len_ms, &mut on_event);
            }
        }

        Ok(())
    }

    fn append_and_check(
        &mut self,
        frame: &[u8],
        is_speech: bool,
        frame_len_ms: u64,
        on_event: &mut impl FnMut(VadEvent),
    ) {
        self.buffer.extend_from_slice(frame);
        self.elapsed_ms += frame_len_ms;

        let end_reached = self.end_counter.observe(!is_speech);
        if is_speech {
            self.end_counter.reset();
        }

        if end_reached {
            self.complete(TerminalReason::SilenceHangover, on_event);
        } else if self.elapsed_ms >= self.config.max_speech_length_ms {
            self.complete(TerminalReason::MaxLength, on_event);
        }
    }

    fn complete(&mut self, terminal: TerminalReason, on_event: &mut impl FnMut(VadEvent)) {
        let utterance = Utterance {
            start_time_ms: self.utterance_start_ms,
            bytes: std::mem::take(&mut self.buffer),
            terminal,
        };
        on_event(VadEvent::SentenceCompleted(utterance));
        self.vad_state = State::Idle;
        self.start_counter.reset();
        self.end_counter.reset();
        if self.config.reset_state_between_utterances {
            self.model.reset();
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.vad_state != State::Idle
    }
}

fn normalize_frame(frame_bytes: &[u8], expected_bytes: usize) -> Vec<u8> {
    let trimmed_len = frame_bytes.len() - (frame_bytes.len() % 2);
    let mut frame = frame_bytes[..trimmed_len].to_vec();
    if frame.len() < expected_bytes {
        eprintln!(
            "vad: frame undersized ({} < {} bytes), zero-padding",
            frame.len(),
            expected_bytes
        );
        frame.resize(expected_bytes, 0);
    } else if frame.len() > expected_bytes {
        eprintln!(
            "vad: frame oversized ({} > {} bytes), truncating",
            frame.len(),
            expected_bytes
        );
        frame.truncate(expected_bytes);
    }
    frame
}

fn bytes_to_f32(pcm16: &[u8]) -> Vec<f32> {
    pcm16
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up_and_floors_at_one() {
        assert_eq!(ceil_div(500, 20), 25);
        assert_eq!(ceil_div(550, 20), 28);
        assert_eq!(ceil_div(1, 20), 1);
    }

    #[test]
    fn normalize_frame_pads_undersized() {
        let frame = normalize_frame(&[1, 2, 3, 4], 8);
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..4], &[1, 2, 3, 4]);
        assert!(frame[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn normalize_frame_truncates_oversized() {
        let frame = normalize_frame(&[1, 2, 3, 4, 5, 6], 4);
        assert_eq!(frame, vec![1, 2, 3, 4]);
    }

    #[test]
    fn normalize_frame_trims_odd_byte() {
        let frame = normalize_frame(&[1, 2, 3], 2);
        assert_eq!(frame, vec![1, 2]);
    }

    #[test]
    fn bytes_to_f32_normalizes_to_unit_range() {
        let pcm = (i16::MAX).to_le_bytes();
        let samples = bytes_to_f32(&pcm);
        assert!((samples[0] - 1.0).abs() < 0.001);
    }

    /// Test double for `SpeechProbabilityModel`: returns a scripted sequence
    /// of probabilities, one per `infer` call, holding the last value once
    /// exhausted. Lets the state machine above it (start/end counters,
    /// pre-roll, max-length truncation) be exercised with no ONNX runtime.
    struct ScriptedModel {
        probs: std::collections::VecDeque<f32>,
        last: f32,
        reset_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl ScriptedModel {
        fn new(probs: Vec<f32>) -> Self {
            Self {
                probs: probs.into(),
                last: 0.0,
                reset_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }
        }

        fn reset_count_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
            self.reset_count.clone()
        }
    }

    impl SpeechProbabilityModel for ScriptedModel {
        fn infer(&mut self, _samples: &[f32]) -> Result<f32, VadError> {
            self.last = self.probs.pop_front().unwrap_or(self.last);
            Ok(self.last)
        }

        fn reset(&mut self) {
            self.reset_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn test_config() -> VadConfig {
        VadConfig {
            threshold: 0.5,
            start_threshold_ms: 40, // 2 frames @ 20ms
            end_threshold_ms: 40,
            pre_speech_ring_ms: 40,
            max_speech_length_ms: 200,
            reset_state_between_utterances: false,
        }
    }

    fn push_frames(
        vad: &mut VadSegmenter<ScriptedModel>,
        count: usize,
        events: &mut Vec<VadEvent>,
    ) {
        let frame = vec![0u8; 640]; // 20ms @ 16kHz 16-bit
        for i in 0..count {
            vad.push_frame(&frame, 16_000, 20, (i as u64) * 20, |e| events.push(e))
                .unwrap();
        }
    }

    #[test]
    fn rejects_wrong_sample_rate() {
        let model = ScriptedModel::new(vec![1.0]);
        let mut vad = VadSegmenter::with_model(test_config(), model, 20);
        let frame = vec![0u8; 640];
        let err = vad
            .push_frame(&frame, 8_000, 20, 0, |_| {})
            .unwrap_err();
        assert!(matches!(err, VadError::InvalidSampleRate { got: 8_000 }));
    }

    #[test]
    fn sustained_speech_triggers_sentence_begin_once() {
        // 2-frame start threshold: two speech frames should trigger exactly
        // one SentenceBegin, and a subsequent speech frame emits nothing new.
        let model = ScriptedModel::new(vec![0.9, 0.9, 0.9]);
        let mut vad = VadSegmenter::with_model(test_config(), model, 20);
        let mut events = Vec::new();
        push_frames(&mut vad, 3, &mut events);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], VadEvent::SentenceBegin));
        assert!(vad.is_speaking());
    }

    #[test]
    fn brief_silence_blip_does_not_start_utterance() {
        // Below start threshold: silence in between resets the counter.
        let model = ScriptedModel::new(vec![0.9, 0.1, 0.9]);
        let mut vad = VadSegmenter::with_model(test_config(), model, 20);
        let mut events = Vec::new();
        push_frames(&mut vad, 3, &mut events);

        assert!(events.is_empty());
        assert!(!vad.is_speaking());
    }

    #[test]
    fn silence_hangover_completes_utterance() {
        // start (2 speech frames) -> in-utterance -> 2 silence frames ends it.
        let model = ScriptedModel::new(vec![0.9, 0.9, 0.1, 0.1]);
        let mut vad = VadSegmenter::with_model(test_config(), model, 20);
        let mut events = Vec::new();
        push_frames(&mut vad, 4, &mut events);

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], VadEvent::SentenceBegin));
        match &events[1] {
            VadEvent::SentenceCompleted(u) => {
                assert_eq!(u.terminal, TerminalReason::SilenceHangover);
            }
            other => panic!("expected SentenceCompleted, got {other:?}"),
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn max_speech_length_forces_completion_even_without_silence() {
        // 200ms max length / 20ms frames = 10 frames of continuous speech.
        let probs = vec![0.9; 12];
        let model = ScriptedModel::new(probs);
        let mut vad = VadSegmenter::with_model(test_config(), model, 20);
        let mut events = Vec::new();
        push_frames(&mut vad, 12, &mut events);

        assert!(events
            .iter()
            .any(|e| matches!(e, VadEvent::SentenceCompleted(u) if u.terminal == TerminalReason::MaxLength)));
    }

    #[test]
    fn max_speech_length_buffer_honors_byte_bound_even_with_preroll() {
        // The emitted buffer includes the pre-speech ring snapshot, so a
        // naive elapsed_ms count (reset to 0 at trigger) would overshoot
        // this bound by the whole preroll. See §8: no SentenceCompleted
        // buffer may exceed max_speech_length_ms * sample_rate * 2 / 1000
        // bytes (16kHz, 16-bit => 32 bytes/ms).
        let probs = vec![0.9; 12];
        let model = ScriptedModel::new(probs);
        let mut vad = VadSegmenter::with_model(test_config(), model, 20);
        let mut events = Vec::new();
        push_frames(&mut vad, 12, &mut events);

        let max_bytes = test_config().max_speech_length_ms * 32;
        let completed = events
            .iter()
            .find_map(|e| match e {
                VadEvent::SentenceCompleted(u) if u.terminal == TerminalReason::MaxLength => {
                    Some(u)
                }
                _ => None,
            })
            .expect("expected a MaxLength completion");
        assert_eq!(completed.bytes.len() as u64, max_bytes);
    }

    #[test]
    fn reset_state_between_utterances_respects_config_flag() {
        let model = ScriptedModel::new(vec![0.9, 0.9, 0.1, 0.1]);
        let reset_count = model.reset_count_handle();
        let mut config = test_config();
        config.reset_state_between_utterances = true;
        let mut vad = VadSegmenter::with_model(config, model, 20);
        let mut events = Vec::new();
        push_frames(&mut vad, 4, &mut events);

        assert!(events
            .iter()
            .any(|e| matches!(e, VadEvent::SentenceCompleted(_))));
        assert_eq!(reset_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
