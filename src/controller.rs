//! Conversation Controller (spec.md §4.7): glues VAD, STT, the LLM Turn
//! Engine, TTS, and the Paced Sender into a turn-taking conversation with
//! barge-in. Grounded on `real_time_transcriber.rs`'s orchestration style
//! end-to-end: the `FinalizingGuard` RAII idiom (here `InFlightTurnGuard`),
//! a mutex-guarded in-flight flag, and idempotent shutdown via
//! repeat-invocation-safe atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{attenuate_mulaw_frame, decode_mulaw, mulaw_silence, resample_pcm16};
use crate::external::InboundRtpFrame;
use crate::llm::TurnEngine;
use crate::sender::PacedSender;
use crate::stt::SttStreamer;
use crate::tts::{CancellationToken, TtsStreamer};
use crate::vad::{OnnxSileroModel, SpeechProbabilityModel, VadEvent, VadSegmenter};

const DUCK_GAIN: f32 = 0.35;
const WELCOME_SILENCE_PREFIX_MS: u64 = 2000;

/// RAII guard mirroring the teacher's `FinalizingGuard`: sets a flag true
/// on construction, clears it on drop, so every exit path (including
/// early returns and panics) releases the in-flight-turn lock.
struct InFlightTurnGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightTurnGuard {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }
}

impl Drop for InFlightTurnGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct ConversationController<M: SpeechProbabilityModel = OnnxSileroModel> {
    vad: Mutex<VadSegmenter<M>>,
    stt: Arc<SttStreamer>,
    turn_engine: Arc<TurnEngine>,
    tts: Arc<TtsStreamer>,
    sender: Arc<PacedSender>,

    is_processing_transcription: Arc<AtomicBool>,
    volume_filter_active: AtomicBool,
    current_turn_cancel: Mutex<CancellationToken>,
    shut_down: AtomicBool,
    now_ms: AtomicU64Ext,
}

/// Tiny monotonic clock the controller hands to the VAD; kept as a
/// dedicated type rather than a bare `u64` field so its increment-on-read
/// behavior is obvious at call sites.
struct AtomicU64Ext(std::sync::atomic::AtomicU64);

impl AtomicU64Ext {
    fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    fn advance(&self, frame_len_ms: u64) -> u64 {
        self.0.fetch_add(frame_len_ms, Ordering::SeqCst)
    }
}

impl<M: SpeechProbabilityModel + 'static> ConversationController<M> {
    pub fn new(
        vad: VadSegmenter<M>,
        stt: Arc<SttStreamer>,
        turn_engine: Arc<TurnEngine>,
        tts: Arc<TtsStreamer>,
        sender: Arc<PacedSender>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            vad: Mutex::new(vad),
            stt,
            turn_engine,
            tts,
            sender,
            is_processing_transcription: Arc::new(AtomicBool::new(false)),
            volume_filter_active: AtomicBool::new(false),
            current_turn_cancel: Mutex::new(CancellationToken::new()),
            shut_down: AtomicBool::new(false),
            now_ms: AtomicU64Ext::new(),
        });
        controller.sender.start();
        controller.spawn_stt_listener();
        controller
    }

    /// Wires up the STT -> controller event path as a background task,
    /// since `TranscriptionComplete` handling suspends on an LLM call.
    fn spawn_stt_listener(self: &Arc<Self>) {
        let controller = self.clone();
        let mut rx = self.stt.subscribe();
        tokio::spawn(async move {
            while let Ok(crate::stt::SttEvent::TranscriptionComplete(text)) = rx.recv().await {
                controller.clone().on_transcription_complete(text).await;
            }
        });
    }

    /// At call answer: seed the welcome line into chat history (no model
    /// call) and enqueue the pre-rendered welcome audio, prefixed with 2s
    /// of silence so PSTN path setup doesn't clip the first syllable.
    pub async fn start_call(&self, welcome_text: &str, welcome_audio_pcmu: &[u8]) {
        self.turn_engine.add_assistant_message(welcome_text).await;
        let silence_bytes = (WELCOME_SILENCE_PREFIX_MS / 20) as usize * crate::codec::PCMU_FRAME_BYTES;
        self.sender.enqueue_bytes(&mulaw_silence(silence_bytes));
        self.sender.enqueue_bytes(welcome_audio_pcmu);
    }

    /// Event 1: inbound 8kHz μ-law RTP frame -> decode -> resample to
    /// 16kHz -> forward to VAD. Frames that aren't valid PCMU are dropped
    /// at the boundary (spec.md §6).
    pub fn on_inbound_audio(self: &Arc<Self>, frame: &InboundRtpFrame) {
        if !frame.is_valid_pcmu() {
            return;
        }
        let pcm8k = decode_mulaw(&frame.bytes);
        let pcm16k = resample_pcm16(&pcm8k, 8_000, 16_000);
        let frame_len_ms = 20u64;
        let now_ms = self.now_ms.advance(frame_len_ms);

        let mut events = Vec::new();
        {
            let mut vad = self.vad.lock();
            let result = vad.push_frame(&pcm16k, 16_000, frame_len_ms, now_ms, |event| {
                events.push(event);
            });
            if let Err(e) = result {
                eprintln!("controller: VAD push_frame failed: {e}");
                return;
            }
        }

        for event in events {
            self.on_vad_event(event);
        }
    }

    fn on_vad_event(self: &Arc<Self>, event: VadEvent) {
        match event {
            VadEvent::SentenceBegin => self.on_sentence_begin(),
            VadEvent::SentenceCompleted(utterance) => self.on_sentence_completed(utterance.bytes),
        }
    }

    /// Event 2: duck the bot if it's currently playing, without
    /// interrupting it yet.
    fn on_sentence_begin(self: &Arc<Self>) {
        if self.sender.is_playing()
            && !self.volume_filter_active.swap(true, Ordering::SeqCst)
        {
            self.sender
                .apply_filter(Arc::new(|frame: &[u8]| attenuate_mulaw_frame(frame, DUCK_GAIN)));
        }
    }

    /// Event 3: clear ducking and hand the utterance to STT.
    fn on_sentence_completed(self: &Arc<Self>, utterance_pcm: Vec<u8>) {
        if self.volume_filter_active.swap(false, Ordering::SeqCst) {
            self.sender.clear_filter();
        }
        let stt = self.stt.clone();
        tokio::spawn(async move {
            if let Err(e) = stt.process_audio_chunk(&utterance_pcm).await {
                eprintln!("controller: STT processing failed: {e}");
            }
        });
    }

    /// Event 4: a full transcript is ready. Concurrent transcripts during
    /// an in-flight turn are dropped, not queued, so the bot never stacks
    /// replies after the user has moved on.
    async fn on_transcription_complete(self: Arc<Self>, text: String) {
        if self.is_processing_transcription.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = InFlightTurnGuard::new(self.is_processing_transcription.clone());

        let cancel = CancellationToken::new();
        *self.current_turn_cancel.lock() = cancel.clone();

        let reply = self.turn_engine.process_message(&text).await;

        // Fully interrupt any in-progress playback now that a new reply
        // is ready, *after* the (possibly slow) LLM call, not before.
        self.sender.reset_buffer();

        let mut rx = self.tts.stream(&reply, cancel).await;
        while let Some(chunk) = rx.recv().await {
            self.sender.enqueue_bytes(&chunk);
        }
    }

    /// Idempotent shutdown: cancels the current turn, stops the sender
    /// (drain + silence), and tolerates repeat invocation.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.current_turn_cancel.lock().cancel();
        self.sender.reset_buffer();
        self.sender.stop().await;
    }
}
