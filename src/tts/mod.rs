//! TTS Streamer (spec.md §4.6): splits text into sentences, synthesizes
//! the first sentence synchronously for minimum time-to-first-chunk, and
//! fans the rest out to a bounded worker pool while preserving original
//! sentence order on output.

use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::codec::{encode_mulaw, resample_pcm16};

const TTS_POOL_CONCURRENCY: usize = 3;
const SYNTH_SAMPLE_RATE: u32 = 22_050;
const TELEPHONY_SAMPLE_RATE: u32 = 8_000;

#[derive(Debug)]
pub enum TtsError {
    SynthesisFailed(String),
}

impl fmt::Display for TtsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtsError::SynthesisFailed(msg) => write!(f, "TTS synthesis failed: {msg}"),
        }
    }
}

impl std::error::Error for TtsError {}

/// Trait seam around the neural vocoder. Produces 22050Hz 16-bit PCM
/// samples for one sentence.
pub trait TtsSynthesizer: Send + Sync {
    fn synthesize(&self, sentence: &str) -> Result<Vec<i16>, TtsError>;
}

/// Cooperative cancellation flag shared between the controller and an
/// in-flight TTS stream; checked between sentences (spec.md §4.6, §5).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Splits `text` into sentences on `.`, `!`, `?` followed by whitespace or
/// end-of-string, rejecting a boundary when the word immediately before
/// the punctuation is a single letter (covers both initials like "A.
/// Smith" and mid-abbreviations like "e.g." where every token is a single
/// letter).
pub fn split_sentences(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let bytes = trimmed.as_bytes();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if matches!(c, '.' | '!' | '?') {
            let next_is_boundary = i + 1 >= bytes.len() || bytes[i + 1].is_ascii_whitespace();
            if next_is_boundary {
                let mut j = i;
                while j > start && (bytes[j - 1] as char).is_alphanumeric() {
                    j -= 1;
                }
                let token_len = i - j;
                let is_single_letter_abbreviation = c == '.' && token_len <= 1;
                if !is_single_letter_abbreviation {
                    let sentence = trimmed[start..=i].trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence.to_string());
                    }
                    start = i + 1;
                }
            }
        }
        i += 1;
    }

    if start < trimmed.len() {
        let remainder = trimmed[start..].trim();
        if !remainder.is_empty() {
            sentences.push(remainder.to_string());
        }
    }

    sentences
}

/// Wrap 16-bit PCM at `SYNTH_SAMPLE_RATE` in a minimal WAV envelope, then
/// resample to telephony rate and μ-law encode. Returns `None` on
/// synthesis/encode failure for this sentence only.
fn render_sentence(synth: &dyn TtsSynthesizer, sentence: &str) -> Option<Vec<u8>> {
    let pcm = match synth.synthesize(sentence) {
        Ok(samples) => samples,
        Err(e) => {
            eprintln!("tts: sentence dropped, synthesis failed: {e}");
            return None;
        }
    };
    if pcm.is_empty() {
        return None;
    }

    let wav_pcm16_bytes = wrap_wav(&pcm);
    let resampled = resample_pcm16(&wav_pcm16_bytes, SYNTH_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE);
    Some(encode_mulaw(&resampled))
}

/// Builds an in-memory mono 16-bit WAV, then strips the header back off
/// (the envelope/unwrap round-trip matches the teacher's `hound`-based WAV
/// path in `audio_processor.rs`, reused here for TTS output instead of mic
/// capture) and returns just the raw little-endian PCM payload.
fn wrap_wav(pcm: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SYNTH_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("valid wav spec");
        for &sample in pcm {
            writer.write_sample(sample).expect("writing in-memory wav sample");
        }
        writer.finalize().expect("finalizing in-memory wav");
    }
    let wav_bytes = cursor.into_inner();
    let mut reader = hound::WavReader::new(Cursor::new(wav_bytes)).expect("reading back own wav");
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .filter_map(|s| s.ok())
        .collect();
    samples.into_iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Concrete synthesizer hitting a configured neural-vocoder HTTP endpoint
/// (out of scope to implement per spec.md §1; this is the seam a caller
/// wires a real provider into). Posts `{"text": ...}` and expects the raw
/// response body to be little-endian 16-bit mono PCM at 22050 Hz, the same
/// shape `render_sentence` expects from any `TtsSynthesizer`. Uses
/// `reqwest::blocking` since `synthesize` runs inside `spawn_blocking`.
pub struct HttpTtsSynthesizer {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTtsSynthesizer {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

impl TtsSynthesizer for HttpTtsSynthesizer {
    fn synthesize(&self, sentence: &str) -> Result<Vec<i16>, TtsError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "text": sentence }))
            .send()
            .map_err(|e| TtsError::SynthesisFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(TtsError::SynthesisFailed(format!("status {status}")));
        }

        let bytes = response
            .bytes()
            .map_err(|e| TtsError::SynthesisFailed(e.to_string()))?;
        let usable = bytes.len() - (bytes.len() % 2);
        Ok(bytes[..usable]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }
}

pub struct TtsStreamer {
    synth: Arc<dyn TtsSynthesizer>,
}

impl TtsStreamer {
    pub fn new(synth: Arc<dyn TtsSynthesizer>) -> Self {
        Self { synth }
    }

    /// Stream μ-law chunks for `text` in sentence order. The first
    /// sentence is synthesized synchronously before this function
    /// returns its receiver's first item; sentences 2..N synthesize
    /// concurrently (bounded to `TTS_POOL_CONCURRENCY`) but are yielded
    /// strictly in original order. Empty text yields nothing. Honors
    /// `cancel` between sentences.
    pub async fn stream(&self, text: &str, cancel: CancellationToken) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(8);
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return rx;
        }

        let synth = self.synth.clone();
        let mut iter = sentences.into_iter();
        let first = iter.next().unwrap();
        let rest: Vec<String> = iter.collect();

        if cancel.is_cancelled() {
            return rx;
        }
        if let Some(chunk) = render_sentence(synth.as_ref(), &first) {
            if tx.send(chunk).await.is_err() {
                return rx;
            }
        }

        if rest.is_empty() {
            return rx;
        }

        let semaphore = Arc::new(Semaphore::new(TTS_POOL_CONCURRENCY));
        let mut handles = Vec::with_capacity(rest.len());
        for sentence in rest {
            let synth = synth.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                tokio::task::spawn_blocking(move || render_sentence(synth.as_ref(), &sentence))
                    .await
                    .unwrap_or(None)
            }));
        }

        tokio::spawn(async move {
            for handle in handles {
                if cancel.is_cancelled() {
                    break;
                }
                match handle.await {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("tts: worker task failed: {e}"),
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSynth;
    impl TtsSynthesizer for EchoSynth {
        fn synthesize(&self, sentence: &str) -> Result<Vec<i16>, TtsError> {
            Ok(vec![1000i16; sentence.len().max(1) * 4])
        }
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        let sentences = split_sentences("Hello there. How are you? Great!");
        assert_eq!(
            sentences,
            vec!["Hello there.", "How are you?", "Great!"]
        );
    }

    #[test]
    fn keeps_single_letter_initials_joined() {
        let sentences = split_sentences("Please ask A. Smith for help.");
        assert_eq!(sentences, vec!["Please ask A. Smith for help."]);
    }

    #[test]
    fn keeps_mid_abbreviation_joined() {
        let sentences = split_sentences("Bring supplies, e.g. water and snacks.");
        assert_eq!(
            sentences,
            vec!["Bring supplies, e.g. water and snacks."]
        );
    }

    #[test]
    fn empty_text_yields_no_sentences() {
        assert!(split_sentences("   ").is_empty());
    }

    #[tokio::test]
    async fn empty_text_stream_yields_zero_chunks() {
        let streamer = TtsStreamer::new(Arc::new(EchoSynth));
        let mut rx = streamer.stream("", CancellationToken::new()).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn multi_sentence_text_yields_chunks_in_order() {
        let streamer = TtsStreamer::new(Arc::new(EchoSynth));
        let mut rx = streamer
            .stream("One. Two. Three.", CancellationToken::new())
            .await;
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_nothing() {
        let streamer = TtsStreamer::new(Arc::new(EchoSynth));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rx = streamer.stream("Hello there.", cancel).await;
        assert!(rx.recv().await.is_none());
    }
}
