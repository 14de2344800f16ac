//! Streaming Speech-to-Text: turns one utterance's worth of 16kHz mono PCM
//! into a single settled transcript, filtering out non-speakable
//! recognizer annotations and aggregating segments within a 2s settling
//! window (spec.md §4.3).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

const SETTLING_DELAY_MS: u64 = 100;
const SETTLING_WINDOW_SECS: i64 = 2;
const WAIT_FOR_COMPLETE_SECS: u64 = 10;
const DOWNLOAD_PROGRESS_STEP_PCT: u64 = 10;

#[derive(Debug)]
pub enum SttError {
    ModelUnavailable(String),
    RecognitionFailed(String),
}

impl fmt::Display for SttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SttError::ModelUnavailable(msg) => write!(f, "STT model unavailable: {msg}"),
            SttError::RecognitionFailed(msg) => write!(f, "STT recognition failed: {msg}"),
        }
    }
}

impl std::error::Error for SttError {}

impl From<std::io::Error> for SttError {
    fn from(e: std::io::Error) -> Self {
        SttError::ModelUnavailable(e.to_string())
    }
}

/// One raw segment as produced by the underlying recognizer, before
/// speakability filtering or settling aggregation.
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub text: String,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TranscriptSegment {
    pub text: String,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
    pub processed_at: DateTime<Utc>,
}

/// Trait seam around the concrete recognizer (ONNX/whisper/HTTP), per
/// spec.md's "underlying recognizer" external collaborator and the
/// teacher's `backend::traits::TranscriptionBackend` separation.
pub trait SttRecognizer: Send + Sync {
    fn recognize(&self, pcm16_16k: &[u8]) -> Result<Vec<RawSegment>, SttError>;
}

/// Test/offline double that always returns no segments.
pub struct NullRecognizer;

impl SttRecognizer for NullRecognizer {
    fn recognize(&self, _pcm16_16k: &[u8]) -> Result<Vec<RawSegment>, SttError> {
        Ok(Vec::new())
    }
}

fn is_speakable(trimmed: &str) -> bool {
    if trimmed.is_empty() {
        return false;
    }
    let bracketed = trimmed.starts_with('[') && trimmed.ends_with(']');
    let parenthesized = trimmed.starts_with('(') && trimmed.ends_with(')');
    !bracketed && !parenthesized
}

#[derive(Debug, Clone)]
pub enum SttEvent {
    TranscriptionComplete(String),
}

#[derive(Debug, Deserialize)]
struct RecognitionResponseSegment {
    text: String,
    #[serde(default)]
    start_ms: u64,
    #[serde(default)]
    end_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    #[serde(default)]
    segments: Vec<RecognitionResponseSegment>,
}

/// Ensure the STT model file named by `local_path` exists, downloading it
/// from `model_url` with ~10%-step progress logging if it's absent.
/// Mirrors the teacher's `download.rs::download_file`: stream to a
/// `.downloading` temp file, then rename into place so a partial download
/// is never mistaken for a complete one. Fatal for the call being
/// answered (`SttError::ModelUnavailable`), not for the process (spec.md
/// §4.3, §7).
pub async fn ensure_model_downloaded(local_path: &Path, model_url: &str) -> Result<(), SttError> {
    if local_path.exists() {
        return Ok(());
    }
    if model_url.is_empty() {
        return Err(SttError::ModelUnavailable(format!(
            "model missing at {} and no download URL configured",
            local_path.display()
        )));
    }

    println!("stt: model not found at {:?}, downloading from {model_url}", local_path);
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SttError::ModelUnavailable(e.to_string()))?;
    }

    let temp_path = local_path.with_extension("downloading");
    let mut response = reqwest::get(model_url)
        .await
        .map_err(|e| SttError::ModelUnavailable(e.to_string()))?;
    if !response.status().is_success() {
        return Err(SttError::ModelUnavailable(format!(
            "download failed with status {}",
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| SttError::ModelUnavailable(e.to_string()))?;

    let mut downloaded: u64 = 0;
    let mut last_logged_pct: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| SttError::ModelUnavailable(e.to_string()))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| SttError::ModelUnavailable(e.to_string()))?;
        downloaded += chunk.len() as u64;
        if total_size > 0 {
            let pct = (downloaded * 100) / total_size;
            if pct >= last_logged_pct + DOWNLOAD_PROGRESS_STEP_PCT {
                last_logged_pct = pct - (pct % DOWNLOAD_PROGRESS_STEP_PCT);
                println!("stt: model download {last_logged_pct}% ({downloaded}/{total_size} bytes)");
            }
        }
    }
    file.flush().await.map_err(|e| SttError::ModelUnavailable(e.to_string()))?;
    drop(file);

    tokio::fs::rename(&temp_path, local_path)
        .await
        .map_err(|e| SttError::ModelUnavailable(e.to_string()))?;
    println!("stt: model downloaded to {:?}", local_path);
    Ok(())
}

/// Concrete recognizer hitting a configured speech-to-text HTTP endpoint
/// (the "underlying recognizer" is an external collaborator per spec.md
/// §4.3, same as the LLM and TTS services). Posts raw 16kHz mono PCM and
/// expects a JSON body of timestamped segments.
pub struct HttpSttRecognizer {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl HttpSttRecognizer {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

impl SttRecognizer for HttpSttRecognizer {
    fn recognize(&self, pcm16_16k: &[u8]) -> Result<Vec<RawSegment>, SttError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/octet-stream")
            .body(pcm16_16k.to_vec())
            .send()
            .map_err(|e| SttError::RecognitionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(SttError::RecognitionFailed(format!("status {status}")));
        }

        let parsed: RecognitionResponse = response
            .json()
            .map_err(|e| SttError::RecognitionFailed(e.to_string()))?;

        Ok(parsed
            .segments
            .into_iter()
            .map(|s| RawSegment {
                text: s.text,
                start_offset_ms: s.start_ms,
                end_offset_ms: s.end_ms,
            })
            .collect())
    }
}

/// Incremental aggregation state plus a broadcast of settled transcripts.
pub struct SttStreamer {
    recognizer: Box<dyn SttRecognizer>,
    pending: Mutex<Vec<TranscriptSegment>>,
    events_tx: broadcast::Sender<SttEvent>,
}

impl SttStreamer {
    pub fn new(recognizer: Box<dyn SttRecognizer>) -> Self {
        let (events_tx, _rx) = broadcast::channel(16);
        Self {
            recognizer,
            pending: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SttEvent> {
        self.events_tx.subscribe()
    }

    /// Run recognition over one utterance's PCM, enqueue speakable
    /// segments, then check settling and possibly fire
    /// `TranscriptionComplete`.
    pub async fn process_audio_chunk(&self, pcm16_16k: &[u8]) -> Result<(), SttError> {
        let raw = self.recognizer.recognize(pcm16_16k)?;
        let now = Utc::now();
        {
            let mut pending = self.pending.lock().await;
            for seg in raw {
                let trimmed = seg.text.trim().to_string();
                if !is_speakable(&trimmed) {
                    continue;
                }
                pending.push(TranscriptSegment {
                    text: trimmed,
                    start_offset_ms: seg.start_offset_ms,
                    end_offset_ms: seg.end_offset_ms,
                    processed_at: now,
                });
            }
        }

        tokio::time::sleep(Duration::from_millis(SETTLING_DELAY_MS)).await;
        self.settle().await;
        Ok(())
    }

    async fn settle(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(SETTLING_WINDOW_SECS);
        let mut pending = self.pending.lock().await;
        let (stale, settled): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|seg| seg.processed_at < cutoff);
        // Segments older than the cutoff are discarded, not resurfaced.
        drop(stale);
        if !settled.is_empty() {
            let text = settled
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let _ = self.events_tx.send(SttEvent::TranscriptionComplete(text));
        }
        *pending = Vec::new();
    }

    /// Wait up to 10s for the next `TranscriptionComplete`; on timeout,
    /// fall back to concatenating whatever segments processed within the
    /// last 10s (possibly empty -> `None`).
    pub async fn wait_for_complete(&self) -> Option<String> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            Duration::from_secs(WAIT_FOR_COMPLETE_SECS),
            rx.recv(),
        )
        .await;

        match waited {
            Ok(Ok(SttEvent::TranscriptionComplete(text))) => Some(text),
            _ => {
                let cutoff = Utc::now() - chrono::Duration::seconds(WAIT_FOR_COMPLETE_SECS as i64);
                let pending = self.pending.lock().await;
                let recent: Vec<&str> = pending
                    .iter()
                    .filter(|s| s.processed_at >= cutoff)
                    .map(|s| s.text.as_str())
                    .collect();
                if recent.is_empty() {
                    None
                } else {
                    Some(recent.join(" "))
                }
            }
        }
    }
}
