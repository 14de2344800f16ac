//! Paced Sender: dispatches one 20ms μ-law frame per 20ms of wall-clock
//! time onto an outbound audio sink, filling gaps with silence, honoring a
//! live filter slot (for duck-the-bot attenuation), and signaling
//! completion when the queue drains after real audio has played.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::codec::{mulaw_silence, PCMU_FRAME_BYTES};

const TICK_MS: u64 = 20;

#[derive(Debug, Clone, Copy)]
pub enum SenderEvent {
    SendingComplete,
}

/// A pure byte-to-byte transform applied to each outbound frame while
/// installed. Expected to return exactly `PCMU_FRAME_BYTES` for a
/// `PCMU_FRAME_BYTES`-sized input; a panicking/erroring filter just means
/// that one frame goes out unfiltered (spec.md §4.2, `SendFailure`).
pub type Filter = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Handle shared between producers (enqueue/apply_filter/reset_buffer) and
/// the tick loop task. Mirrors the teacher's `Arc<Mutex<..>>` +
/// `AtomicBool` orchestration idiom (`real_time_transcriber.rs`).
struct Shared {
    queue: Mutex<std::collections::VecDeque<Vec<u8>>>,
    filter: Mutex<Option<Filter>>,
    has_audio_pending: AtomicBool,
    running: AtomicBool,
}

pub struct PacedSender {
    shared: Arc<Shared>,
    events_tx: broadcast::Sender<SenderEvent>,
    send_action: Arc<dyn Fn(u32, &[u8]) + Send + Sync>,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PacedSender {
    pub fn new(send_action: Arc<dyn Fn(u32, &[u8]) + Send + Sync>) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(std::collections::VecDeque::new()),
                filter: Mutex::new(None),
                has_audio_pending: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            events_tx,
            send_action,
            tick_handle: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SenderEvent> {
        self.events_tx.subscribe()
    }

    /// Start the dedicated 20ms tick task. Safe to call once; a second
    /// call is a no-op while the loop is already running.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let send_action = self.send_action.clone();
        let events_tx = self.events_tx.clone();

        let handle = tokio::spawn(async move {
            let tick_duration = Duration::from_millis(TICK_MS);
            let start = Instant::now();
            let mut expected_elapsed_ms: u64 = 0;

            while shared.running.load(Ordering::SeqCst) {
                let frame = {
                    let mut queue = shared.queue.lock();
                    queue.pop_front()
                };
                let is_silence = frame.is_none();
                let payload = frame.unwrap_or_else(|| mulaw_silence(PCMU_FRAME_BYTES));

                let filter = shared.filter.lock().clone();
                let to_send = if let Some(f) = filter {
                    let out = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&payload)));
                    match out {
                        Ok(bytes) if bytes.len() == PCMU_FRAME_BYTES => bytes,
                        Ok(_) => {
                            eprintln!("sender: filter returned wrong-sized frame, sending unfiltered");
                            payload
                        }
                        Err(_) => {
                            eprintln!("sender: filter panicked, sending unfiltered");
                            payload
                        }
                    }
                } else {
                    payload
                };

                (send_action)(PCMU_FRAME_BYTES as u32, &to_send);

                if !is_silence {
                    let queue_empty = shared.queue.lock().is_empty();
                    if queue_empty && shared.has_audio_pending.swap(false, Ordering::SeqCst) {
                        let _ = events_tx.send(SenderEvent::SendingComplete);
                    }
                }

                expected_elapsed_ms += TICK_MS;
                let target = start + tick_duration * (expected_elapsed_ms / TICK_MS) as u32;
                let now = Instant::now();
                if target > now {
                    tokio::time::sleep(target - now).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        });

        *self.tick_handle.lock() = Some(handle);
    }

    /// Idempotent, async-waitable stop: signals the tick loop and awaits
    /// its join handle (with a bounded timeout) if one was started.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.tick_handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                eprintln!("sender: tick loop shutdown timed out");
            }
        }
    }

    /// Enqueue one 160-byte μ-law frame. Frames that aren't exactly 160
    /// bytes are rejected (logged, dropped) rather than corrupting pacing.
    pub fn enqueue(&self, frame: Vec<u8>) {
        if frame.len() != PCMU_FRAME_BYTES {
            eprintln!(
                "sender: dropping frame of {} bytes (expected {})",
                frame.len(),
                PCMU_FRAME_BYTES
            );
            return;
        }
        self.shared.has_audio_pending.store(true, Ordering::SeqCst);
        self.shared.queue.lock().push_back(frame);
    }

    /// Enqueue an arbitrary-length byte blob, splitting it into 160-byte
    /// frames and discarding any trailing partial frame (spec.md §4.7.5).
    pub fn enqueue_bytes(&self, bytes: &[u8]) {
        for chunk in bytes.chunks(PCMU_FRAME_BYTES) {
            if chunk.len() == PCMU_FRAME_BYTES {
                self.enqueue(chunk.to_vec());
            }
        }
    }

    /// Drain the queue, firing `SendingComplete` immediately if audio was
    /// pending. Used to fully interrupt in-progress playback on barge-in.
    pub fn reset_buffer(&self) {
        self.shared.queue.lock().clear();
        if self.shared.has_audio_pending.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(SenderEvent::SendingComplete);
        }
    }

    pub fn apply_filter(&self, filter: Filter) {
        *self.shared.filter.lock() = Some(filter);
    }

    pub fn clear_filter(&self) {
        *self.shared.filter.lock() = None;
    }

    /// True iff the queue holds at least one frame; silence ticks don't count.
    pub fn is_playing(&self) -> bool {
        !self.shared.queue.lock().is_empty()
    }
}

/// Channel-backed convenience wrapper some callers may prefer over the
/// broadcast subscription directly (mirrors the teacher's
/// `mpsc`-per-consumer pattern in `real_time_transcriber.rs`).
pub fn completion_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn silence_fills_gaps_when_queue_empty() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sender = PacedSender::new(Arc::new(move |_dur, bytes: &[u8]| {
            assert_eq!(bytes.len(), PCMU_FRAME_BYTES);
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        sender.start();
        tokio::time::sleep(Duration::from_millis(90)).await;
        sender.stop().await;
        let n = count.load(Ordering::SeqCst);
        assert!((3..=6).contains(&n), "expected ~4-5 ticks, got {n}");
    }

    #[tokio::test]
    async fn enqueue_then_drain_fires_sending_complete() {
        let sender = Arc::new(PacedSender::new(Arc::new(|_dur, _bytes: &[u8]| {})));
        let mut rx = sender.subscribe();
        sender.enqueue(vec![1u8; PCMU_FRAME_BYTES]);
        sender.start();
        let evt = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        assert!(matches!(evt, SenderEvent::SendingComplete));
        sender.stop().await;
    }

    #[tokio::test]
    async fn reset_buffer_is_idempotent() {
        let sender = PacedSender::new(Arc::new(|_dur, _bytes: &[u8]| {}));
        sender.reset_buffer();
        sender.reset_buffer();
        assert!(!sender.is_playing());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sender = PacedSender::new(Arc::new(|_dur, _bytes: &[u8]| {}));
        sender.start();
        sender.stop().await;
        sender.stop().await;
    }

    #[tokio::test]
    async fn rejects_wrong_sized_frame() {
        let sender = PacedSender::new(Arc::new(|_dur, _bytes: &[u8]| {}));
        sender.enqueue(vec![0u8; 10]);
        assert!(!sender.is_playing());
    }

    #[test]
    fn clear_filter_removes_installed_filter() {
        let sender = PacedSender::new(Arc::new(|_dur, _bytes: &[u8]| {}));
        sender.apply_filter(Arc::new(|b: &[u8]| b.to_vec()));
        sender.clear_filter();
        assert!(sender.shared.filter.lock().is_none());
    }
}
