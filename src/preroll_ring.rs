//! Rolling buffer of the most recently pushed raw frame bytes, used both
//! to seed an utterance with pre-trigger audio and to build the VAD's
//! fixed-size inference window from however much history is available.

use std::collections::VecDeque;

pub struct PrerollRing {
    capacity_bytes: usize,
    buf: VecDeque<u8>,
}

impl PrerollRing {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            buf: VecDeque::with_capacity(capacity_bytes),
        }
    }

    /// Push new bytes, discarding the oldest bytes beyond capacity.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes.iter().copied());
        while self.buf.len() > self.capacity_bytes {
            self.buf.pop_front();
        }
    }

    /// Everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// Build a fixed-size `window_bytes` window from the tail of the
    /// buffer, zero-padding the head when there isn't enough history.
    pub fn tail_window(&self, window_bytes: usize) -> Vec<u8> {
        let available: Vec<u8> = self.buf.iter().rev().take(window_bytes).copied().collect();
        let mut window = vec![0u8; window_bytes - available.len()];
        window.extend(available.into_iter().rev());
        window
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pads_head_when_insufficient_history() {
        let mut ring = PrerollRing::new(1024);
        ring.push(&[1, 2, 3]);
        let window = ring.tail_window(8);
        assert_eq!(window, vec![0, 0, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn tail_window_takes_most_recent_bytes() {
        let mut ring = PrerollRing::new(1024);
        ring.push(&[1, 2, 3, 4, 5, 6]);
        let window = ring.tail_window(4);
        assert_eq!(window, vec![3, 4, 5, 6]);
    }

    #[test]
    fn discards_beyond_capacity() {
        let mut ring = PrerollRing::new(4);
        ring.push(&[1, 2, 3, 4]);
        ring.push(&[5, 6]);
        assert_eq!(ring.snapshot(), vec![3, 4, 5, 6]);
    }
}
