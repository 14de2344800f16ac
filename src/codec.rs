//! μ-law ↔ 16-bit PCM codec, linear resampling, and silence generation.
//!
//! The pipeline speaks two audio shapes: 8 kHz μ-law (PCMU) on the
//! telephony side, and 16-bit PCM at 16 kHz internally for VAD/STT and at
//! 22050 Hz for freshly synthesized TTS output. Everything here is a free
//! function over byte/sample slices; none of it owns state.

/// Bytes in one 20 ms outbound μ-law frame at 8 kHz.
pub const PCMU_FRAME_BYTES: usize = 160;
/// Bytes in one 20 ms 16-bit PCM frame at 16 kHz.
pub const PCM16_16K_FRAME_BYTES: usize = 640;
/// μ-law encoding of silence (max positive value, biased).
pub const MULAW_SILENCE_BYTE: u8 = 0x7F;

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Encode one 16-bit linear PCM sample to μ-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80u8 } else { 0x00u8 };
    let mut magnitude = if sample < 0 {
        sample.saturating_neg()
    } else {
        sample
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    let mut exponent: u8 = 7;
    for exp in 0..8u8 {
        if magnitude <= (0x1F << (exp + 1)) || exp == 7 {
            exponent = exp;
            break;
        }
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    let byte = sign | (exponent << 4) | mantissa;
    !byte
}

/// Decode one μ-law byte to 16-bit linear PCM.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let mut magnitude = ((mantissa as i16) << 3) + MULAW_BIAS;
    magnitude <<= exponent;
    magnitude -= MULAW_BIAS;
    if sign != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode a buffer of little-endian 16-bit PCM samples to μ-law bytes.
/// An odd trailing byte is dropped (with the caller expected to warn).
pub fn encode_mulaw(pcm: &[u8]) -> Vec<u8> {
    let usable = pcm.len() - (pcm.len() % 2);
    let mut out = Vec::with_capacity(usable / 2);
    for chunk in pcm[..usable].chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        out.push(linear_to_mulaw(sample));
    }
    out
}

/// Decode μ-law bytes to little-endian 16-bit PCM.
pub fn decode_mulaw(mulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(mulaw.len() * 2);
    for &byte in mulaw {
        let sample = mulaw_to_linear(byte);
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Produce `len` bytes of μ-law silence.
pub fn mulaw_silence(len: usize) -> Vec<u8> {
    vec![MULAW_SILENCE_BYTE; len]
}

/// Attenuate a μ-law frame by `gain` (0.0-1.0), used by the controller's
/// "duck the bot" volume filter installed on barge-in (spec.md §4.7.2).
pub fn attenuate_mulaw_frame(frame: &[u8], gain: f32) -> Vec<u8> {
    frame
        .iter()
        .map(|&b| {
            let sample = mulaw_to_linear(b) as f32 * gain;
            linear_to_mulaw(sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        })
        .collect()
}

/// Linear resample little-endian 16-bit PCM from `from_hz` to `to_hz`.
/// Uses simple linear interpolation; adequate for narrowband speech.
pub fn resample_pcm16(pcm: &[u8], from_hz: u32, to_hz: u32) -> Vec<u8> {
    if from_hz == to_hz || pcm.len() < 2 {
        return pcm.to_vec();
    }
    let usable = pcm.len() - (pcm.len() % 2);
    let samples: Vec<i16> = pcm[..usable]
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    if samples.is_empty() {
        return Vec::new();
    }
    let ratio = from_hz as f64 / to_hz as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(out_len * 2);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        let interpolated = a + (b - a) * frac;
        out.extend_from_slice(&(interpolated.round() as i16).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_within_quantization_bound() {
        for sample in [-32000i16, -1000, -1, 0, 1, 1000, 32000] {
            let encoded = linear_to_mulaw(sample);
            let decoded = mulaw_to_linear(encoded);
            let delta = (sample as i32 - decoded as i32).abs();
            assert!(delta <= 4096, "sample {sample} decoded to {decoded}");
        }
    }

    #[test]
    fn encode_drops_odd_trailing_byte() {
        let pcm = vec![0u8, 0u8, 1u8];
        let out = encode_mulaw(&pcm);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn silence_frame_is_constant_0x7f() {
        let frame = mulaw_silence(PCMU_FRAME_BYTES);
        assert_eq!(frame.len(), PCMU_FRAME_BYTES);
        assert!(frame.iter().all(|&b| b == MULAW_SILENCE_BYTE));
    }

    #[test]
    fn resample_preserves_duration_ratio() {
        let samples_16k: Vec<u8> = (0..640)
            .flat_map(|i| ((i as i16) * 10).to_le_bytes())
            .collect();
        let resampled = resample_pcm16(&samples_16k, 16000, 8000);
        assert_eq!(resampled.len() / 2, 160);
    }

    #[test]
    fn attenuate_reduces_magnitude() {
        let loud = linear_to_mulaw(20000);
        let quiet = attenuate_mulaw_frame(&[loud], 0.35)[0];
        assert!(mulaw_to_linear(quiet).unsigned_abs() < mulaw_to_linear(loud).unsigned_abs());
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let pcm = vec![1u8, 2u8, 3u8, 4u8];
        assert_eq!(resample_pcm16(&pcm, 16000, 16000), pcm);
    }
}
