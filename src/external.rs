//! Injected collaborators at the process boundary: SIP/RTP transport, a
//! call transfer sink, and a hang-up sink. The core never talks to SIP,
//! STUN, or RTP framing directly; callers hand it closures/trait objects
//! that already speak those protocols.

/// One inbound RTP audio frame as delivered by the SIP/RTP transport layer.
/// Only payload-type 0 (PCMU) frames of exactly 160 bytes are valid; the
/// controller drops anything else at the boundary (spec.md §6).
#[derive(Debug, Clone)]
pub struct InboundRtpFrame {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub bytes: Vec<u8>,
}

impl InboundRtpFrame {
    pub fn is_valid_pcmu(&self) -> bool {
        self.payload_type == 0 && self.bytes.len() == crate::codec::PCMU_FRAME_BYTES
    }
}

/// Outbound audio sink: invoked by the Paced Sender once per 20ms tick
/// with exactly 160 bytes of PCMU payload.
pub trait AudioSink: Send + Sync {
    fn send(&self, duration_rtp_units: u32, bytes: &[u8]);
}

impl<F: Fn(u32, &[u8]) + Send + Sync> AudioSink for F {
    fn send(&self, duration_rtp_units: u32, bytes: &[u8]) {
        self(duration_rtp_units, bytes)
    }
}

/// Transfer sink used by `transfer_conversation`: dials the given SIP
/// address and reports whether the transfer was accepted.
#[async_trait::async_trait]
pub trait TransferSink: Send + Sync {
    async fn transfer(&self, full_address: &str) -> bool;
}

/// Hang-up sink used by `end_conversation`.
pub trait HangupSink: Send + Sync {
    fn hangup(&self);
}

impl<F: Fn() + Send + Sync> HangupSink for F {
    fn hangup(&self) {
        self()
    }
}

/// SMS dispatch sink optionally invoked by `send_notification`. SMS
/// dispatch itself is out of scope (spec.md §1); this crate only defines
/// the seam a caller may wire up.
#[async_trait::async_trait]
pub trait SmsSink: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> bool;
}
