//! Timing profile -- lifetimes and limits shared by every FNE component.
//!
//! The air interfaces have no reliable end-of-call acknowledgment, so all
//! per-stream state is bounded by these timeouts rather than by close
//! signals. Config values override the profile at startup; the profile is
//! the fallback and the source of test expectations.

/// A named set of timing and capacity parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    /// Profile identifier.
    pub id: u16,

    // -- Call tracking --
    /// Milliseconds of silence before a call session is swept.
    pub session_idle_ms: u64,
    /// Milliseconds before an incomplete PDU is discarded.
    pub pdu_max_age_ms: u64,
    /// Milliseconds between sweep passes.
    pub sweep_interval_ms: u64,
    /// Superseded stream ids remembered per session key.
    pub retired_stream_memory: usize,

    // -- Parrot --
    /// Milliseconds to wait after the end marker before replay starts.
    pub parrot_playback_delay_ms: u64,
    /// Milliseconds between replayed frames.
    pub parrot_frame_interval_ms: u64,
    /// Longest test transmission accepted, in frames.
    pub parrot_max_frames: usize,

    // -- Transport --
    /// Largest datagram accepted from a peer.
    pub max_datagram_bytes: usize,
    /// Outbound frames buffered ahead of the UDP socket.
    pub send_queue_depth: usize,
}

/// Default profile.
///
/// Session idle is a few superframes longer than the longest gap a healthy
/// DMR/P25 call produces. PDU age allows for slow confirmed delivery.
pub const DEFAULT_TIMING: TimingProfile = TimingProfile {
    id: 0,

    // Call tracking
    session_idle_ms: 5_000,
    pdu_max_age_ms: 10_000,
    sweep_interval_ms: 1_000,
    retired_stream_memory: 4,

    // Parrot: ~2 minutes of DMR voice at 60ms per burst
    parrot_playback_delay_ms: 2_000,
    parrot_frame_interval_ms: 60,
    parrot_max_frames: 2_048,

    // Transport
    max_datagram_bytes: 1_500,
    send_queue_depth: 1_024,
};

/// The active profile.
pub const CURRENT_TIMING: &TimingProfile = &DEFAULT_TIMING;
