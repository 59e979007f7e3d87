//! FNE call tracking -- the traffic path between peers.
//!
//! Frames arrive tagged with (peer, stream, seq). Each one is classified,
//! attached to a call session, reassembled if it is part of a multi-block
//! PDU, checked against the routing rules and then forwarded, captured for
//! parrot playback, or dropped with a reason.
//!
//! State is sharded per key: frames for different (peer, stream) keys never
//! wait on each other, frames for one key are applied in order. Nothing is
//! closed explicitly by the network; sessions, reassemblies and parrot
//! captures all age out through [`FneCore::sweep_expired`].

pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod parrot;
pub mod reassembly;
pub mod session;
pub mod sink;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, DropReason, InboundFrame, SweepReport,
};
pub use engine::{ActiveCall, CoreStats, FneCore, ParrotReport};
pub use parrot::{CaptureOutcome, CaptureReject, ParrotFrame, ParrotQueue, ParrotStatus};
pub use reassembly::{CompletedPdu, ReassemblyOutcome, Reassembler, RejectReason};
pub use session::{CallIdentity, CallSession, CallSummary, SessionEvent, SessionTable};
pub use sink::{FrameSink, TransportError};
pub use stats::{DispatchStats, StatsSnapshot};
