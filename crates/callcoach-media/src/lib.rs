//! Media plane for the callcoach platform.
//!
//! A fixed pool of routing worker threads carries the per-packet fan-out
//! work so the signaling runtime never touches packet forwarding. Each room
//! gets a [`Router`] bound to the least-loaded worker; transports and tracks
//! are negotiation bookkeeping plus in-process packet channels.
//!
//! Resource ownership lives with the callers (user registry, agent
//! pipeline): the functions in [`ops`] perform exactly one media action over
//! explicit inputs and store nothing themselves.

pub mod config;
pub mod error;
pub mod ops;
pub mod parameters;
pub mod router;
pub mod track;
pub mod transport;
pub mod worker;

pub use config::MediaConfig;
pub use error::MediaError;
pub use ops::ConsumeOutcome;
pub use parameters::{
    ClientTransportParams, ConsumerParams, DtlsParameters, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
};
pub use router::{Router, RouterRegistry};
pub use track::{Consumer, Producer};
pub use transport::{DirectTransport, WebRtcTransport};
pub use worker::{MediaWorkerPool, ResourceUsage, WorkerHandle};
