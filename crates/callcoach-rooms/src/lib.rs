//! Room and user lifecycle for two-party calls.
//!
//! A [`Room`] is the resource container for one call: a dedicated router,
//! a capacity-gated participant set, and the coaching prompt the call runs
//! with. The [`RoomRegistry`] owns room lifecycle (idempotent creation,
//! join/rejoin, teardown when the last participant leaves); the
//! [`UserRegistry`] tracks identities independent of their socket binding
//! and owns per-user media resources.

pub mod error;
pub mod registry;
pub mod room;
pub mod user;

pub use error::RoomError;
pub use registry::RoomRegistry;
pub use room::{JoinOutcome, Room};
pub use user::{User, UserEvent, UserRegistry};
