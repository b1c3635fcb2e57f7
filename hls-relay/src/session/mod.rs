//! Session supervision.
//!
//! A [`SessionMachine`] drives one stream's encoder through its lifecycle.
//! The [`SessionRegistry`] owns all machines, enforces the global session
//! budget and runs the periodic liveness sweep.

pub mod events;
pub mod machine;
pub mod registry;
pub mod status;

pub use events::SessionEvent;
pub use machine::SessionMachine;
pub use registry::{RegistryConfig, SessionRegistry, SweepReport};
pub use status::SessionStatus;
