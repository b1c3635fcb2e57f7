//! Session value types.

mod failure;
mod state;

pub use failure::{FailureKind, SessionFailure};
pub use state::SessionState;
