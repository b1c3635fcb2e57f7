//! Supervised RTSP to HLS relay sessions.
//!
//! One ffmpeg process per stream turns an RTSP source into a rolling HLS
//! playlist on disk. The [`SessionRegistry`] enforces one session per
//! stream and a global session budget, and a periodic sweep notices
//! encoders that die while running.

pub mod config;
pub mod domain;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod output;
pub mod service;
pub mod session;
pub mod store;
pub mod utils;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use service::{StreamService, StreamSnapshot};
pub use session::{SessionRegistry, SessionStatus};
