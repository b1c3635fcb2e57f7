//! Domain types: stream sources, encoding settings and session state.

pub mod session;
pub mod settings;
pub mod source;

pub use session::{FailureKind, SessionFailure, SessionState};
pub use settings::{Bitrate, EncodingSettings, HlsDefaults, Quality, ResolutionTier, StreamSettings};
pub use source::StreamSource;
