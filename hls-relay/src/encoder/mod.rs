//! Encoder process adapter.
//!
//! Builds encoder invocations from validated settings, launches one OS
//! process per session and supervises it through [`EncoderProcess`].

pub mod args;
pub mod ffmpeg;
pub mod process;
pub mod stderr;
pub mod traits;

pub use args::{ExtraArgs, PLAYLIST_FILE, SEGMENT_PATTERN, build_hls_args};
pub use ffmpeg::{FfmpegLauncher, FfmpegLauncherConfig};
pub use process::{EncoderExit, EncoderProcess, ProcessOptions};
pub use stderr::StderrTail;
pub use traits::EncoderLauncher;
