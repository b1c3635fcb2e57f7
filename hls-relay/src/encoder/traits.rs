//! Encoder launcher trait.

use std::path::Path;

use async_trait::async_trait;

use super::process::EncoderProcess;
use crate::Result;
use crate::domain::EncodingSettings;

/// Launches one encoder process per call.
///
/// The session state machine only talks to encoders through this trait,
/// so alternative encoders (or test doubles) can be swapped in.
#[async_trait]
pub trait EncoderLauncher: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start relaying `source_url` into an HLS playlist under `output_dir`.
    async fn launch(
        &self,
        stream_id: &str,
        source_url: &str,
        settings: &EncodingSettings,
        output_dir: &Path,
    ) -> Result<EncoderProcess>;

    /// Whether the encoder executable was found.
    fn is_available(&self) -> bool {
        true
    }

    /// Encoder version string, if known.
    fn version(&self) -> Option<String> {
        None
    }
}
