//! Stream sources.

use serde::{Deserialize, Serialize};
use url::Url;

use super::settings::StreamSettings;
use crate::{Error, Result};

/// URL schemes accepted as relay inputs.
const ACCEPTED_SCHEMES: &[&str] = &["rtsp", "rtsps"];

/// A network video source the relay can convert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub id: String,
    pub source_url: String,
    #[serde(default)]
    pub settings: StreamSettings,
}

impl StreamSource {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            settings: StreamSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Check the id and source URL before anything is launched.
    pub fn validate(&self) -> Result<()> {
        validate_stream_id(&self.id)?;
        validate_source_url(&self.source_url)?;
        Ok(())
    }
}

/// Stream ids name output directories, so they must be a single path segment.
pub fn validate_stream_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::validation("stream id must not be empty"));
    }
    if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(Error::validation(format!(
            "stream id {id:?} is not a valid path segment"
        )));
    }
    Ok(())
}

/// Accept `rtsp://` / `rtsps://` URLs that name a host.
pub fn validate_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::validation(format!("invalid source URL {raw:?}: {e}")))?;

    if !ACCEPTED_SCHEMES.contains(&url.scheme()) {
        return Err(Error::validation(format!(
            "source URL must start with 'rtsp://', got scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::validation(format!("source URL {raw:?} has no host")));
    }

    Ok(url)
}
