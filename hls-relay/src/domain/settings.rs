//! Encoding settings.
//!
//! [`StreamSettings`] is the loose shape stored on stream records.
//! [`EncodingSettings`] is the validated form the encoder adapter consumes;
//! it can only be obtained through [`EncodingSettings::resolve`] or by
//! passing [`EncodingSettings::validate`].

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_PLAYLIST_LENGTH, DEFAULT_SEGMENT_DURATION_SECS, RelayConfig};
use crate::{Error, Result};

/// Highest accepted output frame rate.
pub const MAX_FRAME_RATE: u32 = 120;

/// Default output frame rate.
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Output resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "480p")]
    P480,
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl ResolutionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "480p" => Some(Self::P480),
            "720p" => Some(Self::P720),
            "1080p" => Some(Self::P1080),
            _ => None,
        }
    }

    /// Output frame size as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::P480 => (854, 480),
            Self::P720 => (1280, 720),
            Self::P1080 => (1920, 1080),
        }
    }
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality preset, mapped to an x264 constant rate factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn crf(&self) -> u8 {
        match self {
            Self::Low => 28,
            Self::Medium => 23,
            Self::High => 18,
        }
    }

    /// Bitrate used when the record does not name one.
    pub fn default_bitrate(&self) -> Bitrate {
        match self {
            Self::Low => Bitrate::from_kbps(500),
            Self::Medium => Bitrate::from_kbps(1000),
            Self::High => Bitrate::from_kbps(2000),
        }
    }
}

/// Video bitrate in kbit/s, written as `"1000k"` / `"2M"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bitrate {
    kbps: u32,
}

impl Bitrate {
    pub fn from_kbps(kbps: u32) -> Self {
        Self { kbps }
    }

    pub fn kbps(&self) -> u32 {
        self.kbps
    }

    /// Parse `"<digits>[k|K|m|M]"`; a bare number is taken as kbit/s.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (digits, multiplier) = match s.char_indices().last() {
            Some((idx, 'k' | 'K')) => (&s[..idx], 1),
            Some((idx, 'm' | 'M')) => (&s[..idx], 1000),
            Some(_) => (s, 1),
            None => return Err(Error::validation("bitrate must not be empty")),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::validation(format!(
                "bitrate {s:?} must look like \"1000k\" or \"2M\""
            )));
        }

        let value: u32 = digits
            .parse()
            .map_err(|_| Error::validation(format!("bitrate {s:?} is out of range")))?;
        let kbps = value
            .checked_mul(multiplier)
            .ok_or_else(|| Error::validation(format!("bitrate {s:?} is out of range")))?;
        if kbps == 0 {
            return Err(Error::validation("bitrate must be greater than zero"));
        }

        Ok(Self { kbps })
    }
}

impl std::fmt::Display for Bitrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}k", self.kbps)
    }
}

impl TryFrom<String> for Bitrate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Bitrate> for String {
    fn from(value: Bitrate) -> Self {
        value.to_string()
    }
}

/// Settings as stored on a stream record. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub quality: Quality,
    pub resolution: ResolutionTier,
    pub fps: Option<u32>,
    pub bitrate: Option<String>,
    pub segment_duration_secs: Option<u32>,
    pub playlist_length: Option<u32>,
}

/// Playlist shape defaults applied when a record does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HlsDefaults {
    pub segment_duration_secs: u32,
    pub playlist_length: u32,
}

impl Default for HlsDefaults {
    fn default() -> Self {
        Self {
            segment_duration_secs: DEFAULT_SEGMENT_DURATION_SECS,
            playlist_length: DEFAULT_PLAYLIST_LENGTH,
        }
    }
}

impl From<&RelayConfig> for HlsDefaults {
    fn from(config: &RelayConfig) -> Self {
        Self {
            segment_duration_secs: config.segment_duration_secs,
            playlist_length: config.playlist_length,
        }
    }
}

/// Validated encoder settings for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingSettings {
    pub resolution: ResolutionTier,
    pub frame_rate: u32,
    pub bitrate: Bitrate,
    pub quality: Quality,
    pub segment_duration_secs: u32,
    pub playlist_length: u32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        let defaults = HlsDefaults::default();
        Self {
            resolution: ResolutionTier::default(),
            frame_rate: DEFAULT_FRAME_RATE,
            bitrate: Quality::default().default_bitrate(),
            quality: Quality::default(),
            segment_duration_secs: defaults.segment_duration_secs,
            playlist_length: defaults.playlist_length,
        }
    }
}

impl EncodingSettings {
    /// Merge record settings with defaults and validate the result.
    pub fn resolve(settings: &StreamSettings, defaults: HlsDefaults) -> Result<Self> {
        let bitrate = match settings.bitrate.as_deref() {
            Some(raw) => Bitrate::parse(raw)?,
            None => settings.quality.default_bitrate(),
        };

        let resolved = Self {
            resolution: settings.resolution,
            frame_rate: settings.fps.unwrap_or(DEFAULT_FRAME_RATE),
            bitrate,
            quality: settings.quality,
            segment_duration_secs: settings
                .segment_duration_secs
                .unwrap_or(defaults.segment_duration_secs),
            playlist_length: settings.playlist_length.unwrap_or(defaults.playlist_length),
        };
        resolved.validate()?;
        Ok(resolved)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(Error::validation(format!(
                "frame rate must be between 1 and {MAX_FRAME_RATE}, got {}",
                self.frame_rate
            )));
        }
        if self.bitrate.kbps() == 0 {
            return Err(Error::validation("bitrate must be greater than zero"));
        }
        if self.segment_duration_secs == 0 {
            return Err(Error::validation("segment duration must be at least 1 second"));
        }
        if self.playlist_length == 0 {
            return Err(Error::validation("playlist window must hold at least 1 segment"));
        }
        Ok(())
    }
}
