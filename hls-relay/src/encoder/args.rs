//! Encoder argument construction.

use std::path::Path;

use crate::domain::EncodingSettings;

/// Playlist file written into every output directory.
pub const PLAYLIST_FILE: &str = "playlist.m3u8";

/// Segment file pattern handed to the HLS muxer.
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";

/// Audio bitrate for the AAC track.
const AUDIO_BITRATE: &str = "128k";

/// Additional arguments spliced around the generated ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraArgs {
    /// Placed before `-i`.
    pub input: Vec<String>,
    /// Placed after the encoder options, before the playlist path.
    pub output: Vec<String>,
}

/// Build the ffmpeg argument list for relaying `source_url` into an HLS
/// playlist under `output_dir`.
pub fn build_hls_args(
    source_url: &str,
    settings: &EncodingSettings,
    output_dir: &Path,
    extra: &ExtraArgs,
) -> Vec<String> {
    let (width, height) = settings.resolution.dimensions();
    let bitrate = settings.bitrate;
    let bufsize = format!("{}k", bitrate.kbps().saturating_mul(2));
    // One keyframe per segment so every segment starts cleanly.
    let gop = settings
        .frame_rate
        .saturating_mul(settings.segment_duration_secs);

    let mut args: Vec<String> = ["-y", "-hide_banner", "-nostdin", "-loglevel", "warning"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.extend(extra.input.iter().cloned());
    args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
    args.extend(["-i".to_string(), source_url.to_string()]);

    args.extend([
        "-vf".to_string(),
        format!("scale={width}:{height},fps={}", settings.frame_rate),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "fast".to_string(),
        "-crf".to_string(),
        settings.quality.crf().to_string(),
        "-maxrate".to_string(),
        bitrate.to_string(),
        "-bufsize".to_string(),
        bufsize,
        "-g".to_string(),
        gop.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        AUDIO_BITRATE.to_string(),
    ]);

    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        settings.segment_duration_secs.to_string(),
        "-hls_list_size".to_string(),
        settings.playlist_length.to_string(),
        "-hls_flags".to_string(),
        "delete_segments".to_string(),
        "-hls_segment_filename".to_string(),
        output_dir.join(SEGMENT_PATTERN).to_string_lossy().to_string(),
    ]);

    args.extend(extra.output.iter().cloned());
    args.push(output_dir.join(PLAYLIST_FILE).to_string_lossy().to_string());

    args
}
