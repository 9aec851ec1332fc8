//! Argument builders for the encoder suite.
//!
//! A conversion is planned as an ordered list of [`EncodeStep`]s. The first
//! step whose tool the router can serve is used; later steps are alternates
//! for inputs the preferred encoder cannot read.

use crate::media::{MediaType, TargetFormat};
use crate::routing::{EncodeStrategy, RoutingDecision};
use crate::tools::{canonical_format, ToolKind};
use std::path::Path;

/// AVIF quality for balanced still images (avifenc 0-100 scale).
const AVIF_BALANCED_QUALITY: u8 = 75;
/// AVIF quality for sticker output.
const AVIF_COMPRESSED_QUALITY: u8 = 55;
/// libaom CRF for balanced animated AVIF.
const AV1_BALANCED_CRF: u8 = 30;
/// libaom CRF for sticker output.
const AV1_COMPRESSED_CRF: u8 = 40;

/// One way to run a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeStep {
    pub tool: ToolKind,
    /// Canonical input format, for version routing.
    pub input_format: String,
    /// Canonical output format, for version routing.
    pub output_format: String,
    pub args: Vec<String>,
}

impl EncodeStep {
    fn new(tool: ToolKind, input: &str, output: TargetFormat, args: Vec<String>) -> Self {
        Self {
            tool,
            input_format: canonical_format(input).to_string(),
            output_format: output.as_str().to_string(),
            args,
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn ffmpeg_prelude(input: &Path) -> Vec<String> {
    ["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(path_arg(input)))
        .collect()
}

fn cjxl_args(input: &Path, output: &Path) -> Vec<String> {
    // distance 0 is lossless; JPEG input is recompressed bit-exactly
    vec![
        path_arg(input),
        path_arg(output),
        "-d".into(),
        "0".into(),
        "-e".into(),
        "7".into(),
    ]
}

fn avifenc_args(input: &Path, output: &Path, quality: u8) -> Vec<String> {
    vec![
        "-q".into(),
        quality.to_string(),
        "-s".into(),
        "6".into(),
        "-j".into(),
        "all".into(),
        path_arg(input),
        path_arg(output),
    ]
}

fn ffmpeg_jxl_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = ffmpeg_prelude(input);
    args.extend(["-c:v", "libjxl", "-distance", "0", "-effort", "7"].map(String::from));
    args.push(path_arg(output));
    args
}

fn ffmpeg_avif_args(
    input: &Path,
    output: &Path,
    strategy: EncodeStrategy,
    animated: bool,
) -> Vec<String> {
    let mut args = ffmpeg_prelude(input);
    args.extend(["-c:v", "libaom-av1", "-cpu-used", "6", "-row-mt", "1"].map(String::from));
    match strategy {
        EncodeStrategy::Lossless => {
            args.extend(["-crf", "0", "-b:v", "0", "-pix_fmt", "yuv444p"].map(String::from));
        }
        EncodeStrategy::Compressed => {
            args.extend(["-crf".to_string(), AV1_COMPRESSED_CRF.to_string()]);
            args.extend(["-b:v", "0", "-pix_fmt", "yuv420p"].map(String::from));
        }
        _ => {
            args.extend(["-crf".to_string(), AV1_BALANCED_CRF.to_string()]);
            args.extend(["-b:v", "0", "-pix_fmt", "yuv420p"].map(String::from));
        }
    }
    if !animated {
        args.extend(["-still-picture", "1", "-frames:v", "1"].map(String::from));
    }
    args.extend(["-f", "avif"].map(String::from));
    args.push(path_arg(output));
    args
}

fn ffmpeg_remux_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = ffmpeg_prelude(input);
    args.extend(
        [
            "-map",
            "0",
            "-c",
            "copy",
            "-map_metadata",
            "0",
            "-movflags",
            "+faststart",
        ]
        .map(String::from),
    );
    args.push(path_arg(output));
    args
}

/// Ordered encode plans for converting `input` per `decision`, writing to `output`.
///
/// Empty for skip decisions.
pub fn plan_encode(
    input: &Path,
    input_ext: &str,
    media_type: MediaType,
    decision: &RoutingDecision,
    output: &Path,
) -> Vec<EncodeStep> {
    let format = decision.target_format;
    let animated = media_type == MediaType::Animated;
    match (format, decision.strategy) {
        (TargetFormat::Skip, _) | (_, EncodeStrategy::Skip) => Vec::new(),
        (TargetFormat::Jxl, _) => vec![
            EncodeStep::new(ToolKind::Jxl, input_ext, format, cjxl_args(input, output)),
            EncodeStep::new(ToolKind::Ffmpeg, input_ext, format, ffmpeg_jxl_args(input, output)),
        ],
        (TargetFormat::Avif, strategy) if animated || strategy == EncodeStrategy::Lossless => {
            vec![EncodeStep::new(
                ToolKind::Ffmpeg,
                input_ext,
                format,
                ffmpeg_avif_args(input, output, strategy, animated),
            )]
        }
        (TargetFormat::Avif, strategy) => {
            let quality = if strategy == EncodeStrategy::Compressed {
                AVIF_COMPRESSED_QUALITY
            } else {
                AVIF_BALANCED_QUALITY
            };
            vec![
                EncodeStep::new(ToolKind::Avif, input_ext, format, avifenc_args(input, output, quality)),
                EncodeStep::new(
                    ToolKind::Ffmpeg,
                    input_ext,
                    format,
                    ffmpeg_avif_args(input, output, strategy, false),
                ),
            ]
        }
        (TargetFormat::Mov, _) => vec![EncodeStep::new(
            ToolKind::Ffmpeg,
            input_ext,
            format,
            ffmpeg_remux_args(input, output),
        )],
    }
}

/// Arguments for copying every tag from `source` onto `destination`.
pub fn metadata_copy_args(source: &Path, destination: &Path) -> Vec<String> {
    vec![
        "-q".into(),
        "-overwrite_original".into(),
        "-TagsFromFile".into(),
        path_arg(source),
        "-all:all".into(),
        path_arg(destination),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::QualityTier;
    use crate::routing::decide;
    use crate::config::AppMode;

    fn plan(mode: AppMode, media: MediaType, tier: QualityTier, ext: &str) -> Vec<EncodeStep> {
        let decision = decide(mode, media, tier);
        let input = format!("/m/in.{}", ext);
        plan_encode(Path::new(&input), ext, media, &decision, Path::new("/m/.out"))
    }

    #[test]
    fn test_lossless_jxl_prefers_cjxl() {
        let steps = plan(AppMode::Quality, MediaType::Image, QualityTier::High, "jpg");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].tool, ToolKind::Jxl);
        assert_eq!(steps[0].input_format, "jpeg");
        assert_eq!(steps[0].output_format, "jxl");
        assert_eq!(steps[0].args[..2], ["/m/in.jpg".to_string(), "/m/.out".to_string()]);
        assert!(steps[0].args.windows(2).any(|w| w == ["-d", "0"]));
        assert_eq!(steps[1].tool, ToolKind::Ffmpeg);
    }

    #[test]
    fn test_still_avif_falls_back_to_ffmpeg() {
        let steps = plan(AppMode::AutoPlus, MediaType::Image, QualityTier::Low, "webp");
        assert_eq!(
            steps.iter().map(|s| s.tool).collect::<Vec<_>>(),
            vec![ToolKind::Avif, ToolKind::Ffmpeg]
        );
        assert!(steps[1].args.contains(&"-still-picture".to_string()));
    }

    #[test]
    fn test_animated_avif_uses_ffmpeg_only() {
        let steps = plan(AppMode::Sticker, MediaType::Animated, QualityTier::Low, "gif");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tool, ToolKind::Ffmpeg);
        assert!(steps[0].args.windows(2).any(|w| w == ["-crf", "40"]));
        assert!(!steps[0].args.contains(&"-still-picture".to_string()));

        let steps = plan(AppMode::Quality, MediaType::Animated, QualityTier::High, "gif");
        assert!(steps[0].args.windows(2).any(|w| w == ["-crf", "0"]));
    }

    #[test]
    fn test_remux_copies_streams() {
        let steps = plan(AppMode::AutoPlus, MediaType::Video, QualityTier::High, "mp4");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].output_format, "mov");
        assert!(steps[0].args.windows(2).any(|w| w == ["-c", "copy"]));
    }

    #[test]
    fn test_skip_has_no_plan() {
        assert!(plan(AppMode::Sticker, MediaType::Video, QualityTier::High, "mp4").is_empty());
        assert!(plan(AppMode::AutoPlus, MediaType::Image, QualityTier::Corrupted, "png").is_empty());
    }

    #[test]
    fn test_metadata_copy_args() {
        let args = metadata_copy_args(Path::new("/m/a.png"), Path::new("/m/a.jxl"));
        assert_eq!(args.last().map(String::as_str), Some("/m/a.jxl"));
        assert!(args.contains(&"-TagsFromFile".to_string()));
    }
}
