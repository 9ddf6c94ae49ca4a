//! ffprobe/ffmpeg wrapper for embedded subtitle streams.
//!
//! Codec handling rules: text codecs can always be extracted (or, for the
//! target language, satisfy the goal without extraction); image codecs go
//! through OCR and only for the allow-listed PGS family. `dvd_subtitle`
//! OCRs too poorly to be worth it and is ignored.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SubwardenError};
use crate::subtitle::matcher::normalize_language_code;

pub const TEXT_SUBTITLE_CODECS: [&str; 9] = [
    "subrip",
    "srt",
    "ssa",
    "ass",
    "vtt",
    "webvtt",
    "mov_text",
    "timed_text",
    "subviewer",
];

pub const IMAGE_SUBTITLE_CODECS_RO: [&str; 4] = ["hdmv_pgs_subtitle", "pgssub", "pgs", "xsub"];
pub const IMAGE_SUBTITLE_CODECS_EN: [&str; 3] = ["hdmv_pgs_subtitle", "pgssub", "pgs"];
pub const IGNORED_OCR_CODECS: [&str; 1] = ["dvd_subtitle"];

pub fn is_text_codec(codec: &str) -> bool {
    TEXT_SUBTITLE_CODECS.contains(&codec)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecKind {
    Text,
    Image,
}

/// One subtitle stream as reported by ffprobe, with the language already
/// normalized to a 2-letter code when possible.
#[derive(Debug, Clone)]
pub struct SubtitleStreamInfo {
    pub index: i64,
    pub codec_name: String,
    pub language: Option<String>,
    pub forced: bool,
}

// ffprobe -print_format json shapes.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: i64,
    codec_name: Option<String>,
    #[serde(default)]
    tags: FfprobeTags,
    #[serde(default)]
    disposition: FfprobeDisposition,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    forced: i64,
}

pub fn parse_ffprobe_streams(raw: &str) -> Result<Vec<SubtitleStreamInfo>> {
    let output: FfprobeOutput = serde_json::from_str(raw)?;
    Ok(output
        .streams
        .into_iter()
        .filter_map(|stream| {
            let codec_name = stream.codec_name?.to_lowercase();
            Some(SubtitleStreamInfo {
                index: stream.index,
                codec_name,
                language: stream
                    .tags
                    .language
                    .as_deref()
                    .and_then(normalize_language_code),
                forced: stream.disposition.forced != 0,
            })
        })
        .collect())
}

/// Pick the best stream for a language: text codecs beat image codecs,
/// non-forced beats forced. Returns the stream and its codec kind; image
/// streams outside `allowed_image_codecs` and ignored-OCR codecs are
/// excluded.
pub fn select_best_stream(
    streams: &[SubtitleStreamInfo],
    language: &str,
    allowed_image_codecs: &[&str],
) -> Option<(SubtitleStreamInfo, CodecKind)> {
    let mut best: Option<(i32, SubtitleStreamInfo, CodecKind)> = None;
    for stream in streams {
        if stream.language.as_deref() != Some(language) {
            continue;
        }
        if IGNORED_OCR_CODECS.contains(&stream.codec_name.as_str()) {
            debug!(
                "Skipping stream #{}: codec {} is excluded from OCR",
                stream.index, stream.codec_name
            );
            continue;
        }
        let kind = if is_text_codec(&stream.codec_name) {
            CodecKind::Text
        } else if allowed_image_codecs.contains(&stream.codec_name.as_str()) {
            CodecKind::Image
        } else {
            continue;
        };
        let mut score = if kind == CodecKind::Text { 10 } else { 0 };
        if !stream.forced {
            score += 2;
        }
        if best.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
            best = Some((score, stream.clone(), kind));
        }
    }
    best.map(|(_, stream, kind)| (stream, kind))
}

pub struct MediaProbe {
    ffprobe_path: String,
    ffmpeg_path: String,
    ocr_tool_path: Option<String>,
}

impl MediaProbe {
    pub fn new(ffprobe_path: String, ffmpeg_path: String, ocr_tool_path: Option<String>) -> Self {
        Self {
            ffprobe_path,
            ffmpeg_path,
            ocr_tool_path,
        }
    }

    /// Enumerate the subtitle streams of a video file.
    pub async fn probe_subtitle_streams(&self, video: &Path) -> Result<Vec<SubtitleStreamInfo>> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                "s",
            ])
            .arg(video)
            .output()
            .await
            .map_err(|e| SubwardenError::Process(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(SubwardenError::Process(format!(
                "ffprobe failed on {}: {}",
                video.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        parse_ffprobe_streams(&String::from_utf8_lossy(&output.stdout))
    }

    /// Extract a text subtitle stream to SRT.
    pub async fn extract_text_stream(
        &self,
        video: &Path,
        stream_index: i64,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let dest = dest_dir.join(format!("embedded_{}.srt", stream_index));
        let output = Command::new(&self.ffmpeg_path)
            .args(["-y", "-v", "quiet", "-i"])
            .arg(video)
            .args(["-map", &format!("0:{}", stream_index), "-c:s", "srt"])
            .arg(&dest)
            .output()
            .await
            .map_err(|e| SubwardenError::Process(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() || !dest.exists() {
            return Err(SubwardenError::Process(format!(
                "ffmpeg subtitle extraction failed for stream {} of {}",
                stream_index,
                video.display()
            )));
        }
        info!(
            "Extracted embedded text stream #{} to {}",
            stream_index,
            dest.display()
        );
        Ok(dest)
    }

    /// Extract an image subtitle stream and OCR it to SRT. Requires the OCR
    /// tool to be configured; the tool receives the extracted .sup and the
    /// target SRT path.
    pub async fn extract_image_stream_with_ocr(
        &self,
        video: &Path,
        stream_index: i64,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let Some(ocr_tool) = &self.ocr_tool_path else {
            return Err(SubwardenError::Process(
                "Image subtitle found but no OCR tool configured".to_string(),
            ));
        };

        let sup = dest_dir.join(format!("embedded_{}.sup", stream_index));
        let output = Command::new(&self.ffmpeg_path)
            .args(["-y", "-v", "quiet", "-i"])
            .arg(video)
            .args(["-map", &format!("0:{}", stream_index), "-c:s", "copy"])
            .arg(&sup)
            .output()
            .await
            .map_err(|e| SubwardenError::Process(format!("Failed to run ffmpeg: {}", e)))?;
        if !output.status.success() || !sup.exists() {
            return Err(SubwardenError::Process(format!(
                "ffmpeg image-subtitle extraction failed for stream {}",
                stream_index
            )));
        }

        let srt = dest_dir.join(format!("embedded_{}.srt", stream_index));
        let output = Command::new(ocr_tool)
            .arg(&sup)
            .arg(&srt)
            .output()
            .await
            .map_err(|e| SubwardenError::Process(format!("Failed to run OCR tool: {}", e)))?;
        if !output.status.success() || !srt.exists() {
            warn!(
                "OCR failed for stream {} of {}: {}",
                stream_index,
                video.display(),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(SubwardenError::Process(format!(
                "OCR conversion failed for stream {}",
                stream_index
            )));
        }
        info!("OCR-extracted embedded image stream #{} to {}", stream_index, srt.display());
        Ok(srt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 2, "codec_name": "subrip", "tags": {"language": "eng"}, "disposition": {"forced": 0}},
            {"index": 3, "codec_name": "subrip", "tags": {"language": "rum"}, "disposition": {"forced": 1}},
            {"index": 4, "codec_name": "hdmv_pgs_subtitle", "tags": {"language": "ron"}, "disposition": {"forced": 0}},
            {"index": 5, "codec_name": "dvd_subtitle", "tags": {"language": "ron"}, "disposition": {"forced": 0}},
            {"index": 6, "codec_name": "subrip", "disposition": {"forced": 0}}
        ]
    }"#;

    #[test]
    fn probe_output_parses_and_normalizes_languages() {
        let streams = parse_ffprobe_streams(PROBE_JSON).unwrap();
        assert_eq!(streams.len(), 5);
        assert_eq!(streams[0].language.as_deref(), Some("en"));
        assert_eq!(streams[1].language.as_deref(), Some("ro"));
        assert!(streams[1].forced);
        assert_eq!(streams[4].language, None);
    }

    #[test]
    fn text_streams_beat_image_streams() {
        let streams = parse_ffprobe_streams(PROBE_JSON).unwrap();
        let (best, kind) = select_best_stream(&streams, "ro", &IMAGE_SUBTITLE_CODECS_RO).unwrap();
        // The forced subrip RO stream still wins over the PGS stream.
        assert_eq!(best.index, 3);
        assert_eq!(kind, CodecKind::Text);
    }

    #[test]
    fn image_streams_are_used_when_no_text_exists() {
        let streams = parse_ffprobe_streams(
            r#"{"streams": [
                {"index": 4, "codec_name": "hdmv_pgs_subtitle", "tags": {"language": "ron"}, "disposition": {"forced": 0}},
                {"index": 5, "codec_name": "dvd_subtitle", "tags": {"language": "ron"}, "disposition": {"forced": 0}}
            ]}"#,
        )
        .unwrap();
        let (best, kind) = select_best_stream(&streams, "ro", &IMAGE_SUBTITLE_CODECS_RO).unwrap();
        assert_eq!(best.index, 4);
        assert_eq!(kind, CodecKind::Image);
    }

    #[test]
    fn disallowed_image_codecs_are_excluded() {
        let streams = parse_ffprobe_streams(
            r#"{"streams": [
                {"index": 4, "codec_name": "xsub", "tags": {"language": "eng"}, "disposition": {"forced": 0}}
            ]}"#,
        )
        .unwrap();
        // xsub is allowed for RO but not for EN.
        assert!(select_best_stream(&streams, "en", &IMAGE_SUBTITLE_CODECS_EN).is_none());
    }

    #[test]
    fn missing_language_streams_never_match() {
        let streams = parse_ffprobe_streams(PROBE_JSON).unwrap();
        assert!(select_best_stream(&streams, "fr", &IMAGE_SUBTITLE_CODECS_RO).is_none());
    }
}
