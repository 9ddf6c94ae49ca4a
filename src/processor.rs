//! Folder processor: the body of the external worker script. Walks the
//! submitted folder, identifies video files, and runs the selection
//! pipeline once per video. Everything it logs flows through the
//! supervisor's pipes into the log bus.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::Result;
use crate::pipeline::{PipelineOptions, ProcessingContext, SubtitlePipeline};
use crate::services::media_identity::parse_media_identity;
use crate::services::ServiceContainer;

const VIDEO_EXTENSIONS: [&str; 12] = [
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "ts", "m2ts",
];
const SKIP_PATTERNS: [&str; 2] = ["SAMPLE", "TRAILER"];

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSummary {
    pub videos: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Recursively find processable video files, skipping samples and trailers.
pub fn find_video_files(folder: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
                return false;
            };
            if !VIDEO_EXTENSIONS.contains(&extension.to_lowercase().as_str()) {
                return false;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_uppercase();
            !SKIP_PATTERNS.iter().any(|pattern| name.contains(pattern))
        })
        .collect();
    videos.sort();
    videos
}

/// Run the pipeline over every video file in the folder. Each video gets a
/// fresh service container; the pipeline shuts it down on exit.
pub async fn process_folder(
    config: &Config,
    folder: &Path,
    language: &str,
    options: PipelineOptions,
) -> Result<ProcessSummary> {
    let videos = find_video_files(folder);
    let mut summary = ProcessSummary {
        videos: videos.len(),
        ..Default::default()
    };
    if videos.is_empty() {
        warn!("No video files found in {}", folder.display());
        println!("No video files found in {}", folder.display());
        return Ok(summary);
    }
    info!("Found {} video file(s) in {}", videos.len(), folder.display());

    for video in videos {
        let services = ServiceContainer::from_config(config);
        let mut identity = parse_media_identity(&video);
        // IMDb resolution only matters when an online provider can use it.
        if services.opensubtitles.is_some() || services.subsro.is_some() {
            services.identity.resolve(&mut identity).await;
        }

        let mut context = ProcessingContext::new(
            video.clone(),
            identity,
            language.to_string(),
            options.clone(),
            services,
        );
        let success = SubtitlePipeline::standard().run(&mut context).await;
        let video_name = context.video_basename();
        if success {
            summary.succeeded += 1;
            println!("OK: {}", video_name);
        } else {
            summary.failed += 1;
            println!("FAILED: {}", video_name);
        }
    }

    println!(
        "Processed {} video(s): {} ok, {} failed",
        summary.videos, summary.succeeded, summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_discovery_filters_extensions_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("season1")).unwrap();
        std::fs::write(dir.path().join("Movie.mkv"), "x").unwrap();
        std::fs::write(dir.path().join("season1/Episode.S01E01.mp4"), "x").unwrap();
        std::fs::write(dir.path().join("Movie.sample.mkv"), "x").unwrap();
        std::fs::write(dir.path().join("Trailer.mp4"), "x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let videos = find_video_files(dir.path());
        let names: Vec<String> = videos
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Movie.mkv".to_string(), "Episode.S01E01.mp4".to_string()]);
    }

    #[tokio::test]
    async fn folder_with_ready_subtitles_processes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Movie.2021.mkv"), "fake").unwrap();
        std::fs::write(
            dir.path().join("Movie.2021.ro.srt"),
            "1\n00:00:01,000 --> 00:00:02,000\nSalut\n",
        )
        .unwrap();

        let mut config = crate::config::Config::load().unwrap();
        config.providers.opensubtitles_api_key = None;
        config.providers.subsro_base_url = None;
        config.providers.deepl_api_keys = Vec::new();
        config.tools.ffprobe_path = "/nonexistent/ffprobe".to_string();
        config.tools.ffsubsync_path = "/nonexistent/ffsubsync".to_string();
        config.tools.alass_cli_path = "/nonexistent/alass-cli".to_string();

        let summary = process_folder(&config, dir.path(), "ro", PipelineOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.videos, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn empty_folder_reports_zero_videos() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::load().unwrap();
        let summary = process_folder(&config, dir.path(), "ro", PipelineOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.videos, 0);
    }
}
