//! Staged subtitle selection pipeline.
//!
//! Strategies execute in fixed order against a mutable context. Finding a
//! final target-language subtitle short-circuits the remaining scanners;
//! translation and synchronization still run. Non-critical strategy
//! failures are logged and the chain continues; a critical failure aborts.
//! Temp-dir cleanup and service shutdown happen on every exit path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::services::media_probe::{CodecKind, SubtitleStreamInfo};
use crate::services::media_identity::MediaIdentity;
use crate::services::ServiceContainer;

mod embed_scanner;
mod final_selector;
mod local_scanner;
mod online_fetcher;
mod standard_checker;
mod synchronizer;
mod translator;

pub use embed_scanner::EmbedScanner;
pub use final_selector::FinalSelector;
pub use local_scanner::LocalScanner;
pub use online_fetcher::OnlineFetcher;
pub use standard_checker::StandardFileChecker;
pub use synchronizer::Synchronizer;
pub use translator::Translator;

/// What a strategy reported back to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// The strategy did its work (even if it found nothing).
    Completed,
    /// Preconditions not met; nothing attempted.
    Skipped(String),
    /// The strategy could not do its work.
    Failed(String),
}

/// The finalized target-language subtitle: either a file on disk or an
/// embedded text stream that needs no extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalSubtitle {
    File(PathBuf),
    EmbeddedText,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub skip_translation: bool,
    pub skip_sync: bool,
}

/// Mutable state threaded through the strategy chain for one video file.
pub struct ProcessingContext {
    pub video_path: PathBuf,
    pub identity: MediaIdentity,
    /// Primary target language (2-letter); `fallback_language` drives the
    /// candidate chain when the primary cannot be found.
    pub target_language: String,
    pub fallback_language: String,
    pub options: PipelineOptions,
    pub services: ServiceContainer,

    // Standard-convention paths, set by the standard file checker.
    pub target_ro_path: Option<PathBuf>,
    pub target_en_path: Option<PathBuf>,

    pub found_final_ro: bool,
    pub final_ro_sub: Option<FinalSubtitle>,
    pub final_en_sub_path: Option<PathBuf>,

    // Candidate slots, one per scanner family.
    pub candidate_en_path_standard: Option<PathBuf>,
    pub candidate_en_path_online: Option<PathBuf>,
    pub potential_embedded_en: Option<(SubtitleStreamInfo, CodecKind)>,

    temp_dirs: Vec<tempfile::TempDir>,
    pub errors: Vec<String>,
}

impl ProcessingContext {
    pub fn new(
        video_path: PathBuf,
        identity: MediaIdentity,
        target_language: String,
        options: PipelineOptions,
        services: ServiceContainer,
    ) -> Self {
        Self {
            video_path,
            identity,
            target_language,
            fallback_language: "en".to_string(),
            options,
            services,
            target_ro_path: None,
            target_en_path: None,
            found_final_ro: false,
            final_ro_sub: None,
            final_en_sub_path: None,
            candidate_en_path_standard: None,
            candidate_en_path_online: None,
            potential_embedded_en: None,
            temp_dirs: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn video_basename(&self) -> String {
        self.video_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Standard subtitle path for a language: `<video stem>.<lang>.srt`
    /// next to the video.
    pub fn standard_subtitle_path(&self, language: &str) -> PathBuf {
        let stem = self
            .video_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("video");
        self.video_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{}.{}.srt", stem, language))
    }

    pub fn mark_final_ro(&mut self, subtitle: FinalSubtitle) {
        self.found_final_ro = true;
        self.final_ro_sub = Some(subtitle);
    }

    pub fn add_error(&mut self, strategy: &str, message: &str) {
        let entry = format!("[{}] {}", strategy, message);
        error!("{}", entry);
        self.errors.push(entry);
    }

    /// Register a temp dir for pipeline-owned cleanup on any exit path.
    pub fn add_temp_dir(&mut self, dir: tempfile::TempDir) -> PathBuf {
        let path = dir.path().to_path_buf();
        debug!("Registered temp directory for cleanup: {}", path.display());
        self.temp_dirs.push(dir);
        path
    }

    fn cleanup_temp_dirs(&mut self) {
        if self.temp_dirs.is_empty() {
            return;
        }
        info!("Cleaning up {} temporary directories...", self.temp_dirs.len());
        for dir in self.temp_dirs.drain(..) {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove temp directory {}: {}", path.display(), e);
            }
        }
    }
}

#[async_trait]
pub trait ProcessingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Critical strategies abort the pipeline on failure.
    fn is_critical(&self) -> bool {
        false
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome;
}

/// Strategies that only search for subtitles; they are skipped once the
/// target-language goal is met.
const SCANNER_STRATEGIES: [&str; 3] = ["LocalScanner", "OnlineFetcher", "FinalSelector"];

pub struct SubtitlePipeline {
    strategies: Vec<Box<dyn ProcessingStrategy>>,
}

impl SubtitlePipeline {
    pub fn new(strategies: Vec<Box<dyn ProcessingStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain, in fixed order.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(StandardFileChecker),
            Box::new(EmbedScanner),
            Box::new(LocalScanner),
            Box::new(OnlineFetcher),
            Box::new(FinalSelector),
            Box::new(Translator),
            Box::new(Synchronizer),
        ])
    }

    /// Run the chain. Returns true when a final subtitle (target language
    /// or fallback) exists at the end.
    pub async fn run(&self, context: &mut ProcessingContext) -> bool {
        let started = Instant::now();
        let video = context.video_basename();
        info!("Starting pipeline for: {}", video);

        let mut aborted = false;
        for strategy in &self.strategies {
            if context.found_final_ro && SCANNER_STRATEGIES.contains(&strategy.name()) {
                info!(
                    "Skipping strategy '{}': final {} subtitle already found",
                    strategy.name(),
                    context.target_language
                );
                continue;
            }

            let strategy_started = Instant::now();
            info!("Executing strategy: {}...", strategy.name());
            let outcome = strategy.execute(context).await;
            info!(
                "Strategy {} finished in {:.3}s: {:?}",
                strategy.name(),
                strategy_started.elapsed().as_secs_f64(),
                outcome
            );

            if let StrategyOutcome::Failed(message) = outcome {
                context.add_error(strategy.name(), &message);
                if strategy.is_critical() {
                    error!(
                        "Critical failure in mandatory strategy '{}'; aborting pipeline",
                        strategy.name()
                    );
                    aborted = true;
                    break;
                }
                warn!(
                    "Strategy '{}' failed; pipeline continuing (non-critical)",
                    strategy.name()
                );
            }
        }

        let overall_success = if aborted {
            false
        } else {
            Self::determine_result(context, &video)
        };

        // Finalization on every exit path: temp dirs, then services.
        context.cleanup_temp_dirs();
        context.services.shutdown().await;

        info!(
            "Pipeline finished for: {} in {:.2}s. Overall success: {}",
            video,
            started.elapsed().as_secs_f64(),
            overall_success
        );
        if !context.errors.is_empty() {
            warn!("Errors encountered during pipeline execution ({}):", context.errors.len());
            for entry in &context.errors {
                warn!("  - {}", entry);
            }
        }
        overall_success
    }

    fn determine_result(context: &ProcessingContext, video: &str) -> bool {
        if context.found_final_ro {
            match &context.final_ro_sub {
                Some(FinalSubtitle::EmbeddedText) => {
                    info!("Pipeline result: final subtitle confirmed (embedded text) for {}", video);
                    true
                }
                Some(FinalSubtitle::File(path)) if path.exists() => {
                    info!(
                        "Pipeline result: final subtitle at {} for {}",
                        path.display(),
                        video
                    );
                    true
                }
                other => {
                    error!(
                        "Pipeline result: goal flag set but final path {:?} is invalid for {}",
                        other, video
                    );
                    false
                }
            }
        } else if context
            .final_en_sub_path
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false)
        {
            info!(
                "Pipeline result: fallback {} subtitle selected for {}",
                context.fallback_language, video
            );
            true
        } else {
            warn!("Pipeline result: no suitable final subtitle found for {}", video);
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Config;
    use crate::services::media_identity::parse_media_identity;

    /// Context over a temp directory with a fake video file and a service
    /// container with no providers configured and nonexistent tool paths.
    pub fn offline_context(dir: &Path, video_name: &str, language: &str) -> ProcessingContext {
        let video_path = dir.join(video_name);
        std::fs::write(&video_path, b"\x00fake video bytes").unwrap();

        let mut config = Config::load().unwrap();
        config.providers.opensubtitles_api_key = None;
        config.providers.subsro_base_url = None;
        config.providers.deepl_api_keys = Vec::new();
        config.tools.ffprobe_path = "/nonexistent/ffprobe".to_string();
        config.tools.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        config.tools.ffsubsync_path = "/nonexistent/ffsubsync".to_string();
        config.tools.alass_cli_path = "/nonexistent/alass-cli".to_string();

        let identity = parse_media_identity(&video_path);
        ProcessingContext::new(
            video_path,
            identity,
            language.to_string(),
            PipelineOptions::default(),
            ServiceContainer::from_config(&config),
        )
    }

    pub const SAMPLE_SRT: &str =
        "1\n00:00:01,000 --> 00:00:02,000\nSalut\n\n2\n00:00:03,000 --> 00:00:04,000\nLume\n";
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn existing_standard_subtitle_short_circuits_the_scanners() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.2021.1080p.mkv", "ro");
        std::fs::write(dir.path().join("Movie.2021.1080p.ro.srt"), SAMPLE_SRT).unwrap();

        let success = SubtitlePipeline::standard().run(&mut context).await;
        assert!(success);
        assert!(context.found_final_ro);
        assert_eq!(
            context.final_ro_sub,
            Some(FinalSubtitle::File(dir.path().join("Movie.2021.1080p.ro.srt")))
        );
    }

    #[tokio::test]
    async fn pipeline_without_any_source_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.2021.1080p.mkv", "ro");
        let success = SubtitlePipeline::standard().run(&mut context).await;
        assert!(!success);
        assert!(!context.found_final_ro);
    }

    struct FailingCritical;

    #[async_trait]
    impl ProcessingStrategy for FailingCritical {
        fn name(&self) -> &'static str {
            "FailingCritical"
        }
        fn is_critical(&self) -> bool {
            true
        }
        async fn execute(&self, _context: &mut ProcessingContext) -> StrategyOutcome {
            StrategyOutcome::Failed("deliberate".to_string())
        }
    }

    struct RecordingStrategy;

    #[async_trait]
    impl ProcessingStrategy for RecordingStrategy {
        fn name(&self) -> &'static str {
            "RecordingStrategy"
        }
        async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
            // Would have succeeded; must never run after a critical abort.
            context.mark_final_ro(FinalSubtitle::EmbeddedText);
            StrategyOutcome::Completed
        }
    }

    #[tokio::test]
    async fn critical_failure_aborts_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let pipeline =
            SubtitlePipeline::new(vec![Box::new(FailingCritical), Box::new(RecordingStrategy)]);
        let success = pipeline.run(&mut context).await;
        assert!(!success);
        assert!(!context.found_final_ro, "strategies after the abort must not run");
        assert_eq!(context.errors.len(), 1);
    }

    struct TempDirStrategy;

    #[async_trait]
    impl ProcessingStrategy for TempDirStrategy {
        fn name(&self) -> &'static str {
            "TempDirStrategy"
        }
        async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
            let dir = tempfile::tempdir().unwrap();
            context.add_temp_dir(dir);
            StrategyOutcome::Completed
        }
    }

    #[tokio::test]
    async fn temp_dirs_are_removed_on_every_exit_path() {
        let dir = tempfile::tempdir().unwrap();

        // Success-ish path.
        let mut context = offline_context(dir.path(), "A.mkv", "ro");
        let pipeline = SubtitlePipeline::new(vec![Box::new(TempDirStrategy)]);
        pipeline.run(&mut context).await;
        // Abort path.
        let mut context2 = offline_context(dir.path(), "B.mkv", "ro");
        let pipeline =
            SubtitlePipeline::new(vec![Box::new(TempDirStrategy), Box::new(FailingCritical)]);
        pipeline.run(&mut context2).await;

        assert!(context.temp_dirs.is_empty());
        assert!(context2.temp_dirs.is_empty());
    }
}
