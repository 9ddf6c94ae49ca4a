use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{FinalSubtitle, ProcessingContext, ProcessingStrategy, StrategyOutcome};

/// Synchronizes the finalized subtitle file against the video audio. Only
/// SRT files are syncable; embedded-text results have nothing on disk to
/// adjust.
pub struct Synchronizer;

fn syncable_path(context: &ProcessingContext) -> Option<PathBuf> {
    let is_srt = |path: &PathBuf| {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("srt"))
            .unwrap_or(false)
    };

    // The finalized target-language file wins; fallback otherwise.
    if let Some(FinalSubtitle::File(path)) = &context.final_ro_sub {
        if path.exists() && is_srt(path) {
            return Some(path.clone());
        }
        debug!(
            "Final target subtitle {} is not a syncable SRT file",
            path.display()
        );
    }
    if let Some(path) = &context.final_en_sub_path {
        if path.exists() && is_srt(path) {
            return Some(path.clone());
        }
    }
    None
}

#[async_trait]
impl ProcessingStrategy for Synchronizer {
    fn name(&self) -> &'static str {
        "Synchronizer"
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        if context.options.skip_sync {
            info!("Skipping: synchronization explicitly disabled via options");
            return StrategyOutcome::Skipped("sync disabled".to_string());
        }

        let Some(subtitle) = syncable_path(context) else {
            info!("No suitable SRT file to synchronize");
            return StrategyOutcome::Completed;
        };

        info!("Attempting synchronization for: {}", subtitle.display());
        match context
            .services
            .sync_tools
            .sync_subtitles_with_audio(&context.video_path, &subtitle)
            .await
        {
            Ok(resynced) => {
                info!(
                    "Synchronization completed for {} (resynced: {})",
                    subtitle.display(),
                    resynced
                );
                StrategyOutcome::Completed
            }
            Err(e) => StrategyOutcome::Failed(format!(
                "Sync failed for '{}': {}",
                subtitle.display(),
                e
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn missing_tools_leave_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let subtitle = dir.path().join("Movie.ro.srt");
        std::fs::write(&subtitle, SAMPLE_SRT).unwrap();
        context.mark_final_ro(FinalSubtitle::File(subtitle.clone()));

        // Sync tools are nonexistent binaries: offset check yields None and
        // the strategy completes without touching the file.
        let outcome = Synchronizer.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
        assert_eq!(std::fs::read_to_string(&subtitle).unwrap(), SAMPLE_SRT);
    }

    #[tokio::test]
    async fn embedded_text_results_have_nothing_to_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        context.mark_final_ro(FinalSubtitle::EmbeddedText);
        let outcome = Synchronizer.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
    }

    #[tokio::test]
    async fn skip_option_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        context.options.skip_sync = true;
        let outcome = Synchronizer.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
    }
}
