use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{FinalSubtitle, ProcessingContext, ProcessingStrategy, StrategyOutcome};

/// Checks for subtitles already at the standard paths
/// (`<stem>.<lang>.srt`). Never downloads anything; success means the
/// check was performed.
pub struct StandardFileChecker;

fn non_empty_file(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

#[async_trait]
impl ProcessingStrategy for StandardFileChecker {
    fn name(&self) -> &'static str {
        "StandardFileChecker"
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        let target_ro = context.standard_subtitle_path(&context.target_language);
        let target_en = context.standard_subtitle_path(&context.fallback_language);
        context.target_ro_path = Some(target_ro.clone());
        context.target_en_path = Some(target_en.clone());

        if target_ro.exists() {
            if non_empty_file(&target_ro) {
                info!("Found existing standard {} subtitle: {}", context.target_language, target_ro.display());
                context.mark_final_ro(FinalSubtitle::File(target_ro));
                return StrategyOutcome::Completed;
            }
            warn!("Found standard {} file, but it is empty: {}", context.target_language, target_ro.display());
        } else {
            debug!("No existing standard {} subtitle at: {}", context.target_language, target_ro.display());
        }

        if target_en.exists() {
            if non_empty_file(&target_en) {
                info!("Found existing standard {} subtitle: {}", context.fallback_language, target_en.display());
                // Candidate only; final selection happens later.
                context.candidate_en_path_standard = Some(target_en);
            } else {
                warn!("Found standard {} file, but it is empty: {}", context.fallback_language, target_en.display());
            }
        }

        StrategyOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn nonempty_target_language_file_meets_the_goal() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        std::fs::write(dir.path().join("Movie.ro.srt"), SAMPLE_SRT).unwrap();

        let outcome = StandardFileChecker.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
        assert!(context.found_final_ro);
        assert_eq!(context.target_ro_path, Some(dir.path().join("Movie.ro.srt")));
        assert_eq!(context.target_en_path, Some(dir.path().join("Movie.en.srt")));
    }

    #[tokio::test]
    async fn empty_files_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        std::fs::write(dir.path().join("Movie.ro.srt"), "").unwrap();

        StandardFileChecker.execute(&mut context).await;
        assert!(!context.found_final_ro);
    }

    #[tokio::test]
    async fn fallback_file_becomes_a_candidate_not_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        std::fs::write(dir.path().join("Movie.en.srt"), SAMPLE_SRT).unwrap();

        StandardFileChecker.execute(&mut context).await;
        assert!(!context.found_final_ro);
        assert_eq!(
            context.candidate_en_path_standard,
            Some(dir.path().join("Movie.en.srt"))
        );
        assert!(context.final_en_sub_path.is_none());
    }
}
