use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{FinalSubtitle, ProcessingContext, ProcessingStrategy, StrategyOutcome};

/// Translates the selected fallback-language SRT into the target language
/// when no target-language subtitle was obtained. Critical: a translation
/// failure aborts the pipeline, because a job that reaches this point has
/// no other way to produce the target-language artifact.
pub struct Translator;

#[async_trait]
impl ProcessingStrategy for Translator {
    fn name(&self) -> &'static str {
        "Translator"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        if context.options.skip_translation {
            info!("Skipping: translation explicitly disabled via options");
            return StrategyOutcome::Skipped("translation disabled".to_string());
        }
        if context.found_final_ro {
            debug!("Skipping: final subtitle already found");
            return StrategyOutcome::Skipped("goal already met".to_string());
        }

        let Some(source) = context.final_en_sub_path.clone() else {
            debug!("Skipping: no final fallback subtitle selected to translate from");
            return StrategyOutcome::Skipped("no source subtitle".to_string());
        };
        if !source.exists() {
            warn!(
                "Final {} subtitle path '{}' does not exist; clearing",
                context.fallback_language,
                source.display()
            );
            context.final_en_sub_path = None;
            return StrategyOutcome::Skipped("source subtitle vanished".to_string());
        }
        if source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| !e.eq_ignore_ascii_case("srt"))
            .unwrap_or(true)
        {
            warn!(
                "Skipping: '{}' is not an SRT file; translation requires SRT",
                source.display()
            );
            return StrategyOutcome::Skipped("source is not SRT".to_string());
        }

        let Some(target) = context.target_ro_path.clone() else {
            // Structural context is missing; nothing downstream can recover.
            return StrategyOutcome::Failed(
                "target subtitle path not set in context".to_string(),
            );
        };
        if target.exists() {
            warn!(
                "Target file '{}' already exists but goal flag was unset; reconciling",
                target.display()
            );
            context.mark_final_ro(FinalSubtitle::File(target));
            return StrategyOutcome::Completed;
        }

        let Some(translator) = &context.services.translator else {
            warn!("Skipping: translation service not configured");
            return StrategyOutcome::Skipped("translator unavailable".to_string());
        };

        info!(
            "Translating '{}' ({}) to '{}' ({})",
            source.display(),
            context.fallback_language,
            target.display(),
            context.target_language
        );
        match translator.translate_srt_file(&source, &target).await {
            Ok(()) => {
                context.mark_final_ro(FinalSubtitle::File(target));
                StrategyOutcome::Completed
            }
            Err(e) => StrategyOutcome::Failed(format!("Translation failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn skips_when_no_source_candidate_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        context.target_ro_path = Some(dir.path().join("Movie.ro.srt"));
        let outcome = Translator.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn non_srt_sources_are_not_translated() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let source = dir.path().join("Movie.en.sub");
        std::fs::write(&source, "some sub format").unwrap();
        context.final_en_sub_path = Some(source);
        context.target_ro_path = Some(dir.path().join("Movie.ro.srt"));

        let outcome = Translator.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
        assert!(!context.found_final_ro);
    }

    #[tokio::test]
    async fn missing_target_path_is_a_critical_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let source = dir.path().join("Movie.en.srt");
        std::fs::write(&source, SAMPLE_SRT).unwrap();
        context.final_en_sub_path = Some(source);
        context.target_ro_path = None;

        let outcome = Translator.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Failed(_)));
        assert!(Translator.is_critical());
    }

    #[tokio::test]
    async fn existing_target_file_reconciles_the_goal_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let source = dir.path().join("Movie.en.srt");
        std::fs::write(&source, SAMPLE_SRT).unwrap();
        let target = dir.path().join("Movie.ro.srt");
        std::fs::write(&target, SAMPLE_SRT).unwrap();
        context.final_en_sub_path = Some(source);
        context.target_ro_path = Some(target.clone());

        let outcome = Translator.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
        assert_eq!(context.final_ro_sub, Some(FinalSubtitle::File(target)));
    }

    #[tokio::test]
    async fn missing_translator_service_skips_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let source = dir.path().join("Movie.en.srt");
        std::fs::write(&source, SAMPLE_SRT).unwrap();
        context.final_en_sub_path = Some(source);
        context.target_ro_path = Some(dir.path().join("Movie.ro.srt"));

        let outcome = Translator.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
    }
}
