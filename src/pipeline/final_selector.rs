use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{ProcessingContext, ProcessingStrategy, StrategyOutcome};
use crate::services::media_probe::CodecKind;

/// Selects the final fallback-language subtitle when the target-language
/// goal was not met, by priority: online > standard file > detected
/// embedded stream. Embedded candidates are extracted only now, into a
/// registered temp dir; the chosen file is placed at the standard fallback
/// path so it survives temp cleanup.
pub struct FinalSelector;

#[async_trait]
impl ProcessingStrategy for FinalSelector {
    fn name(&self) -> &'static str {
        "FinalSelector"
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        if context.found_final_ro {
            debug!("Skipping: final subtitle already found");
            return StrategyOutcome::Skipped("goal already met".to_string());
        }

        let mut selected: Option<(PathBuf, &'static str)> = None;

        // 1. Online candidate.
        if let Some(path) = &context.candidate_en_path_online {
            if path.exists() {
                selected = Some((path.clone(), "online"));
            }
        }
        // 2. Standard file candidate.
        if selected.is_none() {
            if let Some(path) = &context.candidate_en_path_standard {
                if path.exists() {
                    selected = Some((path.clone(), "standard file"));
                }
            }
        }
        // 3. Detected embedded candidate; extraction happens only now.
        if selected.is_none() {
            if let Some((stream, kind)) = context.potential_embedded_en.clone() {
                info!(
                    "No higher priority {} candidate; extracting detected embedded stream #{} ({})",
                    context.fallback_language, stream.index, stream.codec_name
                );
                let scratch = match tempfile::tempdir() {
                    Ok(dir) => dir,
                    Err(e) => {
                        return StrategyOutcome::Failed(format!("Temp dir creation failed: {}", e))
                    }
                };
                let scratch_path = context.add_temp_dir(scratch);
                let video = context.video_path.clone();
                let extraction = match kind {
                    CodecKind::Text => {
                        context
                            .services
                            .media_probe
                            .extract_text_stream(&video, stream.index, &scratch_path)
                            .await
                    }
                    CodecKind::Image => {
                        context
                            .services
                            .media_probe
                            .extract_image_stream_with_ocr(&video, stream.index, &scratch_path)
                            .await
                    }
                };
                match extraction {
                    Ok(path) => selected = Some((path, "embedded (extracted)")),
                    Err(e) => {
                        warn!("Failed to extract embedded stream #{}: {}", stream.index, e);
                        context.add_error(
                            self.name(),
                            &format!("Failed to extract embedded stream #{}: {}", stream.index, e),
                        );
                    }
                }
            }
        }

        let Some((path, source)) = selected else {
            info!(
                "No suitable final {} subtitle candidate from any source",
                context.fallback_language
            );
            return StrategyOutcome::Completed;
        };

        // Persist the selection at the standard fallback path unless it is
        // already there (temp-dir artifacts would vanish at cleanup).
        let fallback_language = context.fallback_language.clone();
        let target_en = context.standard_subtitle_path(&fallback_language);
        let final_path = if path != target_en {
            match std::fs::copy(&path, &target_en) {
                Ok(_) => target_en,
                Err(e) => {
                    warn!(
                        "Could not copy selected {} subtitle to {}: {}; keeping original location",
                        fallback_language,
                        target_en.display(),
                        e
                    );
                    path
                }
            }
        } else {
            path
        };

        info!(
            "Final {} subtitle selected (source: {}): {}",
            fallback_language,
            source,
            final_path.display()
        );
        context.final_en_sub_path = Some(final_path);
        StrategyOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn online_candidate_wins_over_standard() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");

        let online = dir.path().join("online.en.srt");
        std::fs::write(&online, SAMPLE_SRT).unwrap();
        let standard = dir.path().join("Movie.en.srt");
        std::fs::write(&standard, SAMPLE_SRT).unwrap();
        context.candidate_en_path_online = Some(online.clone());
        context.candidate_en_path_standard = Some(standard.clone());

        let outcome = FinalSelector.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
        // Selection is persisted at the standard fallback path.
        assert_eq!(context.final_en_sub_path, Some(standard));
    }

    #[tokio::test]
    async fn standard_candidate_used_when_no_online() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let standard = dir.path().join("Movie.en.srt");
        std::fs::write(&standard, SAMPLE_SRT).unwrap();
        context.candidate_en_path_standard = Some(standard.clone());

        FinalSelector.execute(&mut context).await;
        assert_eq!(context.final_en_sub_path, Some(standard));
    }

    #[tokio::test]
    async fn nothing_selected_without_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let outcome = FinalSelector.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
        assert!(context.final_en_sub_path.is_none());
    }

    #[tokio::test]
    async fn failed_embedded_extraction_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        context.potential_embedded_en = Some((
            crate::services::media_probe::SubtitleStreamInfo {
                index: 2,
                codec_name: "subrip".to_string(),
                language: Some("en".to_string()),
                forced: false,
            },
            CodecKind::Text,
        ));

        // ffmpeg is a nonexistent binary in the offline container.
        let outcome = FinalSelector.execute(&mut context).await;
        assert_eq!(outcome, StrategyOutcome::Completed);
        assert!(context.final_en_sub_path.is_none());
        assert_eq!(context.errors.len(), 1);
    }
}
