use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{FinalSubtitle, ProcessingContext, ProcessingStrategy, StrategyOutcome};
use crate::services::media_probe::{
    select_best_stream, CodecKind, IMAGE_SUBTITLE_CODECS_EN, IMAGE_SUBTITLE_CODECS_RO,
};

/// Checks embedded subtitle streams.
///
/// Target language: a text stream meets the goal with no extraction at all;
/// an allow-listed image stream is extracted and OCRed to the standard path
/// now. Fallback language: the best stream is only *detected* here and
/// stored for the final selector, which extracts on demand.
pub struct EmbedScanner;

#[async_trait]
impl ProcessingStrategy for EmbedScanner {
    fn name(&self) -> &'static str {
        "EmbedScanner"
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        if context.found_final_ro {
            debug!("Skipping: final subtitle already found");
            return StrategyOutcome::Skipped("goal already met".to_string());
        }

        let video = context.video_path.clone();
        info!("Checking for embedded subtitles in '{}'...", context.video_basename());

        let streams = match context.services.media_probe.probe_subtitle_streams(&video).await {
            Ok(streams) => streams,
            Err(e) => {
                return StrategyOutcome::Failed(format!("Media probe failed: {}", e));
            }
        };
        if streams.is_empty() {
            info!("No embedded subtitle streams found");
            return StrategyOutcome::Completed;
        }

        // Target language first.
        let target_language = context.target_language.clone();
        if let Some((stream, kind)) =
            select_best_stream(&streams, &target_language, &IMAGE_SUBTITLE_CODECS_RO)
        {
            match kind {
                CodecKind::Text => {
                    info!(
                        "Found embedded text {} subtitle (stream #{}); goal met without extraction",
                        target_language, stream.index
                    );
                    context.mark_final_ro(FinalSubtitle::EmbeddedText);
                    return StrategyOutcome::Completed;
                }
                CodecKind::Image => {
                    info!(
                        "Found embedded image {} subtitle (stream #{}, codec {}); extracting via OCR",
                        target_language, stream.index, stream.codec_name
                    );
                    let scratch = match tempfile::tempdir() {
                        Ok(dir) => dir,
                        Err(e) => {
                            return StrategyOutcome::Failed(format!("Temp dir creation failed: {}", e))
                        }
                    };
                    let scratch_path = context.add_temp_dir(scratch);
                    match context
                        .services
                        .media_probe
                        .extract_image_stream_with_ocr(&video, stream.index, &scratch_path)
                        .await
                    {
                        Ok(extracted) => {
                            // Move the OCR result to the standard path so it
                            // survives temp cleanup.
                            let target = context.standard_subtitle_path(&target_language);
                            if let Err(e) = std::fs::copy(&extracted, &target) {
                                context.add_error(self.name(), &format!(
                                    "Failed to place OCR result at {}: {}",
                                    target.display(),
                                    e
                                ));
                            } else {
                                info!("Extracted embedded {} subtitle to {}", target_language, target.display());
                                context.mark_final_ro(FinalSubtitle::File(target));
                                return StrategyOutcome::Completed;
                            }
                        }
                        Err(e) => {
                            // OCR failing must not kill the chain; later
                            // strategies can still provide a subtitle.
                            warn!("Embedded {} extraction failed: {}", target_language, e);
                            context.add_error(self.name(), &format!("Embedded extraction failed: {}", e));
                        }
                    }
                }
            }
        } else {
            info!("No suitable embedded {} subtitle stream", target_language);
        }

        // Fallback language: detect only, extraction is the final
        // selector's decision.
        let fallback = context.fallback_language.clone();
        match select_best_stream(&streams, &fallback, &IMAGE_SUBTITLE_CODECS_EN) {
            Some((stream, kind)) => {
                info!(
                    "Detected potential embedded {} subtitle ({:?}: stream #{}, codec {}); storing info",
                    fallback, kind, stream.index, stream.codec_name
                );
                context.potential_embedded_en = Some((stream, kind));
            }
            None => {
                info!("No suitable embedded {} subtitle stream detected", fallback);
                context.potential_embedded_en = None;
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
    async fn probe_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // The offline container points ffprobe at a nonexistent binary.
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        let outcome = EmbedScanner.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Failed(_)));
        assert!(!context.found_final_ro);
    }

    #[tokio::test]
    async fn skips_once_goal_is_met() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.mkv", "ro");
        context.mark_final_ro(FinalSubtitle::EmbeddedText);
        let outcome = EmbedScanner.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
    }
}
