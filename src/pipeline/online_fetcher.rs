use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{FinalSubtitle, ProcessingContext, ProcessingStrategy, StrategyOutcome};
use crate::subtitle::matcher::{
    get_subtitle_language_code, rank_candidates, score_candidate, Candidate, CandidateFlags,
    CandidateSource,
};
use crate::subtitle::parser::{
    ensure_correct_timestamp_format, fix_diacritics, read_subtitle_file, tokenize_and_normalize,
};
use crate::services::subsro;

/// Fetches subtitles from the configured online providers, scores every
/// candidate against the media file, and acquires the best ones: the target
/// language is finalized at the standard path, the best fallback-language
/// file is remembered as a candidate for the final selector.
pub struct OnlineFetcher;

#[async_trait]
impl ProcessingStrategy for OnlineFetcher {
    fn name(&self) -> &'static str {
        "OnlineFetcher"
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        if context.found_final_ro {
            return StrategyOutcome::Skipped("goal already met".to_string());
        }
        let Some(imdb_id) = context.identity.imdb_id.clone() else {
            warn!(
                "Skipping: missing IMDb id for '{}'",
                context.identity.basename
            );
            return StrategyOutcome::Skipped("missing IMDb id".to_string());
        };
        if context.services.opensubtitles.is_none() && context.services.subsro.is_none() {
            return StrategyOutcome::Skipped("no online providers configured".to_string());
        }

        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return StrategyOutcome::Failed(format!("Temp dir creation failed: {}", e)),
        };
        let scratch_path = context.add_temp_dir(scratch);

        let media_stem = context
            .video_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let media_tokens = tokenize_and_normalize(&media_stem);
        let media_basename = context.video_basename();
        let media_episode = context.identity.episode.clone();
        let season = context.identity.season.clone();
        let target_language = context.target_language.clone();
        let fallback_language = context.fallback_language.clone();

        info!(
            "Searching online sources for IMDb id {} (episode: {:?})...",
            imdb_id, media_episode
        );

        // --- Gather candidates from every configured provider ---
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut provider_errors: Vec<String> = Vec::new();
        {
            let services = &context.services;

            if let Some(client) = &services.subsro {
                let subsro_dir = scratch_path.join("subsro");
                let _ = std::fs::create_dir_all(&subsro_dir);
                for language in [&target_language, &fallback_language] {
                    match client.find_subtitle_download_urls(&imdb_id, language).await {
                        Ok(urls) => {
                            for (index, url) in urls.iter().enumerate() {
                                let archive_dir = subsro_dir.join(format!("{}_{}", language, index));
                                let _ = std::fs::create_dir_all(&archive_dir);
                                match gather_subsro_archive(
                                    client,
                                    url,
                                    &archive_dir,
                                    language,
                                    index,
                                )
                                .await
                                {
                                    Ok(Some(candidate)) => candidates.push(candidate),
                                    Ok(None) => {}
                                    Err(e) => provider_errors.push(e),
                                }
                            }
                        }
                        Err(e) => provider_errors.push(format!("Subs.ro search failed: {}", e)),
                    }
                }
            }

            if let Some(client) = &services.opensubtitles {
                let languages: Vec<&str> =
                    vec![target_language.as_str(), fallback_language.as_str()];
                match client
                    .search(
                        &imdb_id,
                        season.as_deref(),
                        media_episode.as_deref(),
                        &languages,
                    )
                    .await
                {
                    Ok(found) => candidates.extend(found),
                    Err(e) => provider_errors.push(format!("OpenSubtitles search failed: {}", e)),
                }
            }
        }
        for message in provider_errors {
            context.add_error(self.name(), &message);
        }

        if candidates.is_empty() {
            info!("No online candidates found for {}", imdb_id);
            return StrategyOutcome::Completed;
        }

        // --- Score, filter by the minimum threshold, rank ---
        let min_score = context.services.min_overall_score;
        let scored: Vec<(i32, u8, Candidate)> = candidates
            .into_iter()
            .filter_map(|candidate| {
                score_candidate(
                    &candidate,
                    &media_tokens,
                    &media_basename,
                    media_episode.as_deref(),
                    &target_language,
                )
                .map(|(score, priority)| (score, priority, candidate))
            })
            .filter(|(score, _, candidate)| {
                if *score < min_score {
                    debug!(
                        "Dropping candidate {} (score {} below threshold {})",
                        candidate.id, score, min_score
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        let ranked = rank_candidates(scored);
        info!("Ranked {} online candidates above threshold", ranked.len());

        // --- Acquire: finalize target language, remember best fallback ---
        let target_ro = context.standard_subtitle_path(&target_language);
        let mut acquired_ro: Option<PathBuf> = None;
        let mut acquired_en: Option<PathBuf> = None;
        let mut acquisition_errors: Vec<String> = Vec::new();

        {
            let services = &context.services;
            for (score, priority, candidate) in &ranked {
                if acquired_ro.is_some() {
                    break;
                }
                let is_target = candidate.language.eq_ignore_ascii_case(&target_language);
                if !is_target && acquired_en.is_some() {
                    continue;
                }

                info!(
                    "Attempting online candidate: {:?} (lang {}, score {}, prio {})",
                    candidate.source, candidate.language, score, priority
                );
                let local_file = match obtain_candidate_file(services, candidate, &scratch_path).await
                {
                    Ok(path) => path,
                    Err(e) => {
                        acquisition_errors.push(format!(
                            "Failed to obtain candidate {}: {}",
                            candidate.id, e
                        ));
                        continue;
                    }
                };

                if is_target {
                    match normalize_to(&local_file, &target_ro) {
                        Ok(()) => {
                            info!(
                                "Saved online {} subtitle to standard path: {}",
                                target_language,
                                target_ro.display()
                            );
                            acquired_ro = Some(target_ro.clone());
                        }
                        Err(e) => acquisition_errors.push(e),
                    }
                } else {
                    info!(
                        "Remembering online {} subtitle as candidate: {}",
                        candidate.language,
                        local_file.display()
                    );
                    acquired_en = Some(local_file);
                }
            }
        }
        for message in acquisition_errors {
            context.add_error(self.name(), &message);
        }

        if let Some(path) = acquired_ro {
            context.mark_final_ro(FinalSubtitle::File(path));
        }
        if let Some(path) = acquired_en {
            context.candidate_en_path_online = Some(path);
        }
        StrategyOutcome::Completed
    }
}

/// Download one Subs.ro archive, extract it and pick the best inner
/// subtitle file as a candidate.
async fn gather_subsro_archive(
    client: &crate::services::SubsRoClient,
    url: &str,
    archive_dir: &std::path::Path,
    language: &str,
    index: usize,
) -> std::result::Result<Option<Candidate>, String> {
    let archive = client
        .download_subtitle_archive(url, archive_dir, &format!("subsro_{}_{}", language, index))
        .await
        .map_err(|e| format!("Subs.ro archive download failed: {}", e))?;

    client
        .extract_archive(&archive, archive_dir)
        .await
        .map_err(|e| format!("Failed to extract Subs.ro archive {}: {}", archive.display(), e))?;

    let files = subsro::find_subtitle_files(archive_dir);
    let Some(extracted) = files.into_iter().next() else {
        warn!("No subtitle files found in Subs.ro archive {}", archive.display());
        return Ok(None);
    };

    let file_name = extracted
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from);
    let detected_language = file_name
        .as_deref()
        .and_then(get_subtitle_language_code)
        .unwrap_or_else(|| language.to_string());

    Ok(Some(Candidate {
        source: CandidateSource::SubsRo,
        language: detected_language,
        id: url.to_string(),
        extracted_path: Some(extracted),
        file_name,
        release_name: None,
        flags: CandidateFlags::default(),
        score_bonus: 0,
        download_ref: None,
    }))
}

/// Make the candidate's content available as a local file: archive
/// candidates are already extracted, OpenSubtitles ones are downloaded now.
async fn obtain_candidate_file(
    services: &crate::services::ServiceContainer,
    candidate: &Candidate,
    scratch: &std::path::Path,
) -> std::result::Result<PathBuf, String> {
    if let Some(path) = &candidate.extracted_path {
        return Ok(path.clone());
    }
    let (Some(client), Some(file_id)) = (&services.opensubtitles, &candidate.download_ref) else {
        return Err("candidate has no local file and no download reference".to_string());
    };
    client
        .download(file_id, scratch)
        .await
        .map_err(|e| e.to_string())
}

/// Normalize a downloaded subtitle (charset, diacritics, timestamp format)
/// into its final path.
fn normalize_to(source: &std::path::Path, dest: &std::path::Path) -> std::result::Result<(), String> {
    let content = read_subtitle_file(source)
        .map_err(|e| format!("Failed to read {}: {}", source.display(), e))?;
    let processed = ensure_correct_timestamp_format(&fix_diacritics(&content));
    std::fs::write(dest, processed)
        .map_err(|e| format!("Failed to write {}: {}", dest.display(), e))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn skips_without_imdb_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.2021.mkv", "ro");
        context.identity.imdb_id = None;
        let outcome = OnlineFetcher.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn skips_without_configured_providers() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = offline_context(dir.path(), "Movie.2021.mkv", "ro");
        context.identity.imdb_id = Some("tt1234567".to_string());
        let outcome = OnlineFetcher.execute(&mut context).await;
        assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
    }

    #[test]
    fn normalization_repairs_downloaded_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw.srt");
        let dest = dir.path().join("Movie.ro.srt");
        std::fs::write(&source, "1\n00:00:01.000 --> 00:00:02.000\nAşa\n").unwrap();

        normalize_to(&source, &dest).unwrap();
        let content = std::fs::read_to_string(&dest).unwrap();
        assert!(content.contains("00:00:01,000"));
        assert!(content.contains("Așa"));
    }

    #[test]
    fn normalization_decodes_legacy_charsets() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("legacy.srt");
        let dest = dir.path().join("Movie.ro.srt");
        // Not valid UTF-8: windows-1250 content.
        std::fs::write(&source, b"1\n00:00:01,000 --> 00:00:02,000\ncaf\xE9\n").unwrap();

        normalize_to(&source, &dest).unwrap();
        let content = std::fs::read_to_string(&dest).unwrap();
        assert!(content.contains("caf\u{e9}"));
    }
}
