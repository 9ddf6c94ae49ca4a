use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{FinalSubtitle, ProcessingContext, ProcessingStrategy, StrategyOutcome};
use crate::subtitle::matcher::get_subtitle_language_code;
use crate::subtitle::parser::{
    ensure_correct_timestamp_format, fix_diacritics, read_subtitle_file,
};

const SUBTITLE_EXTENSIONS: [&str; 3] = [".srt", ".sub", ".ass"];

const RO_STOPWORDS: [&str; 20] = [
    "și", "si", "să", "sa", "nu", "este", "sunt", "care", "pentru", "din", "dar", "mai", "fost",
    "acest", "asta", "ceva", "unde", "când", "cum", "vrea",
];
const EN_STOPWORDS: [&str; 16] = [
    "the", "and", "you", "that", "this", "with", "have", "what", "your", "from", "they", "would",
    "there", "been", "were", "just",
];
const RO_DIACRITICS: [char; 10] = ['ă', 'â', 'î', 'ș', 'ț', 'Ă', 'Â', 'Î', 'Ș', 'Ț'];

/// Content-based language detection for subtitle text. Stopword counts plus
/// a diacritic bonus; ties and thin evidence resolve to None.
pub fn detect_language(text: &str) -> Option<&'static str> {
    let sample: String = text.chars().take(5000).collect();
    let mut ro_score = 0usize;
    let mut en_score = 0usize;

    for word in sample
        .split(|c: char| !c.is_alphanumeric() && !RO_DIACRITICS.contains(&c))
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_lowercase();
        if RO_STOPWORDS.contains(&lower.as_str()) {
            ro_score += 1;
        }
        if EN_STOPWORDS.contains(&lower.as_str()) {
            en_score += 1;
        }
    }
    ro_score += sample.chars().filter(|c| RO_DIACRITICS.contains(c)).count() / 2;

    if ro_score >= 3 && ro_score > en_score {
        Some("ro")
    } else if en_score >= 3 && en_score > ro_score {
        Some("en")
    } else {
        None
    }
}

/// Finds non-standard local subtitle files next to the video, detects their
/// language by content, and when the target language matches, normalizes
/// (diacritics, timestamps) into the standard path and removes the source.
pub struct LocalScanner;

#[async_trait]
impl ProcessingStrategy for LocalScanner {
    fn name(&self) -> &'static str {
        "LocalScanner"
    }

    async fn execute(&self, context: &mut ProcessingContext) -> StrategyOutcome {
        if context.found_final_ro {
            debug!("Skipping: final subtitle already found");
            return StrategyOutcome::Skipped("goal already met".to_string());
        }

        let video_dir = match context.video_path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return StrategyOutcome::Completed,
        };
        let target_ro = context.standard_subtitle_path(&context.target_language);
        let target_en = context.standard_subtitle_path(&context.fallback_language);
        let standard_names: Vec<String> = [&target_ro, &target_en]
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.to_lowercase()))
            .collect();

        info!(
            "Scanning '{}' for non-standard local {} subtitles...",
            video_dir.display(),
            context.target_language
        );

        let entries = match std::fs::read_dir(&video_dir) {
            Ok(entries) => entries,
            Err(e) => {
                return StrategyOutcome::Failed(format!(
                    "Cannot scan directory {}: {}",
                    video_dir.display(),
                    e
                ))
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let lower = name.to_lowercase();
            if !SUBTITLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                continue;
            }
            if standard_names.contains(&lower) || lower.ends_with(".bak") || lower.ends_with(".syncbak") {
                continue;
            }
            // Files already in standard format for some other language are
            // left alone.
            if get_subtitle_language_code(&name).is_some() {
                debug!("Skipping '{}': already standard-format for a language", name);
                continue;
            }

            info!("Found potential non-standard local subtitle: {}", name);
            // Charset fallback: legacy cp1250/cp1252 files are common here.
            let content = match read_subtitle_file(&path) {
                Ok(content) if !content.trim().is_empty() => content,
                Ok(_) => {
                    warn!("Local subtitle '{}' is empty; skipping", name);
                    continue;
                }
                Err(e) => {
                    warn!("Could not read local subtitle '{}': {}", name, e);
                    continue;
                }
            };

            let Some(detected) = detect_language(&content) else {
                debug!("Could not detect language for '{}'", name);
                continue;
            };
            info!("Detected language for '{}': {}", name, detected);
            if detected != context.target_language {
                continue;
            }

            // Normalize and save at the standard path.
            let processed = ensure_correct_timestamp_format(&fix_diacritics(&content));
            if let Err(e) = std::fs::write(&target_ro, processed) {
                context.add_error(
                    self.name(),
                    &format!("Failed to write processed local subtitle to '{}': {}", target_ro.display(), e),
                );
                continue;
            }
            info!("Saved processed local subtitle to standard path: {}", target_ro.display());

            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Could not remove original non-standard subtitle '{}': {}", name, e);
            } else {
                info!("Removed original non-standard local subtitle: {}", name);
            }

            context.mark_final_ro(FinalSubtitle::File(target_ro));
            return StrategyOutcome::Completed;
        }

        info!("No suitable non-standard local {} subtitle found", context.target_language);
        StrategyOutcome::Completed
    }
}
