//! EN→RO subtitle translation.
//!
//! DeepL is the primary engine, with API-key rotation driven by a
//! process-scoped character-usage cache (explicit init and teardown,
//! mutex-guarded); the free Google endpoint is the fallback. Translation
//! preserves the SRT structure exactly: indices and timestamps are reused
//! verbatim, only the text blocks are replaced.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SubwardenError};
use crate::subtitle::parser::{
    decode_subtitle_bytes, ensure_correct_timestamp_format, fix_diacritics,
    parse_srt_into_segments, rebuild_srt_from_segments, SrtSegment,
};

/// Character budget per request chunk, under DeepL's request size limit.
const CHUNK_MAX_CHARS: usize = 4500;

static DEEPL_USAGE: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

fn usage_cache() -> &'static Mutex<HashMap<String, u64>> {
    DEEPL_USAGE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Explicit cache initialization at process start.
pub fn init_usage_cache() {
    usage_cache();
}

/// Explicit teardown; called from the service container shutdown hook.
pub fn teardown_usage_cache() {
    if let Ok(mut cache) = usage_cache().lock() {
        cache.clear();
    }
}

fn record_usage(key: &str, characters: u64) {
    if let Ok(mut cache) = usage_cache().lock() {
        *cache.entry(key.to_string()).or_insert(0) += characters;
    }
}

fn usage_of(key: &str) -> u64 {
    usage_cache()
        .lock()
        .map(|cache| cache.get(key).copied().unwrap_or(0))
        .unwrap_or(0)
}

fn mark_exhausted(key: &str, quota: u64) {
    if let Ok(mut cache) = usage_cache().lock() {
        cache.insert(key.to_string(), quota);
    }
}

/// Free-plan keys (`:fx` suffix) use the api-free host.
fn deepl_endpoint(api_key: &str) -> &'static str {
    if api_key.ends_with(":fx") {
        "https://api-free.deepl.com/v2/translate"
    } else {
        "https://api.deepl.com/v2/translate"
    }
}

/// Greedy grouping of segment indices into chunks under the character
/// budget; an oversized single text still gets its own chunk.
pub fn chunk_indices(texts: &[String], max_chars: usize) -> Vec<Vec<usize>> {
    let mut chunks = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_len = 0usize;

    for (index, text) in texts.iter().enumerate() {
        let len = text.len();
        if !current.is_empty() && current_len + len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push(index);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Replace segment texts with their translations, leaving indices and
/// timestamps untouched. Length mismatch is a hard error: a dropped or
/// duplicated segment would silently shift every later subtitle.
pub fn apply_translations(segments: &[SrtSegment], translations: &[String]) -> Result<Vec<SrtSegment>> {
    if segments.len() != translations.len() {
        return Err(SubwardenError::Translation(format!(
            "Translated segment count mismatch: {} in, {} out",
            segments.len(),
            translations.len()
        )));
    }
    Ok(segments
        .iter()
        .zip(translations.iter())
        .map(|(segment, text)| SrtSegment {
            index_line: segment.index_line.clone(),
            timestamp_line: segment.timestamp_line.clone(),
            text: text.clone(),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct DeeplResponse {
    translations: Vec<DeeplTranslation>,
}

#[derive(Debug, Deserialize)]
struct DeeplTranslation {
    text: String,
}

pub struct TranslationManager {
    http: reqwest::Client,
    deepl_keys: Vec<String>,
    character_quota: u64,
}

impl TranslationManager {
    pub fn new(deepl_keys: Vec<String>, character_quota: u64) -> Self {
        init_usage_cache();
        Self {
            http: reqwest::Client::new(),
            deepl_keys,
            character_quota,
        }
    }

    /// Translate an EN SRT file into RO at `ro_path`, preserving structure.
    pub async fn translate_srt_file(&self, en_path: &Path, ro_path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(en_path).await?;
        let content = decode_subtitle_bytes(&bytes);
        let content = ensure_correct_timestamp_format(&content);
        let segments = parse_srt_into_segments(&content);
        if segments.is_empty() {
            return Err(SubwardenError::Translation(format!(
                "No parseable SRT segments in {}",
                en_path.display()
            )));
        }

        let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
        let mut translated: Vec<String> = Vec::with_capacity(texts.len());
        for chunk in chunk_indices(&texts, CHUNK_MAX_CHARS) {
            let batch: Vec<&str> = chunk.iter().map(|&i| texts[i].as_str()).collect();
            let results = self.translate_batch(&batch).await?;
            translated.extend(results);
        }

        let translated_segments = apply_translations(&segments, &translated)?;
        let rebuilt = rebuild_srt_from_segments(&translated_segments);
        let fixed = fix_diacritics(&rebuilt);
        tokio::fs::write(ro_path, fixed).await?;
        info!(
            "Translated {} segments: {} -> {}",
            segments.len(),
            en_path.display(),
            ro_path.display()
        );
        Ok(())
    }

    async fn translate_batch(&self, texts: &[&str]) -> Result<Vec<String>> {
        let characters: u64 = texts.iter().map(|t| t.len() as u64).sum();

        for key in &self.deepl_keys {
            if usage_of(key) + characters > self.character_quota {
                debug!("Skipping DeepL key (quota budget exhausted)");
                continue;
            }
            match self.deepl_translate(key, texts).await {
                Ok(results) => {
                    record_usage(key, characters);
                    return Ok(results);
                }
                Err(SubwardenError::Provider(message)) if message.contains("456") => {
                    warn!("DeepL key over quota; rotating to next key");
                    mark_exhausted(key, self.character_quota);
                }
                Err(e) => {
                    warn!("DeepL translation failed: {}; trying next key", e);
                }
            }
        }

        // All DeepL keys unavailable: fall back to the free Google endpoint,
        // one text per request.
        debug!("Falling back to Google translation for {} texts", texts.len());
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.google_translate(text).await?);
        }
        Ok(results)
    }

    async fn deepl_translate(&self, api_key: &str, texts: &[&str]) -> Result<Vec<String>> {
        let response = self
            .http
            .post(deepl_endpoint(api_key))
            .header("Authorization", format!("DeepL-Auth-Key {}", api_key))
            .json(&serde_json::json!({
                "text": texts,
                "source_lang": "EN",
                "target_lang": "RO",
                "preserve_formatting": true,
            }))
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("DeepL request: {}", e)))?;

        if !response.status().is_success() {
            return Err(SubwardenError::Provider(format!(
                "DeepL returned status {}",
                response.status().as_u16()
            )));
        }
        let body: DeeplResponse = response
            .json()
            .await
            .map_err(|e| SubwardenError::Provider(format!("DeepL body: {}", e)))?;
        if body.translations.len() != texts.len() {
            return Err(SubwardenError::Translation(
                "DeepL returned a different number of translations".to_string(),
            ));
        }
        Ok(body.translations.into_iter().map(|t| t.text).collect())
    }

    async fn google_translate(&self, text: &str) -> Result<String> {
        let response = self
            .http
            .get("https://translate.googleapis.com/translate_a/single")
            .query(&[
                ("client", "gtx"),
                ("sl", "en"),
                ("tl", "ro"),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("Google translate request: {}", e)))?;
        if !response.status().is_success() {
            return Err(SubwardenError::Provider(format!(
                "Google translate returned status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SubwardenError::Provider(format!("Google translate body: {}", e)))?;
        parse_google_response(&body)
            .ok_or_else(|| SubwardenError::Translation("Unparseable Google response".to_string()))
    }
}

/// The gtx endpoint returns nested arrays: `[[["translated","source",..],..],..]`.
pub fn parse_google_response(body: &serde_json::Value) -> Option<String> {
    let parts = body.get(0)?.as_array()?;
    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get(0).and_then(|v| v.as_str()) {
            out.push_str(text);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: u32, text: &str) -> SrtSegment {
        SrtSegment {
            index_line: index.to_string(),
            timestamp_line: format!("00:00:0{},000 --> 00:00:0{},500", index, index),
            text: text.to_string(),
        }
    }

    #[test]
    fn chunking_respects_the_character_budget() {
        let texts = vec!["a".repeat(2000), "b".repeat(2000), "c".repeat(2000)];
        let chunks = chunk_indices(&texts, 4500);
        assert_eq!(chunks, vec![vec![0, 1], vec![2]]);

        // A single oversized text still travels alone.
        let texts = vec!["x".repeat(9000)];
        assert_eq!(chunk_indices(&texts, 4500), vec![vec![0]]);

        assert!(chunk_indices(&[], 4500).is_empty());
    }

    #[test]
    fn translations_preserve_indices_and_timestamps() {
        let segments = vec![segment(1, "Hello"), segment(2, "World")];
        let translated = apply_translations(
            &segments,
            &["Salut".to_string(), "Lume".to_string()],
        )
        .unwrap();
        assert_eq!(translated[0].index_line, "1");
        assert_eq!(translated[0].timestamp_line, segments[0].timestamp_line);
        assert_eq!(translated[0].text, "Salut");
        assert_eq!(translated[1].text, "Lume");
    }

    #[test]
    fn translation_count_mismatch_is_an_error() {
        let segments = vec![segment(1, "Hello")];
        assert!(apply_translations(&segments, &[]).is_err());
    }

    #[test]
    fn usage_cache_rotation_bookkeeping() {
        init_usage_cache();
        teardown_usage_cache();
        record_usage("key-a", 100);
        record_usage("key-a", 50);
        assert_eq!(usage_of("key-a"), 150);
        mark_exhausted("key-a", 500_000);
        assert_eq!(usage_of("key-a"), 500_000);
        teardown_usage_cache();
        assert_eq!(usage_of("key-a"), 0);
    }

    #[test]
    fn free_plan_keys_use_the_free_endpoint() {
        assert_eq!(
            deepl_endpoint("abc123:fx"),
            "https://api-free.deepl.com/v2/translate"
        );
        assert_eq!(deepl_endpoint("abc123"), "https://api.deepl.com/v2/translate");
    }

    #[test]
    fn google_response_concatenates_parts() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[[["Salut ","Hello ",null],["lume","world",null]],null,"en"]"#,
        )
        .unwrap();
        assert_eq!(parse_google_response(&body), Some("Salut lume".to_string()));
        assert_eq!(parse_google_response(&serde_json::json!([])), None);
    }
}
