//! SRT parsing and normalization utilities.
//!
//! Romanian subtitles in the wild carry two recurring defects: legacy
//! code-page diacritics (ª/º/Þ/þ) and cedilla forms (ş/ţ) where the
//! comma-below forms (ș/ț) belong. Both repairs are idempotent, which the
//! translator relies on when it re-processes already-normalized files.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// (incorrect, correct) pairs; legacy code-page characters first, then
/// cedilla-to-comma-below.
const DIACRITIC_REPLACEMENTS: [(&str, &str); 8] = [
    ("\u{aa}", "Ș"), // ª
    ("\u{ba}", "ș"), // º
    ("\u{de}", "Ț"), // Þ
    ("\u{fe}", "ț"), // þ
    ("Ş", "Ș"),
    ("ş", "ș"),
    ("Ţ", "Ț"),
    ("ţ", "ț"),
];

fn timestamp_dot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{2}:\d{2}:\d{2})\.(\d{3})").expect("timestamp dot regex"))
}

fn timestamp_arrow_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{2}:\d{2}:\d{2},\d{3})\s*--?>\s*(\d{2}:\d{2}:\d{2},\d{3})")
            .expect("timestamp arrow regex")
    })
}

fn timestamp_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{2}:\d{2}:\d{2},\d{3}\s*-->\s*\d{2}:\d{2}:\d{2},\d{3}")
            .expect("timestamp line regex")
    })
}

/// Minimal HTML entity unescape covering what subtitle files actually
/// contain. Applied twice by `fix_diacritics` for nested entities.
fn unescape_html_entities(text: &str) -> String {
    let mut out = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ");
    // Numeric entities, decimal and hex.
    static NUMERIC: OnceLock<Regex> = OnceLock::new();
    let numeric = NUMERIC.get_or_init(|| Regex::new(r"&#(x?[0-9a-fA-F]+);").expect("entity regex"));
    out = numeric
        .replace_all(&out, |caps: &regex::Captures| {
            let body = &caps[1];
            let parsed = if let Some(hex) = body.strip_prefix('x').or_else(|| body.strip_prefix('X')) {
                u32::from_str_radix(hex, 16)
            } else {
                body.parse::<u32>()
            };
            parsed
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();
    // `&amp;` last so `&amp;lt;` resolves over two passes, not one.
    out.replace("&amp;", "&")
}

/// Decode raw subtitle bytes to text. BOM-marked encodings win, strict
/// UTF-8 is tried next, and anything else decodes as windows-1250: the
/// legacy code page the cp1250/cp1252/latin-2 family of Romanian and
/// English subtitle files actually ships in.
pub fn decode_subtitle_bytes(bytes: &[u8]) -> String {
    if let Some((encoding, _)) = encoding_rs::Encoding::for_bom(bytes) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    debug!("Subtitle content is not UTF-8; decoding as windows-1250");
    let (text, _) = encoding_rs::WINDOWS_1250.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Read a subtitle file with the charset fallback applied.
pub fn read_subtitle_file(path: &std::path::Path) -> std::io::Result<String> {
    Ok(decode_subtitle_bytes(&std::fs::read(path)?))
}

/// Fix common incorrect Romanian diacritics and unescape HTML entities.
pub fn fix_diacritics(text: &str) -> String {
    let mut corrected = unescape_html_entities(text);
    corrected = unescape_html_entities(&corrected);
    for (wrong, right) in DIACRITIC_REPLACEMENTS {
        corrected = corrected.replace(wrong, right);
    }
    if corrected != text {
        debug!("Applied diacritic/HTML entity corrections");
    }
    corrected
}

/// Ensure SRT timestamps use the comma decimal separator and the canonical
/// ` --> ` arrow.
pub fn ensure_correct_timestamp_format(content: &str) -> String {
    let corrected = timestamp_dot_re().replace_all(content, "$1,$2");
    timestamp_arrow_re()
        .replace_all(&corrected, "$1 --> $2")
        .into_owned()
}

/// Lower-case alphanumeric tokens for filename matching. Underscores and
/// every other non-alphanumeric character separate tokens.
pub fn tokenize_and_normalize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

/// One SRT entry: the index line, the timestamp line and the (possibly
/// multi-line) text block. Lines are kept verbatim so a rebuild preserves
/// the numbering and timing exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtSegment {
    pub index_line: String,
    pub timestamp_line: String,
    pub text: String,
}

/// Parse SRT content into segments, tolerating stray blank lines and
/// malformed blocks (which are skipped with a warning).
pub fn parse_srt_into_segments(content: &str) -> Vec<SrtSegment> {
    let corrected = ensure_correct_timestamp_format(content.trim());
    let mut segments = Vec::new();

    enum State {
        Index,
        Timestamp,
        Text,
    }

    let mut state = State::Index;
    let mut index_line: Option<String> = None;
    let mut timestamp_line: Option<String> = None;
    let mut text_lines: Vec<String> = Vec::new();

    let flush =
        |index_line: &mut Option<String>, timestamp_line: &mut Option<String>, text_lines: &mut Vec<String>, segments: &mut Vec<SrtSegment>| {
            if let (Some(index), Some(timestamp)) = (index_line.take(), timestamp_line.take()) {
                segments.push(SrtSegment {
                    index_line: index,
                    timestamp_line: timestamp,
                    text: text_lines.join("\n"),
                });
            }
            text_lines.clear();
        };

    for (line_number, line) in corrected.lines().enumerate() {
        let stripped = line.trim();
        match state {
            State::Index => {
                if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
                    index_line = Some(line.to_string());
                    state = State::Timestamp;
                } else if !stripped.is_empty() {
                    warn!(
                        "SRT parse (line {}): expected index number, found '{}'; skipping",
                        line_number + 1,
                        stripped
                    );
                }
            }
            State::Timestamp => {
                if timestamp_line_re().is_match(stripped) {
                    timestamp_line = Some(line.to_string());
                    state = State::Text;
                } else if !stripped.is_empty() {
                    warn!(
                        "SRT parse (line {}): expected timestamp, found '{}'; resetting segment",
                        line_number + 1,
                        stripped
                    );
                    index_line = None;
                    state = State::Index;
                }
            }
            State::Text => {
                if stripped.is_empty() {
                    flush(&mut index_line, &mut timestamp_line, &mut text_lines, &mut segments);
                    state = State::Index;
                } else {
                    text_lines.push(line.to_string());
                }
            }
        }
    }
    // Final block without a trailing blank line.
    if matches!(state, State::Text) {
        flush(&mut index_line, &mut timestamp_line, &mut text_lines, &mut segments);
    }

    if segments.is_empty() && !corrected.is_empty() {
        warn!("SRT parsing produced zero segments; check the input format");
    }
    segments
}

/// Rebuild SRT content from segments: one blank line between entries, one
/// trailing newline.
pub fn rebuild_srt_from_segments(segments: &[SrtSegment]) -> String {
    let blocks: Vec<String> = segments
        .iter()
        .filter(|segment| {
            let valid = !segment.index_line.trim().is_empty()
                && segment.timestamp_line.contains("-->");
            if !valid {
                warn!("Skipping invalid segment during SRT rebuild");
            }
            valid
        })
        .map(|segment| {
            format!(
                "{}\n{}\n{}",
                segment.index_line.trim_end(),
                segment.timestamp_line.trim_end(),
                segment.text
            )
        })
        .collect();

    if blocks.is_empty() {
        return String::new();
    }
    let mut result = blocks.join("\n\n");
    result = result.trim_end().to_string();
    result.push('\n');
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:03,500\nHello there\n\n2\n00:00:04,000 --> 00:00:06,000\nSecond line\nwith continuation\n";

    #[test]
    fn parse_extracts_segments() {
        let segments = parse_srt_into_segments(SAMPLE);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].index_line, "1");
        assert_eq!(segments[1].text, "Second line\nwith continuation");
    }

    #[test]
    fn parse_rebuild_parse_is_a_fixpoint() {
        let first = parse_srt_into_segments(SAMPLE);
        let rebuilt = rebuild_srt_from_segments(&first);
        let second = parse_srt_into_segments(&rebuilt);
        assert_eq!(first, second);
        // And a second rebuild changes nothing.
        assert_eq!(rebuilt, rebuild_srt_from_segments(&second));
    }

    #[test]
    fn parse_survives_missing_trailing_blank_line() {
        let segments = parse_srt_into_segments("1\n00:00:01,000 --> 00:00:02,000\nlast");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "last");
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        let content = "garbage\n1\n00:00:01,000 --> 00:00:02,000\nok\n\nnot-a-number\nstill not\n\n2\n00:00:03,000 --> 00:00:04,000\nalso ok\n";
        let segments = parse_srt_into_segments(content);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn timestamp_format_is_normalized() {
        let fixed = ensure_correct_timestamp_format("00:00:01.234 -> 00:00:02.000");
        assert_eq!(fixed, "00:00:01,234 --> 00:00:02,000");
        let fixed = ensure_correct_timestamp_format("00:00:01,234-->00:00:02,000");
        assert_eq!(fixed, "00:00:01,234 --> 00:00:02,000");
    }

    #[test]
    fn utf8_content_passes_through_decoding() {
        assert_eq!(decode_subtitle_bytes("țară".as_bytes()), "țară");
        assert_eq!(decode_subtitle_bytes(b""), "");
    }

    #[test]
    fn legacy_single_byte_content_is_decoded() {
        // 0xE9 is not valid UTF-8 on its own; in windows-1250 it is 'é'.
        assert_eq!(decode_subtitle_bytes(b"caf\xE9"), "caf\u{e9}");
    }

    #[test]
    fn bom_marked_content_is_decoded() {
        // UTF-16LE BOM followed by "Hi".
        let bytes = [0xFF, 0xFE, b'H', 0x00, b'i', 0x00];
        assert_eq!(decode_subtitle_bytes(&bytes), "Hi");
        // UTF-8 BOM is stripped.
        let bytes = [0xEF, 0xBB, 0xBF, b'o', b'k'];
        assert_eq!(decode_subtitle_bytes(&bytes), "ok");
    }

    #[test]
    fn read_subtitle_file_applies_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.srt");
        std::fs::write(&path, b"1\n00:00:01,000 --> 00:00:02,000\ncaf\xE9\n").unwrap();
        let content = read_subtitle_file(&path).unwrap();
        assert!(content.contains("caf\u{e9}"));
    }

    #[test]
    fn fix_diacritics_repairs_legacy_and_cedilla_forms() {
        assert_eq!(fix_diacritics("\u{de}ar\u{ba}"), "Țarș");
        assert_eq!(fix_diacritics("şţŞŢ"), "șțȘȚ");
        assert_eq!(fix_diacritics("a &amp; b &lt;i&gt;"), "a & b <i>");
        assert_eq!(fix_diacritics("&#x219;i &#539;ara"), "și țara");
    }

    #[test]
    fn fix_diacritics_is_idempotent_on_normalized_input() {
        let once = fix_diacritics("Aş vrea să ştiu ţara &amp; restul");
        let twice = fix_diacritics(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn tokenization_lowercases_and_splits() {
        assert_eq!(
            tokenize_and_normalize("The.Movie_Title-2023 (1080p)"),
            vec!["the", "movie", "title", "2023", "1080p"]
        );
        assert!(tokenize_and_normalize("...").is_empty());
    }
}
