//! Candidate scoring against the target media file.
//!
//! Token overlap gives the base score; release-quality tokens are weighted
//! by category so a candidate cut for the same rip scores far above a
//! generic name match. Episode identity is a hard gate: when the media file
//! carries S/E numbers, a candidate for a different episode is rejected
//! outright, whatever its score.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use super::parser::tokenize_and_normalize;

/// Score floor; penalties never drag a candidate below this.
const MIN_SCORE_FLOOR: i32 = -50;
const COMMON_TOKEN_POINTS: i32 = 5;

/// Release-quality categories with their weights. The cam/screener class is
/// an active penalty.
const CATEGORY_WEIGHTS: [(&str, i32, &[&str]); 12] = [
    (
        "hd-uhd",
        25,
        &[
            "8K", "4320p", "4K", "UHD", "2160p", "2048p", "2K", "QHD", "1080i", "1080p", "1440p",
            "HD", "720p", "HQ",
        ],
    ),
    (
        "streaming-service",
        15,
        &[
            "NF", "NFPD", "NETFLIX", "APPLE", "APPLETV", "ATVP", "AMZN", "Prime", "AMZ", "HBO",
            "HMAX", "MAX", "DSNP", "DSNY", "PCOK", "PMTP", "PARAMOUNT", "HULU", "TUBI", "PLUTO",
            "CRITERION", "iPLAYER", "STAN", "CRAV",
        ],
    ),
    (
        "hdr",
        12,
        &[
            "HDR", "HDR10", "HLG", "10bit", "12bit", "Dolby", "DolbyVision", "DoVi",
        ],
    ),
    (
        "web-rip",
        10,
        &[
            "WEBRip", "WEB", "WEBDL", "DL", "HDRip", "WEBMux", "VODRip", "HDWeb", "Rip",
        ],
    ),
    (
        "physical-media",
        9,
        &[
            "BluRay", "BRRip", "BDRip", "BD", "DVDRip", "DVD", "DVD5", "DVD9", "HDDVD", "PAL",
            "NTSC", "VCD", "SVCD",
        ],
    ),
    (
        "broadcast",
        8,
        &[
            "HDTV", "TVRip", "TV", "PDTV", "SDTV", "SATRip", "IPTV", "DVBRip", "DTV", "DSR",
        ],
    ),
    (
        "special-edition",
        7,
        &[
            "Extended", "IMAX", "Directors", "Unrated", "Criterion", "Redux", "Ultimate",
            "Theatrical", "Remastered", "UNCUT", "Limited",
        ],
    ),
    (
        "file-modification",
        5,
        &["PROPER", "REPACK", "INTERNAL", "READNFO", "DUBBED", "SUBBED", "REMUX"],
    ),
    (
        "video-codec",
        4,
        &["x265", "h265", "265", "x264", "h264", "264", "HEVC", "AV1", "AVC", "XviD", "DivX"],
    ),
    (
        "audio-codec",
        3,
        &["AAC", "AC3", "EAC3", "DTS", "TrueHD", "Atmos", "DDP5", "DD5", "FLAC", "OPUS"],
    ),
    ("web-series", 1, &["WebSeries", "WebEpisode", "WebSeason"]),
    (
        "cam-screener",
        -20,
        &[
            "CAM", "HDCAM", "CamRip", "TS", "TeleSync", "TC", "Telecine", "DVDScr", "Screener",
            "SCR", "PreDVDRip",
        ],
    ),
];

/// Common 3-letter to 2-letter language code mappings seen in subtitle
/// filenames.
const LANG_3_TO_2: [(&str, &str); 12] = [
    ("eng", "en"),
    ("rum", "ro"),
    ("ron", "ro"),
    ("fre", "fr"),
    ("fra", "fr"),
    ("ger", "de"),
    ("deu", "de"),
    ("spa", "es"),
    ("ita", "it"),
    ("por", "pt"),
    ("hun", "hu"),
    ("bul", "bg"),
];

fn compiled_categories() -> &'static Vec<(i32, Vec<Regex>)> {
    static COMPILED: OnceLock<Vec<(i32, Vec<Regex>)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        CATEGORY_WEIGHTS
            .iter()
            .map(|(_, weight, criteria)| {
                let patterns = criteria
                    .iter()
                    .filter_map(|criterion| {
                        Regex::new(&format!(r"(?i)\b{}\b", regex::escape(criterion))).ok()
                    })
                    .collect();
                (*weight, patterns)
            })
            .collect()
    })
}

fn season_episode_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?i)\bS(\d{1,3})\s?E(\d{1,3})\b").expect("SxxEyy regex"),
            Regex::new(r"(?i)\b(\d{1,3})\s?x\s?(\d{1,3})\b").expect("NxM regex"),
            Regex::new(r"(?i)\b(?:Season\s)?(\d{1,3})\s(?:Episode|Ep)\s(\d{1,3})\b")
                .expect("Season N Episode M regex"),
        ]
    })
}

fn episode_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bE[p]?(?:isode)?\s?(\d{1,3})\b").expect("episode-only regex"))
}

/// Extract zero-padded season and episode numbers from a filename.
/// Season+episode patterns win over episode-only patterns.
pub fn extract_season_episode(filename: &str) -> (Option<String>, Option<String>) {
    if filename.is_empty() {
        return (None, None);
    }
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[._\-]+").expect("separator regex"));
    let clean = separators.replace_all(stem, " ");

    for pattern in season_episode_res() {
        if let Some(caps) = pattern.captures(&clean) {
            let season = caps[1].to_string();
            let episode = caps[2].to_string();
            if season.len() <= 3 && episode.len() <= 3 {
                return (Some(zero_pad(&season)), Some(zero_pad(&episode)));
            }
        }
    }
    if let Some(caps) = episode_only_re().captures(&clean) {
        return (None, Some(zero_pad(&caps[1])));
    }
    (None, None)
}

fn zero_pad(number: &str) -> String {
    if number.len() >= 2 {
        number.to_string()
    } else {
        format!("0{}", number)
    }
}

/// Episode identity check: episodes must match; seasons must match when
/// both sides carry one.
pub fn is_matching_episode(media_filename: &str, subtitle_filename: &str) -> bool {
    let (media_s, media_e) = extract_season_episode(media_filename);
    let (sub_s, sub_e) = extract_season_episode(subtitle_filename);

    let (Some(media_e), Some(sub_e)) = (media_e, sub_e) else {
        return false;
    };
    if media_e != sub_e {
        return false;
    }
    if let (Some(media_s), Some(sub_s)) = (media_s, sub_s) {
        if media_s != sub_s {
            return false;
        }
    }
    true
}

/// Normalize a language tag to its 2-letter code (`eng` -> `en`); 2-letter
/// codes pass through, unmappable 3-letter codes are unknown.
pub fn normalize_language_code(code: &str) -> Option<String> {
    let raw = code.trim().to_lowercase();
    if let Some((_, mapped)) = LANG_3_TO_2.iter().find(|(three, _)| *three == raw) {
        return Some(mapped.to_string());
    }
    if raw.len() == 2 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(raw);
    }
    None
}

/// Extract a 2-letter language code from a subtitle filename suffix
/// (`movie.en.srt`, `movie_rum.srt`). Unmappable 3-letter codes count as
/// unknown.
pub fn get_subtitle_language_code(filename: &str) -> Option<String> {
    let path = Path::new(filename);
    let ext = path.extension()?.to_str()?.to_lowercase();
    if !matches!(ext.as_str(), "srt" | "sub" | "ass" | "vtt") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;

    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let suffix = SUFFIX.get_or_init(|| Regex::new(r"[._\-]([a-zA-Z]{2,3})$").expect("suffix regex"));
    let raw = suffix.captures(stem)?.get(1)?.as_str().to_lowercase();

    if let Some((_, mapped)) = LANG_3_TO_2.iter().find(|(three, _)| *three == raw) {
        return Some(mapped.to_string());
    }
    if raw.len() == 2 {
        return Some(raw);
    }
    None
}

/// Base token-overlap score plus weighted category bonuses for common
/// tokens.
pub fn calculate_match_score(media_tokens: &[String], subtitle_tokens: &[String]) -> i32 {
    if media_tokens.is_empty() || subtitle_tokens.is_empty() {
        return 0;
    }

    let media_set: std::collections::HashSet<&str> =
        media_tokens.iter().map(|t| t.as_str()).collect();
    let subtitle_set: std::collections::HashSet<&str> =
        subtitle_tokens.iter().map(|t| t.as_str()).collect();
    let common: Vec<&str> = subtitle_set.intersection(&media_set).copied().collect();

    let mut score = common.len() as i32 * COMMON_TOKEN_POINTS;

    let mut weighted_bonus = 0;
    for token in &common {
        for (weight, patterns) in compiled_categories() {
            if patterns.iter().any(|pattern| pattern.is_match(token)) {
                weighted_bonus += weight;
            }
        }
    }
    score += weighted_bonus;
    if weighted_bonus != 0 {
        debug!(
            "Score breakdown: common={}, weighted={} -> {}",
            common.len() as i32 * COMMON_TOKEN_POINTS,
            weighted_bonus,
            score
        );
    }
    score
}

/// Where a candidate came from; drives which name is scored and which
/// bonuses apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    OpenSubtitles,
    SubsRo,
    Local,
    Embedded,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateFlags {
    pub from_trusted: bool,
    pub ai_translated: bool,
    pub machine_translated: bool,
    pub hearing_impaired: bool,
}

/// A subtitle artifact eligible for scoring: a downloaded/extracted file or
/// a provider search result.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: CandidateSource,
    pub language: String,
    pub id: String,
    /// Path to the extracted file, for archive providers.
    pub extracted_path: Option<std::path::PathBuf>,
    pub file_name: Option<String>,
    pub release_name: Option<String>,
    pub flags: CandidateFlags,
    pub score_bonus: i32,
    /// Provider-specific download reference (e.g. OpenSubtitles file id).
    pub download_ref: Option<String>,
}

/// Score a candidate. Returns `(score, language_priority)` where priority 1
/// is the required language and 3 anything else, or None when the candidate
/// is rejected (episode mismatch, nothing to score against).
pub fn score_candidate(
    candidate: &Candidate,
    media_tokens: &[String],
    media_basename: &str,
    media_episode: Option<&str>,
    required_language: &str,
) -> Option<(i32, u8)> {
    let priority = if candidate.language.eq_ignore_ascii_case(required_language) {
        1
    } else {
        3
    };

    // Episode match is mandatory when the media file is an episode.
    let name_for_episode_check = candidate
        .extracted_path
        .as_ref()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .or_else(|| candidate.file_name.clone())
        .or_else(|| candidate.release_name.clone())
        .unwrap_or_else(|| candidate.id.clone());
    if media_episode.is_some() && !is_matching_episode(media_basename, &name_for_episode_check) {
        debug!(
            "Rejecting candidate {} ({:?}): episode mismatch against '{}'",
            candidate.id, candidate.source, name_for_episode_check
        );
        return None;
    }

    let name_for_scoring = match candidate.source {
        CandidateSource::OpenSubtitles => candidate
            .release_name
            .clone()
            .filter(|name| name.len() > 5)
            .or_else(|| candidate.file_name.clone())
            .unwrap_or_default(),
        _ => {
            // Score the actual filename, with the language suffix removed so
            // it does not dilute the token overlap.
            let base = candidate
                .extracted_path
                .as_ref()
                .and_then(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
                .or_else(|| candidate.file_name.clone())
                .unwrap_or_default();
            let pattern = format!(r"(?i)[._\-]{}$", regex::escape(&candidate.language));
            Regex::new(&pattern)
                .map(|re| re.replace(&base, "").trim_matches(['.', '_', '-', ' ']).to_string())
                .unwrap_or(base)
        }
    };

    let mut score = if name_for_scoring.is_empty() {
        if candidate.extracted_path.is_some() {
            1
        } else {
            0
        }
    } else {
        calculate_match_score(media_tokens, &tokenize_and_normalize(&name_for_scoring))
    };

    if candidate.flags.from_trusted {
        score += 5;
    }
    if candidate.flags.ai_translated || candidate.flags.machine_translated {
        score -= 20;
    }
    if candidate.flags.hearing_impaired {
        score -= 2;
    }
    score += candidate.score_bonus;
    score = score.max(MIN_SCORE_FLOOR);

    debug!(
        "Scored candidate {} ({:?}, lang {}, prio {}): {}",
        candidate.id, candidate.source, candidate.language, priority, score
    );
    Some((score, priority))
}

/// Order scored candidates best-first: required language before others,
/// higher score first within a language class.
pub fn rank_candidates(mut scored: Vec<(i32, u8, Candidate)>) -> Vec<(i32, u8, Candidate)> {
    scored.sort_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));
    scored
}
