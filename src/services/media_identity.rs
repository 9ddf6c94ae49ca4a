//! Media identity: what movie or episode a video file actually is.
//!
//! Filename parsing yields title/year or show/season/episode; the IMDb
//! suggestion endpoint resolves the identity to an IMDb id when the network
//! is available. Online search strategies require the id and skip
//! themselves when resolution failed.

use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SubwardenError};
use crate::subtitle::matcher::extract_season_episode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Movie,
    Episode,
}

#[derive(Debug, Clone)]
pub struct MediaIdentity {
    pub basename: String,
    pub title: String,
    pub year: Option<i32>,
    pub season: Option<String>,
    pub episode: Option<String>,
    pub imdb_id: Option<String>,
    pub kind: MediaKind,
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").expect("year regex"))
}

fn se_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bS\d{1,3}\s?E\d{1,3}\b|\b\d{1,3}\s?x\s?\d{1,3}\b").expect("se marker regex")
    })
}

/// Parse identity signals out of a video filename.
pub fn parse_media_identity(video_path: &Path) -> MediaIdentity {
    let basename = video_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let stem = video_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[._]+").expect("separator regex"));
    let clean = separators.replace_all(stem, " ").to_string();

    let (season, episode) = extract_season_episode(&basename);
    let year_match = year_re().find(&clean);
    let se_match = se_marker_re().find(&clean);

    // The title is whatever precedes the first structural marker.
    let cut = [year_match.map(|m| m.start()), se_match.map(|m| m.start())]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(clean.len());
    let title = clean[..cut].trim_matches(['-', ' ']).trim().to_string();
    let title = if title.is_empty() { clean.trim().to_string() } else { title };

    let year = year_match.and_then(|m| m.as_str().parse::<i32>().ok());
    let kind = if episode.is_some() {
        MediaKind::Episode
    } else {
        MediaKind::Movie
    };

    debug!(
        "Parsed identity for '{}': title='{}', year={:?}, S{:?}E{:?}",
        basename, title, year, season, episode
    );
    MediaIdentity {
        basename,
        title,
        year,
        season,
        episode,
        imdb_id: None,
        kind,
    }
}

#[derive(Debug, Deserialize)]
struct SuggestionResponse {
    #[serde(default)]
    d: Vec<SuggestionEntry>,
}

#[derive(Debug, Deserialize)]
struct SuggestionEntry {
    id: String,
    y: Option<i32>,
}

/// Pick the best `tt...` id from a suggestion response, preferring an exact
/// year match.
pub fn pick_suggestion(raw: &str, year: Option<i32>) -> Option<String> {
    let response: SuggestionResponse = serde_json::from_str(raw).ok()?;
    let titles: Vec<&SuggestionEntry> = response
        .d
        .iter()
        .filter(|entry| entry.id.starts_with("tt"))
        .collect();

    if let Some(year) = year {
        if let Some(exact) = titles.iter().find(|entry| entry.y == Some(year)) {
            return Some(exact.id.clone());
        }
    }
    titles.first().map(|entry| entry.id.clone())
}

pub struct MediaIdentityService {
    http: reqwest::Client,
}

impl Default for MediaIdentityService {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaIdentityService {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Resolve a title (and optional year) to an IMDb id via the public
    /// suggestion endpoint.
    pub async fn lookup_imdb_id(&self, title: &str, year: Option<i32>) -> Result<Option<String>> {
        let query = title.trim().to_lowercase();
        if query.is_empty() {
            return Ok(None);
        }
        let first_char = query.chars().next().unwrap_or('x');
        let url = format!(
            "https://v3.sg.media-imdb.com/suggestion/{}/{}.json",
            first_char,
            urlencode(&query)
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("IMDb suggestion request: {}", e)))?;
        if !response.status().is_success() {
            warn!("IMDb suggestion lookup failed with status {}", response.status());
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|e| SubwardenError::Provider(format!("IMDb suggestion body: {}", e)))?;

        let id = pick_suggestion(&body, year);
        match &id {
            Some(id) => info!("Resolved '{}' ({:?}) to IMDb id {}", title, year, id),
            None => warn!("No IMDb id found for '{}' ({:?})", title, year),
        }
        Ok(id)
    }

    /// Fill `imdb_id` on an identity, leaving it None on lookup failure;
    /// the pipeline carries on without online search in that case.
    pub async fn resolve(&self, identity: &mut MediaIdentity) {
        if identity.imdb_id.is_some() || identity.title.is_empty() {
            return;
        }
        match self.lookup_imdb_id(&identity.title, identity.year).await {
            Ok(id) => identity.imdb_id = id,
            Err(e) => warn!("IMDb resolution failed for '{}': {}", identity.title, e),
        }
    }
}

fn urlencode(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_string()
            } else if c == ' ' {
                "%20".to_string()
            } else {
                let mut out = String::new();
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", byte));
                }
                out
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movie_identity_from_filename() {
        let identity = parse_media_identity(Path::new("/m/The.Movie.Title.2021.1080p.WEBRip.mkv"));
        assert_eq!(identity.title, "The Movie Title");
        assert_eq!(identity.year, Some(2021));
        assert_eq!(identity.kind, MediaKind::Movie);
        assert_eq!(identity.episode, None);
    }

    #[test]
    fn episode_identity_from_filename() {
        let identity = parse_media_identity(Path::new("/tv/Great.Show.S02E05.720p.HDTV.mkv"));
        assert_eq!(identity.title, "Great Show");
        assert_eq!(identity.kind, MediaKind::Episode);
        assert_eq!(identity.season.as_deref(), Some("02"));
        assert_eq!(identity.episode.as_deref(), Some("05"));
    }

    #[test]
    fn title_falls_back_to_whole_stem() {
        let identity = parse_media_identity(Path::new("/m/somefilm.mkv"));
        assert_eq!(identity.title, "somefilm");
        assert_eq!(identity.year, None);
    }

    #[test]
    fn suggestion_picking_prefers_year_match() {
        let raw = r#"{"d":[
            {"id":"tt0111161","l":"The Movie","y":1994},
            {"id":"tt2000001","l":"The Movie","y":2021},
            {"id":"nm0000001","l":"Somebody"}
        ]}"#;
        assert_eq!(pick_suggestion(raw, Some(2021)), Some("tt2000001".to_string()));
        assert_eq!(pick_suggestion(raw, Some(1980)), Some("tt0111161".to_string()));
        assert_eq!(pick_suggestion(raw, None), Some("tt0111161".to_string()));
        assert_eq!(pick_suggestion("{}", None), None);
    }

    #[test]
    fn urlencode_handles_spaces_and_unicode() {
        assert_eq!(urlencode("the movie"), "the%20movie");
        assert_eq!(urlencode("țară"), "%C8%9Bar%C4%83");
    }
}
