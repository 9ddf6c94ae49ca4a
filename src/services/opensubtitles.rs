//! OpenSubtitles REST client (api.opensubtitles.com v1).
//!
//! Search is by precise identifiers only: IMDb id plus season/episode for
//! episodes. Login is lazy; the session token is dropped on container
//! shutdown via `logout`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SubwardenError};
use crate::subtitle::matcher::{Candidate, CandidateFlags, CandidateSource};

const DEFAULT_BASE_URL: &str = "https://api.opensubtitles.com/api/v1";
const USER_AGENT: &str = concat!("subwarden v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SearchEntry {
    pub id: String,
    pub attributes: SearchAttributes,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchAttributes {
    pub language: Option<String>,
    pub release: Option<String>,
    #[serde(default)]
    pub from_trusted: bool,
    #[serde(default)]
    pub ai_translated: bool,
    #[serde(default)]
    pub machine_translated: bool,
    #[serde(default)]
    pub hearing_impaired: bool,
    #[serde(default)]
    pub files: Vec<SearchFile>,
}

#[derive(Debug, Deserialize)]
pub struct SearchFile {
    pub file_id: i64,
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    link: String,
    file_name: Option<String>,
}

/// Map a search response to scoreable candidates. Entries without a
/// downloadable file are dropped.
pub fn candidates_from_search(response: SearchResponse) -> Vec<Candidate> {
    response
        .data
        .into_iter()
        .filter_map(|entry| {
            let file = entry.attributes.files.first()?;
            Some(Candidate {
                source: CandidateSource::OpenSubtitles,
                language: entry.attributes.language.clone().unwrap_or_default().to_lowercase(),
                id: entry.id,
                extracted_path: None,
                file_name: file.file_name.clone(),
                release_name: entry.attributes.release.clone(),
                flags: CandidateFlags {
                    from_trusted: entry.attributes.from_trusted,
                    ai_translated: entry.attributes.ai_translated,
                    machine_translated: entry.attributes.machine_translated,
                    hearing_impaired: entry.attributes.hearing_impaired,
                },
                score_bonus: 0,
                download_ref: Some(file.file_id.to_string()),
            })
        })
        .collect()
}

pub struct OpenSubtitlesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    username: Option<String>,
    password: Option<String>,
    token: Mutex<Option<String>>,
}

impl OpenSubtitlesClient {
    pub fn new(api_key: String, username: Option<String>, password: Option<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), api_key, username, password)
    }

    pub fn with_base_url(
        base_url: String,
        api_key: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            username,
            password,
            token: Mutex::new(None),
        }
    }

    async fn ensure_token(&self) -> Result<Option<String>> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            // API-key-only usage is valid for search and download.
            return Ok(None);
        };

        let mut token = self.token.lock().await;
        if token.is_none() {
            debug!("Logging in to OpenSubtitles as {}", username);
            let response = self
                .http
                .post(format!("{}/login", self.base_url))
                .header("Api-Key", &self.api_key)
                .header("User-Agent", USER_AGENT)
                .json(&serde_json::json!({"username": username, "password": password}))
                .send()
                .await
                .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles login: {}", e)))?;
            if !response.status().is_success() {
                return Err(SubwardenError::Provider(format!(
                    "OpenSubtitles login failed with status {}",
                    response.status()
                )));
            }
            let login: LoginResponse = response
                .json()
                .await
                .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles login body: {}", e)))?;
            *token = Some(login.token);
            info!("OpenSubtitles session established");
        }
        Ok(token.clone())
    }

    /// Search by IMDb id (and S/E for episodes) for the given languages.
    pub async fn search(
        &self,
        imdb_id: &str,
        season: Option<&str>,
        episode: Option<&str>,
        languages: &[&str],
    ) -> Result<Vec<Candidate>> {
        let token = self.ensure_token().await?;
        let numeric_imdb = imdb_id.trim_start_matches("tt");

        let mut request = self
            .http
            .get(format!("{}/subtitles", self.base_url))
            .header("Api-Key", &self.api_key)
            .header("User-Agent", USER_AGENT)
            .query(&[
                ("imdb_id", numeric_imdb.to_string()),
                ("languages", languages.join(",")),
                ("order_by", "download_count".to_string()),
            ]);
        if let (Some(season), Some(episode)) = (season, episode) {
            request = request.query(&[
                ("season_number", season.trim_start_matches('0')),
                ("episode_number", episode.trim_start_matches('0')),
            ]);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles search: {}", e)))?;
        if !response.status().is_success() {
            return Err(SubwardenError::Provider(format!(
                "OpenSubtitles search failed with status {}",
                response.status()
            )));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles search body: {}", e)))?;

        let candidates = candidates_from_search(body);
        info!(
            "OpenSubtitles search for tt{} returned {} candidates",
            numeric_imdb,
            candidates.len()
        );
        Ok(candidates)
    }

    /// Request a download link for a file id and fetch it into `dest_dir`.
    pub async fn download(&self, file_id: &str, dest_dir: &Path) -> Result<PathBuf> {
        let token = self.ensure_token().await?;
        let mut request = self
            .http
            .post(format!("{}/download", self.base_url))
            .header("Api-Key", &self.api_key)
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({"file_id": file_id.parse::<i64>().unwrap_or_default()}));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles download: {}", e)))?;
        if !response.status().is_success() {
            return Err(SubwardenError::Provider(format!(
                "OpenSubtitles download request failed with status {} (quota exhausted?)",
                response.status()
            )));
        }
        let download: DownloadResponse = response
            .json()
            .await
            .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles download body: {}", e)))?;

        let file_name = download
            .file_name
            .unwrap_or_else(|| format!("opensubtitles_{}.srt", file_id));
        let dest = dest_dir.join(sanitize_file_name(&file_name));

        let bytes = self
            .http
            .get(&download.link)
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles fetch: {}", e)))?
            .bytes()
            .await
            .map_err(|e| SubwardenError::Provider(format!("OpenSubtitles fetch body: {}", e)))?;
        tokio::fs::write(&dest, &bytes).await?;
        info!("Downloaded OpenSubtitles file {} to {}", file_id, dest.display());
        Ok(dest)
    }

    pub async fn logout(&self) -> Result<()> {
        let mut token = self.token.lock().await;
        if let Some(session) = token.take() {
            let result = self
                .http
                .delete(format!("{}/logout", self.base_url))
                .header("Api-Key", &self.api_key)
                .header("User-Agent", USER_AGENT)
                .bearer_auth(session)
                .send()
                .await;
            match result {
                Ok(_) => debug!("OpenSubtitles session closed"),
                Err(e) => warn!("OpenSubtitles logout request failed: {}", e),
            }
        }
        Ok(())
    }
}

/// Keep downloads inside the destination directory whatever the provider
/// put in `file_name`.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("subtitle.srt");
    base.replace(['/', '\\'], "_")
}
