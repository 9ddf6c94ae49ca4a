//! Subs.ro-style archive provider: search pages list subtitle archives per
//! IMDb id; downloads are ZIP or RAR archives containing one or more
//! subtitle files, from which the best inner match is picked by the caller.
//! RAR needs the external unrar tool; its absence fails only the affected
//! candidate.

use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SubwardenError};
use crate::services::sync_tools::is_tool_available;

fn download_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"href="([^"]*(?:download|descarca)[^"]*)""#).expect("download link regex")
    })
}

/// Pull archive download links out of a search page, preserving order and
/// dropping duplicates.
pub fn extract_download_urls(page: &str, base_url: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    download_link_re()
        .captures_iter(page)
        .map(|caps| caps[1].to_string())
        .map(|href| {
            if href.starts_with("http") {
                href
            } else {
                format!("{}/{}", base_url.trim_end_matches('/'), href.trim_start_matches('/'))
            }
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const RAR_MAGIC: [u8; 4] = [0x52, 0x61, 0x72, 0x21]; // "Rar!"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    Unknown,
}

/// Sniff the archive format from its leading bytes; providers are not
/// reliable about extensions or content types.
pub fn detect_archive_kind(header: &[u8]) -> ArchiveKind {
    if header.starts_with(&ZIP_MAGIC) {
        ArchiveKind::Zip
    } else if header.starts_with(&RAR_MAGIC) {
        ArchiveKind::Rar
    } else {
        ArchiveKind::Unknown
    }
}

/// Extract an archive into `dest_dir`. ZIP is handled in-process; RAR goes
/// through the external unrar tool (availability-probed), since subtitle
/// providers ship both. Unknown headers fall back to the ZIP reader, which
/// produces the error message.
pub async fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    unrar_path: &str,
) -> Result<usize> {
    let header = {
        let mut file = std::fs::File::open(archive_path)?;
        let mut buffer = [0u8; 8];
        let read = file.read(&mut buffer)?;
        buffer[..read].to_vec()
    };

    match detect_archive_kind(&header) {
        ArchiveKind::Rar => extract_rar_archive(archive_path, dest_dir, unrar_path).await,
        ArchiveKind::Zip | ArchiveKind::Unknown => extract_zip_archive(archive_path, dest_dir),
    }
}

/// ZIP extraction. Entry names are flattened to their base name so an
/// archive cannot write outside the directory.
fn extract_zip_archive(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| SubwardenError::Provider(format!("Unreadable archive: {}", e)))?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| SubwardenError::Provider(format!("Corrupt archive entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = Path::new(entry.name())
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string());
        let Some(name) = name else { continue };

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| SubwardenError::Provider(format!("Failed to read archive entry: {}", e)))?;
        std::fs::write(dest_dir.join(&name), contents)?;
        extracted += 1;
    }
    debug!(
        "Extracted {} entries from {} into {}",
        extracted,
        archive_path.display(),
        dest_dir.display()
    );
    Ok(extracted)
}

/// RAR extraction via the external unrar tool. unrar follows multi-volume
/// sets from the first volume on its own.
async fn extract_rar_archive(
    archive_path: &Path,
    dest_dir: &Path,
    unrar_path: &str,
) -> Result<usize> {
    if !is_tool_available(unrar_path).await {
        return Err(SubwardenError::Provider(format!(
            "'{}' unavailable; cannot extract RAR archive {}",
            unrar_path,
            archive_path.display()
        )));
    }

    let output = Command::new(unrar_path)
        .arg("x")
        .arg("-o+")
        .arg("-y")
        .arg(archive_path)
        .arg(dest_dir)
        .output()
        .await
        .map_err(|e| SubwardenError::Provider(format!("Failed to run unrar: {}", e)))?;
    if !output.status.success() {
        return Err(SubwardenError::Provider(format!(
            "unrar failed on {}: {}",
            archive_path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let extracted = WalkDir::new(dest_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path() != archive_path)
        .count();
    debug!(
        "unrar extracted {} files from {} into {}",
        extracted,
        archive_path.display(),
        dest_dir.display()
    );
    Ok(extracted)
}

/// Recursively list subtitle files under a directory, skipping backups.
pub fn find_subtitle_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_lowercase();
            let is_subtitle = name.ends_with(".srt") || name.ends_with(".sub") || name.ends_with(".ass");
            is_subtitle && !name.ends_with(".bak") && !name.ends_with(".syncbak")
        })
        .collect()
}

pub struct SubsRoClient {
    http: reqwest::Client,
    base_url: String,
    unrar_path: String,
}

impl SubsRoClient {
    pub fn new(base_url: String, unrar_path: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            unrar_path,
        }
    }

    /// Extract a downloaded archive (ZIP or RAR) into `dest_dir`.
    pub async fn extract_archive(&self, archive_path: &Path, dest_dir: &Path) -> Result<usize> {
        extract_archive(archive_path, dest_dir, &self.unrar_path).await
    }

    /// Find archive download URLs for an IMDb id and language.
    pub async fn find_subtitle_download_urls(
        &self,
        imdb_id: &str,
        language_code: &str,
    ) -> Result<Vec<String>> {
        let numeric = imdb_id.trim_start_matches("tt");
        let url = format!(
            "{}/subtitrari/imdbid/{}?lang={}",
            self.base_url.trim_end_matches('/'),
            numeric,
            language_code
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("Subs.ro search: {}", e)))?;
        if !response.status().is_success() {
            return Err(SubwardenError::Provider(format!(
                "Subs.ro search failed with status {}",
                response.status()
            )));
        }
        let page = response
            .text()
            .await
            .map_err(|e| SubwardenError::Provider(format!("Subs.ro search body: {}", e)))?;
        let urls = extract_download_urls(&page, &self.base_url);
        info!(
            "Subs.ro search for tt{} ({}) found {} archives",
            numeric,
            language_code,
            urls.len()
        );
        Ok(urls)
    }

    /// Download one archive into `dest_dir`; returns the archive path.
    pub async fn download_subtitle_archive(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_prefix: &str,
    ) -> Result<PathBuf> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SubwardenError::Provider(format!("Subs.ro download: {}", e)))?;
        if !response.status().is_success() {
            return Err(SubwardenError::Provider(format!(
                "Subs.ro download failed with status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SubwardenError::Provider(format!("Subs.ro download body: {}", e)))?;
        if bytes.is_empty() {
            warn!("Subs.ro archive at {} was empty", url);
            return Err(SubwardenError::Provider("Empty archive download".to_string()));
        }

        let dest = dest_dir.join(format!("{}.zip", filename_prefix));
        tokio::fs::write(&dest, &bytes).await?;
        Ok(dest)
    }
}
