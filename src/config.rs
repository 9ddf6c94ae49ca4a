use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub server: ServerConfig,
    pub jobs: JobConfig,
    pub providers: ProviderConfig,
    pub tools: ToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub worker_concurrency: usize,
    pub stream_token_ttl_sec: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// External script the supervisor spawns. Empty means "this binary,
    /// `process` subcommand" resolved at spawn time.
    pub worker_script_path: String,
    pub timeout_sec: u64,
    pub terminate_grace_period_s: u64,
    pub result_message_max_len: usize,
    pub log_snippet_max_len: usize,
    pub max_retries: u32,
    pub log_history_max_items: usize,
    pub allowed_media_folders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub opensubtitles_api_key: Option<String>,
    pub opensubtitles_username: Option<String>,
    pub opensubtitles_password: Option<String>,
    pub subsro_base_url: Option<String>,
    pub deepl_api_keys: Vec<String>,
    pub deepl_character_quota: u64,
    pub min_overall_score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub ffprobe_path: String,
    pub ffmpeg_path: String,
    pub ffsubsync_path: String,
    pub alass_cli_path: String,
    pub unrar_path: String,
    pub ocr_tool_path: Option<String>,
    pub sync_offset_threshold: f64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load from environment variables with defaults. Database-level
    /// overrides are applied afterwards via [`Config::apply_overrides`];
    /// precedence is database over environment over default, computed once
    /// at startup.
    pub fn load() -> Result<Self> {
        Ok(Config {
            database_url: env_or("DATABASE_URL", "sqlite://subwarden.db?mode=rwc"),
            server: ServerConfig {
                bind_addr: env_or("BIND_ADDR", "127.0.0.1:8085"),
                worker_concurrency: env_parse("WORKER_CONCURRENCY", 2),
                stream_token_ttl_sec: env_parse("STREAM_TOKEN_TTL_SEC", 60),
            },
            jobs: JobConfig {
                worker_script_path: env_or("SUBTITLE_WORKER_SCRIPT_PATH", ""),
                timeout_sec: env_parse("JOB_TIMEOUT_SEC", 900),
                terminate_grace_period_s: env_parse("PROCESS_TERMINATE_GRACE_PERIOD_S", 5),
                result_message_max_len: env_parse("JOB_RESULT_MESSAGE_MAX_LEN", 500),
                log_snippet_max_len: env_parse("JOB_LOG_SNIPPET_MAX_LEN", 50_000),
                max_retries: env_parse("JOB_MAX_RETRIES", 2),
                log_history_max_items: env_parse("LOG_HISTORY_MAX_ITEMS", 1000),
                allowed_media_folders: env_opt("ALLOWED_MEDIA_FOLDERS")
                    .map(|raw| split_csv(&raw))
                    .unwrap_or_default(),
            },
            providers: ProviderConfig {
                opensubtitles_api_key: env_opt("OPENSUBTITLES_API_KEY"),
                opensubtitles_username: env_opt("OPENSUBTITLES_USERNAME"),
                opensubtitles_password: env_opt("OPENSUBTITLES_PASSWORD"),
                subsro_base_url: env_opt("SUBSRO_BASE_URL"),
                deepl_api_keys: env_opt("DEEPL_API_KEYS")
                    .map(|raw| split_csv(&raw))
                    .unwrap_or_default(),
                deepl_character_quota: env_parse("DEEPL_CHARACTER_QUOTA", 500_000),
                min_overall_score: env_parse("SUBTITLE_MIN_OVERALL_SCORE", 5),
            },
            tools: ToolConfig {
                ffprobe_path: env_or("FFPROBE_PATH", "ffprobe"),
                ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
                ffsubsync_path: env_or("FFSUBSYNC_PATH", "ffsubsync"),
                alass_cli_path: env_or("ALASS_CLI_PATH", "alass-cli"),
                unrar_path: env_or("UNRAR_PATH", "unrar"),
                ocr_tool_path: env_opt("OCR_TOOL_PATH"),
                sync_offset_threshold: env_parse("SUBTITLE_SYNC_OFFSET_THRESHOLD", 1.0),
            },
        })
    }

    /// Fold the app_settings singleton row into this config. Only fields
    /// present in the row override the environment values.
    pub fn apply_overrides(&mut self, overrides: &crate::database::SettingOverrides) {
        if let Some(v) = overrides.job_timeout_sec {
            self.jobs.timeout_sec = v.max(0) as u64;
        }
        if let Some(v) = overrides.terminate_grace_period_s {
            self.jobs.terminate_grace_period_s = v.max(0) as u64;
        }
        if let Some(v) = overrides.result_message_max_len {
            self.jobs.result_message_max_len = v.max(0) as usize;
        }
        if let Some(v) = overrides.log_snippet_max_len {
            self.jobs.log_snippet_max_len = v.max(0) as usize;
        }
        if let Some(raw) = &overrides.allowed_media_folders {
            let folders = split_csv(raw);
            if !folders.is_empty() {
                self.jobs.allowed_media_folders = folders;
            }
        }
        if let Some(raw) = &overrides.deepl_api_keys {
            let keys = split_csv(raw);
            if !keys.is_empty() {
                self.providers.deepl_api_keys = keys;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.worker_concurrency == 0 {
            return Err(anyhow::anyhow!("WORKER_CONCURRENCY must be greater than 0"));
        }
        if self.jobs.log_history_max_items == 0 {
            return Err(anyhow::anyhow!("LOG_HISTORY_MAX_ITEMS must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::load().unwrap();
        assert_eq!(config.jobs.max_retries, 2);
        assert!(config.jobs.log_snippet_max_len > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = Config::load().unwrap();
        let overrides = crate::database::SettingOverrides {
            job_timeout_sec: Some(30),
            terminate_grace_period_s: None,
            result_message_max_len: Some(64),
            log_snippet_max_len: None,
            allowed_media_folders: Some("/media/movies, /media/tv".to_string()),
            deepl_api_keys: None,
        };
        config.apply_overrides(&overrides);
        assert_eq!(config.jobs.timeout_sec, 30);
        assert_eq!(config.jobs.result_message_max_len, 64);
        assert_eq!(
            config.jobs.allowed_media_folders,
            vec!["/media/movies".to_string(), "/media/tv".to_string()]
        );
    }

    #[test]
    fn csv_splitting_ignores_blanks() {
        assert_eq!(split_csv("a,, b ,"), vec!["a".to_string(), "b".to_string()]);
    }
}
