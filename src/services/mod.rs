//! External service clients used by the pipeline, aggregated behind a
//! single container so strategies receive one handle and teardown happens
//! in one place.

use tracing::{info, warn};

use crate::config::Config;

pub mod media_identity;
pub mod media_probe;
pub mod opensubtitles;
pub mod subsro;
pub mod sync_tools;
pub mod translate;

pub use media_identity::MediaIdentityService;
pub use media_probe::MediaProbe;
pub use opensubtitles::OpenSubtitlesClient;
pub use subsro::SubsRoClient;
pub use sync_tools::SyncTools;
pub use translate::TranslationManager;

/// Service container handed to the pipeline context. Providers whose
/// credentials are absent stay None and their strategies skip themselves.
pub struct ServiceContainer {
    pub media_probe: MediaProbe,
    pub identity: MediaIdentityService,
    pub opensubtitles: Option<OpenSubtitlesClient>,
    pub subsro: Option<SubsRoClient>,
    pub translator: Option<TranslationManager>,
    pub sync_tools: SyncTools,
    pub min_overall_score: i32,
}

impl ServiceContainer {
    pub fn from_config(config: &Config) -> Self {
        let opensubtitles = config
            .providers
            .opensubtitles_api_key
            .as_ref()
            .map(|api_key| {
                OpenSubtitlesClient::new(
                    api_key.clone(),
                    config.providers.opensubtitles_username.clone(),
                    config.providers.opensubtitles_password.clone(),
                )
            });
        if opensubtitles.is_none() {
            info!("OpenSubtitles provider disabled (no API key configured)");
        }

        let subsro = config
            .providers
            .subsro_base_url
            .as_ref()
            .map(|base_url| SubsRoClient::new(base_url.clone(), config.tools.unrar_path.clone()));

        let translator = if config.providers.deepl_api_keys.is_empty() {
            info!("Translator disabled (no DeepL API keys configured)");
            None
        } else {
            Some(TranslationManager::new(
                config.providers.deepl_api_keys.clone(),
                config.providers.deepl_character_quota,
            ))
        };

        Self {
            media_probe: MediaProbe::new(
                config.tools.ffprobe_path.clone(),
                config.tools.ffmpeg_path.clone(),
                config.tools.ocr_tool_path.clone(),
            ),
            identity: MediaIdentityService::new(),
            opensubtitles,
            subsro,
            translator,
            sync_tools: SyncTools::new(
                config.tools.ffsubsync_path.clone(),
                config.tools.alass_cli_path.clone(),
                config.tools.ffmpeg_path.clone(),
                config.tools.sync_offset_threshold,
            ),
            min_overall_score: config.providers.min_overall_score,
        }
    }

    /// Shutdown hook the pipeline invokes from its finalization block on
    /// every exit path. Provider sessions are closed here; the DeepL usage
    /// cache is process-scoped and torn down at worker exit, not per run.
    pub async fn shutdown(&self) {
        if let Some(opensubtitles) = &self.opensubtitles {
            if let Err(e) = opensubtitles.logout().await {
                warn!("OpenSubtitles logout failed: {}", e);
            }
        }
        info!("Service container shut down");
    }
}
