use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::Config;
use crate::database::JobDatabase;
use crate::logbus::LogBus;

/// Shared handle passed to every HTTP/WS handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: JobDatabase,
    pub logbus: Arc<LogBus>,
    pub broker: Arc<Broker>,
    /// Fired on server shutdown; subscriber sessions close 1001 on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        database: JobDatabase,
        logbus: Arc<LogBus>,
        broker: Arc<Broker>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            database,
            logbus,
            broker,
            shutdown,
        }
    }
}
