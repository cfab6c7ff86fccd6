use std::path::PathBuf;

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::observability::usage_log::UsageLog;
use crate::transport::HttpTransport;

/// Shared application state accessible to all handlers. Request pipelines
/// share nothing mutable except the append-only usage log.
#[derive(Debug)]
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub usage_log: UsageLog,
}

impl AppState {
    /// Build the state for `config`: the upstream transport and, when
    /// `features.log_dir` is set, the usage log.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] when the transport cannot be built.
    pub fn from_config(config: AppConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.server, &config.upstream)?;
        let usage_log = UsageLog::new(config.features.log_dir.as_deref().map(PathBuf::from));
        Ok(Self::new(config, transport, usage_log))
    }

    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport, usage_log: UsageLog) -> Self {
        Self {
            config,
            transport,
            usage_log,
        }
    }

    /// Provider label written to usage and error records.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.config.upstream.base_url
    }
}
