//! Engine configuration, loaded from a TOML file with per-field defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use tidebot_api::ApiConfig;

use crate::monitor::GapPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub monitor: MonitorConfig,
    pub versions: VersionsConfig,
    pub auth: AuthConfig,
    pub retry: RetryConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between poll cycles of one monitor job.
    pub interval_secs: u64,
    /// Quiet period after a delivery before the next poll may run.
    pub freeze_secs: u64,
    /// Inactivity duration after which a job deregisters itself.
    pub auto_stop_secs: u64,
    /// Items older than this are not delivered even when new.
    pub retrieve_previous_secs: u64,
    /// What to do when the stored cursor is missing from the window.
    pub gap_policy: GapPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 90,
            freeze_secs: 30,
            auto_stop_secs: 3600,
            retrieve_previous_secs: 21600,
            gap_policy: GapPolicy::SkipToNewest,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn freeze(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freeze_secs as i64)
    }
    pub fn auto_stop(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_stop_secs as i64)
    }
    pub fn retrieve_previous(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retrieve_previous_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VersionsConfig {
    pub app_refresh_secs: u64,
    pub companion_refresh_secs: u64,
    pub webview_refresh_secs: u64,
    pub query_ids_refresh_secs: u64,
    /// Values used until each entry's first successful fetch.
    pub app_fallback: String,
    pub companion_fallback: String,
    pub webview_fallback: String,
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            app_refresh_secs: 7200,
            companion_refresh_secs: 7200,
            webview_refresh_secs: 7200,
            query_ids_refresh_secs: 7200,
            app_fallback: "2.5.1".to_string(),
            companion_fallback: "0.4.1".to_string(),
            webview_fallback: "4.0.0-d5178440".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Seconds between keep-alive sweeps over all profiles.
    pub keep_alive_secs: u64,
    /// Startup delay before monitor jobs are re-armed from the registry.
    pub recovery_delay_secs: u64,
    /// Endpoint overrides; `None` uses the production endpoints.
    pub app_base_url: Option<String>,
    pub f_gen_url: Option<String>,
    pub account_token_url: Option<String>,
    pub account_me_url: Option<String>,
    pub service_login_url: Option<String>,
    pub web_service_token_url: Option<String>,
    pub storefront_url: Option<String>,
    pub companion_source_url: Option<String>,
    pub query_ids_url: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 7200,
            recovery_delay_secs: 10,
            app_base_url: None,
            f_gen_url: None,
            account_token_url: None,
            account_me_url: None,
            service_login_url: None,
            web_service_token_url: None,
            storefront_url: None,
            companion_source_url: None,
            query_ids_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            base_delay_secs: 1.0,
            max_delay_secs: 10.0,
            jitter_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Assemble the API endpoint set, applying any configured overrides.
    pub fn api_config(&self) -> ApiConfig {
        let mut api = ApiConfig::default();
        if let Some(base) = &self.auth.app_base_url {
            api.graphql_url = format!("{base}/api/graphql");
            api.app_base_url = base.clone();
        }
        if let Some(url) = &self.auth.f_gen_url {
            api.f_gen_url = url.clone();
        }
        if let Some(url) = &self.auth.account_token_url {
            api.account_token_url = url.clone();
        }
        if let Some(url) = &self.auth.account_me_url {
            api.account_me_url = url.clone();
        }
        if let Some(url) = &self.auth.service_login_url {
            api.service_login_url = url.clone();
        }
        if let Some(url) = &self.auth.web_service_token_url {
            api.web_service_token_url = url.clone();
        }
        if let Some(url) = &self.auth.storefront_url {
            api.storefront_url = url.clone();
        }
        if let Some(url) = &self.auth.companion_source_url {
            api.companion_source_url = url.clone();
        }
        if let Some(url) = &self.auth.query_ids_url {
            api.query_ids_url = url.clone();
        }
        api.connect_timeout = Duration::from_secs(self.http.connect_timeout_secs);
        api.request_timeout = Duration::from_secs(self.http.request_timeout_secs);
        api
    }

    pub fn backoff(&self) -> crate::retry::BackoffPolicy {
        crate::retry::BackoffPolicy::new(
            self.retry.max_retries,
            Duration::from_secs_f64(self.retry.base_delay_secs),
            Duration::from_secs_f64(self.retry.max_delay_secs),
            Duration::from_secs_f64(self.retry.jitter_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.monitor.interval_secs, 90);
        assert_eq!(config.monitor.gap_policy, GapPolicy::SkipToNewest);
        assert_eq!(config.retry.max_retries, Some(5));
        let api = config.api_config();
        assert!(api.graphql_url.starts_with(&api.app_base_url));
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
[monitor]
interval_secs = 30
gap_policy = "emit-window"

[auth]
app_base_url = "http://127.0.0.1:9999"
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.monitor.interval_secs, 30);
        assert_eq!(config.monitor.gap_policy, GapPolicy::EmitWindow);
        // untouched sections keep their defaults
        assert_eq!(config.monitor.freeze_secs, 30);
        assert_eq!(config.versions.app_refresh_secs, 7200);

        let api = config.api_config();
        assert_eq!(api.app_base_url, "http://127.0.0.1:9999");
        assert_eq!(api.graphql_url, "http://127.0.0.1:9999/api/graphql");
    }
}
