//! Process-wide cache of the drifting request parameters.
//!
//! Reads never block on the network: callers always get the fallback or
//! the most recently fetched value. Each entry is refreshed on its own
//! schedule; a failed refresh keeps the previous value and is never
//! surfaced past a log line.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{info, warn};

use tidebot_api::{fallback_query_ids, ApiClient, VersionInfo};

use crate::config::VersionsConfig;

/// Which cached parameter to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKind {
    App,
    Companion,
    Webview,
    QueryIds,
}

pub struct VersionRegistry {
    inner: RwLock<VersionInfo>,
}

impl VersionRegistry {
    /// Seed the cache with the configured fallbacks and the compiled-in
    /// query-id map.
    pub fn new(config: &VersionsConfig) -> Self {
        Self {
            inner: RwLock::new(VersionInfo {
                app_version: config.app_fallback.clone(),
                companion_version: config.companion_fallback.clone(),
                webview_version: config.webview_fallback.clone(),
                query_ids: fallback_query_ids(),
            }),
        }
    }

    /// Snapshot for building one request. Values observed together here
    /// may span a refresh, which the service tolerates.
    pub fn snapshot(&self) -> VersionInfo {
        self.inner.read().unwrap().clone()
    }

    pub fn get(&self, kind: VersionKind) -> String {
        let inner = self.inner.read().unwrap();
        match kind {
            VersionKind::App => inner.app_version.clone(),
            VersionKind::Companion => inner.companion_version.clone(),
            VersionKind::Webview => inner.webview_version.clone(),
            VersionKind::QueryIds => {
                let mut names: Vec<&str> = inner.query_ids.keys().map(String::as_str).collect();
                names.sort_unstable();
                names.join(",")
            }
        }
    }

    pub fn query_ids(&self) -> HashMap<String, String> {
        self.inner.read().unwrap().query_ids.clone()
    }

    pub async fn refresh_app_version(&self, api: &ApiClient) {
        match api.fetch_app_version().await {
            Ok(version) => {
                info!(%version, "refreshed client app version");
                self.inner.write().unwrap().app_version = version;
            }
            Err(err) => warn!(error = %err, "app version refresh failed; keeping cached value"),
        }
    }

    pub async fn refresh_companion_version(&self, api: &ApiClient) {
        match api.fetch_companion_version().await {
            Ok(version) => {
                info!(%version, "refreshed companion-tool version");
                self.inner.write().unwrap().companion_version = version;
            }
            Err(err) => {
                warn!(error = %err, "companion version refresh failed; keeping cached value")
            }
        }
    }

    pub async fn refresh_webview_version(&self, api: &ApiClient) {
        match api.fetch_webview_version().await {
            Ok(version) => {
                info!(%version, "refreshed web-view version");
                self.inner.write().unwrap().webview_version = version;
            }
            Err(err) => warn!(error = %err, "web-view version refresh failed; keeping cached value"),
        }
    }

    pub async fn refresh_query_ids(&self, api: &ApiClient) {
        match api.fetch_query_ids().await {
            Ok(map) => {
                info!(entries = map.len(), "refreshed query-id map");
                self.inner.write().unwrap().query_ids = map;
            }
            Err(err) => warn!(error = %err, "query-id map refresh failed; keeping cached value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_fallbacks() {
        let registry = VersionRegistry::new(&VersionsConfig::default());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.app_version, registry.get(VersionKind::App));
        assert!(!snapshot.webview_version.is_empty());
        assert!(snapshot.query_ids.contains_key("HomeQuery"));
    }

    #[test]
    fn writes_are_visible_to_later_snapshots() {
        let registry = VersionRegistry::new(&VersionsConfig::default());
        registry.inner.write().unwrap().app_version = "9.9.9".to_string();
        assert_eq!(registry.get(VersionKind::App), "9.9.9");
        assert_eq!(registry.snapshot().app_version, "9.9.9");
    }
}
