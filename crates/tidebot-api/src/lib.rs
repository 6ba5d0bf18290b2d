//! HTTP surface of the external game service.
//!
//! This crate owns everything that talks to the network: the slowly-drifting
//! version sources, the two-step credential exchange, the signed GraphQL
//! call, and the feed-window parsing. It knows nothing about scheduling or
//! persistence: callers hand in a [`VersionInfo`] snapshot and the tokens
//! to use, and get typed results or a classified [`ApiError`] back.

pub mod auth;
pub mod graphql;
pub mod versions;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

pub use auth::{AccountInfo, ServiceSession};
pub use graphql::{
    fallback_query_ids, parse_battle_window, parse_coop_window, AuthTokens, FeedItem, QueryKey,
};

/// Browser user agent presented on web-view requests, matching what the
/// service's own companion app embeds.
pub const APP_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 11; Pixel 5) \
     AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/94.0.4606.61 Mobile Safari/537.36";

/// Errors from the external service, classified the way the retry and
/// credential layers need them.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Connection, TLS, timeout: transient transport trouble.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// A non-2xx status not otherwise classified.
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The distinguished signal that the per-session access token has
    /// silently expired. Never retried blindly; consumed by the
    /// credential chain's one-shot refresh.
    #[error("access token expired")]
    ExpiredToken,

    /// The credential exchange itself failed. Terminal: the account needs
    /// re-linking.
    #[error("credential exchange failed: {0}")]
    Credential(String),

    /// The service answered but the body was not what we expect.
    #[error("malformed response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Whether a backoff loop should retry this error. Expiry, terminal
    /// credential failures and parse failures never benefit from a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Status { .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Endpoints and HTTP timeouts. Defaults point at the production service;
/// tests override individual URLs with a local server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Web-view application base, also the Origin/Referer for signed calls.
    pub app_base_url: String,
    /// GraphQL endpoint under the app base.
    pub graphql_url: String,
    /// Storefront page scraped for the client app version.
    pub storefront_url: String,
    /// Raw source mirror scraped for the companion-tool version.
    pub companion_source_url: String,
    /// Public TypeScript source scraped for the query-id map.
    pub query_ids_url: String,
    /// Account token grant endpoint (session secret -> account tokens).
    pub account_token_url: String,
    /// Account info lookup.
    pub account_me_url: String,
    /// Service login endpoint (account token -> service credential).
    pub service_login_url: String,
    /// Web-service token endpoint (service credential -> gtoken).
    pub web_service_token_url: String,
    /// Request-signing helper endpoint.
    pub f_gen_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let app_base = "https://api.lp1.av5ja.srv.nintendo.net".to_string();
        Self {
            graphql_url: format!("{app_base}/api/graphql"),
            app_base_url: app_base,
            storefront_url:
                "https://apps.apple.com/us/app/nintendo-switch-online/id1234806557".to_string(),
            companion_source_url:
                "https://raw.githubusercontent.com/frozenpandaman/s3s/master/s3s.py".to_string(),
            query_ids_url:
                "https://raw.githubusercontent.com/nintendoapis/splatnet3-types/main/src/graphql.ts"
                    .to_string(),
            account_token_url: "https://accounts.nintendo.com/connect/1.0.0/api/token".to_string(),
            account_me_url: "https://api.accounts.nintendo.com/2.0.0/users/me".to_string(),
            service_login_url: "https://api-lp1.znc.srv.nintendo.net/v3/Account/Login".to_string(),
            web_service_token_url:
                "https://api-lp1.znc.srv.nintendo.net/v2/Game/GetWebServiceToken".to_string(),
            f_gen_url: "https://api.imink.app/f".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of the drifting signing parameters, taken from the version
/// registry right before a request is built.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub app_version: String,
    pub companion_version: String,
    pub webview_version: String,
    pub query_ids: HashMap<String, String>,
}

/// Shared HTTP client for the external service.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ApiConfig>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// GET a URL and return the body, mapping non-2xx to `ApiError::Status`.
    pub(crate) async fn get_text(&self, url: &str) -> ApiResult<String> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { status, body });
        }
        Ok(body)
    }
}
