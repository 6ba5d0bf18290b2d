//! The signed persisted-query call and feed-window parsing.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};

use crate::{ApiClient, ApiError, ApiResult, VersionInfo, APP_USER_AGENT};

/// Logical operations this bot issues against the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Home,
    LatestBattleHistories,
    VsHistoryDetail,
    CoopHistory,
    CoopHistoryDetail,
}

impl QueryKey {
    /// Key into the fetched query-id map.
    pub fn name(&self) -> &'static str {
        match self {
            QueryKey::Home => "HomeQuery",
            QueryKey::LatestBattleHistories => "LatestBattleHistoriesQuery",
            QueryKey::VsHistoryDetail => "VsHistoryDetailQuery",
            QueryKey::CoopHistory => "CoopHistoryQuery",
            QueryKey::CoopHistoryDetail => "CoopHistoryDetailQuery",
        }
    }

    /// Compiled-in id used until the map's first successful fetch.
    pub fn fallback_id(&self) -> &'static str {
        match self {
            QueryKey::Home => "22e2fa8294168003c21b00c333c35384",
            QueryKey::LatestBattleHistories => "0176a47218d830ee447e10af4a287b3f",
            QueryKey::VsHistoryDetail => "291295ad311b99a6288fc95a5c4cb2d2",
            QueryKey::CoopHistory => "2fd21f270d381ecf894eb975c5f6a716",
            QueryKey::CoopHistoryDetail => "379f0d9b78b531be53044bcac031b34b",
        }
    }

    pub fn all() -> [QueryKey; 5] {
        [
            QueryKey::Home,
            QueryKey::LatestBattleHistories,
            QueryKey::VsHistoryDetail,
            QueryKey::CoopHistory,
            QueryKey::CoopHistoryDetail,
        ]
    }
}

/// Compiled-in query-id map, the registry's fallback value.
pub fn fallback_query_ids() -> HashMap<String, String> {
    QueryKey::all()
        .iter()
        .map(|k| (k.name().to_string(), k.fallback_id().to_string()))
        .collect()
}

/// Tokens and locale pulled from a profile right before a signed call.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub gtoken: String,
    pub bullet_token: String,
    pub language: String,
    pub country: String,
}

/// One entry of a history feed window: its opaque id and, when it can be
/// recovered, the wall-clock time the entry was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub id: String,
    pub played_at: Option<DateTime<Utc>>,
}

fn persisted_query_body(query_id: &str, variable: Option<(&str, Value)>) -> Value {
    let mut variables = serde_json::Map::new();
    if let Some((name, value)) = variable {
        variables.insert(name.to_string(), value);
    }
    json!({
        "extensions": {
            "persistedQuery": {
                "sha256Hash": query_id,
                "version": 1,
            }
        },
        "variables": variables,
    })
}

impl ApiClient {
    /// Issue a signed persisted query and return the raw response text.
    ///
    /// A 401 is the expired-token signal; everything else non-2xx is a
    /// plain status error.
    pub async fn graphql_query(
        &self,
        versions: &VersionInfo,
        auth: &AuthTokens,
        key: QueryKey,
        variable: Option<(&str, Value)>,
    ) -> ApiResult<String> {
        let query_id = versions
            .query_ids
            .get(key.name())
            .map(String::as_str)
            .unwrap_or_else(|| key.fallback_id());
        let body = persisted_query_body(query_id, variable);

        let base = &self.config().app_base_url;
        let lang = &auth.language;
        let resp = self
            .http()
            .post(&self.config().graphql_url)
            .bearer_auth(&auth.bullet_token)
            .header("Accept-Language", lang)
            .header("User-Agent", APP_USER_AGENT)
            .header("X-Web-View-Ver", &versions.webview_version)
            .header("Content-Type", "application/json")
            .header("Accept", "*/*")
            .header("Origin", base)
            .header("X-Requested-With", "com.nintendo.znca")
            .header(
                "Referer",
                format!(
                    "{base}?lang={lang}&na_country={}&na_lang={lang}",
                    auth.country
                ),
            )
            .header("Cookie", format!("_gtoken={}; _dnt=1", auth.gtoken))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(ApiError::ExpiredToken);
        }
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { status, body: text });
        }
        Ok(text)
    }

    /// Fetch auxiliary media bytes with the same cookie auth as the
    /// signed calls.
    pub async fn fetch_media(&self, auth: &AuthTokens, url: &str) -> ApiResult<Vec<u8>> {
        let resp = self
            .http()
            .get(url)
            .header("User-Agent", APP_USER_AGENT)
            .header("Accept", "*/*")
            .header("Cookie", format!("_gtoken={}; _dnt=1", auth.gtoken))
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(ApiError::ExpiredToken);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Parse the battle history feed into a newest-first item window.
pub fn parse_battle_window(raw: &str) -> ApiResult<Vec<FeedItem>> {
    parse_window(raw, "/data/latestBattleHistories/historyGroups/nodes")
}

/// Parse the co-op history feed into a newest-first item window.
pub fn parse_coop_window(raw: &str) -> ApiResult<Vec<FeedItem>> {
    parse_window(raw, "/data/coopResult/historyGroups/nodes")
}

fn parse_window(raw: &str, groups_pointer: &str) -> ApiResult<Vec<FeedItem>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ApiError::Parse(format!("feed response: {e}")))?;
    let groups = value
        .pointer(groups_pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::Parse(format!("feed missing {groups_pointer}")))?;

    let mut items = Vec::new();
    for group in groups {
        let details = group
            .pointer("/historyDetails/nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Parse("history group missing detail nodes".into()))?;
        for node in details {
            let id = node
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| ApiError::Parse("history entry missing id".into()))?
                .to_string();
            let played_at = node
                .get("playedTime")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .or_else(|| timestamp_from_entry_id(&id));
            items.push(FeedItem { id, played_at });
        }
    }
    Ok(items)
}

/// Recover the entry timestamp embedded in the opaque id.
///
/// Decoded ids look like `...-u-...:RECENT:20230403T010154_<uuid>`.
pub fn timestamp_from_entry_id(id: &str) -> Option<DateTime<Utc>> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(id).ok()?;
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    let re = Regex::new(r"(\d{8}T\d{6})").unwrap();
    let stamp = re.captures(&decoded)?.get(1)?.as_str().to_string();
    NaiveDateTime::parse_from_str(&stamp, "%Y%m%dT%H%M%S")
        .ok()
        .map(|t| t.and_utc())
}
