//! Fetchers for the externally-sourced, slowly-changing parameters.
//!
//! Each fetch scrapes a public page with a regular expression. Callers
//! (the version registry) treat any error, transport or parse alike, as
//! "keep the cached value".

use std::collections::HashMap;

use regex::Regex;

use crate::{ApiClient, ApiError, ApiResult};

impl ApiClient {
    /// Current client app version, scraped from the storefront listing.
    pub async fn fetch_app_version(&self) -> ApiResult<String> {
        let page = self.get_text(&self.config().storefront_url).await?;
        let re = Regex::new(r#"whats-new__latest__version[^>]*>\s*Version\s*([\d.]+)"#)
            .unwrap();
        let caps = re
            .captures(&page)
            .ok_or_else(|| ApiError::Parse("app version not found on storefront page".into()))?;
        Ok(caps[1].trim().to_string())
    }

    /// Companion-tool version, scraped from its public source mirror.
    pub async fn fetch_companion_version(&self) -> ApiResult<String> {
        let source = self.get_text(&self.config().companion_source_url).await?;
        let re = Regex::new(r#"A_VERSION = "([\d.]*)""#).unwrap();
        let caps = re
            .captures(&source)
            .ok_or_else(|| ApiError::Parse("companion version marker not found".into()))?;
        Ok(caps[1].to_string())
    }

    /// Web-view version string, in `{version}-{revision[..8]}` form.
    ///
    /// Two requests: the app home page to locate the main script asset,
    /// then the script body for the embedded version and revision.
    pub async fn fetch_webview_version(&self) -> ApiResult<String> {
        let base = self.config().app_base_url.clone();
        let resp = self
            .http()
            .get(&base)
            .header("Accept", "*/*")
            .header("X-Requested-With", "com.nintendo.znca")
            .header("Upgrade-Insecure-Requests", "1")
            .header("Cookie", "_dnt=1")
            .send()
            .await?;
        let status = resp.status();
        let home = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { status, body: home });
        }

        let asset_re =
            Regex::new(r#"src="(/static/js/main\.[0-9a-f]+\.js)""#).unwrap();
        let asset = asset_re
            .captures(&home)
            .ok_or_else(|| ApiError::Parse("main script asset not found on home page".into()))?;
        let script_url = format!("{}{}", base, &asset[1]);

        let resp = self
            .http()
            .get(&script_url)
            .header("Accept", "*/*")
            .header("X-Requested-With", "com.nintendo.znca")
            .header("Referer", &base)
            .header("Cookie", "_dnt=1")
            .send()
            .await?;
        let status = resp.status();
        let script = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                body: script,
            });
        }

        parse_webview_version(&script)
    }

    /// Operation-name to opaque query-id map, scraped from a public
    /// TypeScript enum. An empty parse is a failure so the caller keeps
    /// its stale map.
    pub async fn fetch_query_ids(&self) -> ApiResult<HashMap<String, String>> {
        let source = self.get_text(&self.config().query_ids_url).await?;
        parse_query_ids(&source)
    }
}

pub(crate) fn parse_webview_version(script: &str) -> ApiResult<String> {
    let re = Regex::new(
        r#"\b(?P<revision>[0-9a-f]{40})\b[\S]*?void 0[\S]*?"revision_info_not_set"\}`,.*?=`(?P<version>\d+\.\d+\.\d+)-"#,
    )
    .unwrap();
    let caps = re
        .captures(script)
        .ok_or_else(|| ApiError::Parse("web-view version not found in main script".into()))?;
    let revision = &caps["revision"];
    Ok(format!("{}-{}", &caps["version"], &revision[..8]))
}

pub(crate) fn parse_query_ids(source: &str) -> ApiResult<HashMap<String, String>> {
    let block_re = Regex::new(r"export enum RequestId \{(?P<body>[\s\S]*?)\}").unwrap();
    let body = block_re
        .captures(source)
        .ok_or_else(|| ApiError::Parse("RequestId enum not found".into()))?;
    let pair_re = Regex::new(r"(\w+)\s*=\s*'(\w+)'").unwrap();

    let mut map = HashMap::new();
    for caps in pair_re.captures_iter(&body["body"]) {
        map.insert(caps[1].to_string(), caps[2].to_string());
    }
    if map.is_empty() {
        return Err(ApiError::Parse("RequestId enum contained no entries".into()));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_id_enum() {
        let source = r#"
// generated
export enum RequestId {
  HomeQuery = '22e2fa8294168003c21b00c333c35384',
  LatestBattleHistoriesQuery = '0176a47218d830ee447e10af4a287b3f',
}
export enum OtherEnum {
  Ignored = 'ffff',
}
"#;
        let map = parse_query_ids(source).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("HomeQuery").map(String::as_str),
            Some("22e2fa8294168003c21b00c333c35384")
        );
    }

    #[test]
    fn empty_enum_is_a_parse_failure() {
        let source = "export enum RequestId {}";
        assert!(matches!(
            parse_query_ids(source),
            Err(ApiError::Parse(_))
        ));
    }

    #[test]
    fn parses_webview_version_from_minified_script() {
        let revision = "0123456789abcdef0123456789abcdef01234567";
        let script = format!(
            "a=\"{revision}\"!==void 0?a:\"revision_info_not_set\"}}`,b=`6.0.0-`"
        );
        let version = parse_webview_version(&script).unwrap();
        assert_eq!(version, "6.0.0-01234567");
    }

    #[test]
    fn missing_version_marker_is_a_parse_failure() {
        assert!(matches!(
            parse_webview_version("var a = 1;"),
            Err(ApiError::Parse(_))
        ));
    }
}
