//! The two-step credential exchange.
//!
//! Step one turns the long-lived session secret into a web-service token
//! ("gtoken") plus the account's nickname, language and country. Step two
//! turns the gtoken into the per-session access token ("bullet token").
//! Both steps ride through a third-party request-signing helper whose
//! parameters drift with the client app version.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{ApiClient, ApiError, ApiResult, VersionInfo, APP_USER_AGENT};

/// Account metadata returned by the account-info lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub nickname: String,
    pub language: String,
    pub country: String,
    pub birthday: String,
}

/// Result of step one: the service token and the account it belongs to.
#[derive(Debug, Clone)]
pub struct ServiceSession {
    pub gtoken: String,
    pub account_name: String,
    pub language: String,
    pub country: String,
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: Option<String>,
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SigningParams {
    f: String,
    request_id: String,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct ServiceCredentialEnvelope {
    result: Option<ServiceCredentialResult>,
}

#[derive(Debug, Deserialize)]
struct ServiceCredentialResult {
    #[serde(rename = "webApiServerCredential")]
    web_api_server_credential: Option<AccessTokenHolder>,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenHolder {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct BulletTokenEnvelope {
    #[serde(rename = "bulletToken")]
    bullet_token: String,
}

impl ApiClient {
    /// Step one: session secret -> service token + account info.
    ///
    /// The service login and web-service-token calls are each retried once
    /// in place with freshly generated signing parameters, which heals the
    /// signer's occasional transient rejections without a full backoff
    /// round.
    pub async fn acquire_service_token(
        &self,
        session_token: &str,
        versions: &VersionInfo,
    ) -> ApiResult<ServiceSession> {
        let grant = self.account_token_grant(session_token).await?;
        let access_token = grant
            .access_token
            .ok_or_else(|| ApiError::Credential("account grant held no access token".into()))?;
        let id_token = grant
            .id_token
            .ok_or_else(|| ApiError::Credential("account grant held no id token".into()))?;

        let account = self.account_info(&access_token).await?;
        debug!(nickname = %account.nickname, country = %account.country, "account lookup ok");

        let web_api_token = self
            .service_login(&id_token, &account, versions)
            .await?;
        let gtoken = self
            .web_service_token(&web_api_token, versions)
            .await?;

        Ok(ServiceSession {
            gtoken,
            account_name: account.nickname,
            language: account.language,
            country: account.country,
        })
    }

    /// Step two: service token -> per-session access token.
    pub async fn acquire_access_token(
        &self,
        gtoken: &str,
        language: &str,
        country: &str,
        versions: &VersionInfo,
    ) -> ApiResult<String> {
        let url = format!("{}/api/bullet_tokens", self.config().app_base_url);
        let resp = self
            .http()
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Content-Length", "0")
            .header("Accept-Language", language)
            .header("User-Agent", APP_USER_AGENT)
            .header("X-Web-View-Ver", &versions.webview_version)
            .header("X-NACOUNTRY", country)
            .header("Accept", "*/*")
            .header("Origin", &self.config().app_base_url)
            .header("X-Requested-With", "com.nintendo.znca")
            .header("Cookie", format!("_gtoken={gtoken}; _dnt=1"))
            .send()
            .await?;

        let status = resp.status();
        match status.as_u16() {
            401 => {
                return Err(ApiError::Credential(
                    "service token rejected while issuing access token".into(),
                ))
            }
            403 => {
                return Err(ApiError::Credential(
                    "client version marked obsolete while issuing access token".into(),
                ))
            }
            204 => {
                return Err(ApiError::Credential(
                    "account has never played online; no access token available".into(),
                ))
            }
            _ => {}
        }
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { status, body });
        }

        let envelope: BulletTokenEnvelope = serde_json::from_str(&body)
            .map_err(|e| ApiError::Parse(format!("access token response: {e}")))?;
        Ok(envelope.bullet_token)
    }

    async fn account_token_grant(&self, session_token: &str) -> ApiResult<TokenGrant> {
        let resp = self
            .http()
            .post(&self.config().account_token_url)
            .header("User-Agent", "Dalvik/2.1.0 (Linux; U; Android 7.1.2)")
            .header("Accept", "application/json")
            .json(&json!({
                "client_id": "71b963c1b7b6d119",
                "session_token": session_token,
                "grant_type": "urn:ietf:params:oauth:grant-type:jwt-bearer-session-token",
            }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Credential(format!(
                "account token grant failed with {status}: {body}"
            )));
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Parse(format!("account grant: {e}")))
    }

    async fn account_info(&self, access_token: &str) -> ApiResult<AccountInfo> {
        let resp = self
            .http()
            .get(&self.config().account_me_url)
            .header("User-Agent", "NASDKAPI; Android")
            .header("Accept", "application/json")
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Credential(format!(
                "account info lookup failed with {status}: {body}"
            )));
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Parse(format!("account info: {e}")))
    }

    async fn service_login(
        &self,
        id_token: &str,
        account: &AccountInfo,
        versions: &VersionInfo,
    ) -> ApiResult<String> {
        let mut signing = self.signing_params(id_token, 1, versions).await?;
        let mut last_body = String::new();
        for attempt in 0..2 {
            let body = json!({
                "parameter": {
                    "f": signing.f,
                    "language": account.language,
                    "naBirthday": account.birthday,
                    "naCountry": account.country,
                    "naIdToken": id_token,
                    "requestId": signing.request_id,
                    "timestamp": signing.timestamp,
                }
            });
            let resp = self
                .http()
                .post(&self.config().service_login_url)
                .header("X-Platform", "Android")
                .header("X-ProductVersion", &versions.app_version)
                .header(
                    "User-Agent",
                    format!("com.nintendo.znca/{}(Android/7.1.2)", versions.app_version),
                )
                .json(&body)
                .send()
                .await?;
            let text = resp.text().await?;
            let envelope: ServiceCredentialEnvelope = serde_json::from_str(&text)
                .map_err(|e| ApiError::Parse(format!("service login: {e}")))?;
            if let Some(token) = envelope
                .result
                .and_then(|r| r.web_api_server_credential)
                .map(|c| c.access_token)
            {
                return Ok(token);
            }
            last_body = text;
            if attempt == 0 {
                warn!("service login rejected the signing parameters; regenerating once");
                signing = self.signing_params(id_token, 1, versions).await?;
            }
        }
        Err(ApiError::Credential(format!(
            "service login failed: {last_body}"
        )))
    }

    async fn web_service_token(
        &self,
        web_api_token: &str,
        versions: &VersionInfo,
    ) -> ApiResult<String> {
        let mut signing = self.signing_params(web_api_token, 2, versions).await?;
        let mut last_body = String::new();
        for attempt in 0..2 {
            let body = json!({
                "parameter": {
                    "f": signing.f,
                    "id": 4834290508791808u64,
                    "registrationToken": web_api_token,
                    "requestId": signing.request_id,
                    "timestamp": signing.timestamp,
                }
            });
            let resp = self
                .http()
                .post(&self.config().web_service_token_url)
                .header("X-Platform", "Android")
                .header("X-ProductVersion", &versions.app_version)
                .header(
                    "User-Agent",
                    format!("com.nintendo.znca/{}(Android/7.1.2)", versions.app_version),
                )
                .bearer_auth(web_api_token)
                .json(&body)
                .send()
                .await?;
            let text = resp.text().await?;
            let envelope: ServiceCredentialEnvelope = serde_json::from_str(&text)
                .map_err(|e| ApiError::Parse(format!("web service token: {e}")))?;
            if let Some(token) = envelope.result.and_then(|r| r.access_token) {
                return Ok(token);
            }
            last_body = text;
            if attempt == 0 {
                warn!("web-service token rejected the signing parameters; regenerating once");
                signing = self.signing_params(web_api_token, 2, versions).await?;
            }
        }
        Err(ApiError::Credential(format!(
            "web-service token exchange failed: {last_body}"
        )))
    }

    /// Call the request-signing helper for the given derivation step.
    async fn signing_params(
        &self,
        token: &str,
        step: u8,
        versions: &VersionInfo,
    ) -> ApiResult<SigningParams> {
        let resp = self
            .http()
            .post(&self.config().f_gen_url)
            .header(
                "User-Agent",
                format!("tidebot/{}", versions.companion_version),
            )
            .header("Content-Type", "application/json; charset=utf-8")
            .json(&json!({ "token": token, "hash_method": step }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { status, body });
        }
        serde_json::from_str(&body)
            .map_err(|e| ApiError::Parse(format!("signing helper response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_credential_envelope_shapes() {
        let login: ServiceCredentialEnvelope = serde_json::from_str(
            r#"{"result":{"webApiServerCredential":{"accessToken":"abc"}}}"#,
        )
        .unwrap();
        assert_eq!(
            login
                .result
                .and_then(|r| r.web_api_server_credential)
                .map(|c| c.access_token)
                .as_deref(),
            Some("abc")
        );

        let wst: ServiceCredentialEnvelope =
            serde_json::from_str(r#"{"result":{"accessToken":"def"}}"#).unwrap();
        assert_eq!(
            wst.result.and_then(|r| r.access_token).as_deref(),
            Some("def")
        );

        let rejected: ServiceCredentialEnvelope =
            serde_json::from_str(r#"{"status":9403,"errorMessage":"Invalid token."}"#).unwrap();
        assert!(rejected.result.is_none());
    }

    #[test]
    fn signing_params_deserialize() {
        let params: SigningParams = serde_json::from_str(
            r#"{"f":"xyz","request_id":"req-1","timestamp":1680500000000}"#,
        )
        .unwrap();
        assert_eq!(params.f, "xyz");
        assert_eq!(params.request_id, "req-1");
        assert_eq!(params.timestamp, 1680500000000);
    }
}
