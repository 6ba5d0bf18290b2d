//! Per-profile credential chain.
//!
//! Token expiry is never tracked explicitly; it is inferred from the
//! distinguished `ApiError::ExpiredToken` raised by an authenticated call
//! and healed by exactly one refresh-and-retry. Refreshes for one profile
//! are single-flight: concurrent callers that observe the same expiry
//! coalesce onto one exchange and the losers reload the refreshed row.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use tidebot_api::{ApiClient, ApiError, ApiResult};
use tidebot_store::{Profile, StateStore};

use crate::retry::BackoffPolicy;
use crate::versions::VersionRegistry;

struct ProfileGate {
    refresh_lock: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
}

pub struct CredentialChain {
    api: ApiClient,
    store: StateStore,
    versions: Arc<VersionRegistry>,
    backoff: BackoffPolicy,
    gates: Mutex<HashMap<i64, Arc<ProfileGate>>>,
}

impl CredentialChain {
    pub fn new(
        api: ApiClient,
        store: StateStore,
        versions: Arc<VersionRegistry>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            api,
            store,
            versions,
            backoff,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, profile_id: i64) -> Arc<ProfileGate> {
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(profile_id)
            .or_insert_with(|| {
                Arc::new(ProfileGate {
                    refresh_lock: tokio::sync::Mutex::new(()),
                    epoch: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Serialized refresh: derive both short-lived tokens from the session
    /// secret and rewrite the profile in place.
    pub async fn refresh(&self, profile: &mut Profile) -> ApiResult<()> {
        let gate = self.gate(profile.id);
        let _guard = gate.refresh_lock.lock().await;
        self.refresh_inner(profile).await?;
        gate.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn refresh_inner(&self, profile: &mut Profile) -> ApiResult<()> {
        let versions = self.versions.snapshot();

        let session = self
            .backoff
            .run_with(
                || {
                    self.api
                        .acquire_service_token(&profile.session_token, &versions)
                },
                ApiError::is_retryable,
            )
            .await?;
        let bullet_token = self
            .backoff
            .run_with(
                || {
                    self.api.acquire_access_token(
                        &session.gtoken,
                        &session.language,
                        &session.country,
                        &versions,
                    )
                },
                ApiError::is_retryable,
            )
            .await?;

        // Both derived tokens land together; the user-chosen display
        // language is left alone.
        profile.account_name = session.account_name.clone();
        profile.gtoken = session.gtoken.clone();
        profile.bullet_token = bullet_token;
        profile.country = session.country.clone();

        self.store
            .update_profile(profile)
            .await
            .map_err(|e| ApiError::Credential(format!("persisting refreshed profile: {e}")))?;
        info!(profile = profile.id, account = %profile.account_name, "credentials refreshed");
        Ok(())
    }

    /// Run `op`; on the expired-token signal, refresh once and run `op`
    /// exactly one more time. A second expiry within the same call, or a
    /// refresh failure, surfaces to the caller.
    pub async fn with_auto_refresh<T, F, Fut>(
        &self,
        profile: &mut Profile,
        op: F,
    ) -> ApiResult<T>
    where
        F: Fn(Profile) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let gate = self.gate(profile.id);
        let seen_epoch = gate.epoch.load(Ordering::Acquire);

        match op(profile.clone()).await {
            Err(ApiError::ExpiredToken) => {
                warn!(profile = profile.id, "access token expired; refreshing");
                {
                    let _guard = gate.refresh_lock.lock().await;
                    if gate.epoch.load(Ordering::Acquire) == seen_epoch {
                        self.refresh_inner(profile).await?;
                        gate.epoch.fetch_add(1, Ordering::AcqRel);
                    } else {
                        // Someone else refreshed while we waited; pick up
                        // their tokens instead of spending another exchange.
                        if let Ok(Some(updated)) = self.store.get_profile(profile.id).await {
                            *profile = updated;
                        }
                    }
                }
                op(profile.clone()).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;
    use tidebot_api::ApiConfig;

    use crate::config::VersionsConfig;

    async fn chain_with_store() -> (tempfile::TempDir, CredentialChain, Profile) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state.db")).await.unwrap();
        let profile = Profile {
            id: 0,
            user_id: 1,
            name: "main".to_string(),
            account_name: String::new(),
            session_token: "secret".to_string(),
            gtoken: "g1".to_string(),
            bullet_token: "b1".to_string(),
            language: "en-US".to_string(),
            country: "US".to_string(),
            is_current: true,
        };
        let id = store.insert_profile(&profile).await.unwrap();
        let profile = store.get_profile(id).await.unwrap().unwrap();

        let api = ApiClient::new(ApiConfig::default()).unwrap();
        let versions = Arc::new(VersionRegistry::new(&VersionsConfig::default()));
        let chain = CredentialChain::new(api, store, versions, BackoffPolicy::default());
        (dir, chain, profile)
    }

    #[tokio::test]
    async fn passes_through_success_without_refresh() {
        let (_dir, chain, mut profile) = chain_with_store().await;
        let calls = AtomicU32::new(0);
        let result = chain
            .with_auto_refresh(&mut profile, |p| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, ApiError>(p.bullet_token) }
            })
            .await
            .unwrap();
        assert_eq!(result, "b1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_expiry_errors_are_not_healed() {
        let (_dir, chain, mut profile) = chain_with_store().await;
        let calls = AtomicU32::new(0);
        let result: ApiResult<()> = chain
            .with_auto_refresh(&mut profile, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::Parse("garbled".into())) }
            })
            .await;
        assert!(matches!(result, Err(ApiError::Parse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_second_expiry_is_not_auto_healed() {
        let (_dir, chain, mut profile) = chain_with_store().await;

        // Pretend a sibling refreshed so the wrapper reloads instead of
        // exchanging; the retried call still expires, which must surface.
        let gate = chain.gate(profile.id);
        let calls = AtomicU32::new(0);
        let result: ApiResult<()> = chain
            .with_auto_refresh(&mut profile, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    gate.epoch.fetch_add(1, Ordering::AcqRel);
                }
                async { Err(ApiError::ExpiredToken) }
            })
            .await;

        assert!(matches!(result, Err(ApiError::ExpiredToken)));
        // The wrapped operation runs at most twice per invocation.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn coalesced_refresh_reloads_the_profile_row() {
        // Simulate "another caller refreshed first": bump the epoch after
        // the op observes expiry and rewrite the stored row. The wrapper
        // must pick up the stored tokens without exchanging again.
        let (_dir, chain, mut profile) = chain_with_store().await;

        let mut refreshed = profile.clone();
        refreshed.gtoken = "g2".to_string();
        refreshed.bullet_token = "b2".to_string();
        chain.store.update_profile(&refreshed).await.unwrap();

        let gate = chain.gate(profile.id);
        let calls = AtomicU32::new(0);
        let result = chain
            .with_auto_refresh(&mut profile, |p| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // First attempt sees the stale token and, before the
                    // wrapper can react, a sibling finishes its refresh.
                    gate.epoch.fetch_add(1, Ordering::AcqRel);
                }
                async move {
                    if n == 0 {
                        Err(ApiError::ExpiredToken)
                    } else {
                        Ok(p.bullet_token)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "b2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(profile.bullet_token, "b2");
    }
}
