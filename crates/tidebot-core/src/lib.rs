//! Session and incremental polling engine.
//!
//! Keeps per-user credential chains valid against a service whose tokens
//! expire silently, and discovers new history entries for many users
//! without re-delivering or losing any, across process restarts.

pub mod config;
pub mod credentials;
pub mod monitor;
pub mod retry;
pub mod scheduler;
pub mod versions;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use tidebot_api::{ApiClient, ApiError, AuthTokens, QueryKey};
use tidebot_store::{JobRecord, Profile, StateStore};

pub use config::EngineConfig;
pub use credentials::CredentialChain;
pub use monitor::{
    advance_cursor, CursorAdvance, FeedKind, FeedSource, GapPolicy, MonitorRuntime, PollOutcome,
    ServiceFeedSource,
};
pub use retry::BackoffPolicy;
pub use scheduler::{CronSpec, TaskScheduler};
pub use versions::{VersionKind, VersionRegistry};

/// Chat delivery collaborator. Fire-and-forget: the engine logs failures
/// and never retries a send.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Formatting collaborator. The engine hands over raw detail responses
/// and never inspects the produced text.
pub trait Renderer: Send + Sync {
    fn battle_summary(&self, detail_json: &str) -> String;
    fn coop_summary(&self, detail_json: &str) -> String;
    fn auto_stop_notice(&self, idle_minutes: u64) -> String;
}

/// What `enable_monitoring` did, given its toggle semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorToggle {
    Enabled,
    Disabled,
}

struct EngineInner {
    config: EngineConfig,
    api: ApiClient,
    store: StateStore,
    versions: Arc<VersionRegistry>,
    chain: Arc<CredentialChain>,
    scheduler: TaskScheduler,
    runtime: MonitorRuntime,
}

/// The engine owns every background concern: version refreshes, the
/// keep-alive sweep, monitor loops, and registry recovery. Constructed at
/// startup, torn down with [`Engine::shutdown`]; nothing lives in global
/// state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine wired to the production feed source.
    pub fn new(
        config: EngineConfig,
        store: StateStore,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self> {
        let api = ApiClient::new(config.api_config()).context("building API client")?;
        let versions = Arc::new(VersionRegistry::new(&config.versions));
        let backoff = config.backoff();
        let chain = Arc::new(CredentialChain::new(
            api.clone(),
            store.clone(),
            versions.clone(),
            backoff.clone(),
        ));
        let feed = Arc::new(ServiceFeedSource::new(
            api.clone(),
            versions.clone(),
            chain.clone(),
            backoff,
        ));
        Self::with_feed_source(config, store, api, versions, chain, feed, notifier, renderer)
    }

    /// Build an engine around an explicit feed source. Production wiring
    /// goes through [`Engine::new`]; this seam exists for tests and
    /// alternative transports.
    #[allow(clippy::too_many_arguments)]
    pub fn with_feed_source(
        config: EngineConfig,
        store: StateStore,
        api: ApiClient,
        versions: Arc<VersionRegistry>,
        chain: Arc<CredentialChain>,
        feed: Arc<dyn FeedSource>,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self> {
        let runtime = MonitorRuntime::new(
            config.monitor.clone(),
            store.clone(),
            feed,
            notifier,
            renderer,
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                api,
                store,
                versions,
                chain,
                scheduler: TaskScheduler::new(),
                runtime,
            }),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.inner.versions
    }

    pub fn get_version(&self, kind: VersionKind) -> String {
        self.inner.versions.get(kind)
    }

    /// Arm the periodic background tasks: one refresh schedule per version
    /// entry, the keep-alive sweep, and (shortly after startup, so the
    /// rest of initialization can finish first) registry recovery.
    pub fn start_background_tasks(&self) {
        let cfg = &self.inner.config;

        self.arm_version_refresh(
            "versions:app",
            cfg.versions.app_refresh_secs,
            |engine| async move {
                engine
                    .inner
                    .versions
                    .refresh_app_version(&engine.inner.api)
                    .await;
            },
        );
        self.arm_version_refresh(
            "versions:companion",
            cfg.versions.companion_refresh_secs,
            |engine| async move {
                engine
                    .inner
                    .versions
                    .refresh_companion_version(&engine.inner.api)
                    .await;
            },
        );
        self.arm_version_refresh(
            "versions:webview",
            cfg.versions.webview_refresh_secs,
            |engine| async move {
                engine
                    .inner
                    .versions
                    .refresh_webview_version(&engine.inner.api)
                    .await;
            },
        );
        self.arm_version_refresh(
            "versions:query-ids",
            cfg.versions.query_ids_refresh_secs,
            |engine| async move {
                engine
                    .inner
                    .versions
                    .refresh_query_ids(&engine.inner.api)
                    .await;
            },
        );

        let engine = self.clone();
        self.inner.scheduler.run_every(
            "keep-alive",
            std::time::Duration::from_secs(cfg.auth.keep_alive_secs),
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(err) = engine.keep_alive_sweep().await {
                        warn!(error = %err, "keep-alive sweep reported failures");
                    }
                }
            },
        );

        let engine = self.clone();
        self.inner.scheduler.run_after(
            "recovery",
            std::time::Duration::from_secs(cfg.auth.recovery_delay_secs),
            move || async move {
                match engine.recover().await {
                    Ok(count) => info!(jobs = count, "recovered monitor jobs from registry"),
                    Err(err) => warn!(error = %err, "monitor job recovery failed"),
                }
            },
        );
    }

    fn arm_version_refresh<F, Fut>(&self, key: &str, every_secs: u64, refresh: F)
    where
        F: Fn(Engine) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let engine = self.clone();
        self.inner.scheduler.run_every(
            key,
            std::time::Duration::from_secs(every_secs),
            move || refresh(engine.clone()),
        );
    }

    /// Toggle monitoring for a (user, chat) pair.
    ///
    /// Enabling resets both cursors so the first poll bootstraps silently;
    /// enabling while already registered disables instead.
    pub async fn enable_monitoring(&self, user_id: i64, chat_id: i64) -> Result<MonitorToggle> {
        let job_name = JobRecord::name_for_user(user_id);
        if self.inner.store.get_job(&job_name).await?.is_some() {
            self.disable_monitoring(user_id).await?;
            return Ok(MonitorToggle::Disabled);
        }

        let job = JobRecord::new(user_id, chat_id, Utc::now());
        self.inner.store.add_job(&job).await?;
        self.arm_monitor_job(job.job_name.clone());
        info!(user = user_id, chat = chat_id, "monitoring enabled");
        Ok(MonitorToggle::Enabled)
    }

    /// Remove the registry row, then cancel the timer. Returns whether a
    /// job existed. An in-flight poll may finish but re-checks membership
    /// before doing anything, so it cannot reschedule itself.
    pub async fn disable_monitoring(&self, user_id: i64) -> Result<bool> {
        let job_name = JobRecord::name_for_user(user_id);
        let existed = self.inner.store.remove_job(&job_name).await?;
        self.inner.scheduler.cancel(&job_name);
        if existed {
            info!(user = user_id, "monitoring disabled");
        }
        Ok(existed)
    }

    fn arm_monitor_job(&self, job_name: String) {
        let runtime = self.inner.runtime.clone();
        let key = job_name.clone();
        self.inner.scheduler.run_every_until(
            &key,
            self.inner.config.monitor.interval(),
            move || {
                let runtime = runtime.clone();
                let job_name = job_name.clone();
                async move {
                    match runtime.poll_once(&job_name).await {
                        Ok(PollOutcome::AutoStopped) | Ok(PollOutcome::Cancelled) => false,
                        Ok(_) => true,
                        Err(err) => {
                            warn!(job = %job_name, error = %err, "monitor poll failed");
                            true
                        }
                    }
                }
            },
        );
    }

    /// Re-arm a monitor loop for every registry row, cursors intact.
    pub async fn recover(&self) -> Result<usize> {
        let jobs = self.inner.store.list_jobs().await?;
        for job in &jobs {
            self.arm_monitor_job(job.job_name.clone());
        }
        Ok(jobs.len())
    }

    /// Re-derive the credential pair for one profile, serialized per
    /// profile. Terminal failures mean the account needs re-linking.
    pub async fn refresh_credentials(&self, profile_id: i64) -> Result<Profile> {
        let mut profile = self
            .inner
            .store
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| anyhow!("unknown profile {profile_id}"))?;
        self.inner
            .chain
            .refresh(&mut profile)
            .await
            .with_context(|| format!("refreshing credentials for profile {profile_id}"))?;
        Ok(profile)
    }

    /// Fan one lightweight authenticated call out per profile, concurrently,
    /// and report all failures as one combined error. Siblings are never
    /// cancelled by one failure.
    pub async fn keep_alive_sweep(&self) -> Result<()> {
        let profiles = self.inner.store.all_profiles().await?;
        let mut tasks: JoinSet<(i64, ApiResultUnit)> = JoinSet::new();
        for profile in profiles {
            let chain = self.inner.chain.clone();
            let api = self.inner.api.clone();
            let versions = self.inner.versions.clone();
            tasks.spawn(async move {
                let mut profile = profile;
                let id = profile.id;
                let country = profile.country.clone();
                let result = chain
                    .with_auto_refresh(&mut profile, move |p| {
                        let api = api.clone();
                        let versions = versions.snapshot();
                        let country = country.clone();
                        async move {
                            let auth = AuthTokens {
                                gtoken: p.gtoken,
                                bullet_token: p.bullet_token,
                                language: p.language,
                                country: p.country,
                            };
                            api.graphql_query(
                                &versions,
                                &auth,
                                QueryKey::Home,
                                Some(("naCountry", serde_json::json!(country))),
                            )
                            .await
                            .map(|_| ())
                        }
                    })
                    .await;
                (id, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((profile_id, Err(err))) => {
                    failures.push(format!("profile {profile_id}: {err}"))
                }
                Err(err) => failures.push(format!("keep-alive task panicked: {err}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("keep-alive failures: {}", failures.join("; ")))
        }
    }

    /// Cancel every background task. The durable registry is untouched, so
    /// the next process recovers all monitors.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel_all();
        info!("engine shut down");
    }

    /// Whether a monitor loop is currently armed for this user.
    pub fn is_monitor_armed(&self, user_id: i64) -> bool {
        self.inner
            .scheduler
            .is_scheduled(&JobRecord::name_for_user(user_id))
    }
}

type ApiResultUnit = std::result::Result<(), ApiError>;
