//! Incremental history polling.
//!
//! Each monitor job scans two ordered feeds on a fixed interval, emits
//! every entry newer than its stored cursor oldest-first, and advances the
//! cursor after each delivery so an entry is never handed out twice, even
//! across restarts.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use tidebot_api::{
    parse_battle_window, parse_coop_window, ApiClient, ApiError, ApiResult, AuthTokens, FeedItem,
    QueryKey,
};
use tidebot_store::{JobRecord, Profile, StateStore};

use crate::config::MonitorConfig;
use crate::credentials::CredentialChain;
use crate::retry::BackoffPolicy;
use crate::versions::VersionRegistry;
use crate::{Notifier, Renderer};

/// What to do when the stored cursor is missing from the fetched window
/// (the feed outran the poll interval). The conservative default accepts
/// the gap as a known loss instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    SkipToNewest,
    EmitWindow,
}

/// The two feeds a job tracks. No ordering is guaranteed between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Battle,
    Coop,
}

impl FeedKind {
    fn label(&self) -> &'static str {
        match self {
            FeedKind::Battle => "battle",
            FeedKind::Coop => "coop",
        }
    }
}

/// Result of diffing one fetched window against the stored cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorAdvance {
    /// Entries to deliver, oldest first.
    pub emit: Vec<FeedItem>,
    /// New cursor value; `None` means unchanged.
    pub cursor: Option<String>,
}

/// Diff a newest-first window against the stored cursor.
///
/// Bootstrap (no cursor yet) adopts the newest entry silently so enabling
/// a monitor never floods the chat with history.
pub fn advance_cursor(
    window: &[FeedItem],
    cursor: Option<&str>,
    gap_policy: GapPolicy,
) -> CursorAdvance {
    let Some(newest) = window.first() else {
        return CursorAdvance::default();
    };

    let Some(cursor) = cursor else {
        return CursorAdvance {
            emit: Vec::new(),
            cursor: Some(newest.id.clone()),
        };
    };

    match window.iter().position(|item| item.id == cursor) {
        Some(0) => CursorAdvance::default(),
        Some(k) => CursorAdvance {
            emit: window[..k].iter().rev().cloned().collect(),
            cursor: Some(newest.id.clone()),
        },
        None => match gap_policy {
            GapPolicy::SkipToNewest => CursorAdvance {
                emit: Vec::new(),
                cursor: Some(newest.id.clone()),
            },
            GapPolicy::EmitWindow => CursorAdvance {
                emit: window.iter().rev().cloned().collect(),
                cursor: Some(newest.id.clone()),
            },
        },
    }
}

/// Feed access behind a seam so the polling logic is independent of the
/// wire protocol. The production implementation signs GraphQL calls and
/// heals expired tokens; tests script windows directly.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_window(&self, profile: &mut Profile, feed: FeedKind)
        -> ApiResult<Vec<FeedItem>>;
    async fn fetch_detail(
        &self,
        profile: &mut Profile,
        feed: FeedKind,
        entry_id: &str,
    ) -> ApiResult<String>;
}

/// Production feed source: backoff around auto-refresh around the signed
/// persisted query.
pub struct ServiceFeedSource {
    api: ApiClient,
    versions: Arc<VersionRegistry>,
    chain: Arc<CredentialChain>,
    backoff: BackoffPolicy,
}

impl ServiceFeedSource {
    pub fn new(
        api: ApiClient,
        versions: Arc<VersionRegistry>,
        chain: Arc<CredentialChain>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            api,
            versions,
            chain,
            backoff,
        }
    }

    async fn signed_query(
        &self,
        profile: &mut Profile,
        key: QueryKey,
        variable: Option<(&'static str, String)>,
    ) -> ApiResult<String> {
        let api = self.api.clone();
        let versions = self.versions.snapshot();
        let backoff = self.backoff.clone();
        self.chain
            .with_auto_refresh(profile, move |p| {
                let api = api.clone();
                let versions = versions.clone();
                let backoff = backoff.clone();
                let variable = variable.clone();
                async move {
                    let auth = AuthTokens {
                        gtoken: p.gtoken,
                        bullet_token: p.bullet_token,
                        language: p.language,
                        country: p.country,
                    };
                    backoff
                        .run_with(
                            || {
                                let api = api.clone();
                                let versions = versions.clone();
                                let auth = auth.clone();
                                let variable = variable
                                    .as_ref()
                                    .map(|(name, value)| (*name, json!(value)));
                                async move {
                                    api.graphql_query(&versions, &auth, key, variable).await
                                }
                            },
                            ApiError::is_retryable,
                        )
                        .await
                }
            })
            .await
    }
}

#[async_trait]
impl FeedSource for ServiceFeedSource {
    async fn fetch_window(
        &self,
        profile: &mut Profile,
        feed: FeedKind,
    ) -> ApiResult<Vec<FeedItem>> {
        match feed {
            FeedKind::Battle => {
                let raw = self
                    .signed_query(profile, QueryKey::LatestBattleHistories, None)
                    .await?;
                parse_battle_window(&raw)
            }
            FeedKind::Coop => {
                let raw = self.signed_query(profile, QueryKey::CoopHistory, None).await?;
                parse_coop_window(&raw)
            }
        }
    }

    async fn fetch_detail(
        &self,
        profile: &mut Profile,
        feed: FeedKind,
        entry_id: &str,
    ) -> ApiResult<String> {
        match feed {
            FeedKind::Battle => {
                self.signed_query(
                    profile,
                    QueryKey::VsHistoryDetail,
                    Some(("vsResultId", entry_id.to_string())),
                )
                .await
            }
            FeedKind::Coop => {
                self.signed_query(
                    profile,
                    QueryKey::CoopHistoryDetail,
                    Some(("coopHistoryDetailId", entry_id.to_string())),
                )
                .await
            }
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Cycle ran; carries the number of delivered entries.
    Polled { delivered: usize },
    /// Last delivery was too recent; nothing was fetched.
    Frozen,
    /// The job removed itself after the inactivity limit.
    AutoStopped,
    /// The registry no longer contains this job.
    Cancelled,
}

/// Everything one poll cycle needs; shared by all monitor loops.
#[derive(Clone)]
pub struct MonitorRuntime {
    config: MonitorConfig,
    store: StateStore,
    feed: Arc<dyn FeedSource>,
    notifier: Arc<dyn Notifier>,
    renderer: Arc<dyn Renderer>,
}

impl MonitorRuntime {
    pub fn new(
        config: MonitorConfig,
        store: StateStore,
        feed: Arc<dyn FeedSource>,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            store,
            feed,
            notifier,
            renderer,
        }
    }

    /// Run one poll cycle for the named job.
    pub async fn poll_once(&self, job_name: &str) -> Result<PollOutcome> {
        let Some(job) = self.store.get_job(job_name).await? else {
            return Ok(PollOutcome::Cancelled);
        };
        let now = Utc::now();

        // Freeze window: a recent delivery means the chat is busy; skip
        // the whole cycle cheaply.
        if now - job.last_activity < self.config.freeze() {
            return Ok(PollOutcome::Frozen);
        }

        if now - job.last_activity > self.config.auto_stop() {
            info!(job = job_name, "no deliveries within the auto-stop window; stopping");
            // Registry first, then the notice: an in-flight poll elsewhere
            // must already see the job as gone.
            self.store.remove_job(job_name).await?;
            let idle_minutes = self.config.auto_stop_secs / 60;
            let notice = self.renderer.auto_stop_notice(idle_minutes);
            if let Err(err) = self.notifier.send_message(job.chat_id, &notice).await {
                warn!(job = job_name, error = %err, "failed to send auto-stop notice");
            }
            return Ok(PollOutcome::AutoStopped);
        }

        let mut profile = self
            .store
            .current_profile(job.user_id)
            .await?
            .ok_or_else(|| anyhow!("user {} has no selected profile", job.user_id))?;

        let mut delivered = 0;
        for feed in [FeedKind::Battle, FeedKind::Coop] {
            match self.poll_feed(&job, feed, &mut profile).await {
                Ok(count) => delivered += count,
                // One feed failing must not stop the other, and must not
                // move its own cursor.
                Err(err) => {
                    warn!(job = job_name, feed = feed.label(), error = %err, "feed poll failed")
                }
            }
        }

        Ok(PollOutcome::Polled { delivered })
    }

    async fn poll_feed(
        &self,
        job: &JobRecord,
        feed: FeedKind,
        profile: &mut Profile,
    ) -> Result<usize> {
        let window = self.feed.fetch_window(profile, feed).await?;
        let cursor = match feed {
            FeedKind::Battle => job.last_battle_id.as_deref(),
            FeedKind::Coop => job.last_coop_id.as_deref(),
        };
        let advance = advance_cursor(&window, cursor, self.config.gap_policy);

        let now = Utc::now();
        let horizon = now - self.config.retrieve_previous();
        let mut delivered = 0;

        for item in &advance.emit {
            // Entries that are provably older than the horizon still count
            // toward the cursor but are not delivered; this keeps a long
            // outage from dumping stale history into the chat.
            if let Some(played_at) = item.played_at {
                if played_at < horizon {
                    continue;
                }
            }

            let detail = self.feed.fetch_detail(profile, feed, &item.id).await?;
            let text = match feed {
                FeedKind::Battle => self.renderer.battle_summary(&detail),
                FeedKind::Coop => self.renderer.coop_summary(&detail),
            };
            if let Err(err) = self.notifier.send_message(job.chat_id, &text).await {
                warn!(job = %job.job_name, error = %err, "chat delivery failed");
            }

            // Persist after each delivery so a crash mid-window never
            // replays what was already sent.
            self.set_cursor(&job.job_name, feed, &item.id).await?;
            self.store.touch_job_activity(&job.job_name, now).await?;
            delivered += 1;
        }

        if let Some(cursor) = advance.cursor {
            self.set_cursor(&job.job_name, feed, &cursor).await?;
        }

        Ok(delivered)
    }

    async fn set_cursor(&self, job_name: &str, feed: FeedKind, cursor: &str) -> Result<()> {
        match feed {
            FeedKind::Battle => self.store.set_battle_cursor(job_name, cursor).await,
            FeedKind::Coop => self.store.set_coop_cursor(job_name, cursor).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn item(id: &str) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            played_at: None,
        }
    }

    fn stamped(id: &str, at: &str) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            played_at: Some(at.parse::<DateTime<Utc>>().unwrap()),
        }
    }

    #[test]
    fn bootstrap_adopts_newest_without_emitting() {
        let window = vec![item("E"), item("D"), item("C")];
        let advance = advance_cursor(&window, None, GapPolicy::SkipToNewest);
        assert!(advance.emit.is_empty());
        assert_eq!(advance.cursor.as_deref(), Some("E"));
    }

    #[test]
    fn emits_new_entries_chronologically() {
        // Window newest-first [A,B,C,D,E], cursor C: new entries are B and
        // A, delivered oldest-first.
        let window = vec![item("A"), item("B"), item("C"), item("D"), item("E")];
        let advance = advance_cursor(&window, Some("C"), GapPolicy::SkipToNewest);
        assert_eq!(
            advance.emit.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["B", "A"]
        );
        assert_eq!(advance.cursor.as_deref(), Some("A"));
    }

    #[test]
    fn cursor_at_newest_is_a_no_op() {
        let window = vec![item("A"), item("B")];
        let advance = advance_cursor(&window, Some("A"), GapPolicy::SkipToNewest);
        assert!(advance.emit.is_empty());
        assert!(advance.cursor.is_none());
    }

    #[test]
    fn missing_cursor_skips_to_newest_by_default() {
        let window = vec![item("A"), item("B"), item("C")];
        let advance = advance_cursor(&window, Some("Z"), GapPolicy::SkipToNewest);
        assert!(advance.emit.is_empty());
        assert_eq!(advance.cursor.as_deref(), Some("A"));
    }

    #[test]
    fn missing_cursor_can_emit_the_window_when_configured() {
        let window = vec![item("A"), item("B"), item("C")];
        let advance = advance_cursor(&window, Some("Z"), GapPolicy::EmitWindow);
        assert_eq!(
            advance.emit.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["C", "B", "A"]
        );
        assert_eq!(advance.cursor.as_deref(), Some("A"));
    }

    #[test]
    fn empty_window_changes_nothing() {
        let advance = advance_cursor(&[], Some("C"), GapPolicy::SkipToNewest);
        assert!(advance.emit.is_empty());
        assert!(advance.cursor.is_none());

        let advance = advance_cursor(&[], None, GapPolicy::SkipToNewest);
        assert!(advance.cursor.is_none());
    }

    #[test]
    fn stamped_items_keep_their_order_through_the_diff() {
        let window = vec![
            stamped("new", "2023-04-03T03:00:00Z"),
            stamped("mid", "2023-04-03T02:00:00Z"),
            stamped("old", "2023-04-03T01:00:00Z"),
        ];
        let advance = advance_cursor(&window, Some("old"), GapPolicy::SkipToNewest);
        let times: Vec<_> = advance.emit.iter().map(|i| i.played_at.unwrap()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}
