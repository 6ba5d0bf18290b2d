//! End-to-end polling behavior against a scripted feed: bootstrap,
//! incremental delivery, freeze, auto-stop, gap handling, and restart
//! recovery.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use tidebot_api::{ApiClient, ApiConfig, ApiError, ApiResult, FeedItem};
use tidebot_core::{
    CredentialChain, Engine, EngineConfig, FeedKind, FeedSource, MonitorRuntime, MonitorToggle,
    Notifier, PollOutcome, Renderer, VersionRegistry,
};
use tidebot_store::{JobRecord, Profile, StateStore};

fn item(id: &str) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        played_at: None,
    }
}

#[derive(Default)]
struct ScriptedFeed {
    battle: Mutex<Vec<FeedItem>>,
    coop: Mutex<Vec<FeedItem>>,
    fail_battle: AtomicBool,
    window_calls: AtomicU32,
}

impl ScriptedFeed {
    fn set_battle(&self, items: Vec<FeedItem>) {
        *self.battle.lock().unwrap() = items;
    }

    fn set_coop(&self, items: Vec<FeedItem>) {
        *self.coop.lock().unwrap() = items;
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    async fn fetch_window(
        &self,
        _profile: &mut Profile,
        feed: FeedKind,
    ) -> ApiResult<Vec<FeedItem>> {
        self.window_calls.fetch_add(1, Ordering::SeqCst);
        if feed == FeedKind::Battle && self.fail_battle.load(Ordering::SeqCst) {
            return Err(ApiError::Parse("scripted battle feed failure".into()));
        }
        let window = match feed {
            FeedKind::Battle => self.battle.lock().unwrap().clone(),
            FeedKind::Coop => self.coop.lock().unwrap().clone(),
        };
        Ok(window)
    }

    async fn fetch_detail(
        &self,
        _profile: &mut Profile,
        _feed: FeedKind,
        entry_id: &str,
    ) -> ApiResult<String> {
        Ok(format!(r#"{{"id":"{entry_id}"}}"#))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(i64, String)>>,
}

impl RecordingNotifier {
    fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((chat_id, text.to_string()));
        Ok(())
    }
}

struct EchoRenderer;

impl Renderer for EchoRenderer {
    fn battle_summary(&self, detail_json: &str) -> String {
        format!("battle:{detail_json}")
    }

    fn coop_summary(&self, detail_json: &str) -> String {
        format!("coop:{detail_json}")
    }

    fn auto_stop_notice(&self, idle_minutes: u64) -> String {
        format!("auto-stop:{idle_minutes}")
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: StateStore,
    feed: Arc<ScriptedFeed>,
    notifier: Arc<RecordingNotifier>,
    runtime: MonitorRuntime,
    config: EngineConfig,
}

async fn harness() -> Harness {
    let mut config = EngineConfig::default();
    config.monitor.interval_secs = 1;
    config.monitor.freeze_secs = 0;
    config.monitor.auto_stop_secs = 3600;

    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("state.db")).await.unwrap();

    let profile = Profile {
        id: 0,
        user_id: 42,
        name: "main".to_string(),
        account_name: "Squid".to_string(),
        session_token: "secret".to_string(),
        gtoken: "g".to_string(),
        bullet_token: "b".to_string(),
        language: "en-US".to_string(),
        country: "US".to_string(),
        is_current: false,
    };
    let profile_id = store.insert_profile(&profile).await.unwrap();
    store.set_current_profile(42, profile_id).await.unwrap();

    let feed = Arc::new(ScriptedFeed::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let runtime = MonitorRuntime::new(
        config.monitor.clone(),
        store.clone(),
        feed.clone(),
        notifier.clone(),
        Arc::new(EchoRenderer),
    );

    Harness {
        _dir: dir,
        store,
        feed,
        notifier,
        runtime,
        config,
    }
}

async fn add_active_job(store: &StateStore, minutes_idle: i64) -> JobRecord {
    let job = JobRecord {
        last_activity: Utc::now() - ChronoDuration::minutes(minutes_idle),
        ..JobRecord::new(42, -100, Utc::now())
    };
    store.add_job(&job).await.unwrap();
    job
}

#[tokio::test]
async fn bootstrap_then_incremental_delivery_without_duplicates() {
    let h = harness().await;
    let job = add_active_job(&h.store, 5).await;

    h.feed.set_battle(vec![item("c3"), item("c2"), item("c1")]);

    // First-ever poll: adopt the newest entry, deliver nothing.
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 0 });
    assert!(h.notifier.texts().is_empty());
    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    assert_eq!(row.last_battle_id.as_deref(), Some("c3"));

    // Two new entries appear: delivered oldest-first.
    h.feed
        .set_battle(vec![item("c5"), item("c4"), item("c3"), item("c2")]);
    h.store
        .touch_job_activity(&job.job_name, Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap();
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 2 });
    assert_eq!(
        h.notifier.texts(),
        vec![
            r#"battle:{"id":"c4"}"#.to_string(),
            r#"battle:{"id":"c5"}"#.to_string(),
        ]
    );

    // Nothing new: nothing is delivered again, ever.
    h.store
        .touch_job_activity(&job.job_name, Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap();
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 0 });
    assert_eq!(h.notifier.texts().len(), 2);
}

#[tokio::test]
async fn both_feeds_poll_independently() {
    let h = harness().await;
    let job = add_active_job(&h.store, 5).await;

    h.feed.set_battle(vec![item("b1")]);
    h.feed.set_coop(vec![item("s1")]);
    h.runtime.poll_once(&job.job_name).await.unwrap();

    // Battle feed breaks; coop still advances.
    h.feed.fail_battle.store(true, Ordering::SeqCst);
    h.feed.set_battle(vec![item("b2"), item("b1")]);
    h.feed.set_coop(vec![item("s2"), item("s1")]);
    h.store
        .touch_job_activity(&job.job_name, Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap();
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 1 });
    assert_eq!(h.notifier.texts(), vec![r#"coop:{"id":"s2"}"#.to_string()]);

    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    // The failed feed's cursor must not move.
    assert_eq!(row.last_battle_id.as_deref(), Some("b1"));
    assert_eq!(row.last_coop_id.as_deref(), Some("s2"));

    // Feed recovers: the missed battle entry is still delivered.
    h.feed.fail_battle.store(false, Ordering::SeqCst);
    h.store
        .touch_job_activity(&job.job_name, Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap();
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 1 });
    assert!(h.notifier.texts().contains(&r#"battle:{"id":"b2"}"#.to_string()));
}

#[tokio::test]
async fn freeze_window_skips_the_cycle_entirely() {
    let h = harness().await;

    let mut config = h.config.monitor.clone();
    config.freeze_secs = 30;
    let runtime = MonitorRuntime::new(
        config,
        h.store.clone(),
        h.feed.clone(),
        h.notifier.clone(),
        Arc::new(EchoRenderer),
    );

    // Activity seconds ago, freeze 30s: the poll is a cheap no-op.
    let job = add_active_job(&h.store, 0).await;
    h.feed.set_battle(vec![item("c2"), item("c1")]);

    let outcome = runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Frozen);
    assert_eq!(h.feed.window_calls.load(Ordering::SeqCst), 0);
    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    assert!(row.last_battle_id.is_none());
}

#[tokio::test]
async fn auto_stop_removes_the_job_and_notifies_exactly_once() {
    let h = harness().await;
    // 61 minutes idle against a 60-minute limit.
    let job = add_active_job(&h.store, 61).await;

    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::AutoStopped);
    assert!(h.store.get_job(&job.job_name).await.unwrap().is_none());
    assert_eq!(h.notifier.texts(), vec!["auto-stop:60".to_string()]);

    // The job is gone; a straggling cycle does nothing.
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Cancelled);
    assert_eq!(h.notifier.texts().len(), 1);
}

#[tokio::test]
async fn horizon_filters_stale_entries_but_still_advances_the_cursor() {
    let h = harness().await;
    let job = add_active_job(&h.store, 5).await;

    h.feed.set_battle(vec![item("c1")]);
    h.runtime.poll_once(&job.job_name).await.unwrap();

    let fresh = FeedItem {
        id: "c3".to_string(),
        played_at: Some(Utc::now() - ChronoDuration::minutes(1)),
    };
    let stale = FeedItem {
        id: "c2".to_string(),
        // Default horizon is six hours.
        played_at: Some(Utc::now() - ChronoDuration::hours(12)),
    };
    h.feed.set_battle(vec![fresh, stale, item("c1")]);
    h.store
        .touch_job_activity(&job.job_name, Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap();

    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 1 });
    assert_eq!(h.notifier.texts(), vec![r#"battle:{"id":"c3"}"#.to_string()]);
    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    assert_eq!(row.last_battle_id.as_deref(), Some("c3"));
}

#[tokio::test]
async fn reenabling_resets_cursors_and_bootstraps_again() {
    let h = harness().await;
    let job = add_active_job(&h.store, 5).await;

    h.feed.set_battle(vec![item("c2"), item("c1")]);
    h.runtime.poll_once(&job.job_name).await.unwrap();
    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    assert_eq!(row.last_battle_id.as_deref(), Some("c2"));

    // Disable, re-enable: cursors reset, so the first poll after
    // re-enabling delivers nothing no matter how much history exists.
    h.store.remove_job(&job.job_name).await.unwrap();
    add_active_job(&h.store, 5).await;
    h.feed.set_battle(vec![
        item("c9"),
        item("c8"),
        item("c7"),
        item("c2"),
        item("c1"),
    ]);
    let outcome = h.runtime.poll_once(&job.job_name).await.unwrap();
    assert_eq!(outcome, PollOutcome::Polled { delivered: 0 });
    assert!(h.notifier.texts().is_empty());
    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    assert_eq!(row.last_battle_id.as_deref(), Some("c9"));
}

fn engine_with(
    config: EngineConfig,
    store: StateStore,
    feed: Arc<ScriptedFeed>,
    notifier: Arc<RecordingNotifier>,
) -> Engine {
    let api = ApiClient::new(ApiConfig::default()).unwrap();
    let versions = Arc::new(VersionRegistry::new(&config.versions));
    let chain = Arc::new(CredentialChain::new(
        api.clone(),
        store.clone(),
        versions.clone(),
        config.backoff(),
    ));
    Engine::with_feed_source(
        config,
        store,
        api,
        versions,
        chain,
        feed,
        notifier,
        Arc::new(EchoRenderer),
    )
    .unwrap()
}

#[tokio::test]
async fn enable_is_a_toggle() {
    let h = harness().await;
    let engine = engine_with(
        h.config.clone(),
        h.store.clone(),
        h.feed.clone(),
        h.notifier.clone(),
    );

    let toggle = engine.enable_monitoring(42, -100).await.unwrap();
    assert_eq!(toggle, MonitorToggle::Enabled);
    assert!(engine.is_monitor_armed(42));
    assert_eq!(h.store.list_jobs().await.unwrap().len(), 1);

    let toggle = engine.enable_monitoring(42, -100).await.unwrap();
    assert_eq!(toggle, MonitorToggle::Disabled);
    assert!(!engine.is_monitor_armed(42));
    assert!(h.store.list_jobs().await.unwrap().is_empty());

    engine.shutdown();
}

#[tokio::test]
async fn recovery_rearms_registry_jobs_with_cursors_intact() {
    let h = harness().await;

    // Pre-shutdown state: one registered job that has already delivered
    // up to c3.
    let job = add_active_job(&h.store, 5).await;
    h.store.set_battle_cursor(&job.job_name, "c3").await.unwrap();
    h.feed
        .set_battle(vec![item("c4"), item("c3"), item("c2"), item("c1")]);

    // "Restart": a fresh engine over the same store.
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine_with(
        h.config.clone(),
        h.store.clone(),
        h.feed.clone(),
        notifier.clone(),
    );
    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered, 1);
    assert!(engine.is_monitor_armed(42));

    // The re-armed loop picks up exactly the one entry newer than the
    // persisted cursor: nothing lost, nothing re-delivered.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(notifier.texts(), vec![r#"battle:{"id":"c4"}"#.to_string()]);
    let row = h.store.get_job(&job.job_name).await.unwrap().unwrap();
    assert_eq!(row.last_battle_id.as_deref(), Some("c4"));

    engine.shutdown();

    // Second restart with no new entries: silence.
    let notifier2 = Arc::new(RecordingNotifier::default());
    let engine2 = engine_with(
        h.config.clone(),
        h.store.clone(),
        h.feed.clone(),
        notifier2.clone(),
    );
    engine2.recover().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert!(notifier2.texts().is_empty());
    engine2.shutdown();
}

#[tokio::test]
async fn keep_alive_sweep_with_no_profiles_is_clean() {
    let config = EngineConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("state.db")).await.unwrap();
    let engine = engine_with(
        config,
        store,
        Arc::new(ScriptedFeed::default()),
        Arc::new(RecordingNotifier::default()),
    );
    engine.keep_alive_sweep().await.unwrap();
    engine.shutdown();
}
