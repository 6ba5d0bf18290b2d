//! Durable state on SQLite.
//!
//! Two tables: linked account profiles, and the monitor-job registry with
//! its per-feed cursors. Registry membership is the single source of truth
//! for which monitor loops should be running; the engine rebuilds timers
//! from it after a restart.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::instrument;

/// One linked external account. `gtoken` and `bullet_token` are derived
/// together by the credential chain and are only ever rewritten as a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    /// User-chosen label for the slot.
    pub name: String,
    /// Nickname reported by the account lookup.
    pub account_name: String,
    pub session_token: String,
    pub gtoken: String,
    pub bullet_token: String,
    pub language: String,
    pub country: String,
    pub is_current: bool,
}

/// One monitor-job registry row: identity, cursors, and the last time a
/// feed produced a delivered item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_name: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub last_battle_id: Option<String>,
    pub last_coop_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl JobRecord {
    /// Deterministic job name, so re-registration for the same user is
    /// idempotent and toggling can find the existing row.
    pub fn name_for_user(user_id: i64) -> String {
        format!("monitor-{user_id}")
    }

    /// Fresh registry row with unset cursors, activity clock starting now.
    pub fn new(user_id: i64, chat_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            job_name: Self::name_for_user(user_id),
            chat_id,
            user_id,
            last_battle_id: None,
            last_coop_id: None,
            last_activity: now,
        }
    }
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

type ProfileRow = (
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
);

type JobRow = (String, i64, i64, Option<String>, Option<String>, String);

fn profile_from_row(row: ProfileRow) -> Profile {
    let (id, user_id, name, account_name, session_token, gtoken, bullet_token, language, country, is_current) =
        row;
    Profile {
        id,
        user_id,
        name,
        account_name,
        session_token,
        gtoken,
        bullet_token,
        language,
        country,
        is_current: is_current != 0,
    }
}

fn job_from_row(row: JobRow) -> JobRecord {
    let (job_name, chat_id, user_id, last_battle_id, last_coop_id, last_activity) = row;
    JobRecord {
        job_name,
        chat_id,
        user_id,
        last_battle_id,
        last_coop_id,
        last_activity: DateTime::parse_from_rfc3339(&last_activity)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}

impl StateStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS profiles (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                name TEXT NOT NULL,\
                account_name TEXT NOT NULL DEFAULT '',\
                session_token TEXT NOT NULL,\
                gtoken TEXT NOT NULL DEFAULT '',\
                bullet_token TEXT NOT NULL DEFAULT '',\
                language TEXT NOT NULL DEFAULT '',\
                country TEXT NOT NULL DEFAULT '',\
                is_current INTEGER NOT NULL DEFAULT 0\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS monitor_jobs (\
                job_name TEXT PRIMARY KEY,\
                chat_id INTEGER NOT NULL,\
                user_id INTEGER NOT NULL,\
                last_battle_id TEXT,\
                last_coop_id TEXT,\
                last_activity TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- profiles ---

    /// Insert a freshly linked profile and return its id.
    pub async fn insert_profile(&self, profile: &Profile) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO profiles \
                (user_id, name, account_name, session_token, gtoken, bullet_token, language, country, is_current) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
            RETURNING id",
        )
        .bind(profile.user_id)
        .bind(&profile.name)
        .bind(&profile.account_name)
        .bind(&profile.session_token)
        .bind(&profile.gtoken)
        .bind(&profile.bullet_token)
        .bind(&profile.language)
        .bind(&profile.country)
        .bind(profile.is_current as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Rewrite a profile in place (credential refresh path).
    pub async fn update_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            "UPDATE profiles SET \
                name = ?2, account_name = ?3, session_token = ?4, gtoken = ?5, \
                bullet_token = ?6, language = ?7, country = ?8 \
            WHERE id = ?1",
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(&profile.account_name)
        .bind(&profile.session_token)
        .bind(&profile.gtoken)
        .bind(&profile.bullet_token)
        .bind(&profile.language)
        .bind(&profile.country)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, user_id, name, account_name, session_token, gtoken, bullet_token, language, country, is_current \
            FROM profiles WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(profile_from_row))
    }

    /// The profile the user has selected for their commands and monitors.
    pub async fn current_profile(&self, user_id: i64) -> Result<Option<Profile>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, user_id, name, account_name, session_token, gtoken, bullet_token, language, country, is_current \
            FROM profiles WHERE user_id = ?1 AND is_current = 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(profile_from_row))
    }

    /// Select a profile slot, clearing the previous selection.
    pub async fn set_current_profile(&self, user_id: i64, profile_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE profiles SET is_current = 0 WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE profiles SET is_current = 1 WHERE id = ?1 AND user_id = ?2")
            .bind(profile_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_profiles(&self, user_id: i64) -> Result<Vec<Profile>> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, user_id, name, account_name, session_token, gtoken, bullet_token, language, country, is_current \
            FROM profiles WHERE user_id = ?1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(profile_from_row).collect())
    }

    /// Every linked profile, for the keep-alive sweep.
    pub async fn all_profiles(&self) -> Result<Vec<Profile>> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, user_id, name, account_name, session_token, gtoken, bullet_token, language, country, is_current \
            FROM profiles ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(profile_from_row).collect())
    }

    pub async fn delete_profile(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM profiles WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- monitor-job registry ---

    /// Register a job. Re-registering the same name resets its cursors and
    /// activity clock, which is exactly the re-enable semantics.
    pub async fn add_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO monitor_jobs (job_name, chat_id, user_id, last_battle_id, last_coop_id, last_activity) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
            ON CONFLICT(job_name) DO UPDATE SET \
                chat_id = excluded.chat_id, \
                user_id = excluded.user_id, \
                last_battle_id = excluded.last_battle_id, \
                last_coop_id = excluded.last_coop_id, \
                last_activity = excluded.last_activity",
        )
        .bind(&job.job_name)
        .bind(job.chat_id)
        .bind(job.user_id)
        .bind(&job.last_battle_id)
        .bind(&job.last_coop_id)
        .bind(job.last_activity.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a registry row; returns whether it existed.
    pub async fn remove_job(&self, job_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM monitor_jobs WHERE job_name = ?1")
            .bind(job_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_job(&self, job_name: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT job_name, chat_id, user_id, last_battle_id, last_coop_id, last_activity \
            FROM monitor_jobs WHERE job_name = ?1",
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(job_from_row))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT job_name, chat_id, user_id, last_battle_id, last_coop_id, last_activity \
            FROM monitor_jobs ORDER BY job_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(job_from_row).collect())
    }

    pub async fn set_battle_cursor(&self, job_name: &str, cursor: &str) -> Result<()> {
        sqlx::query("UPDATE monitor_jobs SET last_battle_id = ?2 WHERE job_name = ?1")
            .bind(job_name)
            .bind(cursor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_coop_cursor(&self, job_name: &str, cursor: &str) -> Result<()> {
        sqlx::query("UPDATE monitor_jobs SET last_coop_id = ?2 WHERE job_name = ?1")
            .bind(job_name)
            .bind(cursor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record that a feed produced a delivered item.
    pub async fn touch_job_activity(&self, job_name: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE monitor_jobs SET last_activity = ?2 WHERE job_name = ?1")
            .bind(job_name)
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
