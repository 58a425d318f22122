//! Persistent Store.
//!
//! SQLite behind a pool of exactly one connection: the pool's queue is the
//! single serialized access point for every task (gateway hooks and both
//! reconciliation timers). Each method is one atomically-committed
//! statement, so no lock is ever held across a network call.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::Snowflake;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        twitch_name  TEXT NOT NULL PRIMARY KEY,
        src_id       TEXT,
        fetched_at   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tracked_games (
        name            TEXT NOT NULL PRIMARY KEY,
        twitch_game_id  TEXT NOT NULL UNIQUE,
        src_game_id     TEXT NOT NULL UNIQUE,
        channel_id      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS personal_bests (
        src_id       TEXT NOT NULL,
        src_game_id  TEXT NOT NULL,
        PRIMARY KEY (src_id, src_game_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS moderated_games (
        name         TEXT NOT NULL PRIMARY KEY,
        src_game_id  TEXT NOT NULL UNIQUE,
        channel_id   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS announced_streams (
        name                TEXT NOT NULL,
        game                TEXT NOT NULL,
        title               TEXT NOT NULL,
        url                 TEXT NOT NULL,
        preview_url         TEXT NOT NULL,
        channel_id          TEXT NOT NULL,
        message_id          TEXT NOT NULL,
        started_at          TEXT NOT NULL,
        preview_expires_at  TEXT NOT NULL,
        PRIMARY KEY (name, game)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS unverified_runs (
        run_id        TEXT NOT NULL PRIMARY KEY,
        game_id       TEXT NOT NULL,
        submitted_at  TEXT NOT NULL,
        channel_id    TEXT NOT NULL,
        message_id    TEXT NOT NULL
    )
    "#,
];

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TrackedGame {
    pub name: String,
    pub twitch_game_id: String,
    pub src_game_id: String,
    pub channel_id: Snowflake,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ModeratedGame {
    pub name: String,
    pub src_game_id: String,
    pub channel_id: Snowflake,
}

/// Cached answer to "is this Twitch user a speedrunner?".
///
/// `src_id` is `None` for a user known *not* to be a runner.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RunnerRecord {
    pub twitch_name: String,
    pub src_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A stream whose "went live" message is posted and not yet retired.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AnnouncedStream {
    pub name: String,
    pub game: String,
    pub title: String,
    pub url: String,
    pub preview_url: String,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    pub started_at: DateTime<Utc>,
    pub preview_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UnverifiedRun {
    pub run_id: String,
    pub game_id: String,
    pub submitted_at: DateTime<Utc>,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `url`, e.g.
    /// `sqlite:speedrun-bot.db?mode=rwc`.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "opened store");
        Ok(store)
    }

    /// Private database that lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        // An in-memory database dies with its connection, so never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("store schema up to date");
        Ok(())
    }

    // -- Runners -------------------------------------------------------------

    pub async fn runner(&self, twitch_name: &str) -> Result<Option<RunnerRecord>> {
        let row = sqlx::query_as::<_, RunnerRecord>("SELECT * FROM users WHERE twitch_name = ?")
            .bind(twitch_name.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn put_runner(
        &self,
        twitch_name: &str,
        src_id: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO users (twitch_name, src_id, fetched_at) VALUES (?, ?, ?)")
            .bind(twitch_name.to_lowercase())
            .bind(src_id)
            .bind(fetched_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_runner(&self, twitch_name: &str, fetched_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET fetched_at = ? WHERE twitch_name = ?")
            .bind(fetched_at)
            .bind(twitch_name.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has_personal_best(&self, src_id: &str, src_game_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM personal_bests WHERE src_id = ? AND src_game_id = ?")
                .bind(src_id)
                .bind(src_game_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn add_personal_best(&self, src_id: &str, src_game_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO personal_bests (src_id, src_game_id) VALUES (?, ?)")
            .bind(src_id)
            .bind(src_game_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Tracked games -------------------------------------------------------

    pub async fn tracked_games(&self) -> Result<Vec<TrackedGame>> {
        let rows = sqlx::query_as::<_, TrackedGame>("SELECT * FROM tracked_games ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn add_tracked_game(&self, game: &TrackedGame) -> Result<()> {
        sqlx::query(
            "INSERT INTO tracked_games (name, twitch_game_id, src_game_id, channel_id) VALUES (?, ?, ?, ?)",
        )
        .bind(&game.name)
        .bind(&game.twitch_game_id)
        .bind(&game.src_game_id)
        .bind(&game.channel_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::command(format!("Game `{}` is already being tracked.", game.name))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Stop tracking `name` and forget the personal bests cached for it.
    /// Returns `false` if the game was not tracked.
    pub async fn remove_tracked_game(&self, name: &str) -> Result<bool> {
        let src_game_id: Option<(String,)> =
            sqlx::query_as("SELECT src_game_id FROM tracked_games WHERE name = ? COLLATE NOCASE")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((src_game_id,)) = src_game_id else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM personal_bests WHERE src_game_id = ?")
            .bind(&src_game_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM tracked_games WHERE src_game_id = ?")
            .bind(&src_game_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    // -- Moderated games -----------------------------------------------------

    pub async fn moderated_games(&self) -> Result<Vec<ModeratedGame>> {
        let rows = sqlx::query_as::<_, ModeratedGame>("SELECT * FROM moderated_games ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn add_moderated_game(&self, game: &ModeratedGame) -> Result<()> {
        sqlx::query("INSERT INTO moderated_games (name, src_game_id, channel_id) VALUES (?, ?, ?)")
            .bind(&game.name)
            .bind(&game.src_game_id)
            .bind(&game.channel_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::command(format!("Game `{}` is already being moderated.", game.name))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub async fn remove_moderated_game(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM moderated_games WHERE name = ? COLLATE NOCASE")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Announced streams ---------------------------------------------------

    pub async fn announced_streams(&self) -> Result<Vec<AnnouncedStream>> {
        let rows = sqlx::query_as::<_, AnnouncedStream>("SELECT * FROM announced_streams")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn announced_stream(&self, name: &str, game: &str) -> Result<Option<AnnouncedStream>> {
        let row = sqlx::query_as::<_, AnnouncedStream>(
            "SELECT * FROM announced_streams WHERE name = ? AND game = ?",
        )
        .bind(name)
        .bind(game)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn add_announced_stream(&self, stream: &AnnouncedStream) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO announced_streams
                (name, game, title, url, preview_url, channel_id, message_id, started_at, preview_expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stream.name)
        .bind(&stream.game)
        .bind(&stream.title)
        .bind(&stream.url)
        .bind(&stream.preview_url)
        .bind(&stream.channel_id)
        .bind(&stream.message_id)
        .bind(stream.started_at)
        .bind(stream.preview_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a title/preview refresh of a still-live stream.
    pub async fn update_announced_stream(&self, stream: &AnnouncedStream) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE announced_streams
            SET title = ?, preview_url = ?, preview_expires_at = ?
            WHERE name = ? AND game = ?
            "#,
        )
        .bind(&stream.title)
        .bind(&stream.preview_url)
        .bind(stream.preview_expires_at)
        .bind(&stream.name)
        .bind(&stream.game)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_announced_stream(&self, name: &str, game: &str) -> Result<()> {
        sqlx::query("DELETE FROM announced_streams WHERE name = ? AND game = ?")
            .bind(name)
            .bind(game)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Unverified runs -----------------------------------------------------

    pub async fn unverified_runs(&self, game_id: &str) -> Result<Vec<UnverifiedRun>> {
        let rows = sqlx::query_as::<_, UnverifiedRun>(
            "SELECT * FROM unverified_runs WHERE game_id = ? ORDER BY submitted_at",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn add_unverified_run(&self, run: &UnverifiedRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO unverified_runs (run_id, game_id, submitted_at, channel_id, message_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.game_id)
        .bind(run.submitted_at)
        .bind(&run.channel_id)
        .bind(&run.message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_unverified_run(&self, run_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM unverified_runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
