//! Leaderboard Provider collaborator backed by the speedrun.com REST API.
//!
//! Only the handful of calls the bot needs. Runner lookups are cached in the
//! store: a known runner is never re-fetched, a known non-runner is
//! re-checked after a week, and personal bests at most once a day.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result, MAX_CANDIDATES};
use crate::http::RequestClient;
use crate::store::Store;

pub const SRC_API: &str = "https://www.speedrun.com/api/v1";

const NON_RUNNER_TTL_DAYS: i64 = 7;
const PERSONAL_BEST_TTL_DAYS: i64 = 1;

/// speedrun.com's maximum page size.
const PAGE_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Collaborator interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    New,
    Verified,
    Rejected,
    Deleted,
}

impl RunStatus {
    /// Reaction that marks the resolution on the announcement, if resolved.
    pub fn reaction(self) -> Option<&'static str> {
        match self {
            RunStatus::New => None,
            RunStatus::Verified => Some("✅"),
            RunStatus::Rejected => Some("❌"),
            RunStatus::Deleted => Some("🗑️"),
        }
    }
}

/// A run awaiting verification.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedRun {
    pub id: String,
    pub game_id: String,
    pub submitted_at: DateTime<Utc>,
    pub weblink: String,
    pub category: String,
    pub runner: String,
    /// Primary time in seconds.
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcUser {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait LeaderboardProvider: Send + Sync {
    /// speedrun.com id of the runner streaming as `twitch_name`, if any.
    async fn is_known_runner(&self, twitch_name: &str) -> Result<Option<String>>;

    /// Whether `twitch_name` has a personal best in `src_game_id`.
    async fn runs_game(&self, twitch_name: &str, src_game_id: &str) -> Result<bool>;

    async fn get_unverified_runs(&self, src_game_id: &str) -> Result<Vec<SubmittedRun>>;

    async fn get_run_status(&self, run_id: &str) -> Result<RunStatus>;

    /// Resolve a game name to exactly one speedrun.com game id.
    async fn find_game(&self, name: &str) -> Result<String>;

    /// Resolve a user name to exactly one speedrun.com user.
    async fn find_user(&self, name: &str) -> Result<SrcUser>;
}

/// Pick one candidate for `query`: a lone result wins, then an exact name
/// match. Anything else is a command error listing the candidates.
pub fn pick_exact_match<T>(query: &str, what: &str, candidates: Vec<(String, T)>) -> Result<T> {
    if candidates.len() <= 1 {
        return candidates
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| {
                Error::command(format!("Could not find {} {} on Speedrun.com", what, query))
            });
    }

    let count = candidates.len();
    let mut names = Vec::with_capacity(count);
    for (name, value) in candidates {
        if name == query {
            return Ok(value);
        }
        names.push(name);
    }
    names.truncate(MAX_CANDIDATES);
    Err(Error::Command {
        message: format!(
            "Found {} possible matches for {} {} on Speedrun.com -- Try one of these options:",
            count, what, query
        ),
        candidates: names,
    })
}

// ---------------------------------------------------------------------------
// speedrun.com wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Names {
    international: String,
    #[serde(default)]
    twitch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    names: Names,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    weblink: String,
    game: String,
    submitted: Option<DateTime<Utc>>,
    times: Times,
    category: Envelope<Category>,
    players: Envelope<Vec<Player>>,
}

#[derive(Debug, Deserialize)]
struct Times {
    primary_t: f64,
}

#[derive(Debug, Deserialize)]
struct Category {
    name: String,
}

/// Registered users carry `names`, guests only `name`.
#[derive(Debug, Deserialize)]
struct Player {
    #[serde(default)]
    names: Option<Names>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunWithStatus {
    status: Status,
}

#[derive(Debug, Deserialize)]
struct Status {
    status: String,
}

impl Run {
    fn into_submitted(self) -> SubmittedRun {
        let runner = self
            .players
            .data
            .into_iter()
            .filter_map(|p| p.names.map(|n| n.international).or(p.name))
            .collect::<Vec<_>>()
            .join(", ");
        SubmittedRun {
            id: self.id,
            game_id: self.game,
            submitted_at: self.submitted.unwrap_or_else(Utc::now),
            weblink: self.weblink,
            category: self.category.data.name,
            runner,
            time: self.times.primary_t,
        }
    }
}

fn parse_status(status: &str) -> Result<RunStatus> {
    match status {
        "new" => Ok(RunStatus::New),
        "verified" => Ok(RunStatus::Verified),
        "rejected" => Ok(RunStatus::Rejected),
        other => Err(crate::http::HttpError::Decode(format!("unknown run status `{}`", other)).into()),
    }
}

// ---------------------------------------------------------------------------
// SpeedrunClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpeedrunClient {
    http: RequestClient,
    store: Store,
}

impl SpeedrunClient {
    pub fn new(http: RequestClient, store: Store) -> Self {
        Self { http, store }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", SRC_API, path);
        let envelope: Envelope<T> = self
            .http
            .json(|client| client.get(&url).query(query))
            .await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl LeaderboardProvider for SpeedrunClient {
    async fn is_known_runner(&self, twitch_name: &str) -> Result<Option<String>> {
        let now = Utc::now();
        if let Some(record) = self.store.runner(twitch_name).await? {
            if record.src_id.is_some() {
                return Ok(record.src_id);
            }
            if now < record.fetched_at + Duration::days(NON_RUNNER_TTL_DAYS) {
                return Ok(None);
            }
        }

        let users: Vec<Resource> = self
            .get("users", &[("twitch", twitch_name.to_string())])
            .await?;
        match users.into_iter().next() {
            Some(user) => {
                debug!(twitch_name, src_id = %user.id, "found speedrunner");
                // Epoch fetch time so the first personal-best check fetches.
                self.store
                    .put_runner(twitch_name, Some(&user.id), DateTime::<Utc>::UNIX_EPOCH)
                    .await?;
                Ok(Some(user.id))
            }
            None => {
                self.store.put_runner(twitch_name, None, now).await?;
                Ok(None)
            }
        }
    }

    async fn runs_game(&self, twitch_name: &str, src_game_id: &str) -> Result<bool> {
        let Some(record) = self.store.runner(twitch_name).await? else {
            return Ok(false);
        };
        let Some(src_id) = record.src_id else {
            return Ok(false);
        };
        if self.store.has_personal_best(&src_id, src_game_id).await? {
            return Ok(true);
        }

        let now = Utc::now();
        if now < record.fetched_at + Duration::days(PERSONAL_BEST_TTL_DAYS) {
            return Ok(false);
        }
        self.store.touch_runner(twitch_name, now).await?;

        let pbs: Vec<serde_json::Value> = self
            .get(
                &format!("users/{}/personal-bests", src_id),
                &[("game", src_game_id.to_string())],
            )
            .await?;
        if pbs.is_empty() {
            return Ok(false);
        }
        self.store.add_personal_best(&src_id, src_game_id).await?;
        Ok(true)
    }

    async fn get_unverified_runs(&self, src_game_id: &str) -> Result<Vec<SubmittedRun>> {
        let mut runs = Vec::new();
        let mut offset = 0usize;
        loop {
            let page: Vec<Run> = self
                .get(
                    "runs",
                    &[
                        ("game", src_game_id.to_string()),
                        ("status", "new".to_string()),
                        ("orderby", "submitted".to_string()),
                        ("direction", "asc".to_string()),
                        ("embed", "category,players".to_string()),
                        ("max", PAGE_SIZE.to_string()),
                        ("offset", offset.to_string()),
                    ],
                )
                .await?;
            let count = page.len();
            runs.extend(page.into_iter().map(Run::into_submitted));
            if count < PAGE_SIZE {
                break;
            }
            offset += count;
        }
        Ok(runs)
    }

    async fn get_run_status(&self, run_id: &str) -> Result<RunStatus> {
        let url = format!("{}/runs/{}", SRC_API, run_id);
        let result: std::result::Result<Envelope<RunWithStatus>, _> =
            self.http.json(|client| client.get(&url)).await;
        match result {
            Ok(run) => parse_status(&run.data.status.status),
            Err(e) if e.is_not_found() => Ok(RunStatus::Deleted),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_game(&self, name: &str) -> Result<String> {
        let games: Vec<Resource> = self.get("games", &[("name", name.to_string())]).await?;
        let candidates = games
            .into_iter()
            .map(|g| (g.names.twitch.unwrap_or(g.names.international), g.id))
            .collect();
        pick_exact_match(name, "game", candidates)
    }

    async fn find_user(&self, name: &str) -> Result<SrcUser> {
        let users: Vec<Resource> = self.get("users", &[("name", name.to_string())]).await?;
        let candidates = users
            .into_iter()
            .map(|u| {
                let user = SrcUser {
                    id: u.id,
                    name: u.names.international.clone(),
                };
                (u.names.international, user)
            })
            .collect();
        pick_exact_match(name, "user", candidates)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
