use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_lock::Mutex;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discord::{DiscordRest, EditOutcome};
use crate::error::Result;
use crate::markdown::{escape_markdown, format_duration};
use crate::speedrun::LeaderboardProvider;
use crate::store::{AnnouncedStream, Store, TrackedGame};
use crate::twitch::{LiveStream, StreamProvider};
use crate::types::{CreateMessage, EditMessage, Embed};

/// (runner name, tracked game name)
type StreamKey = (String, String);

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPass {
    pub went_live: usize,
    pub refreshed: usize,
    pub went_offline: usize,
    /// Missing streams not yet retired (unconfirmed or inside the debounce).
    pub pending_offline: usize,
    pub failures: usize,
}

/// Announces tracked-game speedrunners going live and retires the
/// announcement once they are confirmed offline.
pub struct StreamReconciler {
    store: Store,
    streams: Arc<dyn StreamProvider>,
    leaderboard: Arc<dyn LeaderboardProvider>,
    discord: Arc<dyn DiscordRest>,
    /// How long a stream must stay missing and unconfirmed before the
    /// offline edit is sent.
    offline_confirmation: Duration,
    missing_since: Mutex<HashMap<StreamKey, DateTime<Utc>>>,
}

impl StreamReconciler {
    pub fn new(
        store: Store,
        streams: Arc<dyn StreamProvider>,
        leaderboard: Arc<dyn LeaderboardProvider>,
        discord: Arc<dyn DiscordRest>,
        offline_confirmation: Duration,
    ) -> Self {
        Self {
            store,
            streams,
            leaderboard,
            discord,
            offline_confirmation,
            missing_since: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile_live_streams(&self) -> Result<StreamPass> {
        self.reconcile_live_streams_at(Utc::now()).await
    }

    /// One reconciliation pass as of `now`.
    ///
    /// Only a failure to read the store or to fetch the live list aborts
    /// the pass; in that case nothing is marked offline.
    pub async fn reconcile_live_streams_at(&self, now: DateTime<Utc>) -> Result<StreamPass> {
        let mut pass = StreamPass::default();

        let games = self.store.tracked_games().await?;
        if games.is_empty() {
            debug!("no tracked games, skipping stream reconciliation");
            return Ok(pass);
        }
        let by_twitch_id: HashMap<&str, &TrackedGame> = games
            .iter()
            .map(|g| (g.twitch_game_id.as_str(), g))
            .collect();
        let by_name: HashMap<&str, &TrackedGame> =
            games.iter().map(|g| (g.name.as_str(), g)).collect();

        let announced: HashMap<StreamKey, AnnouncedStream> = self
            .store
            .announced_streams()
            .await?
            .into_iter()
            .map(|row| ((row.name.clone(), row.game.clone()), row))
            .collect();

        // One batched call covers every tracked game.
        let game_ids: Vec<String> = games.iter().map(|g| g.twitch_game_id.clone()).collect();
        let fetched = self.streams.get_live_streams(&game_ids).await?;
        debug!(count = fetched.len(), games = games.len(), "fetched live streams");

        // -- live set --------------------------------------------------------

        let mut live: HashMap<StreamKey, (LiveStream, &TrackedGame)> = HashMap::new();
        for stream in fetched {
            let Some(game) = by_twitch_id.get(stream.game_id.as_str()).copied() else {
                continue;
            };
            let key = (stream.name.clone(), game.name.clone());
            if live.contains_key(&key) {
                continue;
            }
            // Announced rows were already vetted when they went live.
            if !announced.contains_key(&key) {
                match self.is_speedrunner_of(&stream, game).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(stream = %stream.name, game = %game.name, error = %e, "speedrunner lookup failed");
                        pass.failures += 1;
                        continue;
                    }
                }
            }
            live.insert(key, (stream, game));
        }

        // -- went live / still live ------------------------------------------

        for (key, (stream, game)) in &live {
            match announced.get(key) {
                None => match self.announce(stream, game, now).await {
                    Ok(()) => pass.went_live += 1,
                    Err(e) => {
                        warn!(stream = %stream.name, game = %game.name, error = %e, "failed to announce stream");
                        pass.failures += 1;
                    }
                },
                Some(row) => {
                    self.missing_since.lock().await.remove(key);
                    match self.refresh(row, stream, now).await {
                        Ok(true) => pass.refreshed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(stream = %row.name, game = %row.game, error = %e, "failed to refresh stream");
                            pass.failures += 1;
                        }
                    }
                }
            }
        }

        // -- possibly offline ------------------------------------------------

        let missing: Vec<&AnnouncedStream> = announced
            .iter()
            .filter(|(key, _)| !live.contains_key(*key))
            .map(|(_, row)| row)
            .collect();
        if !missing.is_empty() {
            let offline = self.confirm_offline(&missing, &by_name, &mut pass).await;
            for row in missing {
                let key = (row.name.clone(), row.game.clone());
                if !offline.contains(&key) {
                    pass.pending_offline += 1;
                    continue;
                }

                let first_missing = *self.missing_since.lock().await.entry(key.clone()).or_insert(now);
                if now - first_missing < self.offline_confirmation {
                    debug!(stream = %row.name, game = %row.game, "stream missing, waiting for debounce");
                    pass.pending_offline += 1;
                    continue;
                }

                match self.retire(row, now).await {
                    Ok(()) => {
                        self.missing_since.lock().await.remove(&key);
                        pass.went_offline += 1;
                    }
                    Err(e) => {
                        warn!(stream = %row.name, game = %row.game, error = %e, "failed to retire stream");
                        pass.failures += 1;
                    }
                }
            }
        }

        info!(
            went_live = pass.went_live,
            refreshed = pass.refreshed,
            went_offline = pass.went_offline,
            pending_offline = pass.pending_offline,
            failures = pass.failures,
            "stream reconciliation pass finished"
        );
        Ok(pass)
    }

    async fn is_speedrunner_of(&self, stream: &LiveStream, game: &TrackedGame) -> Result<bool> {
        if self.leaderboard.is_known_runner(&stream.name).await?.is_none() {
            debug!(stream = %stream.name, "not a speedrunner");
            return Ok(false);
        }
        let runs = self
            .leaderboard
            .runs_game(&stream.name, &game.src_game_id)
            .await?;
        if !runs {
            debug!(stream = %stream.name, game = %game.name, "speedrunner, but not of this game");
        }
        Ok(runs)
    }

    /// Two-stage check of streams missing from the live list. Returns the
    /// keys that neither stage could show live under the same game.
    async fn confirm_offline(
        &self,
        missing: &[&AnnouncedStream],
        games: &HashMap<&str, &TrackedGame>,
        pass: &mut StreamPass,
    ) -> HashSet<StreamKey> {
        let mut offline = HashSet::new();
        let mut ambiguous = Vec::new();

        // Stage 1: an offline channel's preview redirects to a placeholder.
        for row in missing {
            match self.streams.get_preview_metadata(&row.preview_url).await {
                Ok(meta) if meta.is_redirect => {
                    offline.insert((row.name.clone(), row.game.clone()));
                }
                Ok(_) => ambiguous.push(*row),
                Err(e) => {
                    warn!(stream = %row.name, game = %row.game, error = %e, "preview check failed");
                    ambiguous.push(*row);
                }
            }
        }
        if ambiguous.is_empty() {
            return offline;
        }

        // Stage 2: ask for the remaining channels directly, in one batch.
        let logins: Vec<String> = ambiguous.iter().map(|row| channel_login(&row.url)).collect();
        let current = match self.streams.get_streams_for_users(&logins).await {
            Ok(current) => current,
            Err(e) => {
                warn!(count = logins.len(), error = %e, "user stream lookup failed, keeping streams");
                pass.failures += 1;
                return offline;
            }
        };

        for row in ambiguous {
            let login = channel_login(&row.url);
            let twitch_game_id = games.get(row.game.as_str()).map(|g| g.twitch_game_id.as_str());
            let still_live = current
                .iter()
                .any(|s| s.login == login && Some(s.game_id.as_str()) == twitch_game_id);
            if still_live {
                debug!(stream = %row.name, game = %row.game, "missing from live list but still live");
                self.missing_since
                    .lock()
                    .await
                    .remove(&(row.name.clone(), row.game.clone()));
            } else {
                offline.insert((row.name.clone(), row.game.clone()));
            }
        }
        offline
    }

    /// Send the "went live" message, then persist the row.
    async fn announce(&self, stream: &LiveStream, game: &TrackedGame, now: DateTime<Utc>) -> Result<()> {
        // An unknown expiry just means the first pass refreshes it.
        let preview_expires_at = match self.streams.get_preview_metadata(&stream.preview_url).await {
            Ok(meta) => meta.expires_at,
            Err(e) => {
                debug!(stream = %stream.name, error = %e, "preview metadata unavailable");
                now
            }
        };

        let content = format!(
            "{} is now doing runs of {} at {}",
            escape_markdown(&stream.name),
            escape_markdown(&game.name),
            stream.url
        );
        let message = CreateMessage::new().content(content).embed(stream_embed(stream));
        let message_id = self.discord.send_message(&game.channel_id, &message).await?;
        info!(stream = %stream.name, game = %game.name, message_id = %message_id, "stream went live");

        self.store
            .add_announced_stream(&AnnouncedStream {
                name: stream.name.clone(),
                game: game.name.clone(),
                title: stream.title.clone(),
                url: stream.url.clone(),
                preview_url: stream.preview_url.clone(),
                channel_id: game.channel_id.clone(),
                message_id,
                started_at: now,
                preview_expires_at,
            })
            .await
    }

    /// Refresh title/preview of a still-live stream when needed. Returns
    /// whether an edit was made.
    async fn refresh(&self, row: &AnnouncedStream, stream: &LiveStream, now: DateTime<Utc>) -> Result<bool> {
        let title_changed = row.title != stream.title;
        let preview_expired = now >= row.preview_expires_at;
        if !title_changed && !preview_expired {
            return Ok(false);
        }

        let meta = self.streams.get_preview_metadata(&stream.preview_url).await?;
        let edit = EditMessage::new().embed(stream_embed(stream));
        match self
            .discord
            .edit_message(&row.channel_id, &row.message_id, &edit)
            .await?
        {
            EditOutcome::Edited => {
                let mut updated = row.clone();
                updated.title = stream.title.clone();
                updated.preview_url = stream.preview_url.clone();
                updated.preview_expires_at = meta.expires_at;
                self.store.update_announced_stream(&updated).await?;
                debug!(stream = %row.name, game = %row.game, title_changed, "refreshed stream message");
                Ok(true)
            }
            EditOutcome::Gone => {
                // No message means we were never really live: announce again.
                info!(stream = %row.name, game = %row.game, "stream message deleted, re-announcing next pass");
                self.store.delete_announced_stream(&row.name, &row.game).await?;
                Ok(false)
            }
        }
    }

    /// Edit the message into its offline summary, then delete the row.
    /// The row survives any failed edit so the next pass retries.
    async fn retire(&self, row: &AnnouncedStream, now: DateTime<Utc>) -> Result<()> {
        let content = format!(
            "{} went offline after {}.\r\nWatch their latest videos here: <{}/videos?filter=archives>",
            escape_markdown(&row.name),
            format_duration(now - row.started_at),
            row.url
        );
        let edit = EditMessage::new().content(content).clear_embeds();
        let outcome = self
            .discord
            .edit_message(&row.channel_id, &row.message_id, &edit)
            .await?;
        self.store.delete_announced_stream(&row.name, &row.game).await?;
        info!(stream = %row.name, game = %row.game, outcome = ?outcome, "stream went offline");
        Ok(())
    }
}

fn stream_embed(stream: &LiveStream) -> Embed {
    // A fresh query string makes Discord fetch the current preview.
    let preview = format!("{}?{}", stream.preview_url, Uuid::new_v4().simple());
    Embed::new()
        .title(escape_markdown(&stream.title))
        .url(&stream.url)
        .image(preview)
}

/// `https://www.twitch.tv/name` → `name`
fn channel_login(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
