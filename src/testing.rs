//! In-process fakes of the external collaborators, recording every call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::discord::{DiscordRest, EditOutcome};
use crate::error::{Error, Result};
use crate::http::HttpError;
use crate::speedrun::{pick_exact_match, LeaderboardProvider, RunStatus, SrcUser, SubmittedRun};
use crate::twitch::{LiveStream, PreviewMetadata, StreamProvider};
use crate::types::*;

fn network_error(what: &str) -> Error {
    HttpError::Status {
        status: 503,
        url: format!("https://fake.invalid/{}", what),
        body: "unavailable".to_string(),
    }
    .into()
}

fn not_found(what: &str) -> Error {
    HttpError::Status {
        status: 404,
        url: format!("https://fake.invalid/{}", what),
        body: "not found".to_string(),
    }
    .into()
}

pub fn live_stream(name: &str, game: &str, game_id: &str, title: &str) -> LiveStream {
    let login = name.to_lowercase();
    LiveStream {
        name: name.to_string(),
        title: title.to_string(),
        preview_url: format!("https://previews.invalid/live_user_{}-320x180.jpg", login),
        game: game.to_string(),
        game_id: game_id.to_string(),
        viewer_count: 1,
        url: format!("https://www.twitch.tv/{}", login),
        login,
    }
}

// ---------------------------------------------------------------------------
// FakeStreams
// ---------------------------------------------------------------------------

pub struct FakeStreams {
    live: Mutex<Vec<LiveStream>>,
    /// `None` mirrors `live`.
    user_streams: Mutex<Option<Vec<LiveStream>>>,
    redirects: Mutex<HashSet<String>>,
    preview_expires_at: Mutex<DateTime<Utc>>,
    fail_live: AtomicBool,
    fail_users: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
}

impl Default for FakeStreams {
    fn default() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            user_streams: Mutex::new(None),
            redirects: Mutex::new(HashSet::new()),
            preview_expires_at: Mutex::new(Utc::now() + Duration::days(365)),
            fail_live: AtomicBool::new(false),
            fail_users: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeStreams {
    pub fn set_live(&self, streams: Vec<LiveStream>) {
        *self.live.lock().unwrap() = streams;
    }

    pub fn set_user_streams(&self, streams: Vec<LiveStream>) {
        *self.user_streams.lock().unwrap() = Some(streams);
    }

    pub fn redirect_preview(&self, preview_url: &str) {
        self.redirects.lock().unwrap().insert(preview_url.to_string());
    }

    pub fn set_preview_expiry(&self, at: DateTime<Utc>) {
        *self.preview_expires_at.lock().unwrap() = at;
    }

    pub fn fail_live(&self, fail: bool) {
        self.fail_live.store(fail, Ordering::SeqCst);
    }

    pub fn fail_users(&self, fail: bool) {
        self.fail_users.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| **c == name).count()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }
}

#[async_trait]
impl StreamProvider for FakeStreams {
    async fn get_live_streams(&self, game_ids: &[String]) -> Result<Vec<LiveStream>> {
        self.record("get_live_streams");
        if self.fail_live.load(Ordering::SeqCst) {
            return Err(network_error("streams"));
        }
        Ok(self
            .live
            .lock()
            .unwrap()
            .iter()
            .filter(|s| game_ids.contains(&s.game_id))
            .cloned()
            .collect())
    }

    async fn get_streams_for_users(&self, logins: &[String]) -> Result<Vec<LiveStream>> {
        self.record("get_streams_for_users");
        if self.fail_users.load(Ordering::SeqCst) {
            return Err(network_error("users"));
        }
        let source = self
            .user_streams
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.live.lock().unwrap().clone());
        Ok(source
            .into_iter()
            .filter(|s| logins.contains(&s.login))
            .collect())
    }

    async fn get_preview_metadata(&self, preview_url: &str) -> Result<PreviewMetadata> {
        self.record("get_preview_metadata");
        Ok(PreviewMetadata {
            is_redirect: self.redirects.lock().unwrap().contains(preview_url),
            expires_at: *self.preview_expires_at.lock().unwrap(),
        })
    }

    async fn get_user_id(&self, username: &str) -> Result<String> {
        self.record("get_user_id");
        Ok(format!("twitch-{}", username.to_lowercase()))
    }

    async fn get_game_id(&self, game_name: &str) -> Result<String> {
        self.record("get_game_id");
        Ok(format!("twitch-{}", game_name))
    }
}

// ---------------------------------------------------------------------------
// FakeLeaderboard
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLeaderboard {
    /// Lowercase twitch name → src game ids with a personal best.
    runners: Mutex<HashMap<String, HashSet<String>>>,
    unverified: Mutex<HashMap<String, Vec<SubmittedRun>>>,
    statuses: Mutex<HashMap<String, RunStatus>>,
    games: Mutex<Vec<(String, String)>>,
    users: Mutex<Vec<(String, String)>>,
    fail_status: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeLeaderboard {
    pub fn add_runner(&self, twitch_name: &str, src_game_id: &str) {
        self.runners
            .lock()
            .unwrap()
            .entry(twitch_name.to_lowercase())
            .or_default()
            .insert(src_game_id.to_string());
    }

    pub fn set_unverified(&self, src_game_id: &str, runs: Vec<SubmittedRun>) {
        self.unverified
            .lock()
            .unwrap()
            .insert(src_game_id.to_string(), runs);
    }

    pub fn set_status(&self, run_id: &str, status: RunStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(run_id.to_string(), status);
    }

    pub fn add_game(&self, name: &str, id: &str) {
        self.games
            .lock()
            .unwrap()
            .push((name.to_string(), id.to_string()));
    }

    pub fn add_user(&self, name: &str, id: &str) {
        self.users
            .lock()
            .unwrap()
            .push((name.to_string(), id.to_string()));
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == name)
            .count()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }
}

#[async_trait]
impl LeaderboardProvider for FakeLeaderboard {
    async fn is_known_runner(&self, twitch_name: &str) -> Result<Option<String>> {
        self.record("is_known_runner");
        let key = twitch_name.to_lowercase();
        Ok(self
            .runners
            .lock()
            .unwrap()
            .contains_key(&key)
            .then(|| format!("src-{}", key)))
    }

    async fn runs_game(&self, twitch_name: &str, src_game_id: &str) -> Result<bool> {
        self.record("runs_game");
        Ok(self
            .runners
            .lock()
            .unwrap()
            .get(&twitch_name.to_lowercase())
            .map_or(false, |games| games.contains(src_game_id)))
    }

    async fn get_unverified_runs(&self, src_game_id: &str) -> Result<Vec<SubmittedRun>> {
        self.record("get_unverified_runs");
        Ok(self
            .unverified
            .lock()
            .unwrap()
            .get(src_game_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_run_status(&self, run_id: &str) -> Result<RunStatus> {
        self.record("get_run_status");
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(network_error("runs"));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(run_id)
            .copied()
            .unwrap_or(RunStatus::Deleted))
    }

    async fn find_game(&self, name: &str) -> Result<String> {
        self.record("find_game");
        let candidates = self.games.lock().unwrap().clone();
        let matching = candidates
            .into_iter()
            .filter(|(game, _)| game.contains(name))
            .collect();
        pick_exact_match(name, "game", matching)
    }

    async fn find_user(&self, name: &str) -> Result<SrcUser> {
        self.record("find_user");
        let candidates = self.users.lock().unwrap().clone();
        let matching = candidates
            .into_iter()
            .filter(|(user, _)| user.contains(name))
            .map(|(user, id)| (user.clone(), SrcUser { id, name: user }))
            .collect();
        pick_exact_match(name, "user", matching)
    }
}

// ---------------------------------------------------------------------------
// FakeDiscord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel_id: String,
    pub message_id: String,
    pub message: CreateMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditedMessage {
    pub channel_id: String,
    pub message_id: String,
    pub edit: EditMessage,
}

#[derive(Default)]
pub struct FakeDiscord {
    next_id: AtomicU64,
    sent: Mutex<Vec<SentMessage>>,
    edits: Mutex<Vec<EditedMessage>>,
    reactions: Mutex<Vec<(String, String, String)>>,
    interaction_responses: Mutex<Vec<(String, InteractionResponse)>>,
    gone: Mutex<HashSet<String>>,
    fail_sends: AtomicBool,
    fail_edits: AtomicBool,
    fail_reactions: AtomicBool,
}

impl FakeDiscord {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<EditedMessage> {
        self.edits.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<(String, String, String)> {
        self.reactions.lock().unwrap().clone()
    }

    pub fn interaction_responses(&self) -> Vec<(String, InteractionResponse)> {
        self.interaction_responses.lock().unwrap().clone()
    }

    /// Future edits of `message_id` report the message as deleted.
    pub fn delete_message(&self, message_id: &str) {
        self.gone.lock().unwrap().insert(message_id.to_string());
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reactions(&self, fail: bool) {
        self.fail_reactions.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscordRest for FakeDiscord {
    async fn send_message(&self, channel_id: &str, message: &CreateMessage) -> Result<Snowflake> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(network_error("send"));
        }
        let message_id = format!("M{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent.lock().unwrap().push(SentMessage {
            channel_id: channel_id.to_string(),
            message_id: message_id.clone(),
            message: message.clone(),
        });
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        edit: &EditMessage,
    ) -> Result<EditOutcome> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(network_error("edit"));
        }
        if self.gone.lock().unwrap().contains(message_id) {
            return Ok(EditOutcome::Gone);
        }
        self.edits.lock().unwrap().push(EditedMessage {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            edit: edit.clone(),
        });
        Ok(EditOutcome::Edited)
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        if self.fail_reactions.load(Ordering::SeqCst) {
            return Err(network_error("reaction"));
        }
        if self.gone.lock().unwrap().contains(message_id) {
            return Err(not_found("reaction"));
        }
        self.reactions.lock().unwrap().push((
            channel_id.to_string(),
            message_id.to_string(),
            emoji.to_string(),
        ));
        Ok(())
    }

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .retain(|r| r != &(channel_id.to_string(), message_id.to_string(), emoji.to_string()));
        Ok(())
    }

    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        _interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<()> {
        self.interaction_responses
            .lock()
            .unwrap()
            .push((interaction_id.to_string(), response.clone()));
        Ok(())
    }
}
