//! Discord REST collaborator.
//!
//! [`DiscordRest`] is the narrow surface the rest of the bot needs (send,
//! edit, react, answer interactions). [`DiscordHttpClient`] implements it on
//! top of the shared [`RequestClient`], adding bot auth and Discord's
//! per-route rate-limit buckets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::http::{capped_secs, decode_json, status_error, HttpError, RequestClient};
use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DISCORD_API: &str = "https://discord.com/api/v10";

/// Longest pre-emptive wait for an exhausted bucket.
const MAX_BUCKET_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Collaborator interface
// ---------------------------------------------------------------------------

/// Result of editing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Edited,
    /// The message (or its channel) no longer exists.
    Gone,
}

#[async_trait]
pub trait DiscordRest: Send + Sync {
    /// Post a message and return its id.
    async fn send_message(&self, channel_id: &str, message: &CreateMessage) -> Result<Snowflake>;

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        edit: &EditMessage,
    ) -> Result<EditOutcome>;

    /// `emoji` is a unicode emoji such as `"✅"`.
    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()>;

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()>;

    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// No request on any route may be sent before this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending on `route_key`, if at all.
    fn delay_for(&self, route_key: &str, now: Instant) -> Option<Duration> {
        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        if state.remaining == 0 && state.resets_at > now {
            return Some(state.resets_at - now);
        }
        None
    }

    fn update(&mut self, route_key: &str, info: &RateLimitInfo, now: Instant) {
        let reset_after = info
            .reset_after
            .and_then(|s| capped_secs(s, MAX_BUCKET_WAIT));

        if info.is_global {
            if let Some(reset_after) = reset_after {
                self.global_until = Some(now + reset_after);
            }
        }

        if let Some(bucket) = &info.bucket {
            self.route_buckets.insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: now + reset_after.unwrap_or(Duration::from_secs(1)),
                },
            );
        }
    }
}

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// Rate-limit aware Discord REST client. Cheap to clone.
#[derive(Clone)]
pub struct DiscordHttpClient {
    http: RequestClient,
    token: String,
    base_url: String,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl DiscordHttpClient {
    pub fn new(http: RequestClient, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            base_url: DISCORD_API.to_string(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    /// Send a request to `{base_url}/{path}`.
    ///
    /// `route_key` selects the rate-limit bucket and should be a template
    /// like `POST /channels/{channel_id}/messages`. The response is returned
    /// whatever its status.
    async fn request(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<Value>,
    ) -> std::result::Result<Response, HttpError> {
        let delay = self.limiter.lock().await.delay_for(route_key, Instant::now());
        if let Some(delay) = delay {
            let delay = delay.min(MAX_BUCKET_WAIT);
            debug!(
                route = route_key,
                delay_ms = delay.as_millis() as u64,
                "rate-limit pre-emptive backoff"
            );
            tokio::time::sleep(delay).await;
        }

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let auth = format!("Bot {}", self.token);
        let resp = self
            .http
            .execute(|client| {
                let req = client
                    .request(method.clone(), &url)
                    .header(AUTHORIZATION, &auth);
                match &body {
                    Some(json) => req.json(json),
                    None => req,
                }
            })
            .await?;

        let info = parse_rate_limit_headers(resp.headers());
        self.limiter.lock().await.update(route_key, &info, Instant::now());
        Ok(resp)
    }

    async fn request_ok(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<Value>,
    ) -> std::result::Result<Response, HttpError> {
        let resp = self.request(method, path, route_key, body).await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(status_error(resp).await)
        }
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> std::result::Result<Value, HttpError> {
    serde_json::to_value(value).map_err(|e| HttpError::Decode(e.to_string()))
}

fn reaction_path(channel_id: &str, message_id: &str, emoji: &str) -> String {
    format!(
        "channels/{}/messages/{}/reactions/{}/@me",
        channel_id,
        message_id,
        urlencoding::encode(emoji)
    )
}

/// `None` when the status is neither success nor "message gone".
fn edit_outcome(status: StatusCode) -> Option<EditOutcome> {
    if status.is_success() {
        Some(EditOutcome::Edited)
    } else if status == StatusCode::NOT_FOUND {
        Some(EditOutcome::Gone)
    } else {
        None
    }
}

#[async_trait]
impl DiscordRest for DiscordHttpClient {
    async fn send_message(&self, channel_id: &str, message: &CreateMessage) -> Result<Snowflake> {
        let path = format!("channels/{}/messages", channel_id);
        let route_key = format!("POST /channels/{}/messages", channel_id);
        let resp = self
            .request_ok(Method::POST, &path, &route_key, Some(to_body(message)?))
            .await?;
        let bytes = resp.bytes().await.map_err(HttpError::from)?;
        let created: CreatedMessage = decode_json(&bytes)?;
        Ok(created.id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        edit: &EditMessage,
    ) -> Result<EditOutcome> {
        let path = format!("channels/{}/messages/{}", channel_id, message_id);
        let route_key = format!("PATCH /channels/{}/messages", channel_id);
        let resp = self
            .request(Method::PATCH, &path, &route_key, Some(to_body(edit)?))
            .await?;
        match edit_outcome(resp.status()) {
            Some(EditOutcome::Gone) => {
                warn!(channel_id, message_id, "message to edit no longer exists");
                Ok(EditOutcome::Gone)
            }
            Some(outcome) => Ok(outcome),
            None => Err(status_error(resp).await.into()),
        }
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let route_key = format!("PUT /channels/{}/messages/reactions", channel_id);
        self.request_ok(
            Method::PUT,
            &reaction_path(channel_id, message_id, emoji),
            &route_key,
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let route_key = format!("DELETE /channels/{}/messages/reactions", channel_id);
        self.request_ok(
            Method::DELETE,
            &reaction_path(channel_id, message_id, emoji),
            &route_key,
            None,
        )
        .await?;
        Ok(())
    }

    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<()> {
        let path = format!(
            "interactions/{}/{}/callback",
            interaction_id, interaction_token
        );
        // Discord answers 204 No Content on success.
        self.request_ok(
            Method::POST,
            &path,
            "POST /interactions/callback",
            Some(to_body(response)?),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
