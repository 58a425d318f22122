//! Stream Provider collaborator backed by the Twitch Helix API.

use async_lock::Mutex;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderName, CACHE_CONTROL, EXPIRES};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::http::{decode_json, status_error, HttpError, RequestClient};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const HELIX_API: &str = "https://api.twitch.tv/helix";
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Helix's maximum page size and maximum repeated query parameters.
const PAGE_SIZE: usize = 100;

const PREVIEW_WIDTH: u32 = 320;
const PREVIEW_HEIGHT: u32 = 180;

/// Preview expiry used when the CDN sends no caching headers.
const DEFAULT_PREVIEW_TTL_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Collaborator interface
// ---------------------------------------------------------------------------

/// A live stream as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStream {
    /// Display name of the broadcaster.
    pub name: String,
    /// Lowercase account name, as used in channel URLs.
    pub login: String,
    pub title: String,
    pub preview_url: String,
    pub game: String,
    pub game_id: String,
    pub viewer_count: u64,
    /// Channel URL, e.g. `https://www.twitch.tv/name`.
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewMetadata {
    /// The preview redirected (or 404'd): the stream is very likely offline.
    pub is_redirect: bool,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Every live stream of any of `game_ids`.
    async fn get_live_streams(&self, game_ids: &[String]) -> Result<Vec<LiveStream>>;

    /// Current live streams of the given broadcasters (by login), whatever
    /// they play.
    async fn get_streams_for_users(&self, logins: &[String]) -> Result<Vec<LiveStream>>;

    async fn get_preview_metadata(&self, preview_url: &str) -> Result<PreviewMetadata>;

    /// Fails with a command error if no such user exists.
    async fn get_user_id(&self, username: &str) -> Result<String>;

    /// Fails with a command error if no such game exists.
    async fn get_game_id(&self, game_name: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Helix wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    user_login: String,
    user_name: String,
    game_id: String,
    game_name: String,
    #[serde(rename = "type")]
    kind: String,
    title: String,
    viewer_count: u64,
    thumbnail_url: String,
}

#[derive(Debug, Deserialize)]
struct HelixId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl HelixStream {
    fn into_live_stream(self) -> Option<LiveStream> {
        if self.kind != "live" {
            return None;
        }
        Some(LiveStream {
            preview_url: sized_thumbnail(&self.thumbnail_url),
            url: format!("https://www.twitch.tv/{}", self.user_login),
            login: self.user_login,
            name: self.user_name,
            title: self.title,
            game: self.game_name,
            game_id: self.game_id,
            viewer_count: self.viewer_count,
        })
    }
}

fn sized_thumbnail(template: &str) -> String {
    template
        .replace("{width}", &PREVIEW_WIDTH.to_string())
        .replace("{height}", &PREVIEW_HEIGHT.to_string())
}

/// Expiry of a preview image from `Expires`, falling back to
/// `Cache-Control: max-age` and then to a short default.
fn preview_expiry(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(expires) = header(EXPIRES).and_then(|s| DateTime::parse_from_rfc2822(s).ok()) {
        return expires.with_timezone(&Utc);
    }

    let max_age = header(CACHE_CONTROL).and_then(|s| {
        s.split(',')
            .filter_map(|directive| directive.trim().strip_prefix("max-age="))
            .find_map(|secs| secs.parse::<i64>().ok())
    });
    now + Duration::seconds(max_age.unwrap_or(DEFAULT_PREVIEW_TTL_SECS))
}

// ---------------------------------------------------------------------------
// TwitchClient
// ---------------------------------------------------------------------------

pub struct TwitchClient {
    http: RequestClient,
    client_id: String,
    client_secret: String,
    /// App access token from the client-credentials grant.
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for TwitchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitchClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl TwitchClient {
    pub fn new(
        http: RequestClient,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(token.clone());
        }

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let resp: TokenResponse = self
            .http
            .json(|client| client.post(TOKEN_URL).query(&params))
            .await?;
        info!("obtained Twitch app access token");
        *token = Some(resp.access_token.clone());
        Ok(resp.access_token)
    }

    /// GET `{HELIX_API}/{path}`, refreshing the access token once on 401.
    async fn helix_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<HelixPage<T>> {
        let url = format!("{}/{}", HELIX_API, path);
        let mut refreshed = false;
        loop {
            let token = self.access_token().await?;
            let resp = self
                .http
                .execute(|client| {
                    client
                        .get(&url)
                        .query(query)
                        .header("Client-Id", &self.client_id)
                        .bearer_auth(&token)
                })
                .await?;

            if resp.status() == StatusCode::UNAUTHORIZED && !refreshed {
                warn!("Twitch access token rejected, requesting a new one");
                self.token.lock().await.take();
                refreshed = true;
                continue;
            }
            if !resp.status().is_success() {
                return Err(status_error(resp).await.into());
            }
            let bytes = resp.bytes().await.map_err(HttpError::from)?;
            return Ok(decode_json(&bytes)?);
        }
    }

    /// `/streams` filtered by `key` (`game_id` or `user_login`), batching up
    /// to a page worth of values per request and following pagination.
    async fn fetch_streams(&self, key: &str, values: &[String]) -> Result<Vec<LiveStream>> {
        let mut streams = Vec::new();
        for chunk in values.chunks(PAGE_SIZE) {
            let mut cursor: Option<String> = None;
            loop {
                let mut query: Vec<(&str, String)> =
                    chunk.iter().map(|v| (key, v.clone())).collect();
                query.push(("first", PAGE_SIZE.to_string()));
                if let Some(after) = cursor.take() {
                    query.push(("after", after));
                }

                let page: HelixPage<HelixStream> = self.helix_get("streams", &query).await?;
                let full_page = page.data.len() >= PAGE_SIZE;
                streams.extend(page.data.into_iter().filter_map(HelixStream::into_live_stream));

                match page.pagination.cursor {
                    Some(next) if full_page => cursor = Some(next),
                    _ => break,
                }
            }
        }
        debug!(filter = key, count = streams.len(), "fetched live streams");
        Ok(streams)
    }
}

#[async_trait]
impl StreamProvider for TwitchClient {
    async fn get_live_streams(&self, game_ids: &[String]) -> Result<Vec<LiveStream>> {
        if game_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_streams("game_id", game_ids).await
    }

    async fn get_streams_for_users(&self, logins: &[String]) -> Result<Vec<LiveStream>> {
        if logins.is_empty() {
            return Ok(Vec::new());
        }
        let logins: Vec<String> = logins.iter().map(|n| n.to_lowercase()).collect();
        self.fetch_streams("user_login", &logins).await
    }

    async fn get_preview_metadata(&self, preview_url: &str) -> Result<PreviewMetadata> {
        let resp = self.http.execute(|client| client.head(preview_url)).await?;
        let status = resp.status();
        Ok(PreviewMetadata {
            is_redirect: status.is_redirection() || status == StatusCode::NOT_FOUND,
            expires_at: preview_expiry(resp.headers(), Utc::now()),
        })
    }

    async fn get_user_id(&self, username: &str) -> Result<String> {
        let page: HelixPage<HelixId> = self
            .helix_get("users", &[("login", username.to_lowercase())])
            .await?;
        page.data
            .into_iter()
            .next()
            .map(|user| user.id)
            .ok_or_else(|| Error::command(format!("Could not find Twitch user {}", username)))
    }

    async fn get_game_id(&self, game_name: &str) -> Result<String> {
        let page: HelixPage<HelixId> = self
            .helix_get("games", &[("name", game_name.to_string())])
            .await?;
        page.data
            .into_iter()
            .next()
            .map(|game| game.id)
            .ok_or_else(|| Error::command(format!("Could not find game {} on Twitch", game_name)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    static_assertions::assert_impl_all!(TwitchClient: StreamProvider, Send, Sync);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    // -- Helix decoding ------------------------------------------------------

    #[test]
    fn streams_page_keeps_only_live_streams() {
        let body = br#"{
            "data": [
                {"user_login": "foo_bar", "user_name": "Foo_Bar", "game_id": "33", "game_name": "game1",
                 "type": "live", "title": "any% attempts", "viewer_count": 12,
                 "thumbnail_url": "https://static-cdn.jtvnw.net/previews-ttv/live_user_foo_bar-{width}x{height}.jpg"},
                {"user_login": "rerun", "user_name": "rerun", "game_id": "33", "game_name": "game1",
                 "type": "", "title": "vod", "viewer_count": 1,
                 "thumbnail_url": "x-{width}x{height}.jpg"}
            ],
            "pagination": {"cursor": "abc"}
        }"#;
        let page: HelixPage<HelixStream> = decode_json(body).unwrap();
        assert_eq!(page.pagination.cursor.as_deref(), Some("abc"));

        let live: Vec<LiveStream> = page
            .data
            .into_iter()
            .filter_map(HelixStream::into_live_stream)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "Foo_Bar");
        assert_eq!(live[0].login, "foo_bar");
        assert_eq!(live[0].url, "https://www.twitch.tv/foo_bar");
        assert_eq!(
            live[0].preview_url,
            "https://static-cdn.jtvnw.net/previews-ttv/live_user_foo_bar-320x180.jpg"
        );
        assert_eq!(live[0].game_id, "33");
    }

    #[test]
    fn pagination_is_optional() {
        let page: HelixPage<HelixId> = decode_json(br#"{"data": [{"id": "42"}]}"#).unwrap();
        assert!(page.pagination.cursor.is_none());
        assert_eq!(page.data[0].id, "42");
    }

    #[test]
    fn ragged_page_is_a_decode_error() {
        let err = decode_json::<HelixPage<HelixId>>(br#"{"error": "Unauthorized"}"#).unwrap_err();
        assert!(matches!(err, HttpError::Decode(_)));
    }

    // -- preview_expiry() ----------------------------------------------------

    #[test]
    fn expiry_from_expires_header() {
        let mut headers = HeaderMap::new();
        headers.insert(EXPIRES, HeaderValue::from_static("Fri, 01 Mar 2024 12:05:00 GMT"));
        assert_eq!(
            preview_expiry(&headers, now()),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()
        );
    }

    #[test]
    fn expiry_from_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=60"));
        assert_eq!(preview_expiry(&headers, now()), now() + Duration::seconds(60));
    }

    #[test]
    fn expiry_defaults_without_headers() {
        assert_eq!(
            preview_expiry(&HeaderMap::new(), now()),
            now() + Duration::seconds(DEFAULT_PREVIEW_TTL_SECS)
        );
    }
}
