//! Process configuration, read once at startup.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::{default_reconnect_delay, GatewayConfig, DEFAULT_GATEWAY_URL};
use crate::http::HttpConfig;
use crate::types::Snowflake;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:speedrun-bot.db?mode=rwc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub twitch_client_id: String,
    pub twitch_client_secret: String,
    pub database_url: String,
    pub gateway_url: String,
    pub stream_interval: Duration,
    pub run_interval: Duration,
    /// How long a stream must stay missing before it is announced offline.
    pub offline_confirmation: Duration,
    pub reconnect_delay: Duration,
    pub http: HttpConfig,
    pub admins: HashSet<Snowflake>,
    pub log_format: LogFormat,
}

impl Config {
    /// Load `.env` (if present), then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| Error::config(format!("{} is not set", key)));

        let discord_token = match (get("DISCORD_TOKEN"), get("DISCORD_TOKEN_FILE")) {
            (Some(token), _) => token,
            (None, Some(path)) => std::fs::read_to_string(&path)
                .map_err(|e| Error::config(format!("cannot read DISCORD_TOKEN_FILE {}: {}", path, e)))?
                .trim()
                .to_string(),
            (None, None) => {
                return Err(Error::config(
                    "DISCORD_TOKEN or DISCORD_TOKEN_FILE must be set",
                ))
            }
        };

        let defaults = HttpConfig::default();
        let http = HttpConfig {
            backoff_floor: positive(&get, "HTTP_BACKOFF_FLOOR_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_floor),
            backoff_ceiling: positive(&get, "HTTP_BACKOFF_CEILING_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_ceiling),
            max_attempts: positive(&get, "HTTP_MAX_ATTEMPTS")?
                .map(|n| {
                    u32::try_from(n).map_err(|_| {
                        Error::config(format!("HTTP_MAX_ATTEMPTS is too large, got `{}`", n))
                    })
                })
                .transpose()?
                .unwrap_or(defaults.max_attempts),
            timeout: defaults.timeout,
        };

        let log_format = match get("LOG_FORMAT").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::config(format!(
                    "LOG_FORMAT must be `pretty` or `json`, got `{}`",
                    other
                )))
            }
        };

        Ok(Self {
            discord_token,
            twitch_client_id: required("TWITCH_CLIENT_ID")?,
            twitch_client_secret: required("TWITCH_CLIENT_SECRET")?,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            gateway_url: get("GATEWAY_URL").unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            stream_interval: positive(&get, "STREAM_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
            run_interval: positive(&get, "RUN_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(600)),
            offline_confirmation: seconds(&get, "OFFLINE_CONFIRMATION_SECS")?
                .unwrap_or(Duration::ZERO),
            reconnect_delay: seconds(&get, "RECONNECT_DELAY_SECS")?
                .unwrap_or_else(default_reconnect_delay),
            http,
            admins: get("ADMIN_USER_IDS")
                .map(|ids| {
                    ids.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            log_format,
        })
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.gateway_url.clone(),
            reconnect_delay: self.reconnect_delay,
            ..GatewayConfig::new(self.discord_token.clone())
        }
    }

    pub fn http(&self) -> HttpConfig {
        self.http.clone()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"<redacted>")
            .field("twitch_client_id", &self.twitch_client_id)
            .field("twitch_client_secret", &"<redacted>")
            .field("database_url", &self.database_url)
            .field("gateway_url", &self.gateway_url)
            .field("stream_interval", &self.stream_interval)
            .field("run_interval", &self.run_interval)
            .field("offline_confirmation", &self.offline_confirmation)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("http", &self.http)
            .field("admins", &self.admins)
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn number<G>(get: &G, key: &str) -> Result<Option<u64>>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| {
            v.trim().parse::<u64>().map_err(|_| {
                Error::config(format!("{} must be a non-negative integer, got `{}`", key, v))
            })
        })
        .transpose()
}

fn seconds<G>(get: &G, key: &str) -> Result<Option<Duration>>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(number(get, key)?.map(Duration::from_secs))
}

/// Like [`number`], but zero is an error.
fn positive<G>(get: &G, key: &str) -> Result<Option<u64>>
where
    G: Fn(&str) -> Option<String>,
{
    match number(get, key)? {
        Some(0) => Err(Error::config(format!("{} must be greater than zero", key))),
        n => Ok(n),
    }
}
