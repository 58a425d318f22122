//! Crate-wide error taxonomy.
//!
//! Network failures are always retried (by the next reconciliation pass or
//! the gateway supervisor), usage and command errors are surfaced to the
//! invoking channel, and everything else is fatal for the process.

use thiserror::Error;

use crate::http::HttpError;

/// Maximum number of disambiguation candidates shown in a chat reply.
pub const MAX_CANDIDATES: usize = 10;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure talking to Discord, Twitch or speedrun.com.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Malformed command invocation (missing argument).
    #[error("{0}")]
    Usage(String),

    /// Well-formed but semantically invalid command.
    #[error("{message}")]
    Command {
        message: String,
        candidates: Vec<String>,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command {
            message: msg.into(),
            candidates: Vec::new(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failed action should simply be attempted again later.
    ///
    /// Ragged provider responses count as network errors: the next pass
    /// will see a fresh response.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_))
    }

    /// The remote resource no longer exists (HTTP 404).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Http(e) if e.is_not_found())
    }

    /// Text to reply with when a command fails, or `None` if the failure
    /// should only be logged.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Error::Usage(msg) => Some(msg.clone()),
            Error::Command {
                message,
                candidates,
            } => {
                if candidates.is_empty() {
                    return Some(message.clone());
                }
                let shown: Vec<&str> = candidates
                    .iter()
                    .take(MAX_CANDIDATES)
                    .map(String::as_str)
                    .collect();
                Some(format!("{}\n{}", message, shown.join("\n")))
            }
            Error::Http(_) => {
                Some("Could not reach an external service, please try again later.".to_string())
            }
            _ => None,
        }
    }
}
