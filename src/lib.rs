//! Discord bot that announces speedrunners going live on Twitch and new
//! speedrun.com submissions.
//!
//! The gateway connection lives in [`gateway`], the periodic diffing of
//! provider state against announced messages in [`reconcile`]. Everything is
//! wired together in [`bot::run`].

pub mod bot;
pub mod commands;
pub mod config;
pub mod discord;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod markdown;
pub mod reconcile;
pub mod scheduler;
pub mod speedrun;
pub mod store;
pub mod twitch;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
