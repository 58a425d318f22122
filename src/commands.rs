//! Chat and slash commands.
//!
//! Commands arrive either as `!`-prefixed messages or as application-command
//! interactions. Both are parsed into a [`Command`], run against the store
//! and providers, and answered with a plain text reply.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::discord::DiscordRest;
use crate::error::{Error, Result};
use crate::events::{DispatchEvent, EventKind, Hooks};
use crate::speedrun::LeaderboardProvider;
use crate::store::{ModeratedGame, Store, TrackedGame};
use crate::twitch::StreamProvider;
use crate::types::*;

pub const PREFIX: char = '!';

const HELP: &str = "\
Commands:
`!link twitch_username src_username` Link a Twitch account to a speedrun.com runner
`!track_game game_name` Announce runners of a game in this channel when they go live
`!untrack_game game_name` Stop announcing runners of a game
`!moderate_game game_name` Announce new unverified runs of a game in this channel
`!unmoderate_game game_name` Stop announcing unverified runs of a game
`!about` What this bot does
`!help` This message";

const ABOUT: &str = "I announce speedrunners when they go live on Twitch, \
and post new speedrun.com submissions for moderators to review.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Link { twitch_name: String, src_name: String },
    TrackGame { game: String },
    UntrackGame { game: String },
    ModerateGame { game: String },
    UnmoderateGame { game: String },
    About,
    Help,
}

impl Command {
    /// Parse a command by name (without the prefix).
    ///
    /// Unknown names are `Ok(None)` so ordinary chatter starting with `!` is
    /// ignored; a known command with missing arguments is a usage error.
    pub fn parse(name: &str, args: &[String]) -> Result<Option<Command>> {
        let game = |command: &str| -> Result<String> {
            let game = args.join(" ");
            if game.trim().is_empty() {
                return Err(Error::usage(format!(
                    "Usage of !{0}: `!{0} game_name`",
                    command
                )));
            }
            Ok(game.trim().to_string())
        };

        let command = match name.to_lowercase().as_str() {
            "link" => match args {
                [twitch_name, src_name] => Command::Link {
                    twitch_name: twitch_name.clone(),
                    src_name: src_name.clone(),
                },
                _ => {
                    return Err(Error::usage(
                        "Usage of !link: `!link twitch_username src_username`",
                    ))
                }
            },
            "track_game" => Command::TrackGame {
                game: game("track_game")?,
            },
            "untrack_game" => Command::UntrackGame {
                game: game("untrack_game")?,
            },
            "moderate_game" => Command::ModerateGame {
                game: game("moderate_game")?,
            },
            "unmoderate_game" => Command::UnmoderateGame {
                game: game("unmoderate_game")?,
            },
            "about" => Command::About,
            "help" => Command::Help,
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// Commands that change what the bot announces where.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::TrackGame { .. }
                | Command::UntrackGame { .. }
                | Command::ModerateGame { .. }
                | Command::UnmoderateGame { .. }
        )
    }
}

/// Who ran a command, and where.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: Command,
    pub channel_id: Snowflake,
    pub user_id: Snowflake,
}

pub struct CommandDispatcher {
    store: Store,
    streams: Arc<dyn StreamProvider>,
    leaderboard: Arc<dyn LeaderboardProvider>,
    discord: Arc<dyn DiscordRest>,
    admins: HashSet<Snowflake>,
}

impl CommandDispatcher {
    pub fn new(
        store: Store,
        streams: Arc<dyn StreamProvider>,
        leaderboard: Arc<dyn LeaderboardProvider>,
        discord: Arc<dyn DiscordRest>,
        admins: HashSet<Snowflake>,
    ) -> Self {
        Self {
            store,
            streams,
            leaderboard,
            discord,
            admins,
        }
    }

    /// Register the message and interaction hooks.
    pub fn register(self: &Arc<Self>, hooks: &mut Hooks) {
        for kind in [
            EventKind::MessageCreate,
            EventKind::DirectMessageCreate,
            EventKind::InteractionCreate,
        ] {
            let this = Arc::clone(self);
            hooks.on(kind, move |event| {
                let this = Arc::clone(&this);
                async move { this.handle(event).await }
            });
        }
    }

    async fn handle(&self, event: DispatchEvent) -> Result<()> {
        match event {
            DispatchEvent::MessageCreate(msg) | DispatchEvent::DirectMessageCreate(msg) => {
                self.on_message(msg).await
            }
            DispatchEvent::InteractionCreate(interaction) => self.on_interaction(interaction).await,
            _ => Ok(()),
        }
    }

    async fn on_message(&self, msg: Message) -> Result<()> {
        if msg.author.bot {
            return Ok(());
        }
        let Some(text) = msg.content.trim().strip_prefix(PREFIX) else {
            return Ok(());
        };
        let mut words = text.split_whitespace().map(str::to_string);
        let Some(name) = words.next() else {
            return Ok(());
        };
        let args: Vec<String> = words.collect();

        let reply = match Command::parse(&name, &args) {
            Ok(None) => return Ok(()),
            Ok(Some(command)) => {
                self.dispatch(&Invocation {
                    command,
                    channel_id: msg.channel_id.clone(),
                    user_id: msg.author.id.clone(),
                })
                .await
            }
            Err(e) => e.user_message(),
        };

        if let Some(reply) = reply {
            self.discord
                .send_message(&msg.channel_id, &CreateMessage::new().content(reply))
                .await?;
        }
        Ok(())
    }

    async fn on_interaction(&self, interaction: Interaction) -> Result<()> {
        if interaction.kind != INTERACTION_APPLICATION_COMMAND {
            return Ok(());
        }
        let Some(data) = interaction.data.as_ref() else {
            return Ok(());
        };

        // A `channel` option overrides where the command applies.
        let mut channel_id = interaction.channel_id.clone().unwrap_or_default();
        let mut args = Vec::new();
        for option in &data.options {
            let Some(value) = option.value_text() else {
                continue;
            };
            if option.name == "channel" {
                channel_id = value;
            } else {
                args.push(value);
            }
        }
        let user_id = interaction
            .author()
            .map(|u| u.id.clone())
            .unwrap_or_default();

        let reply = match Command::parse(&data.name, &args) {
            Ok(None) => Some(format!("Unknown command `{}`.", data.name)),
            Ok(Some(command)) => {
                self.dispatch(&Invocation {
                    command,
                    channel_id,
                    user_id,
                })
                .await
            }
            Err(e) => e.user_message(),
        };

        // Interactions must always be answered.
        let reply = reply.unwrap_or_else(|| "Something went wrong.".to_string());
        self.discord
            .create_interaction_response(
                &interaction.id,
                &interaction.token,
                &InteractionResponse::text(reply),
            )
            .await
    }

    /// Run a command and render the reply, failures included.
    ///
    /// Returns `None` only for failures that should not be shown in chat.
    pub async fn dispatch(&self, invocation: &Invocation) -> Option<String> {
        if invocation.command.requires_admin() && !self.admins.contains(&invocation.user_id) {
            info!(user_id = %invocation.user_id, command = ?invocation.command, "refused admin command");
            return Some("You are not allowed to use this command.".to_string());
        }

        match self.execute(invocation).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                match &e {
                    Error::Usage(_) | Error::Command { .. } => {}
                    _ => warn!(command = ?invocation.command, error = %e, "command failed"),
                }
                e.user_message()
            }
        }
    }

    async fn execute(&self, invocation: &Invocation) -> Result<String> {
        let channel_id = &invocation.channel_id;
        match &invocation.command {
            Command::Link {
                twitch_name,
                src_name,
            } => {
                // Fails for unknown Twitch users.
                self.streams.get_user_id(twitch_name).await?;
                let runner = self.leaderboard.find_user(src_name).await?;
                // An epoch fetch time forces a personal-best refresh on next use.
                self.store
                    .put_runner(twitch_name, Some(&runner.id), DateTime::<Utc>::UNIX_EPOCH)
                    .await?;
                info!(twitch = %twitch_name, src = %runner.name, "linked runner");
                Ok(format!(
                    "Linked Twitch user {} to speedrun.com user {}.",
                    twitch_name, runner.name
                ))
            }
            Command::TrackGame { game } => {
                let src_game_id = self.leaderboard.find_game(game).await?;
                let twitch_game_id = self.streams.get_game_id(game).await?;
                self.store
                    .add_tracked_game(&TrackedGame {
                        name: game.clone(),
                        twitch_game_id,
                        src_game_id,
                        channel_id: channel_id.clone(),
                    })
                    .await?;
                info!(game = %game, channel_id = %channel_id, "tracking game");
                Ok(format!(
                    "Will now announce runners of {} in channel <#{}>.",
                    game, channel_id
                ))
            }
            Command::UntrackGame { game } => {
                if !self.store.remove_tracked_game(game).await? {
                    return Err(Error::command(format!("Game `{}` is not being tracked.", game)));
                }
                info!(game = %game, "untracked game");
                Ok(format!("Will no longer announce runners of {}.", game))
            }
            Command::ModerateGame { game } => {
                let src_game_id = self.leaderboard.find_game(game).await?;
                self.store
                    .add_moderated_game(&ModeratedGame {
                        name: game.clone(),
                        src_game_id,
                        channel_id: channel_id.clone(),
                    })
                    .await?;
                info!(game = %game, channel_id = %channel_id, "moderating game");
                Ok(format!(
                    "Will now announce newly submitted runs of {} in channel <#{}>.",
                    game, channel_id
                ))
            }
            Command::UnmoderateGame { game } => {
                if !self.store.remove_moderated_game(game).await? {
                    return Err(Error::command(format!(
                        "Game `{}` is not being moderated.",
                        game
                    )));
                }
                info!(game = %game, "unmoderated game");
                Ok(format!("Will no longer announce runs of {}.", game))
            }
            Command::About => Ok(ABOUT.to_string()),
            Command::Help => Ok(HELP.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDiscord, FakeLeaderboard, FakeStreams};

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    struct Harness {
        store: Store,
        leaderboard: Arc<FakeLeaderboard>,
        discord: Arc<FakeDiscord>,
        dispatcher: Arc<CommandDispatcher>,
    }

    async fn harness() -> Harness {
        let store = Store::in_memory().await.unwrap();
        let streams = Arc::new(FakeStreams::default());
        let leaderboard = Arc::new(FakeLeaderboard::default());
        let discord = Arc::new(FakeDiscord::default());
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            streams,
            leaderboard.clone(),
            discord.clone(),
            HashSet::from(["admin".to_string()]),
        ));
        Harness {
            store,
            leaderboard,
            discord,
            dispatcher,
        }
    }

    fn invocation(command: Command, user_id: &str) -> Invocation {
        Invocation {
            command,
            channel_id: "C1".to_string(),
            user_id: user_id.to_string(),
        }
    }

    fn message(author_bot: bool, content: &str) -> Message {
        Message {
            id: "m".to_string(),
            channel_id: "C1".to_string(),
            guild_id: Some("G".to_string()),
            author: User {
                id: "admin".to_string(),
                username: "someone".to_string(),
                discriminator: None,
                bot: author_bot,
                global_name: None,
            },
            content: content.to_string(),
        }
    }

    // -- Command::parse() --------------------------------------------------

    #[test]
    fn parses_multi_word_game_names() {
        let cmd = Command::parse("track_game", &args(&["Celeste", "Classic"])).unwrap();
        assert_eq!(
            cmd,
            Some(Command::TrackGame {
                game: "Celeste Classic".to_string()
            })
        );
    }

    #[test]
    fn missing_arguments_are_usage_errors() {
        let err = Command::parse("link", &args(&["only_one"])).unwrap_err();
        assert_eq!(
            err.user_message().as_deref(),
            Some("Usage of !link: `!link twitch_username src_username`")
        );
        let err = Command::parse("untrack_game", &[]).unwrap_err();
        assert!(matches!(err, Error::Usage(ref m) if m.contains("!untrack_game game_name")));
    }

    #[test]
    fn unknown_commands_are_ignored() {
        assert_eq!(Command::parse("restart", &[]).unwrap(), None);
    }

    #[test]
    fn only_game_changes_need_admin() {
        assert!(Command::TrackGame { game: "x".into() }.requires_admin());
        assert!(Command::UnmoderateGame { game: "x".into() }.requires_admin());
        assert!(!Command::Help.requires_admin());
        assert!(!Command::Link {
            twitch_name: "a".into(),
            src_name: "b".into()
        }
        .requires_admin());
    }

    // -- dispatch() --------------------------------------------------------

    #[tokio::test]
    async fn track_game_stores_both_ids() {
        let h = harness().await;
        h.leaderboard.add_game("Celeste", "src-celeste");

        let reply = h
            .dispatcher
            .dispatch(&invocation(Command::TrackGame { game: "Celeste".into() }, "admin"))
            .await;
        assert_eq!(
            reply.as_deref(),
            Some("Will now announce runners of Celeste in channel <#C1>.")
        );

        let games = h.store.tracked_games().await.unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].src_game_id, "src-celeste");
        assert_eq!(games[0].twitch_game_id, "twitch-Celeste");
        assert_eq!(games[0].channel_id, "C1");
    }

    #[tokio::test]
    async fn tracking_twice_reports_a_command_error() {
        let h = harness().await;
        h.leaderboard.add_game("Celeste", "src-celeste");
        let cmd = invocation(Command::TrackGame { game: "Celeste".into() }, "admin");
        h.dispatcher.dispatch(&cmd).await;

        let reply = h.dispatcher.dispatch(&cmd).await.unwrap();
        assert!(reply.contains("already being tracked"), "{}", reply);
    }

    #[tokio::test]
    async fn ambiguous_game_lists_candidates() {
        let h = harness().await;
        h.leaderboard.add_game("Mario 64", "a");
        h.leaderboard.add_game("Mario Kart", "b");

        let reply = h
            .dispatcher
            .dispatch(&invocation(Command::ModerateGame { game: "Mario".into() }, "admin"))
            .await
            .unwrap();
        assert!(reply.contains("Mario 64"));
        assert!(reply.contains("Mario Kart"));
        assert!(h.store.moderated_games().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_admins_cannot_change_games() {
        let h = harness().await;
        h.leaderboard.add_game("Celeste", "src-celeste");

        let reply = h
            .dispatcher
            .dispatch(&invocation(Command::TrackGame { game: "Celeste".into() }, "rando"))
            .await;
        assert_eq!(
            reply.as_deref(),
            Some("You are not allowed to use this command.")
        );
        assert!(h.store.tracked_games().await.unwrap().is_empty());
        assert_eq!(h.leaderboard.call_count("find_game"), 0);
    }

    #[tokio::test]
    async fn untracking_unknown_game_is_reported() {
        let h = harness().await;
        let reply = h
            .dispatcher
            .dispatch(&invocation(Command::UntrackGame { game: "Nope".into() }, "admin"))
            .await;
        assert_eq!(reply.as_deref(), Some("Game `Nope` is not being tracked."));
    }

    #[tokio::test]
    async fn moderate_then_unmoderate() {
        let h = harness().await;
        h.leaderboard.add_game("Celeste", "src-celeste");
        h.dispatcher
            .dispatch(&invocation(Command::ModerateGame { game: "Celeste".into() }, "admin"))
            .await;
        assert_eq!(h.store.moderated_games().await.unwrap().len(), 1);

        let reply = h
            .dispatcher
            .dispatch(&invocation(Command::UnmoderateGame { game: "celeste".into() }, "admin"))
            .await;
        assert_eq!(reply.as_deref(), Some("Will no longer announce runs of celeste."));
        assert!(h.store.moderated_games().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_stores_runner_for_anyone() {
        let h = harness().await;
        h.leaderboard.add_user("RunnerOne", "src-1");

        let reply = h
            .dispatcher
            .dispatch(&invocation(
                Command::Link {
                    twitch_name: "RunnerTV".into(),
                    src_name: "RunnerOne".into(),
                },
                "rando",
            ))
            .await;
        assert_eq!(
            reply.as_deref(),
            Some("Linked Twitch user RunnerTV to speedrun.com user RunnerOne.")
        );
        let runner = h.store.runner("runnertv").await.unwrap().unwrap();
        assert_eq!(runner.src_id.as_deref(), Some("src-1"));
        assert_eq!(runner.fetched_at, DateTime::<Utc>::UNIX_EPOCH);
    }

    // -- register() --------------------------------------------------------

    #[tokio::test]
    async fn prefixed_message_gets_a_reply() {
        let h = harness().await;
        let mut hooks = Hooks::new();
        h.dispatcher.register(&mut hooks);

        hooks
            .dispatch(DispatchEvent::MessageCreate(message(false, "!help")))
            .unwrap()
            .await
            .unwrap();
        let sent = h.discord.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, "C1");
        assert_eq!(sent[0].message.content.as_deref(), Some(HELP));
    }

    #[tokio::test]
    async fn bots_and_plain_chatter_are_ignored() {
        let h = harness().await;
        let mut hooks = Hooks::new();
        h.dispatcher.register(&mut hooks);

        for msg in [
            message(true, "!help"),
            message(false, "hello there"),
            message(false, "!not_a_command"),
        ] {
            hooks
                .dispatch(DispatchEvent::MessageCreate(msg))
                .unwrap()
                .await
                .unwrap();
        }
        assert!(h.discord.sent().is_empty());
    }

    #[tokio::test]
    async fn slash_command_uses_channel_option() {
        let h = harness().await;
        h.leaderboard.add_game("Celeste", "src-celeste");
        let mut hooks = Hooks::new();
        h.dispatcher.register(&mut hooks);

        let interaction: Interaction = serde_json::from_value(serde_json::json!({
            "id": "I1",
            "application_id": "A",
            "type": 2,
            "token": "tok",
            "channel_id": "C1",
            "guild_id": "G",
            "member": {"user": {"id": "admin", "username": "someone"}},
            "data": {
                "name": "track_game",
                "options": [
                    {"name": "channel", "value": "C7"},
                    {"name": "game_name", "value": "Celeste"}
                ]
            }
        }))
        .unwrap();

        hooks
            .dispatch(DispatchEvent::InteractionCreate(interaction))
            .unwrap()
            .await
            .unwrap();

        let responses = h.discord.interaction_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "I1");
        let content = responses[0].1.data.as_ref().unwrap().content.clone();
        assert_eq!(
            content.as_deref(),
            Some("Will now announce runners of Celeste in channel <#C7>.")
        );
        assert_eq!(h.store.tracked_games().await.unwrap()[0].channel_id, "C7");
    }

    #[tokio::test]
    async fn registers_message_and_interaction_hooks() {
        let h = harness().await;
        let mut hooks = Hooks::new();
        h.dispatcher.register(&mut hooks);
        assert!(hooks.is_registered(EventKind::MessageCreate));
        assert!(hooks.is_registered(EventKind::DirectMessageCreate));
        assert!(hooks.is_registered(EventKind::InteractionCreate));
        assert!(!hooks.is_registered(EventKind::ReactionAdd));
    }
}
