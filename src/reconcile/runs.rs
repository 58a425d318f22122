use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::discord::DiscordRest;
use crate::error::Result;
use crate::markdown::{escape_markdown, format_duration};
use crate::speedrun::{LeaderboardProvider, SubmittedRun};
use crate::store::{ModeratedGame, Store, UnverifiedRun};
use crate::types::CreateMessage;

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunPass {
    pub announced: usize,
    pub resolved: usize,
    pub failures: usize,
}

/// Posts new speedrun.com submissions of moderated games and marks them
/// with a reaction once they are verified, rejected or deleted.
pub struct RunReconciler {
    store: Store,
    leaderboard: Arc<dyn LeaderboardProvider>,
    discord: Arc<dyn DiscordRest>,
}

impl RunReconciler {
    pub fn new(
        store: Store,
        leaderboard: Arc<dyn LeaderboardProvider>,
        discord: Arc<dyn DiscordRest>,
    ) -> Self {
        Self {
            store,
            leaderboard,
            discord,
        }
    }

    pub async fn reconcile_unverified_runs(&self) -> Result<RunPass> {
        let mut pass = RunPass::default();
        for game in self.store.moderated_games().await? {
            if let Err(e) = self.reconcile_game(&game, &mut pass).await {
                warn!(game = %game.name, error = %e, "run reconciliation failed for game");
                pass.failures += 1;
            }
        }
        if pass != RunPass::default() {
            info!(
                announced = pass.announced,
                resolved = pass.resolved,
                failures = pass.failures,
                "run reconciliation pass finished"
            );
        }
        Ok(pass)
    }

    async fn reconcile_game(&self, game: &ModeratedGame, pass: &mut RunPass) -> Result<()> {
        let submitted = self.leaderboard.get_unverified_runs(&game.src_game_id).await?;
        let known = self.store.unverified_runs(&game.src_game_id).await?;
        debug!(game = %game.name, submitted = submitted.len(), known = known.len(), "unverified runs");

        let known_ids: HashSet<&str> = known.iter().map(|r| r.run_id.as_str()).collect();
        let submitted_ids: HashSet<&str> = submitted.iter().map(|r| r.id.as_str()).collect();

        for run in submitted.iter().filter(|r| !known_ids.contains(r.id.as_str())) {
            match self.announce(game, run).await {
                Ok(()) => pass.announced += 1,
                Err(e) => {
                    warn!(game = %game.name, run_id = %run.id, error = %e, "failed to announce run");
                    pass.failures += 1;
                }
            }
        }

        for row in known.iter().filter(|r| !submitted_ids.contains(r.run_id.as_str())) {
            match self.resolve(row).await {
                Ok(true) => pass.resolved += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(game = %game.name, run_id = %row.run_id, error = %e, "failed to resolve run");
                    pass.failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Send the announcement, then persist the row.
    async fn announce(&self, game: &ModeratedGame, run: &SubmittedRun) -> Result<()> {
        let time = Duration::milliseconds((run.time * 1000.0).round() as i64);
        let content = format!(
            "New run submitted to {}: {} in {} by {}\n<{}>",
            escape_markdown(&game.name),
            escape_markdown(&run.category),
            format_duration(time),
            escape_markdown(&run.runner),
            run.weblink
        );
        let message_id = self
            .discord
            .send_message(&game.channel_id, &CreateMessage::new().content(content))
            .await?;
        info!(game = %game.name, run_id = %run.id, "announced unverified run");

        self.store
            .add_unverified_run(&UnverifiedRun {
                run_id: run.id.clone(),
                game_id: game.src_game_id.clone(),
                submitted_at: run.submitted_at,
                channel_id: game.channel_id.clone(),
                message_id,
            })
            .await
    }

    /// React with the final status and forget the run. Returns `false` while
    /// the run is still awaiting verification.
    async fn resolve(&self, row: &UnverifiedRun) -> Result<bool> {
        let status = self.leaderboard.get_run_status(&row.run_id).await?;
        let Some(emoji) = status.reaction() else {
            debug!(run_id = %row.run_id, "run left the queue but is still new");
            return Ok(false);
        };

        match self
            .discord
            .add_reaction(&row.channel_id, &row.message_id, emoji)
            .await
        {
            Ok(()) => {}
            // Nothing left to mark.
            Err(e) if e.is_not_found() => {
                debug!(run_id = %row.run_id, "announcement deleted, dropping run");
            }
            Err(e) => return Err(e),
        }
        self.store.delete_unverified_run(&row.run_id).await?;
        info!(run_id = %row.run_id, status = ?status, "run resolved");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedrun::RunStatus;
    use crate::testing::{FakeDiscord, FakeLeaderboard};
    use chrono::{TimeZone, Utc};

    struct Harness {
        store: Store,
        leaderboard: Arc<FakeLeaderboard>,
        discord: Arc<FakeDiscord>,
        reconciler: RunReconciler,
    }

    async fn harness() -> Harness {
        let store = Store::in_memory().await.unwrap();
        let leaderboard = Arc::new(FakeLeaderboard::default());
        let discord = Arc::new(FakeDiscord::default());
        store
            .add_moderated_game(&ModeratedGame {
                name: "game1".to_string(),
                src_game_id: "g1".to_string(),
                channel_id: "C9".to_string(),
            })
            .await
            .unwrap();
        let reconciler = RunReconciler::new(store.clone(), leaderboard.clone(), discord.clone());
        Harness {
            store,
            leaderboard,
            discord,
            reconciler,
        }
    }

    fn run(id: &str) -> SubmittedRun {
        SubmittedRun {
            id: id.to_string(),
            game_id: "g1".to_string(),
            submitted_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            weblink: format!("https://www.speedrun.com/game1/run/{}", id),
            category: "Any%".to_string(),
            runner: "foo_bar".to_string(),
            time: 3725.0,
        }
    }

    // -- reconcile_unverified_runs() ---------------------------------------

    #[tokio::test]
    async fn new_runs_are_announced_once() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1"), run("r2")]);

        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.announced, 2);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass, RunPass::default());

        let sent = h.discord.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].channel_id, "C9");
        let content = sent[0].message.content.as_deref().unwrap();
        assert!(content.contains("Any% in 1:02:05 by foo\\_bar"));
        assert!(content.contains("<https://www.speedrun.com/game1/run/r1>"));
        assert_eq!(h.store.unverified_runs("g1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolved_runs_get_status_reactions() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1"), run("r2"), run("r3")]);
        h.reconciler.reconcile_unverified_runs().await.unwrap();

        h.leaderboard.set_unverified("g1", vec![]);
        h.leaderboard.set_status("r1", RunStatus::Verified);
        h.leaderboard.set_status("r2", RunStatus::Rejected);
        // r3 unknown to the provider: deleted.
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.resolved, 3);

        let sent = h.discord.sent();
        let mut reactions = h.discord.reactions();
        reactions.sort();
        let mut expected = vec![
            ("C9".to_string(), sent[0].message_id.clone(), "✅".to_string()),
            ("C9".to_string(), sent[1].message_id.clone(), "❌".to_string()),
            ("C9".to_string(), sent[2].message_id.clone(), "🗑️".to_string()),
        ];
        expected.sort();
        assert_eq!(reactions, expected);
        assert!(h.store.unverified_runs("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_status_fetch_keeps_run_for_retry() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1")]);
        h.reconciler.reconcile_unverified_runs().await.unwrap();

        h.leaderboard.set_unverified("g1", vec![]);
        h.leaderboard.fail_status(true);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.failures, 1);
        assert_eq!(h.store.unverified_runs("g1").await.unwrap().len(), 1);

        h.leaderboard.fail_status(false);
        h.leaderboard.set_status("r1", RunStatus::Verified);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.resolved, 1);
    }

    #[tokio::test]
    async fn failed_reaction_keeps_run_for_retry() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1")]);
        h.reconciler.reconcile_unverified_runs().await.unwrap();

        h.leaderboard.set_unverified("g1", vec![]);
        h.leaderboard.set_status("r1", RunStatus::Verified);
        h.discord.fail_reactions(true);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.failures, 1);
        assert_eq!(h.store.unverified_runs("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleted_announcement_still_resolves() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1")]);
        h.reconciler.reconcile_unverified_runs().await.unwrap();
        h.discord.delete_message(&h.discord.sent()[0].message_id);

        h.leaderboard.set_unverified("g1", vec![]);
        h.leaderboard.set_status("r1", RunStatus::Verified);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.resolved, 1);
        assert!(h.store.unverified_runs("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn still_new_run_is_left_alone() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1")]);
        h.reconciler.reconcile_unverified_runs().await.unwrap();

        h.leaderboard.set_unverified("g1", vec![]);
        h.leaderboard.set_status("r1", RunStatus::New);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass, RunPass::default());
        assert!(h.discord.reactions().is_empty());
        assert_eq!(h.store.unverified_runs("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_is_not_persisted() {
        let h = harness().await;
        h.leaderboard.set_unverified("g1", vec![run("r1")]);
        h.discord.fail_sends(true);
        let pass = h.reconciler.reconcile_unverified_runs().await.unwrap();
        assert_eq!(pass.failures, 1);
        assert!(h.store.unverified_runs("g1").await.unwrap().is_empty());
    }
}
