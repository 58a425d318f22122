//! Composition root: builds every collaborator from the [`Config`], starts
//! the reconciliation timers and runs the gateway until it fails fatally.

use std::sync::Arc;

use tracing::info;

use crate::commands::CommandDispatcher;
use crate::config::Config;
use crate::discord::{DiscordHttpClient, DiscordRest};
use crate::error::{Error, Result};
use crate::events::Hooks;
use crate::gateway::Gateway;
use crate::http::RequestClient;
use crate::reconcile::{RunReconciler, StreamReconciler};
use crate::scheduler::spawn_every;
use crate::speedrun::{LeaderboardProvider, SpeedrunClient};
use crate::store::Store;
use crate::twitch::{StreamProvider, TwitchClient};

/// Run the bot. Only returns on a fatal error.
pub async fn run(config: Config) -> Result<()> {
    info!(config = ?config, "starting");

    let store = Store::open(&config.database_url).await?;
    // One client, so every provider shares the same backoff.
    let http = RequestClient::new(&config.http())?;

    let discord: Arc<dyn DiscordRest> =
        Arc::new(DiscordHttpClient::new(http.clone(), config.discord_token.clone()));
    let streams: Arc<dyn StreamProvider> = Arc::new(TwitchClient::new(
        http.clone(),
        config.twitch_client_id.clone(),
        config.twitch_client_secret.clone(),
    ));
    let leaderboard: Arc<dyn LeaderboardProvider> =
        Arc::new(SpeedrunClient::new(http, store.clone()));

    let offline_confirmation = chrono::Duration::from_std(config.offline_confirmation)
        .map_err(|e| Error::config(format!("OFFLINE_CONFIRMATION_SECS out of range: {}", e)))?;
    let stream_reconciler = Arc::new(StreamReconciler::new(
        store.clone(),
        Arc::clone(&streams),
        Arc::clone(&leaderboard),
        Arc::clone(&discord),
        offline_confirmation,
    ));
    let run_reconciler = Arc::new(RunReconciler::new(
        store.clone(),
        Arc::clone(&leaderboard),
        Arc::clone(&discord),
    ));

    let stream_timer = spawn_every("streams", config.stream_interval, move || {
        let reconciler = Arc::clone(&stream_reconciler);
        async move { reconciler.reconcile_live_streams().await }
    });
    let run_timer = spawn_every("runs", config.run_interval, move || {
        let reconciler = Arc::clone(&run_reconciler);
        async move { reconciler.reconcile_unverified_runs().await }
    });

    let dispatcher = Arc::new(CommandDispatcher::new(
        store,
        streams,
        leaderboard,
        discord,
        config.admins.clone(),
    ));
    let mut hooks = Hooks::new();
    dispatcher.register(&mut hooks);

    let mut gateway = Gateway::new(config.gateway(), hooks);
    info!(intents = ?gateway.intents(), "connecting to gateway");
    let result = gateway.run().await;

    stream_timer.abort();
    run_timer.abort();
    result
}
