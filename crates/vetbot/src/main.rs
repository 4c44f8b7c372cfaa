use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vetbot_core::{
    config::Config,
    engine::VettingEngine,
    messaging::{port::MessagingGateway, throttled::ThrottledGateway},
    scheduler::DeadlineScheduler,
    store::{JsonFileStore, SessionStore},
};
use vetbot_stdio::{stdin_deliveries, Roster, StdioGateway};

const INBOUND_CAPACITY: usize = 256;
const TIMER_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vetbot_core::logging::init("vetbot")?;

    let cfg = Arc::new(Config::load()?);
    info!(
        moderation = %cfg.moderation_channel,
        quorum = cfg.quorum,
        max_vetoes = cfg.max_veto_votes,
        poll_window_secs = cfg.poll_window.as_secs(),
        "vetbot starting"
    );

    let store: Arc<dyn SessionStore> = Arc::new(
        JsonFileStore::open(&cfg.store_path)
            .await
            .with_context(|| format!("open session store {}", cfg.store_path.display()))?,
    );

    let server = cfg
        .bot_user_id
        .0
        .split_once(':')
        .map(|(_, server)| server.to_string())
        .unwrap_or_default();
    let roster = Arc::new(Roster::watching([cfg.moderation_channel.clone()]));
    let gateway: Arc<dyn MessagingGateway> = Arc::new(ThrottledGateway::new(
        Arc::new(StdioGateway::stdout(server, roster.clone())),
        cfg.throttle,
    ));

    let (timer_tx, timer_rx) = mpsc::channel(TIMER_CAPACITY);
    let scheduler = DeadlineScheduler::new(timer_tx);
    let engine = VettingEngine::new(cfg.clone(), store, gateway, scheduler.clone());

    let armed = engine.recover().await.context("recover deadlines")?;
    info!(armed, "ready");

    let (deliveries, reader) = stdin_deliveries(INBOUND_CAPACITY, roster);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                shutdown.cancel();
            }
        });
    }

    engine.run(deliveries, timer_rx, shutdown).await;
    scheduler.stop().await;

    if reader.is_finished() {
        if let Err(e) = reader.await? {
            warn!("inbound reader failed: {e:#}");
        }
    } else {
        reader.abort();
    }

    info!("vetbot stopped");
    Ok(())
}
