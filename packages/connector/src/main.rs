use std::sync::Arc;
use std::time::Duration;

use paychan_connector::channels::{ChainRouter, ChannelManager};
use paychan_connector::config::Config;
use paychan_connector::accounts::AccountManager;
use paychan_connector::db;
use paychan_connector::lifecycle::WalletLifecycle;
use paychan_connector::peer::{LocalTransport, PeerDirectory};
use paychan_connector::settlement::{SettlementMonitor, SettlementTracker};

use paychan_rs::evm::EvmChannelWatcher;
use paychan_rs::signer::SignerService;
use paychan_rs::telemetry::TelemetryBus;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting PayChan settlement connector");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        evm_chain_id = config.evm.chain_id,
        xrp_enabled = config.xrp.enabled,
        rebalance = config.channels.rebalance_enabled,
        "Configuration loaded"
    );

    // Connect to the channel store
    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Channel store connected");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Channel store migrations complete");

    // Shared infrastructure
    let telemetry = TelemetryBus::new();
    let tracker = SettlementTracker::new();
    let signers = Arc::new(SignerService::from_mnemonic(&config.signer.mnemonic)?);
    let directory = Arc::new(PeerDirectory::new());
    let lifecycle = Arc::new(WalletLifecycle::new(pool.clone(), telemetry.clone()));
    let accounts = Arc::new(AccountManager::new(telemetry.clone(), tracker.clone()));
    let router = Arc::new(ChainRouter::new(
        signers.clone(),
        config.evm.clone(),
        config.xrp.clone(),
    )?);

    // Peer transport (in-process endpoints; the BTP framing in front of
    // this is carried by the surrounding deployment)
    let transport = Arc::new(LocalTransport::new(
        "connector",
        LocalTransport::registry(),
        Duration::from_millis(config.peer.timeout_ms),
        config.peer.retry_attempts,
        Duration::from_millis(config.peer.retry_delay_ms),
    ));

    // Channel manager and startup recovery
    let manager = ChannelManager::new(
        pool.clone(),
        lifecycle.clone(),
        signers.clone(),
        router,
        transport,
        directory.clone(),
        telemetry.clone(),
        tracker.clone(),
        config.channels.clone(),
    );
    manager.recover().await?;
    tracing::info!("Channel recovery complete");

    // Settlement monitor feeding the manager's trigger loop
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(64);
    let monitor = SettlementMonitor::new(
        telemetry.clone(),
        tracker.clone(),
        config.channels.settlement_threshold,
        trigger_tx,
    );

    // EVM event watcher feeding the manager's event loop
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
    let watcher = EvmChannelWatcher::new(
        &config.evm.rpc_url,
        config.evm.chain_id,
        config.evm.channels_address.parse()?,
        config.evm.finality_blocks,
        Duration::from_millis(config.connector.poll_interval_ms),
        event_tx,
    )
    .await?;

    // Shutdown plumbing
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx3, shutdown_rx3) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx4, shutdown_rx4) = tokio::sync::mpsc::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(()).await;
        let _ = shutdown_tx2.send(()).await;
        let _ = shutdown_tx3.send(()).await;
        let _ = shutdown_tx4.send(()).await;
    });

    tracing::info!("Connector initialized, starting processing");

    // Run the monitor, the trigger consumer and the event loop concurrently
    tokio::select! {
        _ = monitor.run(shutdown_rx) => {
            tracing::warn!("Settlement monitor stopped");
        }
        _ = manager.clone().run_settlement_loop(accounts, trigger_rx, shutdown_rx2) => {
            tracing::warn!("Settlement loop stopped");
        }
        _ = manager.clone().run_event_loop(event_rx, shutdown_rx3) => {
            tracing::warn!("Event loop stopped");
        }
        result = watcher.run(shutdown_rx4) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "EVM watcher error");
            }
        }
    }

    tracing::info!("PayChan settlement connector stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,paychan_connector=debug,paychan_rs=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
