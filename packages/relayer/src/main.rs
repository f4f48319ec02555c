use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use eyre::WrapErr;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use relayer::api::{self, AppState};
use relayer::config::Config;
use relayer::consensus::RelayConsensusEngine;
use relayer::history::TaskHistoryStore;
use relayer::hub::{EvmLedgerClient, LedgerClient};
use relayer::source::{BitcoinRpcAdapter, SourceChainAdapter};
use relayer::store::{HeaderStore, MemoryStore, PgStore};
use relayer::transport::TransportTaskEngine;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting hub chain relayer");

    let config = Config::load()?;
    info!(
        hub_chain_id = config.hub.chain_id,
        relay = %config.hub.relay_address,
        source_network = config.source.network.as_str(),
        relay_role = config.roles.relay,
        transport_role = config.roles.transport,
        "Configuration loaded"
    );

    let source: Arc<dyn SourceChainAdapter> = Arc::new(BitcoinRpcAdapter::new(
        config.source.rpc_url.clone(),
        config.source.rpc_user.clone(),
        config.source.rpc_password.clone(),
        config.source.network,
        Duration::from_millis(config.source.poll_interval_ms),
    )?);
    match source.top_height().await {
        Ok(top) => info!(
            source = source.name(),
            source_top = top,
            genesis_height = config.source.network.genesis_height(top),
            "Source chain reachable"
        ),
        Err(e) => warn!(source = source.name(), error = %e, "Source chain not reachable yet"),
    }

    let ledger: Arc<dyn LedgerClient> = Arc::new(EvmLedgerClient::new(
        &config.hub.rpc_url,
        &config.hub.relay_address,
        config.hub.transport_address.as_deref(),
        &config.hub.private_key,
    )?);

    let store: Arc<dyn HeaderStore> = match &config.database {
        Some(db) => {
            let store = PgStore::connect(&db.url, source.name()).await?;
            info!("Database connected");
            Arc::new(store)
        }
        None => {
            info!("No DATABASE_URL, using in-memory header store");
            Arc::new(MemoryStore::default())
        }
    };

    let history = match (&config.hub.transport_address, config.roles.transport) {
        (Some(addr), true) => {
            let transport = Address::from_str(addr).wrap_err("Invalid transport contract address")?;
            Some(Arc::new(
                TaskHistoryStore::open(&config.relayer.history_path, transport).await?,
            ))
        }
        _ => None,
    };

    // Create shutdown channels
    let (relay_tx, relay_rx) = mpsc::channel::<()>(1);
    let (transport_tx, transport_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = relay_tx.send(()).await;
        let _ = transport_tx.send(()).await;
    });

    // Start metrics/API server
    let api_addr = config.api_addr()?;
    let api_state = AppState {
        relayer: ledger.relayer_address(),
        relay_contract: ledger.relay_contract(),
        roles: config.roles,
        store: store.clone(),
        history: history.clone(),
        started: Instant::now(),
    };
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            error!(error = %e, "API server error");
        }
    });

    let relay = async {
        if !config.roles.relay {
            return Ok(());
        }
        let mut engine = RelayConsensusEngine::new(
            source.clone(),
            ledger.clone(),
            store.clone(),
            config.relay_config(),
        );
        engine.run(relay_rx).await
    };

    let transport = async {
        let Some(history) = history.clone() else {
            return Ok(());
        };
        let engine = TransportTaskEngine::new(
            source.clone(),
            ledger.clone(),
            store.clone(),
            history,
            config.transport_config(),
        );
        engine.run(transport_rx).await
    };

    // One role failing its preflight leaves the other running
    let (relay_result, transport_result) = tokio::join!(relay, transport);
    if let Err(e) = relay_result {
        error!(error = %e, "Relay consensus engine error");
    }
    if let Err(e) = transport_result {
        error!(error = %e, "Transport task engine error");
    }

    info!("Hub chain relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
