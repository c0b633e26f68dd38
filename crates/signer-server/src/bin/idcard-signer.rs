//! ID-card signer service binary.
//!
//! Unlocks the wallet once at startup (PIN prompt on this terminal), then
//! serves the HTTP API until Ctrl-C. Transfer confirmations are asked on the
//! same terminal.

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use idcard_signer_core::token::{CardSessionManager, Pkcs11Token};
use idcard_signer_core::units::format_ether;
use idcard_signer_core::{JsonRpcLedger, LedgerNode, Terminal, TransactionSigner, U256};
use idcard_signer_server::{
    AppState, CachedInfo, Config, ServerResult, SigningWorker, lock_cards, router, unlock_wallet,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Signer stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> ServerResult<()> {
    info!("Starting idcard-signer");
    info!("PKCS#11 module: {}", config.pkcs11_lib.display());
    info!("Ledger node: {}", config.node_url);

    let engine = config.engine()?;
    let node: Arc<dyn LedgerNode> = Arc::new(JsonRpcLedger::new(
        config.node_url.as_str(),
        config.node_timeout(),
    )?);
    let terminal = Arc::new(Terminal::new(config.confirm_timeout())?);

    let token = Pkcs11Token::load(&config.pkcs11_lib)?;
    let cards = Arc::new(Mutex::new(CardSessionManager::new(
        token,
        config.selector(),
        terminal.clone(),
    )));

    let address = {
        let cards = Arc::clone(&cards);
        let engine = engine.clone();
        task::spawn_blocking(move || unlock_wallet(&cards, &engine)).await??
    };
    info!("Wallet unlocked: {address}");

    let balance = match node.balance(address).await {
        Ok(balance) => {
            info!("Balance: {} ETH", format_ether(balance));
            balance
        }
        Err(e) => {
            warn!("Could not fetch initial balance: {e}");
            U256::ZERO
        }
    };

    let (queue, jobs) = mpsc::channel(config.queue_depth.max(1));
    let worker = SigningWorker::new(
        Arc::clone(&cards),
        engine,
        TransactionSigner::new(Arc::clone(&node)),
        terminal,
        address,
        config.confirm_timeout(),
    );
    let worker = tokio::spawn(worker.run(jobs));

    let state = AppState::new(Arc::new(CachedInfo::new(address, balance)), node, queue);
    let listener = TcpListener::bind(config.listen).await?;
    info!("Signer ready on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining queued jobs");
    worker.await?;

    lock_cards(&cards).shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, shutting down");
}
