//! Blockfall Server
//!
//! Match orchestration server for Blockfall.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockfall::{
    network::{GameServer, ServerConfig},
    store::{AccountStore, JsonFileStore, MemoryStore},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = ServerConfig::from_env();
    info!("Blockfall Server v{}", VERSION);
    info!("Binding {}", config.bind_addr);

    let store: Box<dyn AccountStore> = match &config.accounts_path {
        Some(path) => {
            let store = JsonFileStore::open(path)
                .with_context(|| format!("opening account file {}", path.display()))?;
            info!("Accounts: {}", path.display());
            Box::new(store)
        }
        None => {
            info!("Accounts: in memory");
            Box::new(MemoryStore::new())
        }
    };
    if !config.game.auth.token_login_enabled() {
        info!("Token login disabled (AUTH_SECRET not set)");
    }

    let server = std::sync::Arc::new(GameServer::new(config, store));
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server stopped")?;
    Ok(())
}
