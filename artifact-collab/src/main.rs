//! `collab-server`: runs the collaboration gateway.
//!
//! Configuration comes from `COLLAB_*` environment variables (see
//! [`EngineConfig::from_env`]). Tokens are supplied as
//! `COLLAB_TOKENS="token:user_id:username[:role],..."`. With
//! `COLLAB_STORAGE_PATH` set, comments, activity and notifications are
//! kept in RocksDB; otherwise in memory.

use std::sync::Arc;

use log::info;

use artifact_collab::{
    CollabEngine, CollabServer, Collaborators, DurableStore, EngineConfig, MemoryStore, RocksConfig,
    RocksStore, StaticIdentity,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting collaboration server...");

    let config = EngineConfig::from_env();
    let tokens = std::env::var("COLLAB_TOKENS").unwrap_or_default();
    let identity = Arc::new(StaticIdentity::parse(&tokens)?);
    if tokens.is_empty() {
        log::warn!("COLLAB_TOKENS is empty; every connection will be refused");
    }

    let store: Arc<dyn DurableStore> = match &config.storage_path {
        Some(path) => {
            info!("Using RocksDB store at {}", path.display());
            Arc::new(RocksStore::open(RocksConfig {
                path: path.clone(),
                ..RocksConfig::default()
            })?)
        }
        None => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let collaborators = Collaborators {
        store,
        ..Collaborators::in_memory(identity)
    };
    let engine = CollabEngine::new(config, collaborators);
    let server = Arc::new(CollabServer::new(engine));

    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
