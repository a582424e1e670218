//! Application state and initialization
//!
//! Wires the local store, the server client and the scheduler into the
//! facades the host application uses.

use crate::config::ClientConfig;
use crate::database::LocalStore;
use crate::error::Result;
use crate::remote::{HttpRemoteStore, RemoteStore};
use crate::services::{DraftManager, EntryRepository, Scheduler, TokioScheduler, UserService};
use crate::sync::SyncCoordinator;
use std::sync::Arc;

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub config: ClientConfig,
    pub entries: EntryRepository,
    pub drafts: DraftManager,
    pub users: UserService,
}

/// Open the database and connect to the configured server.
pub async fn bootstrap(config: ClientConfig) -> Result<AppState> {
    tracing::info!("Initializing application");
    tracing::info!("Database: {:?}", config.database_path);
    tracing::info!("Server: {}", config.server_url);

    let store = LocalStore::open(&config.database_path).await?;
    let remote = HttpRemoteStore::new(&config.server_url, config.request_timeout())?;

    Ok(build(config, store, Arc::new(remote), Arc::new(TokioScheduler)))
}

/// Assemble the services from already constructed parts.
pub fn build(
    config: ClientConfig,
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    scheduler: Arc<dyn Scheduler>,
) -> AppState {
    let coordinator = SyncCoordinator::new(store.clone(), remote);
    let entries = EntryRepository::new(coordinator, scheduler, config.undo_window())
        .with_timeline_limit(config.timeline_limit);

    AppState {
        drafts: DraftManager::new(entries.clone()),
        users: UserService::new(store),
        entries,
        config,
    }
}
