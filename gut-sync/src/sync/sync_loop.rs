//! Background sync loop
//!
//! Runs an upload pass on a fixed interval and immediately whenever the
//! context goes from offline to online. Passes are no-ops while syncing is
//! not possible.

use super::context::SyncContext;
use super::coordinator::SyncCoordinator;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct SyncLoopHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    /// Stop the loop and wait for a pass in progress to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!("Sync loop ended abnormally: {}", e);
        }
    }
}

/// Spawn the loop on the current runtime. Dropping the handle stops it.
pub fn spawn_sync_loop(
    coordinator: SyncCoordinator,
    mut context: watch::Receiver<SyncContext>,
    period: Duration,
) -> SyncLoopHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let mut was_online = context.borrow().online;

    let task = tokio::spawn(async move {
        tracing::info!("Starting background sync every {:?}", period);

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = interval.tick() => {}
                changed = context.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Context sender dropped, stopping sync loop");
                        break;
                    }
                    let online = context.borrow_and_update().online;
                    let came_online = online && !was_online;
                    was_online = online;
                    if !came_online {
                        continue;
                    }
                    tracing::info!("Back online, syncing now");
                }
            }

            let ctx = *context.borrow();
            match coordinator.sync_now(ctx).await {
                Ok(report) => tracing::debug!("Background sync: {:?}", report),
                Err(e) => tracing::error!("Background sync failed: {}", e),
            }
        }

        tracing::info!("Background sync stopped");
    });

    SyncLoopHandle {
        stop: Some(stop_tx),
        task,
    }
}
