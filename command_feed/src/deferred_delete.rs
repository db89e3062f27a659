use std::{sync::Arc, time::Duration};

use anyhow::Result;
use feed_utils::get_epoch_time_in_ms;
use state_store::{
    requests::{RequestPayload, StateMachineUpdateRequest},
    CommandFeedState,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

const SWEEP_BATCH_SIZE: usize = 100;

/// Removes queue entries whose Complete checkpoint deferred the delete.
pub struct DeferredDeleteSweeper {
    state: Arc<CommandFeedState>,
    idle_interval: Duration,
}

impl DeferredDeleteSweeper {
    pub fn new(state: Arc<CommandFeedState>, idle_interval: Duration) -> Self {
        Self {
            state,
            idle_interval,
        }
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let mut rx = self.state.get_deferred_delete_watcher();
        loop {
            let wait = match self.run().await {
                Ok(Some(wait)) => wait,
                Ok(None) => continue,
                Err(err) => {
                    error!("error sweeping deferred deletes: {:?}", err);
                    Duration::from_secs(30)
                }
            };
            tokio::select! {
                _ = rx.changed() => {
                    rx.borrow_and_update();
                }
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {
                    info!("deferred delete sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Sweeps what is due. Returns how long to sleep before the next sweep,
    /// or `None` when a full batch was removed and more may be due.
    async fn run(&self) -> Result<Option<Duration>> {
        let now = get_epoch_time_in_ms();
        let removed = self.sweep_due(now).await?;
        if removed >= SWEEP_BATCH_SIZE {
            return Ok(None);
        }
        let next_due = self
            .state
            .reader()
            .due_deferred_deletes(u64::MAX - 1, 1)?
            .into_iter()
            .next()
            .map(|d| Duration::from_millis(d.due_at.saturating_sub(now)));
        Ok(Some(
            next_due
                .map(|d| d.min(self.idle_interval))
                .unwrap_or(self.idle_interval),
        ))
    }

    /// Removes up to one batch of deferred deletes due at `now`.
    pub async fn sweep_due(&self, now: u64) -> Result<usize> {
        let due = self
            .state
            .reader()
            .due_deferred_deletes(now, SWEEP_BATCH_SIZE)?;
        if due.is_empty() {
            return Ok(0);
        }
        let removed = due.len();
        debug!(removed, "removing deferred deletes");
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RemoveDeferredDeletes(due),
            })
            .await?;
        Ok(removed)
    }
}
