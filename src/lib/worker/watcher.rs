use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provision::guarded;
use super::types::WorkerResult;
use crate::lib::store::task_store::TaskStore;
use crate::lib::tasks::docker::{ContainerRuntime, MANAGED_LABEL, TASK_ID_LABEL};
use crate::lib::tasks::state::{status_from_runtime, valid_state_transition};
use crate::lib::tasks::types::{ContainerState, TaskError, TaskStatus};

/// Pulls container state from the runtime back into the task store.
pub struct Watcher {
    store: Arc<TaskStore>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    call_timeout: Duration,
}

pub struct WatcherHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stops the loop and waits for the in-flight tick to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "watcher task ended abnormally");
        }
    }
}

impl Watcher {
    pub fn new(
        store: Arc<TaskStore>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Watcher {
            store,
            runtime,
            interval,
            call_timeout,
        }
    }

    pub fn spawn(self) -> WatcherHandle {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.run(cancel.clone()));
        WatcherHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "watcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile_once(&cancel).await {
                Ok(0) => {}
                Ok(updated) => debug!(updated, "reconciled task statuses"),
                Err(err) if cancel.is_cancelled() => debug!(error = %err, "tick interrupted"),
                Err(err) => warn!(error = %err, "reconciliation tick failed"),
            }
        }

        info!("watcher stopped");
    }

    /// One pass over the runtime's containers. Returns how many stored
    /// statuses changed.
    pub async fn reconcile_once(&self, cancel: &CancellationToken) -> WorkerResult<usize> {
        let containers = guarded(
            "container list",
            cancel,
            self.call_timeout,
            self.runtime.list_containers(),
        )
        .await?;

        let mut updated = 0;
        for container in containers
            .iter()
            .filter(|c| c.labels.contains_key(MANAGED_LABEL))
        {
            match self.reconcile_container(container) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(container_id = %container.id, error = %err, "could not reconcile container")
                }
            }
        }

        Ok(updated)
    }

    fn reconcile_container(&self, container: &ContainerState) -> Result<bool, TaskError> {
        let Some(raw_id) = container.labels.get(TASK_ID_LABEL) else {
            debug!(container_id = %container.id, "managed container without task id");
            return Ok(false);
        };
        let id = Uuid::parse_str(raw_id).map_err(|err| {
            TaskError::Validation(format!("bad task id label {:?}: {}", raw_id, err))
        })?;

        let Some(observed) = status_from_runtime(&container.status) else {
            return Ok(false);
        };

        // evaluated against the stored status inside the store's write
        let accepts = |current: TaskStatus| {
            current != observed
                && valid_state_transition(&current, &observed)
                && !(current == TaskStatus::Suspended && observed == TaskStatus::Exited)
        };

        match self.store.transition_task_status(id, observed, accepts) {
            Ok(Some(previous)) => {
                info!(task_id = %id, from = ?previous, to = ?observed, "task status reconciled");
                Ok(true)
            }
            Ok(None) => {
                debug!(task_id = %id, to = ?observed, "observed status not applicable");
                Ok(false)
            }
            Err(TaskError::NotFound(_)) => {
                debug!(task_id = %id, container_id = %container.id, "container has no task");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
