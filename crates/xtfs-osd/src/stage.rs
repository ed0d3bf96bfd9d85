//! Replication stage: the task that owns the [`ObjectDissemination`].
//!
//! Callers talk to the stage through a [`ReplicationHandle`]. Requests go
//! through a bounded queue; remote read results come back through an
//! unbounded internal queue that is always drained first, so in-flight reads
//! are never starved by new requests.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use xtfs_common::{FileId, ServiceAvailability};

use crate::config::DisseminationConfig;
use crate::dissemination::{
    DisseminationStats, FetchRequest, FetchResult, ObjectDissemination, ReadCompletion, Waiter,
};
use crate::error::{ReplicationError, ReplicationResult};
use crate::object_io::{LocalObjectStore, RemoteObjectReader};

/// A message for the replication stage.
#[derive(Debug)]
pub enum StageMessage {
    /// Fetch an object and report to `waiter`.
    Fetch {
        /// What to fetch.
        request: FetchRequest,
        /// Who to tell.
        waiter: Waiter,
    },
    /// Stop replicating a file.
    CancelFile {
        /// File to cancel.
        file_id: FileId,
    },
    /// Fail all pending requests and stop the stage.
    Shutdown,
}

/// Handle to a running [`ReplicationStage`].
#[derive(Clone)]
pub struct ReplicationHandle {
    sender: mpsc::Sender<StageMessage>,
    stats: Arc<watch::Receiver<DisseminationStats>>,
}

impl ReplicationHandle {
    /// Send a raw message to the stage.
    /// Returns `Err(Shutdown)` if the stage has stopped.
    pub async fn send(&self, message: StageMessage) -> ReplicationResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Queue a fetch whose result is delivered to `waiter`.
    ///
    /// If the stage has stopped, `waiter` receives `Err(Shutdown)` as well.
    pub async fn submit(&self, request: FetchRequest, waiter: Waiter) -> ReplicationResult<()> {
        match self.sender.send(StageMessage::Fetch { request, waiter }).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(message)) => {
                if let StageMessage::Fetch { waiter, .. } = message {
                    waiter.complete(Err(ReplicationError::Shutdown));
                }
                Err(ReplicationError::Shutdown)
            }
        }
    }

    /// Fetch an object and wait for the result.
    pub async fn fetch_object(&self, request: FetchRequest) -> FetchResult {
        let (waiter, rx) = Waiter::channel();
        self.submit(request, waiter).await?;
        rx.await.map_err(|_| ReplicationError::Shutdown)?
    }

    /// Stop replicating `file_id`.
    pub async fn cancel_file(&self, file_id: FileId) -> ReplicationResult<()> {
        self.send(StageMessage::CancelFile { file_id }).await
    }

    /// Ask the stage to stop. Pending requests fail with `Shutdown`.
    pub async fn shutdown(&self) -> ReplicationResult<()> {
        self.send(StageMessage::Shutdown).await
    }

    /// Snapshot of the stage's counters.
    pub fn stats(&self) -> DisseminationStats {
        self.stats.borrow().clone()
    }

    /// Check if the stage is still running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// The task owning the object dissemination.
pub struct ReplicationStage {
    dissemination: ObjectDissemination,
    stats_tx: watch::Sender<DisseminationStats>,
}

impl ReplicationStage {
    /// Spawn the stage on the current tokio runtime.
    pub fn start(
        config: DisseminationConfig,
        availability: Arc<ServiceAvailability>,
        reader: Arc<dyn RemoteObjectReader>,
        store: Arc<dyn LocalObjectStore>,
    ) -> ReplicationHandle {
        let (request_tx, request_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(DisseminationStats::default());

        info!(
            local_node = %config.local_node,
            strategy = ?config.default_strategy,
            max_objects_in_progress = config.max_objects_in_progress_per_file,
            max_objects_in_progress_overall = config.max_objects_in_progress_overall,
            "replication stage started"
        );
        let stage = ReplicationStage {
            dissemination: ObjectDissemination::new(
                config,
                availability,
                reader,
                store,
                completion_tx,
            ),
            stats_tx,
        };
        tokio::spawn(stage.run(request_rx, completion_rx));

        ReplicationHandle {
            sender: request_tx,
            stats: Arc::new(stats_rx),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<StageMessage>,
        mut completions: mpsc::UnboundedReceiver<ReadCompletion>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(completion) = completions.recv() => {
                    self.dissemination.handle_completion(completion);
                }
                message = requests.recv() => match message {
                    Some(StageMessage::Fetch { request, waiter }) => {
                        self.dissemination.fetch_object(request, waiter);
                    }
                    Some(StageMessage::CancelFile { file_id }) => {
                        self.dissemination.cancel_file(&file_id);
                    }
                    Some(StageMessage::Shutdown) => break,
                    None => {
                        debug!("all replication handles dropped");
                        break;
                    }
                },
            }
            let _ = self.stats_tx.send(self.dissemination.stats());
        }

        requests.close();
        while let Ok(message) = requests.try_recv() {
            if let StageMessage::Fetch { waiter, .. } = message {
                waiter.complete(Err(ReplicationError::Shutdown));
            }
        }
        self.dissemination.shutdown();
        let _ = self.stats_tx.send(self.dissemination.stats());
        info!("replication stage stopped");
    }
}
