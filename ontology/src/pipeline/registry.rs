use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::RunEvent;

/// Live handle on a running build.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub data_source_id: Uuid,
    pub tx: broadcast::Sender<RunEvent>,
    pub cancel: CancellationToken,
}

/// In-process registry of running builds: cancellation tokens and event
/// channels. The one-run-per-data-source guard lives in the run store; this
/// only tracks what this process is executing.
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<Uuid, RunHandle>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid, data_source_id: Uuid) -> RunHandle {
        let (tx, _) = broadcast::channel(256);
        let handle = RunHandle {
            run_id,
            data_source_id,
            tx,
            cancel: CancellationToken::new(),
        };
        self.runs.insert(run_id, handle.clone());
        handle
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunHandle> {
        self.runs.get(&run_id).map(|h| h.clone())
    }

    pub fn active_for(&self, data_source_id: Uuid) -> Option<RunHandle> {
        self.runs
            .iter()
            .find(|h| h.data_source_id == data_source_id)
            .map(|h| h.clone())
    }

    /// Request cancellation. Returns false if the run is not executing here.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(h) => {
                h.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, run_id: Uuid) -> Option<broadcast::Receiver<RunEvent>> {
        self.runs.get(&run_id).map(|h| h.tx.subscribe())
    }

    pub fn remove(&self, run_id: Uuid) {
        self.runs.remove(&run_id);
    }
}
