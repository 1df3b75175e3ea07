use std::sync::mpsc::{self, Receiver, Sender};

use serde::Deserialize;
use tracing::warn;

use crate::bed::model::{Bed, BedId, BedPatch};
use crate::sync::cache::LocalCache;
use crate::sync::remote::{RemoteJob, RemoteVisitLog, RemoteWorker};
use crate::sync::{MutationSink, Origin, SyncError, SyncStatus, VisitLog};

/// Dual-write facade: the local cache is rewritten synchronously, the remote
/// store is fed through the worker queue.
pub struct PersistenceBridge {
    cache: LocalCache,
    remote: Option<RemoteWorker>,
}

impl PersistenceBridge {
    pub fn new(cache: LocalCache, remote: Option<RemoteWorker>) -> Self {
        Self { cache, remote }
    }

    pub fn visit_log(&self) -> Option<Box<dyn VisitLog>> {
        self.remote.as_ref().map(|worker| {
            Box::new(RemoteVisitLog::new(worker.handle().clone())) as Box<dyn VisitLog>
        })
    }

    fn push_remote(&self, bed_id: BedId, patch: &BedPatch, roster: &[Bed]) {
        let Some(worker) = &self.remote else {
            return;
        };
        let stamp = roster
            .iter()
            .find(|bed| bed.id == bed_id)
            .map(|bed| bed.last_update_timestamp)
            .unwrap_or_default();
        let job = RemoteJob::UpdateBed {
            bed_id,
            patch: patch.clone(),
            stamp,
        };
        if let Err(err) = worker.handle().submit(job) {
            warn!(bed_id, error = %err, "remote bed update not queued");
        }
    }
}

impl MutationSink for PersistenceBridge {
    fn record(
        &mut self,
        origin: Origin,
        bed_id: BedId,
        patch: &BedPatch,
        roster: &[Bed],
    ) -> Result<(), SyncError> {
        match origin {
            // Derived values are recomputed from the anchor on restart.
            Origin::Tick => Ok(()),
            Origin::Remote => self.cache.save(roster),
            Origin::Local => {
                self.push_remote(bed_id, patch, roster);
                self.cache.save(roster)
            }
        }
    }

    fn status(&self) -> SyncStatus {
        self.remote
            .as_ref()
            .map(|worker| worker.handle().status())
            .unwrap_or(SyncStatus::LocalOnly)
    }
}

/// Row-changed event pushed by another viewer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RealtimeEvent {
    pub bed_id: BedId,
    #[serde(default)]
    pub changes: BedPatch,
    pub timestamp: i64,
}

pub struct RealtimeFeed {
    receiver: Receiver<RealtimeEvent>,
}

impl RealtimeFeed {
    pub fn channel() -> (Sender<RealtimeEvent>, Self) {
        let (sender, receiver) = mpsc::channel();
        (sender, Self { receiver })
    }

    /// Everything queued so far, without blocking.
    pub fn drain(&self) -> Vec<RealtimeEvent> {
        self.receiver.try_iter().collect()
    }
}
