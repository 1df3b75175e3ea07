pub mod bridge;
pub mod cache;
pub mod remote;

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::bed::model::{Bed, BedId, BedPatch, PatientVisit, VisitPatch};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("table {} is malformed: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("remote queue is full, job dropped")]
    QueueFull,
    #[error("remote worker has stopped")]
    WorkerStopped,
}

/// Connectivity indicator surfaced to viewers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    LocalOnly,
    Online,
    Degraded,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Origin {
    /// Operator action in this process.
    Local,
    /// Derived remaining-time refresh from the timer.
    Tick,
    /// Merged realtime push from another viewer.
    Remote,
}

/// Receives every bed mutation after it has been applied in memory.
pub trait MutationSink: Send {
    fn record(
        &mut self,
        origin: Origin,
        bed_id: BedId,
        patch: &BedPatch,
        roster: &[Bed],
    ) -> Result<(), SyncError>;

    fn status(&self) -> SyncStatus;
}

/// Treatment-log collaborator. Calls are best-effort and never block the caller.
pub trait VisitLog: Send {
    fn add_visit(&self, visit: PatientVisit);
    fn update_visit(&self, bed_id: BedId, patch: VisitPatch);
}
