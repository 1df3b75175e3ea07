use thiserror::Error;
use tracing::{debug, warn};

use crate::bed::model::{Bed, BedId, BedPatch};
use crate::sync::{MutationSink, Origin, SyncError, SyncStatus};

/// Pushed changes stamped further than this from the local clock are refused.
pub const MAX_REMOTE_SKEW_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("unknown bed id {0}")]
    UnknownBed(BedId),
    #[error("bed {bed_id} could not be persisted locally: {source}")]
    Persist {
        bed_id: BedId,
        #[source]
        source: SyncError,
    },
}

/// In-memory roster. Every field change goes through one of the write paths
/// below so the sink sees all of them.
pub struct BedStore {
    beds: Vec<Bed>,
    sink: Box<dyn MutationSink>,
    last_stamp: i64,
}

impl BedStore {
    pub fn new(beds: Vec<Bed>, sink: Box<dyn MutationSink>) -> Self {
        let last_stamp = beds
            .iter()
            .map(|bed| bed.last_update_timestamp)
            .max()
            .unwrap_or_default();
        Self {
            beds,
            sink,
            last_stamp,
        }
    }

    pub fn get(&self, id: BedId) -> Option<&Bed> {
        self.beds.iter().find(|bed| bed.id == id)
    }

    pub fn list(&self) -> &[Bed] {
        &self.beds
    }

    pub fn ids(&self) -> Vec<BedId> {
        self.beds.iter().map(|bed| bed.id).collect()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sink.status()
    }

    /// Stamped operator write. Local persistence failures are logged; the
    /// in-memory state stands.
    pub fn update(&mut self, id: BedId, patch: &BedPatch, now_ms: i64) -> Result<(), BoardError> {
        match self.update_confirmed(id, patch, now_ms) {
            Err(BoardError::Persist { bed_id, source }) => {
                warn!(bed_id, error = %source, "bed mutation not persisted locally");
                Ok(())
            }
            other => other,
        }
    }

    /// Like [`BedStore::update`] but the caller learns whether the local cache
    /// accepted the write.
    pub fn update_confirmed(
        &mut self,
        id: BedId,
        patch: &BedPatch,
        now_ms: i64,
    ) -> Result<(), BoardError> {
        let index = self.index_of(id)?;
        let stamp = now_ms.max(self.last_stamp.saturating_add(1));
        self.last_stamp = stamp;

        let bed = &mut self.beds[index];
        bed.apply(patch);
        bed.last_update_timestamp = stamp;

        self.sink
            .record(Origin::Local, id, patch, &self.beds)
            .map_err(|source| BoardError::Persist { bed_id: id, source })
    }

    /// Timer refresh of the displayed remaining time. Carries no stamp.
    pub fn derive_remaining(&mut self, id: BedId, remaining: i64) -> Result<(), BoardError> {
        let index = self.index_of(id)?;
        let patch = BedPatch {
            remaining_time: Some(remaining),
            ..BedPatch::default()
        };
        self.beds[index].apply(&patch);
        if let Err(err) = self.sink.record(Origin::Tick, id, &patch, &self.beds) {
            debug!(bed_id = id, error = %err, "derived update not persisted");
        }
        Ok(())
    }

    /// Applies a pushed change when it is at least as recent as the local row
    /// and its stamp is within [`MAX_REMOTE_SKEW_MS`] of `now_ms`. Returns
    /// whether it was accepted.
    pub fn merge_remote(
        &mut self,
        id: BedId,
        changes: &BedPatch,
        stamp: i64,
        now_ms: i64,
    ) -> Result<bool, BoardError> {
        let index = self.index_of(id)?;
        if stamp.abs_diff(now_ms) > MAX_REMOTE_SKEW_MS {
            warn!(bed_id = id, stamp, now_ms, "refusing realtime event with implausible stamp");
            return Ok(false);
        }
        let Some(merged) = merge_incoming(&self.beds[index], changes, stamp) else {
            debug!(
                bed_id = id,
                stamp,
                local_stamp = self.beds[index].last_update_timestamp,
                "dropping stale realtime event"
            );
            return Ok(false);
        };
        self.beds[index] = merged;
        self.last_stamp = self.last_stamp.max(stamp);

        if let Err(err) = self.sink.record(Origin::Remote, id, changes, &self.beds) {
            warn!(bed_id = id, error = %err, "merged realtime event not persisted locally");
        }
        Ok(true)
    }

    fn index_of(&self, id: BedId) -> Result<usize, BoardError> {
        self.beds
            .iter()
            .position(|bed| bed.id == id)
            .ok_or(BoardError::UnknownBed(id))
    }
}

/// Last-timestamp-wins merge. `None` means the incoming change is older than
/// what the bed already holds.
pub fn merge_incoming(bed: &Bed, changes: &BedPatch, stamp: i64) -> Option<Bed> {
    if stamp < bed.last_update_timestamp {
        return None;
    }
    let mut merged = bed.clone();
    merged.apply(changes);
    merged.last_update_timestamp = stamp;
    Some(merged)
}
