use std::sync::Arc;

use tracing::{debug, warn};

use crate::bed::catalog::{Catalog, ClinicSettings};
use crate::bed::model::{Bed, BedId, BedPatch, PatientVisit, StatusFlags, TreatmentStep, VisitPatch};
use crate::bed::store::{BedStore, BoardError};
use crate::bed::timer::{KeepAwakeLatch, TickOutcome, TimerEngine};
use crate::bed::treatment_text::format_steps;
use crate::sync::bridge::RealtimeEvent;
use crate::sync::{MutationSink, SyncStatus, VisitLog};
use crate::time_provider::TimeProvider;

/// Facade over the roster that every operator action goes through. The
/// action, control and integration operations live in sibling modules.
pub struct BedBoard {
    pub(crate) store: BedStore,
    pub(crate) catalog: Catalog,
    pub(crate) settings: ClinicSettings,
    clock: Arc<dyn TimeProvider>,
    visits: Option<Box<dyn VisitLog>>,
    timer: TimerEngine,
    keep_awake: KeepAwakeLatch,
}

impl BedBoard {
    pub fn new(
        roster: Vec<Bed>,
        sink: Box<dyn MutationSink>,
        catalog: Catalog,
        settings: ClinicSettings,
        clock: Arc<dyn TimeProvider>,
        visits: Option<Box<dyn VisitLog>>,
    ) -> Self {
        Self {
            store: BedStore::new(roster, sink),
            timer: TimerEngine::new(settings.near_end_secs),
            keep_awake: KeepAwakeLatch::new(settings.keep_awake),
            catalog,
            settings,
            clock,
            visits,
        }
    }

    pub fn beds(&self) -> &[Bed] {
        self.store.list()
    }

    pub fn bed(&self, id: BedId) -> Option<&Bed> {
        self.store.get(id)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &ClinicSettings {
        &self.settings
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.store.sync_status()
    }

    pub fn keep_awake_asserted(&self) -> bool {
        self.keep_awake.is_asserted()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// One timer pass plus the keep-awake check.
    pub fn tick(&mut self) -> TickOutcome {
        let now = self.now_ms();
        let mut outcome = self.timer.tick(&mut self.store, &self.catalog.presets, now);
        outcome.keep_awake = self.keep_awake.update(self.store.list());
        outcome
    }

    pub fn apply_realtime(&mut self, event: &RealtimeEvent) -> bool {
        let now = self.now_ms();
        match self
            .store
            .merge_remote(event.bed_id, &event.changes, event.timestamp, now)
        {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "realtime event ignored");
                false
            }
        }
    }

    /// Resolved steps of a bed's program, owned so callers can keep mutating.
    pub(crate) fn steps_of(&self, id: BedId) -> Vec<TreatmentStep> {
        self.store
            .get(id)
            .map(|bed| bed.steps(&self.catalog.presets).to_vec())
            .unwrap_or_default()
    }

    /// Stamped write for operator actions; false when the bed does not exist.
    pub(crate) fn write(&mut self, id: BedId, patch: &BedPatch) -> bool {
        let now = self.now_ms();
        match self.store.update(id, patch, now) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "bed write skipped");
                false
            }
        }
    }

    pub(crate) fn store_update_confirmed(
        &mut self,
        id: BedId,
        patch: &BedPatch,
    ) -> Result<(), BoardError> {
        let now = self.now_ms();
        self.store.update_confirmed(id, patch, now)
    }

    pub(crate) fn log_visit_start(&self, id: BedId, steps: &[TreatmentStep], flags: StatusFlags) {
        if let Some(visits) = &self.visits {
            visits.add_visit(PatientVisit::started(id, format_steps(steps), flags));
        }
    }

    pub(crate) fn log_visit_change(&self, id: BedId, patch: VisitPatch) {
        if let Some(visits) = &self.visits {
            visits.update_visit(id, patch);
        }
    }
}
