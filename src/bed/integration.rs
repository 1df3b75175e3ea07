use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::bed::board::BedBoard;
use crate::bed::controls::completed_patch;
use crate::bed::model::{
    BedId, BedPatch, BedStatus, PatientVisit, Preset, Program, TreatmentStep, VisitPatch,
};
use crate::bed::store::BoardError;
use crate::bed::treatment_text::{format_steps, match_preset, parse_steps};

impl BedBoard {
    /// Re-syncs a bed with an edited visit record. Flags always follow the
    /// record; the timer restarts only when forced, when the bed is not
    /// running, or when the record describes a different program.
    pub fn override_bed_from_log(
        &mut self,
        id: BedId,
        visit: &PatientVisit,
        force_restart: bool,
    ) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        let text = visit.treatment_name.trim();

        let (program, steps) = match match_preset(text, &self.catalog.presets) {
            Some(preset) => (
                Program::ById {
                    preset_id: preset.id.clone(),
                },
                preset.steps.clone(),
            ),
            None => {
                let steps = parse_steps(text, &self.catalog.quick_treatments);
                let preset = Preset {
                    id: format!("log-restore-{}", self.now_ms()),
                    name: text.to_string(),
                    steps: steps.clone(),
                };
                (Program::Inline { preset }, steps)
            }
        };
        let Some(first) = steps.first() else {
            debug!(bed_id = id, treatment = text, "log entry names no known steps");
            return false;
        };

        let restart = force_restart
            || bed.status != BedStatus::Active
            || !same_steps(bed.steps(&self.catalog.presets), &steps);
        let patch = if restart {
            BedPatch {
                status: Some(BedStatus::Active),
                program: Some(program),
                current_step_index: Some(0),
                memos: Some(BTreeMap::new()),
                ..BedPatch::anchored(first.duration, self.now_ms())
            }
        } else {
            BedPatch::default()
        }
        .with_flags(visit.flags);

        if restart {
            info!(bed_id = id, treatment = text, "bed restarted from log entry");
        }
        self.write(id, &patch)
    }

    /// Moves the live treatment of `from` onto `to` and clears `from`. The
    /// source is only cleared once the destination write is confirmed.
    pub fn move_bed_state(&mut self, from: BedId, to: BedId) -> Result<bool, BoardError> {
        if from == to {
            return Ok(false);
        }
        let source = self.bed(from).cloned().ok_or(BoardError::UnknownBed(from))?;
        let previous = self.bed(to).cloned().ok_or(BoardError::UnknownBed(to))?;
        if source.status == BedStatus::Idle {
            return Ok(false);
        }

        if let Err(err) = self.store_update_confirmed(to, &BedPatch::runtime_of(&source)) {
            warn!(from, to, error = %err, "move aborted, restoring destination");
            self.write(to, &BedPatch::runtime_of(&previous));
            return Err(err);
        }
        self.write(from, &BedPatch::idle());
        info!(from, to, "bed state moved");
        Ok(true)
    }

    /// Replaces the bed's steps with an edited list. The running timer is
    /// kept when the current step is unchanged.
    pub fn update_bed_steps(&mut self, id: BedId, steps: Vec<TreatmentStep>) -> bool {
        if steps.is_empty() {
            return false;
        }
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if bed.status == BedStatus::Idle {
            return false;
        }

        let index = bed.current_step_index;
        let name = bed
            .program
            .resolve(&self.catalog.presets)
            .map(|preset| preset.name.clone())
            .unwrap_or_else(|| "Custom".to_string());
        let old_current = bed.current_step(&self.catalog.presets).cloned();
        let new_current = steps.get(index).cloned();
        let status = bed.status;

        let mut patch = match (status, new_current) {
            (_, None) => completed_patch(steps.len()),
            (BedStatus::Active, Some(step)) if !same_step(old_current.as_ref(), &step) => {
                BedPatch::anchored(step.duration, self.now_ms())
            }
            _ => BedPatch::default(),
        };
        let treatment = format_steps(&steps);
        patch.program = Some(Program::Inline {
            preset: Preset {
                id: format!("custom-edit-{}", self.now_ms()),
                name,
                steps,
            },
        });

        if !self.write(id, &patch) {
            return false;
        }
        self.log_visit_change(id, VisitPatch::treatment(treatment));
        true
    }
}

fn same_step(old: Option<&TreatmentStep>, new: &TreatmentStep) -> bool {
    old.is_some_and(|old| old.id == new.id && old.duration == new.duration)
}

fn same_steps(current: &[TreatmentStep], incoming: &[TreatmentStep]) -> bool {
    current.len() == incoming.len()
        && current.iter().zip(incoming).all(|(a, b)| {
            a.name.trim().eq_ignore_ascii_case(b.name.trim())
                && a.duration == b.duration
                && a.enable_timer == b.enable_timer
        })
}
