use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::bed::board::BedBoard;
use crate::bed::catalog::QuickTreatment;
use crate::bed::model::{BedId, BedPatch, BedStatus, Preset, Program, StatusFlags, TreatmentStep};

pub const TRACTION_STEP_NAME: &str = "Traction";

/// Starting a treatment. Any prior state of the bed is superseded.
impl BedBoard {
    pub fn select_preset(&mut self, id: BedId, preset_id: &str, flags: StatusFlags) -> bool {
        if self.catalog.preset(preset_id).is_none() {
            debug!(bed_id = id, preset_id, "unknown preset, nothing started");
            return false;
        }
        self.start_program(
            id,
            Program::ById {
                preset_id: preset_id.to_string(),
            },
            flags,
        )
    }

    pub fn start_custom_preset(
        &mut self,
        id: BedId,
        name: &str,
        steps: Vec<TreatmentStep>,
        flags: StatusFlags,
    ) -> bool {
        if steps.is_empty() {
            return false;
        }
        let preset = Preset {
            id: format!("custom-{}", self.now_ms()),
            name: name.to_string(),
            steps,
        };
        self.start_program(id, Program::Inline { preset }, flags)
    }

    pub fn start_quick_treatment(
        &mut self,
        id: BedId,
        template: &QuickTreatment,
        flags: StatusFlags,
    ) -> bool {
        let step = template.to_step(format!("{}-0", template.id));
        self.start_custom_preset(id, &template.name, vec![step], flags)
    }

    /// A `minutes` of zero uses the configured default traction length.
    pub fn start_traction(&mut self, id: BedId, minutes: u32, flags: StatusFlags) -> bool {
        let minutes = if minutes == 0 {
            self.settings.traction_minutes
        } else {
            minutes
        };
        let step = TreatmentStep {
            id: "traction-0".to_string(),
            name: TRACTION_STEP_NAME.to_string(),
            duration: i64::from(minutes) * 60,
            enable_timer: true,
            color: String::new(),
        };
        let flags = StatusFlags {
            is_traction: true,
            ..flags
        };
        self.start_custom_preset(id, TRACTION_STEP_NAME, vec![step], flags)
    }

    fn start_program(&mut self, id: BedId, program: Program, flags: StatusFlags) -> bool {
        if self.bed(id).is_none() {
            return false;
        }
        let steps = program.steps(&self.catalog.presets).to_vec();
        let Some(first) = steps.first() else {
            return false;
        };

        let patch = BedPatch {
            status: Some(BedStatus::Active),
            program: Some(program),
            current_step_index: Some(0),
            memos: Some(BTreeMap::new()),
            ..BedPatch::anchored(first.duration, self.now_ms())
        }
        .with_flags(flags);
        if !self.write(id, &patch) {
            return false;
        }
        info!(bed_id = id, steps = steps.len(), first_step = %first.name, "treatment started");
        self.log_visit_start(id, &steps, flags);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::bed::board::fixtures::*;
    use crate::bed::model::{BedStatus, Program, StatusFlags};

    fn injection() -> StatusFlags {
        StatusFlags {
            is_injection: true,
            ..StatusFlags::default()
        }
    }

    #[test]
    fn selecting_preset_anchors_first_step() {
        let mut h = harness(5);
        assert!(h.board.select_preset(3, "preset-shoulder", injection()));

        let bed = h.bed(3);
        assert_eq!(bed.status, BedStatus::Active);
        assert_eq!(bed.current_step_index, 0);
        assert_eq!(bed.remaining_time, 600);
        assert_eq!(bed.original_duration, 600);
        assert_eq!(bed.start_time, Some(T0));
        assert!(bed.flags.is_injection);
        assert!(!bed.is_paused);
        assert_eq!(
            bed.program,
            Program::ById {
                preset_id: "preset-shoulder".to_string()
            }
        );

        let added = h.visits.added.lock().expect("visits").clone();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].bed_id, Some(3));
        assert_eq!(added[0].treatment_name, "ICT / TENS");
        assert!(added[0].flags.is_injection);
    }

    #[test]
    fn unknown_preset_is_a_no_op() {
        let mut h = harness(2);
        assert!(!h.board.select_preset(1, "missing", StatusFlags::default()));
        assert_eq!(h.bed(1).status, BedStatus::Idle);
        assert!(h.sink.recorded().is_empty());
        assert!(h.visits.added.lock().expect("visits").is_empty());
    }

    #[test]
    fn starting_supersedes_previous_treatment() {
        let mut h = harness(1);
        assert!(h.board.select_preset(1, "preset-back", StatusFlags::default()));
        h.board.next_step(1);
        h.board.update_memo(1, 0, Some("left"));
        h.board.toggle_pause(1);

        assert!(h.board.select_preset(1, "preset-shoulder", StatusFlags::default()));
        let bed = h.bed(1);
        assert_eq!(bed.current_step_index, 0);
        assert!(bed.memos.is_empty());
        assert!(!bed.is_paused);
        assert_eq!(bed.remaining_time, 600);
    }

    #[test]
    fn custom_preset_requires_steps() {
        let mut h = harness(1);
        assert!(!h.board.start_custom_preset(1, "Empty", Vec::new(), StatusFlags::default()));
        assert!(h.board.start_custom_preset(
            1,
            "Ad hoc",
            vec![step("x", "Laser", 240)],
            StatusFlags::default()
        ));
        let bed = h.bed(1);
        assert_eq!(bed.remaining_time, 240);
        match bed.program {
            Program::Inline { preset } => assert_eq!(preset.name, "Ad hoc"),
            other => panic!("expected inline program, got {other:?}"),
        }
    }

    #[test]
    fn quick_treatment_builds_single_step() {
        let mut h = harness(1);
        let template = h.board.catalog().quick_treatments[0].clone();
        assert!(h.board.start_quick_treatment(1, &template, StatusFlags::default()));
        let bed = h.bed(1);
        let steps = bed.steps(&h.board.catalog().presets);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "Hot Pack");
        assert_eq!(steps[0].id, "hp-0");
        assert_eq!(bed.remaining_time, 600);
    }

    #[test]
    fn traction_always_sets_flag_and_defaults_minutes() {
        let mut h = harness(1);
        assert!(h.board.start_traction(1, 0, StatusFlags::default()));
        let bed = h.bed(1);
        assert!(bed.flags.is_traction);
        assert_eq!(bed.remaining_time, 15 * 60);

        assert!(h.board.start_traction(1, 20, injection()));
        let bed = h.bed(1);
        assert!(bed.flags.is_traction);
        assert!(bed.flags.is_injection);
        assert_eq!(bed.remaining_time, 20 * 60);
    }

    #[test]
    fn unknown_bed_starts_nothing() {
        let mut h = harness(1);
        assert!(!h.board.select_preset(9, "preset-shoulder", StatusFlags::default()));
        assert!(h.visits.added.lock().expect("visits").is_empty());
    }
}
