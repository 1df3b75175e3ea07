use tracing::info;

use crate::bed::board::BedBoard;
use crate::bed::model::{BedId, BedPatch, BedStatus, FlagKind, Preset, Program, VisitPatch};
use crate::bed::timer::remaining_at;

impl BedBoard {
    pub fn next_step(&mut self, id: BedId) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if bed.status == BedStatus::Idle {
            return false;
        }
        let steps = self.steps_of(id);
        if steps.is_empty() {
            return false;
        }

        let next = bed.current_step_index + 1;
        let patch = match steps.get(next) {
            Some(step) => BedPatch {
                current_step_index: Some(next),
                ..BedPatch::anchored(step.duration, self.now_ms())
            },
            None => {
                info!(bed_id = id, "treatment completed");
                completed_patch(steps.len())
            }
        };
        self.write(id, &patch)
    }

    /// Going back always restarts the previous step at its full duration.
    pub fn prev_step(&mut self, id: BedId) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if bed.status != BedStatus::Active || bed.current_step_index == 0 {
            return false;
        }
        let steps = self.steps_of(id);
        if steps.is_empty() {
            return false;
        }
        let target = (bed.current_step_index - 1).min(steps.len() - 1);
        let patch = BedPatch {
            current_step_index: Some(target),
            ..BedPatch::anchored(steps[target].duration, self.now_ms())
        };
        self.write(id, &patch)
    }

    pub fn toggle_pause(&mut self, id: BedId) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if bed.status != BedStatus::Active {
            return false;
        }
        let now = self.now_ms();
        let patch = if bed.is_paused {
            BedPatch::anchored(bed.remaining_time, now)
        } else {
            BedPatch {
                remaining_time: Some(remaining_at(bed, now)),
                is_paused: Some(true),
                ..BedPatch::default()
            }
        };
        self.write(id, &patch)
    }

    /// Swaps two steps of the bed's program, forking a catalog preset into an
    /// inline copy. Memos travel with their steps.
    pub fn swap_steps(&mut self, id: BedId, first: usize, second: usize) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if first == second {
            return false;
        }
        let Some(resolved) = bed.program.resolve(&self.catalog.presets) else {
            return false;
        };
        if first >= resolved.steps.len() || second >= resolved.steps.len() {
            return false;
        }

        let mut preset: Preset = resolved.clone();
        preset.steps.swap(first, second);

        let mut memos = bed.memos.clone();
        let memo_first = memos.remove(&first);
        let memo_second = memos.remove(&second);
        if let Some(text) = memo_first {
            memos.insert(second, text);
        }
        if let Some(text) = memo_second {
            memos.insert(first, text);
        }

        let current = bed.current_step_index;
        let mut patch = if bed.status == BedStatus::Active && (current == first || current == second)
        {
            BedPatch::anchored(preset.steps[current].duration, self.now_ms())
        } else {
            BedPatch::default()
        };
        patch.program = Some(Program::Inline { preset });
        patch.memos = Some(memos);
        self.write(id, &patch)
    }

    /// Flips one ancillary flag and mirrors it onto the visit record.
    pub fn toggle_flag(&mut self, id: BedId, kind: FlagKind) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if bed.status == BedStatus::Idle {
            return false;
        }
        let value = !bed.flags.get(kind);
        let mut patch = BedPatch::default();
        patch.set_flag(kind, value);
        if !self.write(id, &patch) {
            return false;
        }
        self.log_visit_change(id, VisitPatch::flag(kind, value));
        true
    }

    /// Stores the text as given; `None` or blank text removes the memo.
    pub fn update_memo(&mut self, id: BedId, step_index: usize, text: Option<&str>) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if step_index >= bed.steps(&self.catalog.presets).len() {
            return false;
        }
        let mut memos = bed.memos.clone();
        match text.filter(|text| !text.trim().is_empty()) {
            Some(text) => {
                memos.insert(step_index, text.to_string());
            }
            None => {
                memos.remove(&step_index);
            }
        }
        let patch = BedPatch {
            memos: Some(memos),
            ..BedPatch::default()
        };
        self.write(id, &patch)
    }

    /// Operator correction of the running timer.
    pub fn update_bed_duration(&mut self, id: BedId, seconds: i64) -> bool {
        let Some(bed) = self.bed(id) else {
            return false;
        };
        if bed.status != BedStatus::Active {
            return false;
        }
        let patch = BedPatch::anchored(seconds.max(0), self.now_ms());
        self.write(id, &patch)
    }

    pub fn clear_bed(&mut self, id: BedId) -> bool {
        self.write(id, &BedPatch::idle())
    }

    /// Clears every bed; returns how many were cleared.
    pub fn reset_all(&mut self) -> usize {
        let ids = self.store.ids();
        let cleared = ids.into_iter().filter(|id| self.clear_bed(*id)).count();
        info!(cleared, "all beds reset");
        cleared
    }
}

pub(crate) fn completed_patch(step_count: usize) -> BedPatch {
    BedPatch {
        status: Some(BedStatus::Completed),
        current_step_index: Some(step_count.saturating_sub(1)),
        start_time: Some(None),
        remaining_time: Some(0),
        is_paused: Some(false),
        ..BedPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use crate::bed::board::fixtures::*;
    use crate::bed::model::{Bed, BedStatus, FlagKind, Program, StatusFlags, VisitPatch};

    fn started(preset: &str) -> Harness {
        let mut h = harness(6);
        assert!(h.board.select_preset(3, preset, StatusFlags::default()));
        h
    }

    fn step_names(h: &Harness, bed: &Bed) -> Vec<String> {
        bed.steps(&h.board.catalog().presets)
            .iter()
            .map(|step| step.name.clone())
            .collect()
    }

    #[test]
    fn stepping_through_shoulder_preset_completes() {
        let mut h = started("preset-shoulder");

        h.clock.advance_secs(100);
        assert!(h.board.next_step(3));
        let bed = h.bed(3);
        assert_eq!(bed.current_step_index, 1);
        assert_eq!(bed.remaining_time, 300);
        assert_eq!(bed.start_time, Some(T0 + 100_000));

        assert!(h.board.next_step(3));
        let bed = h.bed(3);
        assert_eq!(bed.status, BedStatus::Completed);
        assert_eq!(bed.remaining_time, 0);
        assert_eq!(bed.current_step_index, 1);
        assert_eq!(bed.start_time, None);
    }

    #[test]
    fn next_step_on_idle_bed_is_a_no_op() {
        let mut h = harness(2);
        assert!(!h.board.next_step(1));
        assert!(!h.board.next_step(99));
        assert!(h.sink.recorded().is_empty());
    }

    #[test]
    fn prev_step_resets_to_full_duration() {
        let mut h = started("preset-back");
        h.board.next_step(3);
        h.board.next_step(3);
        h.clock.advance_secs(50);

        assert!(h.board.prev_step(3));
        let bed = h.bed(3);
        assert_eq!(bed.current_step_index, 1);
        assert_eq!(bed.remaining_time, 300);
        assert_eq!(bed.original_duration, 300);

        assert!(h.board.prev_step(3));
        assert!(!h.board.prev_step(3));
        assert_eq!(h.bed(3).current_step_index, 0);
    }

    #[test]
    fn prev_step_requires_active_bed() {
        let mut h = started("preset-shoulder");
        h.board.next_step(3);
        h.board.next_step(3);
        assert_eq!(h.bed(3).status, BedStatus::Completed);
        assert!(!h.board.prev_step(3));
    }

    #[test]
    fn pause_survives_long_gap() {
        let mut h = harness(6);
        assert!(h.board.start_custom_preset(
            5,
            "Two minutes",
            vec![step("x", "Laser", 120)],
            StatusFlags::default()
        ));
        h.clock.advance_secs(80);
        assert!(h.board.toggle_pause(5));
        let paused = h.bed(5);
        assert!(paused.is_paused);
        assert_eq!(paused.remaining_time, 40);

        h.clock.advance_secs(500);
        h.board.tick();
        assert_eq!(h.bed(5).remaining_time, 40);

        assert!(h.board.toggle_pause(5));
        let resumed = h.bed(5);
        assert!(!resumed.is_paused);
        assert_eq!(resumed.remaining_time, 40);
        assert_eq!(resumed.original_duration, 40);
        assert_eq!(resumed.start_time, Some(T0 + 580_000));

        h.clock.advance_secs(10);
        h.board.tick();
        assert_eq!(h.bed(5).remaining_time, 30);
    }

    #[test]
    fn immediate_pause_resume_keeps_computed_remaining() {
        let mut h = started("preset-shoulder");
        h.clock.advance_ms(12_345);
        h.board.toggle_pause(3);
        h.board.toggle_pause(3);
        let bed = h.bed(3);
        assert_eq!(crate::bed::timer::remaining_at(&bed, h.board.now_ms()), 588);
    }

    #[test]
    fn pause_is_only_for_active_beds() {
        let mut h = harness(1);
        assert!(!h.board.toggle_pause(1));
    }

    #[test]
    fn swapping_twice_restores_order_and_memos() {
        let mut h = started("preset-back");
        h.board.update_memo(3, 0, Some("heat low"));
        h.board.update_memo(3, 2, Some("light"));
        let before = h.bed(3);
        let before_names = step_names(&h, &before);

        assert!(h.board.swap_steps(3, 0, 2));
        let swapped = h.bed(3);
        assert_eq!(step_names(&h, &swapped), vec!["Exercise", "Ultrasound", "Hot Pack"]);
        assert_eq!(swapped.memos.get(&2).map(String::as_str), Some("heat low"));
        assert_eq!(swapped.memos.get(&0).map(String::as_str), Some("light"));
        assert!(matches!(swapped.program, Program::Inline { .. }));

        assert!(h.board.swap_steps(3, 0, 2));
        let restored = h.bed(3);
        assert_eq!(step_names(&h, &restored), before_names);
        assert_eq!(restored.memos, before.memos);
    }

    #[test]
    fn swapping_active_step_reanchors_timer() {
        let mut h = started("preset-back");
        h.clock.advance_secs(60);
        assert!(h.board.swap_steps(3, 0, 2));
        let bed = h.bed(3);
        assert_eq!(bed.remaining_time, 900);
        assert_eq!(bed.start_time, Some(T0 + 60_000));

        h.clock.advance_secs(5);
        assert!(h.board.swap_steps(3, 1, 2));
        let bed = h.bed(3);
        assert_eq!(bed.remaining_time, 900);
        assert_eq!(bed.start_time, Some(T0 + 60_000));
    }

    #[test]
    fn swap_out_of_range_or_same_index_is_a_no_op() {
        let mut h = started("preset-shoulder");
        let before = h.bed(3);
        assert!(!h.board.swap_steps(3, 0, 5));
        assert!(!h.board.swap_steps(3, 1, 1));
        assert_eq!(h.bed(3), before);
    }

    #[test]
    fn toggle_flag_mirrors_to_visit_log() {
        let mut h = started("preset-shoulder");
        assert!(h.board.toggle_flag(3, FlagKind::Eswt));
        assert!(h.bed(3).flags.is_eswt);
        assert!(h.board.toggle_flag(3, FlagKind::Eswt));
        assert!(!h.bed(3).flags.is_eswt);

        let updated = h.visits.updated.lock().expect("visits").clone();
        assert_eq!(
            updated,
            vec![
                (3, VisitPatch::flag(FlagKind::Eswt, true)),
                (3, VisitPatch::flag(FlagKind::Eswt, false)),
            ]
        );
        assert!(!h.board.toggle_flag(1, FlagKind::Fluid));
    }

    #[test]
    fn memo_set_and_clear() {
        let mut h = started("preset-shoulder");
        assert!(h.board.update_memo(3, 1, Some("  right arm ")));
        assert_eq!(h.bed(3).memos.get(&1).map(String::as_str), Some("  right arm "));
        assert!(h.board.update_memo(3, 1, Some("")));
        assert!(h.bed(3).memos.is_empty());
        assert!(h.board.update_memo(3, 1, Some("x")));
        assert!(h.board.update_memo(3, 1, Some("   ")));
        assert!(h.bed(3).memos.is_empty());
        assert!(!h.board.update_memo(3, 7, Some("nope")));
    }

    #[test]
    fn duration_override_reanchors_active_bed_only() {
        let mut h = started("preset-shoulder");
        h.board.toggle_pause(3);
        h.clock.advance_secs(30);
        assert!(h.board.update_bed_duration(3, 200));
        let bed = h.bed(3);
        assert_eq!(bed.remaining_time, 200);
        assert_eq!(bed.original_duration, 200);
        assert!(!bed.is_paused);
        assert_eq!(bed.start_time, Some(T0 + 30_000));

        assert!(h.board.update_bed_duration(3, -5));
        assert_eq!(h.bed(3).remaining_time, 0);
        assert!(!h.board.update_bed_duration(1, 100));
    }

    #[test]
    fn clear_is_idempotent() {
        let mut h = started("preset-shoulder");
        h.board.toggle_flag(3, FlagKind::Fluid);
        h.board.update_memo(3, 0, Some("memo"));

        assert!(h.board.clear_bed(3));
        let once = h.bed(3);
        assert!(h.board.clear_bed(3));
        let twice = h.bed(3);

        let mut expected = Bed::idle(3);
        expected.last_update_timestamp = once.last_update_timestamp;
        assert_eq!(once, expected);
        expected.last_update_timestamp = twice.last_update_timestamp;
        assert_eq!(twice, expected);
    }

    #[test]
    fn reset_all_clears_every_bed() {
        let mut h = started("preset-shoulder");
        h.board.select_preset(1, "preset-back", StatusFlags::default());
        assert_eq!(h.board.reset_all(), 6);
        assert!(h.board.beds().iter().all(|bed| bed.status == BedStatus::Idle));
    }
}
