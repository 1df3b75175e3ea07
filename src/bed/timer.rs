use std::collections::HashMap;

use tracing::warn;

use crate::bed::model::{Bed, BedId, BedStatus, Preset};
use crate::bed::store::BedStore;

pub fn elapsed_secs(start_ms: i64, now_ms: i64) -> i64 {
    now_ms.saturating_sub(start_ms).max(0) / 1_000
}

/// Remaining seconds as of `now_ms`. Beds that are not counting down report
/// their stored snapshot.
pub fn remaining_at(bed: &Bed, now_ms: i64) -> i64 {
    match bed.start_time {
        Some(start) if is_counting(bed) => bed
            .original_duration
            .saturating_sub(elapsed_secs(start, now_ms)),
        _ => bed.remaining_time,
    }
}

fn is_counting(bed: &Bed) -> bool {
    bed.status == BedStatus::Active && !bed.is_paused && bed.start_time.is_some()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub updated: usize,
    /// Timed steps seen at or below zero for the first time since they were
    /// anchored.
    pub overtime: Vec<BedId>,
    /// Timed steps that just entered the near-end window.
    pub near_end: Vec<BedId>,
    /// Keep-awake transition, if one happened.
    pub keep_awake: Option<bool>,
}

/// Identifies one countdown: a new anchor re-arms the overtime signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    step: usize,
    start_ms: i64,
    duration: i64,
}

struct Due {
    id: BedId,
    previous: i64,
    remaining: i64,
    timed: bool,
    anchor: Anchor,
}

#[derive(Debug, Clone)]
pub struct TimerEngine {
    near_end_secs: i64,
    overtime_signalled: HashMap<BedId, Anchor>,
}

impl TimerEngine {
    pub fn new(near_end_secs: i64) -> Self {
        Self {
            near_end_secs,
            overtime_signalled: HashMap::new(),
        }
    }

    pub fn tick(&mut self, store: &mut BedStore, presets: &[Preset], now_ms: i64) -> TickOutcome {
        let due: Vec<Due> = store
            .list()
            .iter()
            .filter(|bed| is_counting(bed))
            .map(|bed| Due {
                id: bed.id,
                previous: bed.remaining_time,
                remaining: remaining_at(bed, now_ms),
                timed: bed
                    .current_step(presets)
                    .map(|step| step.enable_timer)
                    .unwrap_or(false),
                anchor: Anchor {
                    step: bed.current_step_index,
                    start_ms: bed.start_time.unwrap_or_default(),
                    duration: bed.original_duration,
                },
            })
            .collect();
        self.overtime_signalled
            .retain(|id, _| due.iter().any(|entry| entry.id == *id));

        let mut outcome = TickOutcome::default();
        for entry in due {
            let Due {
                id,
                previous,
                remaining,
                timed,
                anchor,
            } = entry;
            if remaining != previous {
                if let Err(err) = store.derive_remaining(id, remaining) {
                    warn!(bed_id = id, error = %err, "timer could not refresh bed");
                    continue;
                }
                outcome.updated += 1;
            }
            if !timed {
                continue;
            }
            if remaining <= 0 {
                if self.overtime_signalled.get(&id) != Some(&anchor) {
                    self.overtime_signalled.insert(id, anchor);
                    outcome.overtime.push(id);
                }
            } else if previous > self.near_end_secs
                && remaining != previous
                && remaining <= self.near_end_secs
            {
                outcome.near_end.push(id);
            }
        }
        outcome
    }
}

/// Tracks whether the device should be kept awake: true while any bed is
/// counting down.
#[derive(Debug, Clone, Copy)]
pub struct KeepAwakeLatch {
    enabled: bool,
    asserted: bool,
}

impl KeepAwakeLatch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            asserted: false,
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    /// Returns the new value only when it changes.
    pub fn update(&mut self, beds: &[Bed]) -> Option<bool> {
        let wanted =
            self.enabled && beds.iter().any(|bed| bed.status == BedStatus::Active && !bed.is_paused);
        if wanted == self.asserted {
            return None;
        }
        self.asserted = wanted;
        Some(wanted)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::bed::model::{BedPatch, Program, TreatmentStep};
    use crate::sync::Origin;
    use crate::sync::testing::RecordingSink;

    fn presets() -> Vec<Preset> {
        vec![Preset {
            id: "p".to_string(),
            name: "P".to_string(),
            steps: vec![
                TreatmentStep {
                    id: "timed".to_string(),
                    name: "Timed".to_string(),
                    duration: 120,
                    enable_timer: true,
                    color: String::new(),
                },
                TreatmentStep {
                    id: "marker".to_string(),
                    name: "Marker".to_string(),
                    duration: 30,
                    enable_timer: false,
                    color: String::new(),
                },
            ],
        }]
    }

    fn running_store(duration: i64, start_ms: i64, step: usize) -> (BedStore, RecordingSink) {
        let sink = RecordingSink::default();
        let mut store = BedStore::new(vec![Bed::idle(1), Bed::idle(2)], Box::new(sink.clone()));
        let mut patch = BedPatch::anchored(duration, start_ms);
        patch.status = Some(BedStatus::Active);
        patch.current_step_index = Some(step);
        patch.program = Some(Program::ById {
            preset_id: "p".to_string(),
        });
        store.update(1, &patch, start_ms).expect("start bed");
        (store, sink)
    }

    #[test]
    fn remaining_follows_wall_clock_not_tick_count() {
        let (mut store, _) = running_store(120, 1_000_000, 0);
        let mut engine = TimerEngine::new(60);

        engine.tick(&mut store, &presets(), 1_000_000 + 80_400);
        assert_eq!(store.get(1).map(|bed| bed.remaining_time), Some(40));

        // A long stall is absorbed in one tick.
        engine.tick(&mut store, &presets(), 1_000_000 + 200_000);
        assert_eq!(store.get(1).map(|bed| bed.remaining_time), Some(-80));
    }

    #[test]
    fn ticks_never_stamp_or_reach_remote() {
        let (mut store, sink) = running_store(120, 5_000, 0);
        let stamp = store.get(1).map(|bed| bed.last_update_timestamp);
        TimerEngine::new(60).tick(&mut store, &presets(), 9_000);
        assert_eq!(store.get(1).map(|bed| bed.last_update_timestamp), stamp);
        assert_eq!(sink.recorded().last().map(|m| m.origin), Some(Origin::Tick));
    }

    #[test]
    fn paused_and_idle_beds_are_left_alone() {
        let (mut store, _) = running_store(120, 0, 0);
        let paused = BedPatch {
            is_paused: Some(true),
            ..BedPatch::default()
        };
        store.update(1, &paused, 1).expect("pause");
        let outcome = TimerEngine::new(60).tick(&mut store, &presets(), 100_000);
        assert_eq!(outcome.updated, 0);
        assert_eq!(store.get(1).map(|bed| bed.remaining_time), Some(120));
    }

    #[test]
    fn overtime_and_near_end_fire_once_on_crossing() {
        let (mut store, _) = running_store(120, 0, 0);
        let mut engine = TimerEngine::new(60);

        let outcome = engine.tick(&mut store, &presets(), 61_000);
        assert_eq!(outcome.near_end, vec![1]);
        let outcome = engine.tick(&mut store, &presets(), 62_000);
        assert!(outcome.near_end.is_empty());

        let outcome = engine.tick(&mut store, &presets(), 120_000);
        assert_eq!(outcome.overtime, vec![1]);
        let outcome = engine.tick(&mut store, &presets(), 125_000);
        assert!(outcome.overtime.is_empty());
        assert_eq!(outcome.updated, 1);
    }

    #[test]
    fn untimed_step_never_signals_overtime() {
        let (mut store, _) = running_store(30, 0, 1);
        let outcome = TimerEngine::new(60).tick(&mut store, &presets(), 40_000);
        assert!(outcome.overtime.is_empty());
        assert_eq!(store.get(1).map(|bed| bed.remaining_time), Some(-10));
    }

    #[test]
    fn zero_length_timed_step_signals_overtime_once() {
        let (mut store, _) = running_store(0, 1_000_000, 0);
        let mut engine = TimerEngine::new(60);

        let signals: Vec<Vec<BedId>> = (0..5)
            .map(|secs| engine.tick(&mut store, &presets(), 1_000_000 + secs * 1_000).overtime)
            .collect();
        assert_eq!(signals[0], vec![1]);
        assert!(signals[1..].iter().all(Vec::is_empty));
        assert_eq!(store.get(1).map(|bed| bed.remaining_time), Some(-4));
    }

    #[test]
    fn re_anchoring_rearms_overtime() {
        let (mut store, _) = running_store(120, 0, 0);
        let mut engine = TimerEngine::new(60);
        assert_eq!(engine.tick(&mut store, &presets(), 121_000).overtime, vec![1]);

        store
            .update(1, &BedPatch::anchored(0, 130_000), 130_000)
            .expect("re-anchor");
        assert_eq!(engine.tick(&mut store, &presets(), 131_000).overtime, vec![1]);
        assert!(engine.tick(&mut store, &presets(), 132_000).overtime.is_empty());
    }

    #[test]
    fn extreme_anchor_saturates_instead_of_overflowing() {
        let mut bed = Bed::idle(1);
        bed.status = BedStatus::Active;
        bed.start_time = Some(i64::MIN);
        bed.original_duration = i64::MIN + 5;
        assert_eq!(elapsed_secs(i64::MIN, i64::MAX), i64::MAX / 1_000);
        assert_eq!(remaining_at(&bed, 1_000), i64::MIN);
    }

    #[test]
    fn clock_stepping_backwards_counts_as_no_elapsed_time() {
        let mut bed = Bed::idle(1);
        bed.status = BedStatus::Active;
        bed.start_time = Some(10_000);
        bed.original_duration = 90;
        assert_eq!(remaining_at(&bed, 4_000), 90);
    }

    #[test]
    fn keep_awake_reports_transitions_only() {
        let mut latch = KeepAwakeLatch::new(true);
        let mut beds = vec![Bed::idle(1)];
        assert_eq!(latch.update(&beds), None);

        beds[0].status = BedStatus::Active;
        assert_eq!(latch.update(&beds), Some(true));
        assert_eq!(latch.update(&beds), None);
        assert!(latch.is_asserted());

        beds[0].is_paused = true;
        assert_eq!(latch.update(&beds), Some(false));
    }

    #[test]
    fn disabled_keep_awake_never_asserts() {
        let mut latch = KeepAwakeLatch::new(false);
        let mut bed = Bed::idle(1);
        bed.status = BedStatus::Active;
        assert_eq!(latch.update(&[bed]), None);
    }

    proptest! {
        #[test]
        fn tick_matches_anchor_formula(
            duration in 0_i64..20_000,
            start in 0_i64..4_000_000_000_000,
            elapsed_ms in 0_i64..100_000_000,
        ) {
            let (mut store, _) = running_store(duration, start, 0);
            TimerEngine::new(60).tick(&mut store, &presets(), start + elapsed_ms);
            let bed = store.get(1).expect("bed");
            prop_assert_eq!(bed.remaining_time, duration - elapsed_ms / 1_000);
            prop_assert_eq!(bed.original_duration, duration);
            prop_assert_eq!(bed.start_time, Some(start));
        }
    }
}
