use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::bed::board::BedBoard;
use crate::bed::model::BedStatus;
use crate::bed::timer::remaining_at;

pub struct DiagnosticsContext<'a> {
    pub clock_label: &'a str,
    pub sync_mode: String,
    pub cache_path: String,
}

pub fn run_diagnostics(board: &BedBoard, context: &DiagnosticsContext<'_>) {
    print!("{}", render_report(board, context));
}

pub fn render_report(board: &BedBoard, context: &DiagnosticsContext<'_>) -> String {
    let now = board.now_ms();
    let presets = &board.catalog().presets;
    let mut out = String::new();

    let _ = writeln!(out, "Bed board diagnostics");
    let _ = writeln!(out, "Clock source: {}", context.clock_label);
    let _ = writeln!(out, "Roster size: {}", board.beds().len());
    let _ = writeln!(out, "Presets loaded: {}", presets.len());
    let _ = writeln!(
        out,
        "Quick treatments loaded: {}",
        board.catalog().quick_treatments.len()
    );
    let _ = writeln!(out, "Sync mode: {}", context.sync_mode);
    let _ = writeln!(out, "Local cache: {}", context.cache_path);
    let _ = writeln!(out, "Tick interval: {} ms", board.settings().tick_ms);

    let busy: Vec<_> = board
        .beds()
        .iter()
        .filter(|bed| bed.status != BedStatus::Idle)
        .collect();
    let _ = writeln!(out, "Beds in use: {}", busy.len());
    for bed in busy {
        let steps = bed.steps(presets);
        let step_name = bed
            .current_step(presets)
            .map(|step| step.name.as_str())
            .unwrap_or("?");
        let status = match bed.status {
            BedStatus::Idle => "IDLE",
            BedStatus::Active if bed.is_paused => "PAUSED",
            BedStatus::Active => "ACTIVE",
            BedStatus::Completed => "COMPLETED",
        };
        let _ = writeln!(
            out,
            "  Bed {}: {status} step {}/{} ({step_name}) remaining {}",
            bed.id,
            bed.current_step_index + 1,
            steps.len(),
            format_remaining(remaining_at(bed, now)),
        );
    }
    out
}

/// `MM:SS`, prefixed with `+` once the step has run over.
pub fn format_remaining(seconds: i64) -> String {
    let sign = if seconds < 0 { "+" } else { "" };
    let total = seconds.unsigned_abs();
    format!("{sign}{:02}:{:02}", total / 60, total % 60)
}

/// Sleeps until `deadline`, finishing with a short yield loop so ticks land
/// close to the wall-clock boundary.
pub fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if now >= deadline {
        return;
    }

    let remaining = deadline.saturating_duration_since(now);
    if remaining > Duration::from_millis(2) {
        std::thread::sleep(remaining - Duration::from_millis(1));
    }
    while Instant::now() < deadline {
        std::thread::yield_now();
    }
}
