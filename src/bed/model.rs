use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

pub type BedId = u32;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BedStatus {
    #[default]
    Idle,
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentStep {
    pub id: String,
    pub name: String,
    /// Seconds.
    pub duration: i64,
    #[serde(default = "default_enable_timer")]
    pub enable_timer: bool,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub steps: Vec<TreatmentStep>,
}

/// Where a bed's steps come from. A named preset is referenced by id and never
/// mutated; any edit forks it into an inline copy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Program {
    #[default]
    None,
    ById {
        preset_id: String,
    },
    Inline {
        preset: Preset,
    },
}

impl Program {
    pub fn resolve<'a>(&'a self, presets: &'a [Preset]) -> Option<&'a Preset> {
        match self {
            Program::None => None,
            Program::ById { preset_id } => presets.iter().find(|preset| &preset.id == preset_id),
            Program::Inline { preset } => Some(preset),
        }
    }

    pub fn steps<'a>(&'a self, presets: &'a [Preset]) -> &'a [TreatmentStep] {
        self.resolve(presets)
            .map(|preset| preset.steps.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    Injection,
    Fluid,
    Traction,
    Eswt,
    Manual,
}

impl FlagKind {
    pub const ALL: [FlagKind; 5] = [
        FlagKind::Injection,
        FlagKind::Fluid,
        FlagKind::Traction,
        FlagKind::Eswt,
        FlagKind::Manual,
    ];
}

/// Ancillary treatments running alongside the step program.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusFlags {
    #[serde(default)]
    pub is_injection: bool,
    #[serde(default)]
    pub is_fluid: bool,
    #[serde(default)]
    pub is_traction: bool,
    #[serde(default)]
    pub is_eswt: bool,
    #[serde(default)]
    pub is_manual: bool,
}

impl StatusFlags {
    pub fn get(&self, kind: FlagKind) -> bool {
        match kind {
            FlagKind::Injection => self.is_injection,
            FlagKind::Fluid => self.is_fluid,
            FlagKind::Traction => self.is_traction,
            FlagKind::Eswt => self.is_eswt,
            FlagKind::Manual => self.is_manual,
        }
    }

    pub fn set(&mut self, kind: FlagKind, value: bool) {
        match kind {
            FlagKind::Injection => self.is_injection = value,
            FlagKind::Fluid => self.is_fluid = value,
            FlagKind::Traction => self.is_traction = value,
            FlagKind::Eswt => self.is_eswt = value,
            FlagKind::Manual => self.is_manual = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bed {
    pub id: BedId,
    #[serde(default)]
    pub status: BedStatus,
    #[serde(default)]
    pub program: Program,
    #[serde(default)]
    pub current_step_index: usize,
    /// Unix ms at which the current step was last anchored.
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub original_duration: i64,
    #[serde(default)]
    pub remaining_time: i64,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub flags: StatusFlags,
    #[serde(default)]
    pub memos: BTreeMap<usize, String>,
    #[serde(default)]
    pub last_update_timestamp: i64,
}

impl Bed {
    pub fn idle(id: BedId) -> Self {
        Self {
            id,
            status: BedStatus::Idle,
            program: Program::None,
            current_step_index: 0,
            start_time: None,
            original_duration: 0,
            remaining_time: 0,
            is_paused: false,
            flags: StatusFlags::default(),
            memos: BTreeMap::new(),
            last_update_timestamp: 0,
        }
    }

    pub fn steps<'a>(&'a self, presets: &'a [Preset]) -> &'a [TreatmentStep] {
        self.program.steps(presets)
    }

    pub fn current_step<'a>(&'a self, presets: &'a [Preset]) -> Option<&'a TreatmentStep> {
        self.steps(presets).get(self.current_step_index)
    }

    /// Shallow field overwrite; fields absent from the patch are left alone.
    pub fn apply(&mut self, patch: &BedPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(program) = &patch.program {
            self.program = program.clone();
        }
        if let Some(index) = patch.current_step_index {
            self.current_step_index = index;
        }
        if let Some(start_time) = patch.start_time {
            self.start_time = start_time;
        }
        if let Some(original) = patch.original_duration {
            self.original_duration = original;
        }
        if let Some(remaining) = patch.remaining_time {
            self.remaining_time = remaining;
        }
        if let Some(paused) = patch.is_paused {
            self.is_paused = paused;
        }
        for kind in FlagKind::ALL {
            if let Some(value) = patch.flag(kind) {
                self.flags.set(kind, value);
            }
        }
        if let Some(memos) = &patch.memos {
            self.memos = memos.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BedPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BedStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<Program>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    /// `Some(None)` clears the anchor.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_injection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_fluid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_traction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_eswt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_manual: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memos: Option<BTreeMap<usize, String>>,
}

impl BedPatch {
    /// Every field reset to the IDLE invariant.
    pub fn idle() -> Self {
        Self {
            status: Some(BedStatus::Idle),
            program: Some(Program::None),
            current_step_index: Some(0),
            start_time: Some(None),
            original_duration: Some(0),
            remaining_time: Some(0),
            is_paused: Some(false),
            memos: Some(BTreeMap::new()),
            ..Self::default()
        }
        .with_flags(StatusFlags::default())
    }

    /// The live treatment of a bed, without its identity or stamp.
    pub fn runtime_of(bed: &Bed) -> Self {
        Self {
            status: Some(bed.status),
            program: Some(bed.program.clone()),
            current_step_index: Some(bed.current_step_index),
            start_time: Some(bed.start_time),
            original_duration: Some(bed.original_duration),
            remaining_time: Some(bed.remaining_time),
            is_paused: Some(bed.is_paused),
            memos: Some(bed.memos.clone()),
            ..Self::default()
        }
        .with_flags(bed.flags)
    }

    /// Restart the countdown at `duration` seconds from `now_ms`.
    pub fn anchored(duration: i64, now_ms: i64) -> Self {
        Self {
            start_time: Some(Some(now_ms)),
            remaining_time: Some(duration),
            original_duration: Some(duration),
            is_paused: Some(false),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: StatusFlags) -> Self {
        for kind in FlagKind::ALL {
            self.set_flag(kind, flags.get(kind));
        }
        self
    }

    pub fn flag(&self, kind: FlagKind) -> Option<bool> {
        match kind {
            FlagKind::Injection => self.is_injection,
            FlagKind::Fluid => self.is_fluid,
            FlagKind::Traction => self.is_traction,
            FlagKind::Eswt => self.is_eswt,
            FlagKind::Manual => self.is_manual,
        }
    }

    pub fn set_flag(&mut self, kind: FlagKind, value: bool) {
        let slot = match kind {
            FlagKind::Injection => &mut self.is_injection,
            FlagKind::Fluid => &mut self.is_fluid,
            FlagKind::Traction => &mut self.is_traction,
            FlagKind::Eswt => &mut self.is_eswt,
            FlagKind::Manual => &mut self.is_manual,
        };
        *slot = Some(value);
    }
}

/// External treatment-log row. Written by the engine, only read back on an
/// explicit restore.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatientVisit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub bed_id: Option<BedId>,
    #[serde(default)]
    pub treatment_name: String,
    #[serde(flatten)]
    pub flags: StatusFlags,
}

impl PatientVisit {
    pub fn started(bed_id: BedId, treatment_name: String, flags: StatusFlags) -> Self {
        Self {
            id: None,
            bed_id: Some(bed_id),
            treatment_name,
            flags,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_injection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_fluid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_traction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_eswt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_manual: Option<bool>,
}

impl VisitPatch {
    pub fn treatment(name: String) -> Self {
        Self {
            treatment_name: Some(name),
            ..Self::default()
        }
    }

    pub fn flag(kind: FlagKind, value: bool) -> Self {
        let mut patch = Self::default();
        let slot = match kind {
            FlagKind::Injection => &mut patch.is_injection,
            FlagKind::Fluid => &mut patch.is_fluid,
            FlagKind::Traction => &mut patch.is_traction,
            FlagKind::Eswt => &mut patch.is_eswt,
            FlagKind::Manual => &mut patch.is_manual,
        };
        *slot = Some(value);
        patch
    }
}

fn default_enable_timer() -> bool {
    true
}

// Distinguishes an explicit `null` (Some(None)) from an absent field (None).
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
