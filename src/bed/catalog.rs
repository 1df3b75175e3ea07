use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::bed::model::{Preset, TreatmentStep};

#[derive(Debug, Clone)]
pub struct ClinicConfig {
    pub version: u32,
    pub settings: ClinicSettings,
    pub catalog: Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClinicSettings {
    pub bed_count: u32,
    pub tick_ms: u64,
    pub near_end_secs: i64,
    pub traction_minutes: u32,
    pub keep_awake: bool,
}

impl Default for ClinicSettings {
    fn default() -> Self {
        Self {
            bed_count: default_bed_count(),
            tick_ms: default_tick_ms(),
            near_end_secs: default_near_end_secs(),
            traction_minutes: default_traction_minutes(),
            keep_awake: true,
        }
    }
}

/// Single-step template offered on the quick-start grid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuickTreatment {
    pub id: String,
    pub name: String,
    pub duration_minutes: u32,
    #[serde(default = "default_enable_timer")]
    pub enable_timer: bool,
    #[serde(default)]
    pub color: String,
}

impl QuickTreatment {
    pub fn to_step(&self, step_id: String) -> TreatmentStep {
        TreatmentStep {
            id: step_id,
            name: self.name.clone(),
            duration: i64::from(self.duration_minutes) * 60,
            enable_timer: self.enable_timer,
            color: self.color.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub presets: Vec<Preset>,
    pub quick_treatments: Vec<QuickTreatment>,
}

impl Catalog {
    pub fn preset(&self, id: &str) -> Option<&Preset> {
        self.presets.iter().find(|preset| preset.id == id)
    }
}

pub fn load_clinic_config(path: &Path) -> Result<ClinicConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read clinic config {}", path.display()))?;
    parse_clinic_config_text(&content)
}

pub fn parse_clinic_config_text(content: &str) -> Result<ClinicConfig> {
    let raw = serde_json::from_str::<ClinicConfigFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != 1 {
        bail!(
            "unsupported clinic config version {}; expected version 1",
            raw.version
        );
    }

    let settings = raw.settings;
    if settings.bed_count == 0 {
        bail!("settings.bed_count must be greater than zero");
    }
    if settings.tick_ms == 0 {
        bail!("settings.tick_ms must be greater than zero");
    }
    if settings.traction_minutes == 0 {
        bail!("settings.traction_minutes must be greater than zero");
    }

    let mut preset_ids = HashSet::new();
    for preset in &raw.presets {
        if !preset_ids.insert(preset.id.as_str()) {
            bail!("duplicate preset id found: {}", preset.id);
        }
        if preset.steps.is_empty() {
            bail!("preset '{}' must have at least one step", preset.id);
        }
        if let Some(step) = preset.steps.iter().find(|step| step.duration < 0) {
            bail!(
                "preset '{}' step '{}' has a negative duration",
                preset.id,
                step.id
            );
        }
    }

    let mut quick_ids = HashSet::new();
    for quick in &raw.quick_treatments {
        if !quick_ids.insert(quick.id.as_str()) {
            bail!("duplicate quick treatment id found: {}", quick.id);
        }
        if quick.name.trim().is_empty() {
            bail!("quick treatment '{}' must have a name", quick.id);
        }
    }

    Ok(ClinicConfig {
        version: raw.version,
        settings: ClinicSettings {
            bed_count: settings.bed_count,
            tick_ms: settings.tick_ms,
            near_end_secs: settings.near_end_secs,
            traction_minutes: settings.traction_minutes,
            keep_awake: settings.keep_awake,
        },
        catalog: Catalog {
            presets: raw.presets,
            quick_treatments: raw.quick_treatments,
        },
    })
}

#[derive(Debug, Deserialize)]
struct ClinicConfigFile {
    version: u32,
    #[serde(default)]
    settings: ClinicSettingsFile,
    #[serde(default)]
    presets: Vec<Preset>,
    #[serde(default)]
    quick_treatments: Vec<QuickTreatment>,
}

#[derive(Debug, Deserialize)]
struct ClinicSettingsFile {
    #[serde(default = "default_bed_count")]
    bed_count: u32,
    #[serde(default = "default_tick_ms")]
    tick_ms: u64,
    #[serde(default = "default_near_end_secs")]
    near_end_secs: i64,
    #[serde(default = "default_traction_minutes")]
    traction_minutes: u32,
    #[serde(default = "default_keep_awake")]
    keep_awake: bool,
}

impl Default for ClinicSettingsFile {
    fn default() -> Self {
        Self {
            bed_count: default_bed_count(),
            tick_ms: default_tick_ms(),
            near_end_secs: default_near_end_secs(),
            traction_minutes: default_traction_minutes(),
            keep_awake: default_keep_awake(),
        }
    }
}

fn default_bed_count() -> u32 {
    11
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_near_end_secs() -> i64 {
    60
}

fn default_traction_minutes() -> u32 {
    15
}

fn default_keep_awake() -> bool {
    true
}

fn default_enable_timer() -> bool {
    true
}
