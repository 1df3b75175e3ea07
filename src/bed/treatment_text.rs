//! Conversion between a step list and the free-text `treatment_name` column of
//! the visit log.

use crate::bed::catalog::QuickTreatment;
use crate::bed::model::{Preset, TreatmentStep};

const JOINER: &str = " / ";
const SEPARATORS: [char; 3] = ['/', '+', ','];

pub fn format_steps(steps: &[TreatmentStep]) -> String {
    steps
        .iter()
        .map(|step| step.name.trim())
        .collect::<Vec<_>>()
        .join(JOINER)
}

fn tokens(text: &str) -> Vec<String> {
    text.split(SEPARATORS)
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Catalog preset described by `text`, either by its step list or its name.
pub fn match_preset<'a>(text: &str, presets: &'a [Preset]) -> Option<&'a Preset> {
    let wanted = tokens(text);
    if wanted.is_empty() {
        return None;
    }
    presets
        .iter()
        .find(|preset| tokens(&format_steps(&preset.steps)) == wanted)
        .or_else(|| {
            presets
                .iter()
                .find(|preset| preset.name.trim().eq_ignore_ascii_case(text.trim()))
        })
}

fn match_quick<'a>(token: &str, quick: &'a [QuickTreatment]) -> Option<&'a QuickTreatment> {
    if let Some(exact) = quick
        .iter()
        .find(|template| template.name.trim().to_lowercase() == token)
    {
        return Some(exact);
    }
    let mut prefixed = quick
        .iter()
        .filter(|template| template.name.trim().to_lowercase().starts_with(token));
    match (prefixed.next(), prefixed.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// Rebuilds steps from free text using the quick-treatment names. Unknown
/// tokens are skipped; ids depend only on template and position.
pub fn parse_steps(text: &str, quick: &[QuickTreatment]) -> Vec<TreatmentStep> {
    tokens(text)
        .iter()
        .filter_map(|token| match_quick(token, quick))
        .enumerate()
        .map(|(position, template)| template.to_step(format!("{}-{position}", template.id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(id: &str, name: &str, minutes: u32) -> QuickTreatment {
        QuickTreatment {
            id: id.to_string(),
            name: name.to_string(),
            duration_minutes: minutes,
            enable_timer: true,
            color: String::new(),
        }
    }

    fn catalog() -> Vec<QuickTreatment> {
        vec![
            quick("hp", "Hot Pack", 10),
            quick("ict", "ICT", 10),
            quick("tens", "TENS", 5),
            quick("us", "Ultrasound", 5),
            quick("uv", "UV Lamp", 3),
        ]
    }

    fn step(id: &str, name: &str, duration: i64) -> TreatmentStep {
        TreatmentStep {
            id: id.to_string(),
            name: name.to_string(),
            duration,
            enable_timer: true,
            color: String::new(),
        }
    }

    #[test]
    fn formats_names_with_slashes() {
        let steps = vec![step("a", "Hot Pack", 600), step("b", " ICT ", 600)];
        assert_eq!(format_steps(&steps), "Hot Pack / ICT");
        assert_eq!(format_steps(&[]), "");
    }

    #[test]
    fn parses_mixed_separators_case_insensitively() {
        let steps = parse_steps("hot pack + ict, Tens", &catalog());
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Hot Pack", "ICT", "TENS"]);
        assert_eq!(steps[0].duration, 600);
        assert_eq!(steps[2].id, "tens-2");
    }

    #[test]
    fn unique_prefix_matches_but_ambiguous_prefix_does_not() {
        let steps = parse_steps("Ultra / U", &catalog());
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "Ultrasound");
    }

    #[test]
    fn unknown_tokens_are_skipped() {
        assert!(parse_steps("Massage / ???", &catalog()).is_empty());
        assert!(parse_steps("   ", &catalog()).is_empty());
        let steps = parse_steps("Massage / ICT", &catalog());
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, "ict-0");
    }

    #[test]
    fn reparsing_formatted_text_is_stable() {
        let first = parse_steps("Hot Pack / ICT", &catalog());
        let second = parse_steps(&format_steps(&first), &catalog());
        assert_eq!(first, second);
    }

    #[test]
    fn preset_matches_by_steps_then_by_name() {
        let presets = vec![
            Preset {
                id: "shoulder".to_string(),
                name: "Shoulder".to_string(),
                steps: vec![step("ict", "ICT", 600), step("tens", "TENS", 300)],
            },
            Preset {
                id: "knee".to_string(),
                name: "Knee Basic".to_string(),
                steps: vec![step("hp", "Hot Pack", 600)],
            },
        ];
        assert_eq!(
            match_preset("ict/tens", &presets).map(|p| p.id.as_str()),
            Some("shoulder")
        );
        assert_eq!(
            match_preset("knee basic", &presets).map(|p| p.id.as_str()),
            Some("knee")
        );
        assert!(match_preset("TENS / ICT", &presets).is_none());
        assert!(match_preset("", &presets).is_none());
    }
}
