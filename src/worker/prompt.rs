//! Prompt enhancer
//!
//! Turns the degradation map and the optional user prompt into a bounded
//! restoration instruction for the provider. At most three kinds are
//! addressed, strongest first; each picks a fragment from a severity tier.

use crate::api::models::{DegradationKind, DegradationMap};

const SELECTION_THRESHOLD: f32 = 0.3;
const MAX_SELECTED: usize = 3;
const MAX_LEN: usize = 1000;
const TRUNCATE_TO: usize = 950;

const QUALITY_GUIDANCE: &str =
    "Preserve natural textures and faithful colors; do not invent detail or over-smooth surfaces.";
const SEVERITY_HINT: &str = "Treat the most severe degradation first.";
const SUBTLE_ONLY: &str =
    "Subtle enhancement only: gently improve clarity and tone without altering the content.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Low,
    Medium,
    High,
}

fn severity_for(score: f32) -> Severity {
    if score >= 0.7 {
        Severity::High
    } else if score >= 0.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// [low, medium, high] fragments per kind
fn fragments(kind: DegradationKind) -> [&'static str; 3] {
    match kind {
        DegradationKind::Blur => [
            "slightly sharpen soft edges",
            "recover fine detail lost to blur",
            "strongly deblur and reconstruct fine detail",
        ],
        DegradationKind::Noise => [
            "lightly reduce grain",
            "remove visible noise while keeping texture",
            "aggressively denoise heavy grain without plastic smoothing",
        ],
        DegradationKind::LowLight => [
            "gently lift shadow detail",
            "brighten the underexposed areas and balance exposure",
            "recover a severely underexposed image with natural tones",
        ],
        DegradationKind::Compression => [
            "soften minor compression artifacts",
            "remove blocky compression artifacts",
            "repair heavy JPEG artifacts and banding",
        ],
        DegradationKind::Scratch => [
            "heal small scratches and specks",
            "remove scratches and dust across the frame",
            "reconstruct areas damaged by deep scratches and tears",
        ],
        DegradationKind::Fade => [
            "slightly enrich faded tones",
            "restore faded colors and contrast",
            "fully revive a badly faded image with rich, period-accurate color",
        ],
        DegradationKind::ColorShift => [
            "nudge the white balance back to neutral",
            "correct the color cast",
            "remove a strong color cast and rebuild accurate hues",
        ],
    }
}

pub fn enhance(map: &DegradationMap, user_prompt: Option<&str>) -> String {
    let mut selected: Vec<(DegradationKind, f32)> = map
        .iter()
        .filter(|(_, score)| **score > SELECTION_THRESHOLD)
        .map(|(kind, score)| (*kind, *score))
        .collect();
    selected.sort_by(|a, b| b.1.total_cmp(&a.1));
    selected.truncate(MAX_SELECTED);

    let prompt = user_prompt.map(str::trim).filter(|p| !p.is_empty());

    let mut out = String::new();
    if let Some(p) = prompt {
        out.push_str("User request: ");
        out.push_str(p);
        out.push_str(". ");
    }

    if selected.is_empty() {
        if prompt.is_none() {
            return SUBTLE_ONLY.to_string();
        }
        out.push_str(QUALITY_GUIDANCE);
        return bounded(out);
    }

    let parts: Vec<&str> = selected
        .iter()
        .map(|(kind, score)| {
            let tier = fragments(*kind);
            match severity_for(*score) {
                Severity::Low => tier[0],
                Severity::Medium => tier[1],
                Severity::High => tier[2],
            }
        })
        .collect();
    out.push_str("Technical restoration: ");
    out.push_str(&parts.join("; "));
    out.push_str(". ");
    out.push_str(QUALITY_GUIDANCE);

    if selected.iter().any(|(_, score)| severity_for(*score) == Severity::High) {
        out.push(' ');
        out.push_str(SEVERITY_HINT);
    }

    bounded(out)
}

fn bounded(text: String) -> String {
    if text.len() <= MAX_LEN {
        return text;
    }
    let mut end = TRUNCATE_TO;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(DegradationKind, f32)]) -> DegradationMap {
        entries.iter().copied().collect()
    }

    #[test]
    fn empty_map_without_prompt_is_subtle_only() {
        assert_eq!(enhance(&DegradationMap::new(), None), SUBTLE_ONLY);
    }

    #[test]
    fn weak_scores_are_not_selected() {
        let weak = map(&[(DegradationKind::Blur, 0.3), (DegradationKind::Noise, 0.1)]);
        assert_eq!(enhance(&weak, None), SUBTLE_ONLY);
    }

    #[test]
    fn user_prompt_leads_the_output() {
        let out = enhance(&map(&[(DegradationKind::Fade, 0.6)]), Some("  make it pop  "));
        assert!(out.starts_with("User request: make it pop. "));
        assert!(out.contains("restore faded colors"));
    }

    #[test]
    fn strongest_three_kinds_in_descending_order() {
        let out = enhance(
            &map(&[
                (DegradationKind::Blur, 0.45),
                (DegradationKind::Noise, 0.95),
                (DegradationKind::Scratch, 0.65),
                (DegradationKind::Fade, 0.5),
            ]),
            None,
        );
        let noise = out.find("aggressively denoise").unwrap();
        let scratch = out.find("remove scratches").unwrap();
        assert!(noise < scratch);
        // Fourth-strongest (blur) is dropped
        assert!(!out.contains("sharpen"));
        // Fade at 0.5 is in: medium tier
        assert!(out.contains("restore faded colors"));
    }

    #[test]
    fn severity_tiers_pick_matching_fragments() {
        let low = enhance(&map(&[(DegradationKind::Noise, 0.4)]), None);
        assert!(low.contains("lightly reduce grain"));
        assert!(!low.contains(SEVERITY_HINT));

        let medium = enhance(&map(&[(DegradationKind::Noise, 0.6)]), None);
        assert!(medium.contains("remove visible noise"));

        let high = enhance(&map(&[(DegradationKind::Noise, 0.8)]), None);
        assert!(high.contains("aggressively denoise"));
        assert!(high.contains(SEVERITY_HINT));
    }

    #[test]
    fn output_is_bounded() {
        let long_prompt = "restore ".repeat(200);
        let out = enhance(&map(&[(DegradationKind::Blur, 0.9)]), Some(&long_prompt));
        assert!(out.len() <= TRUNCATE_TO + 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn blank_prompt_is_treated_as_absent() {
        assert_eq!(enhance(&DegradationMap::new(), Some("   ")), SUBTLE_ONLY);
    }
}
