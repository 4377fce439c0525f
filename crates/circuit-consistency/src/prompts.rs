//! Prompt templates.
//!
//! Templates are plain strings with `{placeholder}` slots, overridable from
//! the `[prompts]` config section. Unknown placeholders are left as-is.

use serde::{Deserialize, Serialize};

const NAMING_PROMPT: &str = "\
The marked region {component_box} of this circuit diagram contains one component. \
Reply with the component's name exactly as labelled in the diagram, or a short \
functional name if it has no label. Reply with the name only.";

const DETAIL_PROMPT: &str = "\
Analyse the component \"{component_name}\" at {component_box} in this circuit diagram. \
Known components and their boxes: {all_components}.

List every connection of this component. For each connection give the name and box \
of the component at the other end, the box of the pin on this component \
(visual_position) and the function of the signal. Use the boxes from the known \
component list. Reply as JSON:
{\"component_name\": \"...\", \"box\": \"(x1, y1, x2, y2)\", \"connections\": \
{\"input\": [{\"name\": \"...\", \"box\": \"(x1, y1, x2, y2)\", \"visual_position\": \"(x1, y1, x2, y2)\", \"function\": \"...\"}], \
\"output\": [], \"bidirectional\": []}}";

const JUDGE_PROMPT: &str = "\
Two analyses of the component \"{component_name}\" at {component_box} in this circuit \
diagram follow. Use the diagram as ground truth.

Analysis A:
{detail_a}

Analysis B:
{detail_b}

Structurally, {n_consistent} connections match out of {n_total1} (A) and {n_total2} (B), \
a base score of {base_score}. Judge the functional descriptions of the matched pins and \
the overall role of the component. Reply as JSON:
{\"pin_agreement\": \"aligned|minor_mismatch|contradiction\", \"role_consistent\": true, \
\"critical_pins\": [], \"inconsistencies\": [], \"better_source\": \"A|B\", \"reasoning\": \"...\"}";

/// The three prompts the pipeline sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    /// Asks for a component's display name. Slots: `component_box`.
    pub naming: String,
    /// Asks for a component's connections. Slots: `component_box`,
    /// `component_name`, `all_components`.
    pub detail: String,
    /// Asks for a qualitative comparison. Slots: `component_box`,
    /// `component_name`, `detail_a`, `detail_b`, `n_consistent`, `n_total1`,
    /// `n_total2`, `base_score`.
    pub judge: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            naming: NAMING_PROMPT.to_string(),
            detail: DETAIL_PROMPT.to_string(),
            judge: JUDGE_PROMPT.to_string(),
        }
    }
}

/// Substitute `{name}` slots in one pass over `template`.
///
/// Substituted text is never rescanned, so a value that itself contains
/// `{slot}` is inserted verbatim. Unknown slots are left as written.
#[must_use]
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            values
                .iter()
                .find(|(slot, _)| *slot == name)
                .map(|(_, value)| (*value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
