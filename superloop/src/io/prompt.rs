//! Prompt rendering for roles, delegation handshakes, adaptation passes and children.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order before the last section is truncated.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::Role;

const ROLE_COMMON_TEMPLATE: &str = include_str!("prompts/_role_common.md");
const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");
const TESTER_TEMPLATE: &str = include_str!("prompts/tester.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const SCRIPTED_TEMPLATE: &str = include_str!("prompts/scripted.md");
const HANDSHAKE_TEMPLATE: &str = include_str!("prompts/handshake.md");
const ADAPTATION_TEMPLATE: &str = include_str!("prompts/adaptation.md");
const CHILD_TEMPLATE: &str = include_str!("prompts/child.md");

/// Default prompt budget in bytes.
pub const DEFAULT_PROMPT_BUDGET: usize = 120_000;

/// Drop order for droppable sections, least important first.
const DROP_ORDER: [&str; 6] = [
    "reports",
    "context",
    "feedback",
    "checklist",
    "failures",
    "delegation",
];

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("_role_common", ROLE_COMMON_TEMPLATE),
        ("planner", PLANNER_TEMPLATE),
        ("implementer", IMPLEMENTER_TEMPLATE),
        ("tester", TESTER_TEMPLATE),
        ("reviewer", REVIEWER_TEMPLATE),
        ("scripted", SCRIPTED_TEMPLATE),
        ("handshake", HANDSHAKE_TEMPLATE),
        ("adaptation", ADAPTATION_TEMPLATE),
        ("child", CHILD_TEMPLATE),
    ] {
        env.add_template(name, source)
            .expect("embedded prompt template should be valid");
    }
    env
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

#[derive(Debug, Clone, Serialize)]
pub struct ReportRef {
    pub role: Role,
    pub path: String,
}

/// Inputs for a role's main prompt.
#[derive(Debug, Clone, Serialize)]
pub struct RolePromptInputs {
    pub loop_id: String,
    pub iteration: u32,
    pub role: Role,
    pub spec_path: String,
    pub spec_text: String,
    pub completion_promise: String,
    pub report_path: Option<String>,
    pub reports: Vec<ReportRef>,
    pub previous_notes: Vec<String>,
    pub rejection_note: Option<String>,
    pub test_failures: Option<String>,
    pub checklist_remaining: Vec<String>,
    pub delegation_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptedPromptInputs {
    pub loop_id: String,
    pub iteration: u32,
    pub spec_path: String,
    pub session_index: usize,
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakePromptInputs {
    pub loop_id: String,
    pub iteration: u32,
    pub role: Role,
    pub spec_path: String,
    pub spec_text: String,
    pub request_path: String,
    pub max_waves: usize,
    pub max_children: usize,
    pub reconnaissance: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildBrief {
    pub id: String,
    pub state: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptationPromptInputs {
    pub role: Role,
    pub wave_id: String,
    pub decision_path: String,
    pub completed: Vec<ChildBrief>,
    pub remaining: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildPromptInputs {
    pub loop_id: String,
    pub role: Role,
    pub wave_id: String,
    pub child_id: String,
    pub prompt: String,
    pub context_files: Vec<String>,
    pub reconnaissance: bool,
}

pub fn render_role_prompt(inputs: &RolePromptInputs, budget: usize) -> Result<String> {
    render(inputs.role.as_str(), inputs, budget)
}

pub fn render_scripted_prompt(inputs: &ScriptedPromptInputs, budget: usize) -> Result<String> {
    render("scripted", inputs, budget)
}

pub fn render_handshake_prompt(inputs: &HandshakePromptInputs, budget: usize) -> Result<String> {
    render("handshake", inputs, budget)
}

pub fn render_adaptation_prompt(inputs: &AdaptationPromptInputs, budget: usize) -> Result<String> {
    render("adaptation", inputs, budget)
}

pub fn render_child_prompt(inputs: &ChildPromptInputs, budget: usize) -> Result<String> {
    render("child", inputs, budget)
}

fn render<T: Serialize>(template: &str, inputs: &T, budget: usize) -> Result<String> {
    let rendered = ENGINE.get_template(template)?.render(inputs)?;
    let mut sections = parse_sections(&rendered);
    apply_budget(&mut sections, budget);
    Ok(join_sections(&sections))
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    let over = total_len(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    // Truncate the largest section rather than the contract or promise.
    if let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) {
        let keep = largest.content.len().saturating_sub(over + 12);
        let mut cut = keep;
        while cut > 0 && !largest.content.is_char_boundary(cut) {
            cut -= 1;
        }
        largest.content.truncate(cut);
        largest.content.push_str("\n[truncated]");
        debug!(section = %largest.key, kept = cut, "truncated prompt section for budget");
    }
}

fn join_sections(sections: &[Section]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}
