//! Delegation request parsing and normalization.
//!
//! A role authors a request during its handshake pass. Normalization applies
//! the policy caps deterministically so the scheduler only ever sees a plan
//! whose dispatchable children respect `max_waves` and `max_children`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Raw request as authored by the role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DelegationRequest {
    #[serde(default)]
    pub waves: Vec<RequestedWave>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestedWave {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub children: Vec<RequestedChild>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestedChild {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub context_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChild {
    pub id: String,
    pub wave_index: usize,
    pub prompt: String,
    pub context_files: Vec<String>,
    /// Set when the child is dropped before dispatch.
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedWave {
    pub index: usize,
    pub id: String,
    pub children: Vec<PlannedChild>,
}

impl PlannedWave {
    pub fn dispatchable(&self) -> impl Iterator<Item = &PlannedChild> {
        self.children.iter().filter(|c| c.skip_reason.is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct DelegationPlan {
    pub waves: Vec<PlannedWave>,
}

impl DelegationPlan {
    pub fn requested(&self) -> usize {
        self.waves.iter().map(|w| w.children.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.iter().all(|w| w.dispatchable().next().is_none())
    }
}

/// Apply wave and child caps, sanitize ids and drop empty prompts.
pub fn normalize_request(
    request: &DelegationRequest,
    max_waves: usize,
    max_children: usize,
) -> DelegationPlan {
    let mut seen = HashSet::new();
    let mut seen_waves = HashSet::new();
    let mut waves = Vec::with_capacity(request.waves.len());

    for (wave_index, wave) in request.waves.iter().enumerate() {
        let wave_base = wave
            .id
            .as_deref()
            .map(sanitize_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("wave-{}", wave_index + 1));
        let wave_id = unique_id(&wave_base, &mut seen_waves);
        let wave_over_cap = wave_index >= max_waves;

        let mut children = Vec::with_capacity(wave.children.len());
        let mut dispatchable = 0usize;
        for (child_index, child) in wave.children.iter().enumerate() {
            let base = child
                .id
                .as_deref()
                .map(sanitize_id)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("w{}-c{}", wave_index + 1, child_index + 1));
            let id = unique_id(&base, &mut seen);
            let prompt = child.prompt.trim().to_string();

            let skip_reason = if wave_over_cap {
                Some(format!("wave cap reached (max_waves={max_waves})"))
            } else if prompt.is_empty() {
                Some("empty prompt".to_string())
            } else if dispatchable >= max_children {
                Some(format!("child cap reached (max_children={max_children})"))
            } else {
                dispatchable += 1;
                None
            };

            children.push(PlannedChild {
                id,
                wave_index,
                prompt,
                context_files: child.context_files.clone(),
                skip_reason,
            });
        }

        waves.push(PlannedWave {
            index: wave_index,
            id: wave_id,
            children,
        });
    }

    DelegationPlan { waves }
}

fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn unique_id(base: &str, seen: &mut HashSet<String>) -> String {
    if seen.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Parent decision after an adaptation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdaptationDecision {
    Continue,
    Abort { reason: String },
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse an adaptation decision file. Missing or invalid input means continue.
pub fn parse_adaptation_decision(raw: Option<&str>) -> AdaptationDecision {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return AdaptationDecision::Continue;
    };
    let Ok(parsed) = serde_json::from_str::<RawDecision>(raw) else {
        return AdaptationDecision::Continue;
    };
    match parsed.decision.trim().to_ascii_lowercase().as_str() {
        "abort" => AdaptationDecision::Abort {
            reason: parsed.reason.unwrap_or_default(),
        },
        _ => AdaptationDecision::Continue,
    }
}
