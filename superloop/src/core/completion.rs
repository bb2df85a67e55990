//! Completion decision over gate results.

use crate::core::types::GateMode;

/// Whether a command-backed gate runs this iteration.
pub fn should_run_gate(mode: GateMode, promise_matched: bool, checklist_complete: bool) -> bool {
    match mode {
        GateMode::Always => true,
        GateMode::OnPromise => promise_matched || checklist_complete,
        GateMode::Never => false,
    }
}

/// Inputs to the candidate-complete decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionInputs {
    pub promise_matched: bool,
    pub tests_ok: bool,
    pub validation_ok: bool,
    pub validation_required: bool,
    pub checklist_ok: bool,
    pub evidence_ok: bool,
    pub evidence_required: bool,
}

/// Candidate-complete iff the promise matched and every required gate is ok.
pub fn is_candidate_complete(inputs: &CompletionInputs) -> bool {
    inputs.promise_matched
        && inputs.tests_ok
        && (!inputs.validation_required || inputs.validation_ok)
        && inputs.checklist_ok
        && (!inputs.evidence_required || inputs.evidence_ok)
}

/// Names of unmet gates, for iteration notes.
pub fn unmet_gates(inputs: &CompletionInputs) -> Vec<&'static str> {
    let mut unmet = Vec::new();
    if !inputs.promise_matched {
        unmet.push("promise");
    }
    if !inputs.checklist_ok {
        unmet.push("checklist");
    }
    if !inputs.tests_ok {
        unmet.push("tests");
    }
    if inputs.validation_required && !inputs.validation_ok {
        unmet.push("validation");
    }
    if inputs.evidence_required && !inputs.evidence_ok {
        unmet.push("evidence");
    }
    unmet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ok() -> CompletionInputs {
        CompletionInputs {
            promise_matched: true,
            tests_ok: true,
            validation_ok: true,
            validation_required: true,
            checklist_ok: true,
            evidence_ok: true,
            evidence_required: true,
        }
    }

    #[test]
    fn on_promise_mode_runs_when_promise_or_checklist() {
        assert!(should_run_gate(GateMode::OnPromise, true, false));
        assert!(should_run_gate(GateMode::OnPromise, false, true));
        assert!(!should_run_gate(GateMode::OnPromise, false, false));
        assert!(should_run_gate(GateMode::Always, false, false));
        assert!(!should_run_gate(GateMode::Never, true, true));
    }

    #[test]
    fn all_gates_ok_is_complete() {
        assert!(is_candidate_complete(&all_ok()));
        assert!(unmet_gates(&all_ok()).is_empty());
    }

    #[test]
    fn missing_promise_blocks_completion() {
        let inputs = CompletionInputs {
            promise_matched: false,
            ..all_ok()
        };
        assert!(!is_candidate_complete(&inputs));
        assert_eq!(unmet_gates(&inputs), vec!["promise"]);
    }

    #[test]
    fn optional_gates_are_ignored_when_not_required() {
        let inputs = CompletionInputs {
            validation_ok: false,
            validation_required: false,
            evidence_ok: false,
            evidence_required: false,
            ..all_ok()
        };
        assert!(is_candidate_complete(&inputs));
    }

    #[test]
    fn failing_tests_block_completion() {
        let inputs = CompletionInputs {
            tests_ok: false,
            checklist_ok: false,
            ..all_ok()
        };
        assert!(!is_candidate_complete(&inputs));
        assert_eq!(unmet_gates(&inputs), vec!["checklist", "tests"]);
    }
}
