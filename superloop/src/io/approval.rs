//! Approval request record (`.superloop/loops/<loop>/approval.json`).
//!
//! Lifecycle: absent → `pending` → `approved | rejected`. The loop driver
//! consumes a decided record exactly once and deletes it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::ApprovalStatus;
use crate::io::events::now_rfc3339;
use crate::io::fsutil::{read_json_opt, write_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub status: ApprovalStatus,
    pub loop_id: String,
    pub run_id: String,
    pub iteration: u32,
    pub requested_at: String,
    pub decided_at: Option<String>,
    pub by: Option<String>,
    pub note: Option<String>,
    /// Gate summary shown to the human reviewer.
    #[serde(default)]
    pub summary: Vec<String>,
}

pub fn load_approval(path: &Path) -> Result<Option<ApprovalRequest>> {
    read_json_opt(path).context("load approval request")
}

/// Write a fresh pending request, replacing any previous record.
pub fn request_approval(
    path: &Path,
    loop_id: &str,
    run_id: &str,
    iteration: u32,
    summary: Vec<String>,
) -> Result<ApprovalRequest> {
    let request = ApprovalRequest {
        status: ApprovalStatus::Pending,
        loop_id: loop_id.to_string(),
        run_id: run_id.to_string(),
        iteration,
        requested_at: now_rfc3339(),
        decided_at: None,
        by: None,
        note: None,
        summary,
    };
    write_json(path, &request)?;
    info!(loop_id, iteration, "approval requested");
    Ok(request)
}

/// Record a human decision on a pending request.
pub fn decide_approval(
    path: &Path,
    decision: ApprovalStatus,
    by: Option<&str>,
    note: Option<&str>,
) -> Result<ApprovalRequest> {
    if decision == ApprovalStatus::Pending {
        bail!("approval decision must be approved or rejected");
    }
    let Some(mut request) = load_approval(path)? else {
        bail!("no approval request at {}", path.display());
    };
    if request.status != ApprovalStatus::Pending {
        bail!(
            "approval request for iteration {} is already {:?}",
            request.iteration,
            request.status
        );
    }
    request.status = decision;
    request.decided_at = Some(now_rfc3339());
    request.by = by.map(str::to_string);
    request.note = note.map(str::to_string);
    write_json(path, &request)?;
    info!(loop_id = %request.loop_id, status = ?decision, "approval decided");
    Ok(request)
}

/// Delete a decided request after the driver acted on it.
pub fn consume_approval(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_request_can_be_decided_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("approval.json");
        request_approval(&path, "demo", "run-1", 3, vec!["tests: ok".to_string()])
            .expect("request");

        let decided = decide_approval(&path, ApprovalStatus::Rejected, Some("ana"), Some("nope"))
            .expect("decide");
        assert_eq!(decided.status, ApprovalStatus::Rejected);
        assert_eq!(decided.note.as_deref(), Some("nope"));
        assert!(decided.decided_at.is_some());

        let again = decide_approval(&path, ApprovalStatus::Approved, None, None);
        assert!(again.is_err());
    }

    #[test]
    fn deciding_without_request_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = decide_approval(
            &temp.path().join("approval.json"),
            ApprovalStatus::Approved,
            None,
            None,
        )
        .expect_err("no request");
        assert!(err.to_string().contains("no approval request"));
    }

    #[test]
    fn consume_deletes_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("approval.json");
        request_approval(&path, "demo", "run-1", 1, Vec::new()).expect("request");
        consume_approval(&path).expect("consume");
        assert!(load_approval(&path).expect("load").is_none());
        consume_approval(&path).expect("consume twice");
    }
}
