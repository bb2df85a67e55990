//! Vendor transcript parsing: rate-limit detection and resume discovery.
//!
//! Detection is deliberately narrow. Structured JSON envelopes are checked
//! first; plain-text heuristics only fire on error-shaped lines so that agent
//! chatter about rate limiting (or a file containing "429") does not trip it.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::types::{ResumeHint, ResumeStrategy};
use crate::io::config::RunnerSpec;

/// A detected rate-limit line plus whatever reset timing could be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSignal {
    pub message: String,
    pub reset_hint: Option<String>,
    pub retry_after: Option<Duration>,
}

/// Vendor-specific view of an agent's output stream.
pub trait AgentTranscriptParser: Send + Sync {
    fn detect_rate_limit(&self, line: &str) -> Option<RateLimitSignal>;

    /// Resume handle after an interrupted session.
    ///
    /// `minted` is the session id injected at spawn (session-id vendors).
    fn resume_hint(&self, started_at: SystemTime, minted: Option<&str>) -> Option<ResumeHint>;
}

/// Text and JSON heuristics only; always restarts from scratch.
#[derive(Debug, Default)]
pub struct PlainTranscripts;

impl AgentTranscriptParser for PlainTranscripts {
    fn detect_rate_limit(&self, line: &str) -> Option<RateLimitSignal> {
        detect_rate_limit_line(line)
    }

    fn resume_hint(&self, _started_at: SystemTime, _minted: Option<&str>) -> Option<ResumeHint> {
        None
    }
}

/// Vendors that accept a caller-chosen session id (claude-style).
#[derive(Debug, Default)]
pub struct SessionIdTranscripts;

impl AgentTranscriptParser for SessionIdTranscripts {
    fn detect_rate_limit(&self, line: &str) -> Option<RateLimitSignal> {
        detect_rate_limit_line(line)
    }

    fn resume_hint(&self, _started_at: SystemTime, minted: Option<&str>) -> Option<ResumeHint> {
        minted.map(|id| ResumeHint::SessionId(id.to_string()))
    }
}

/// Vendors that record their own thread ids in transcript files (codex-style).
#[derive(Debug)]
pub struct ThreadDiscoveryTranscripts {
    root: PathBuf,
}

impl ThreadDiscoveryTranscripts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AgentTranscriptParser for ThreadDiscoveryTranscripts {
    fn detect_rate_limit(&self, line: &str) -> Option<RateLimitSignal> {
        detect_rate_limit_line(line)
    }

    fn resume_hint(&self, started_at: SystemTime, _minted: Option<&str>) -> Option<ResumeHint> {
        discover_thread_id(&self.root, started_at).map(ResumeHint::ThreadId)
    }
}

pub fn parser_for(spec: &RunnerSpec) -> Box<dyn AgentTranscriptParser> {
    match spec.resume {
        ResumeStrategy::None => Box::new(PlainTranscripts),
        ResumeStrategy::SessionId => Box::new(SessionIdTranscripts),
        ResumeStrategy::ThreadDiscovery => match spec.transcripts_root() {
            Some(root) => Box::new(ThreadDiscoveryTranscripts::new(root)),
            None => Box::new(PlainTranscripts),
        },
    }
}

static TEXT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\busage limit (?:reached|exceeded|hit)\b",
        r"(?i)\byou(?:'ve| have) (?:hit|reached|exceeded) (?:your|the) (?:usage|rate) limit\b",
        r"(?i)\brate[ _-]?limit(?:ed)? (?:reached|exceeded|error)\b",
        r"(?i)^\s*(?:\[?error\]?|api error|http error|fatal)\b[:\s].*\b(?:429|too many requests|rate[ _-]?limit(?:ed)?)\b",
        r"(?i)\bHTTP/\d(?:\.\d)?\s+429\b",
        r"(?i)\bstatus(?:[ _]code)?\s*[:=]?\s*429\b",
        r"(?i)^\s*too many requests\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("rate limit regex"))
    .collect()
});

static RETRY_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:try again|retry|resets?) in (?:about )?(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h)\b")
        .expect("retry-in regex")
});

static RESETS_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bresets?(?: at)?\s+(\d{1,2}(?::\d{2})?\s*(?:am|pm)?(?:\s*\([^)]*\))?)")
        .expect("resets-at regex")
});

static PIPE_EPOCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)limit reached\|(\d{10})\b").expect("pipe epoch regex"));

/// Classify one output line.
pub fn detect_rate_limit_line(line: &str) -> Option<RateLimitSignal> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        // JSON lines are judged by their structure only.
        return serde_json::from_str::<Value>(trimmed)
            .ok()
            .and_then(|value| detect_json_rate_limit(&value));
    }
    if !TEXT_PATTERNS.iter().any(|re| re.is_match(trimmed)) {
        return None;
    }
    Some(signal_from_text(trimmed))
}

fn signal_from_text(message: &str) -> RateLimitSignal {
    let (reset_hint, retry_after) = parse_reset(message);
    RateLimitSignal {
        message: message.to_string(),
        reset_hint,
        retry_after,
    }
}

/// Reset hint and wait parsed from free text.
pub fn parse_reset(text: &str) -> (Option<String>, Option<Duration>) {
    if let Some(caps) = PIPE_EPOCH_RE.captures(text)
        && let Ok(epoch) = caps[1].parse::<i64>()
    {
        return epoch_reset(epoch);
    }
    if let Some(caps) = RETRY_IN_RE.captures(text)
        && let Ok(amount) = caps[1].parse::<u64>()
    {
        let unit = caps[2].to_ascii_lowercase();
        let secs = if unit.starts_with('h') {
            amount.saturating_mul(3600)
        } else if unit.starts_with('m') {
            amount.saturating_mul(60)
        } else {
            amount
        };
        return (Some(caps[0].to_string()), Some(Duration::from_secs(secs)));
    }
    if let Some(caps) = RESETS_AT_RE.captures(text) {
        return (Some(format!("resets {}", caps[1].trim())), None);
    }
    (None, None)
}

fn epoch_reset(epoch: i64) -> (Option<String>, Option<Duration>) {
    let Some(at) = Utc.timestamp_opt(epoch, 0).single() else {
        return (None, None);
    };
    let wait = (at - Utc::now()).to_std().ok();
    (Some(at.to_rfc3339()), wait)
}

const JSON_RATE_LIMIT_CODES: [&str; 5] = [
    "rate_limit_error",
    "rate_limit_exceeded",
    "usage_limit_reached",
    "usage_limit_exceeded",
    "too_many_requests",
];

/// Structured error envelopes emitted by agent CLIs in JSON mode.
fn detect_json_rate_limit(value: &Value) -> Option<RateLimitSignal> {
    let obj = value.as_object()?;
    let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    let error = obj
        .get("error")
        .or_else(|| obj.get("msg").filter(|m| m["type"] == "error"));

    let codes = [
        error.and_then(|e| e.get("type")).and_then(Value::as_str),
        error.and_then(|e| e.get("code")).and_then(Value::as_str),
        obj.get("code").and_then(Value::as_str),
    ];
    let status = [
        obj.get("status"),
        obj.get("status_code"),
        error.and_then(|e| e.get("status")),
    ]
    .into_iter()
    .flatten()
    .any(|s| s.as_u64() == Some(429));

    let message = error
        .and_then(|e| e.get("message").or_else(|| e.get("msg")))
        .and_then(Value::as_str)
        .or_else(|| error.and_then(Value::as_str))
        .or_else(|| obj.get("message").and_then(Value::as_str))
        .or_else(|| obj.get("result").and_then(Value::as_str))
        .unwrap_or_default();

    let code_match = codes
        .iter()
        .flatten()
        .any(|c| JSON_RATE_LIMIT_CODES.contains(&c.to_ascii_lowercase().as_str()));
    let is_error_envelope = kind == "error"
        || obj.get("is_error").and_then(Value::as_bool) == Some(true)
        || error.is_some();
    let message_match = is_error_envelope && TEXT_PATTERNS.iter().any(|re| re.is_match(message));

    if !(code_match || status || message_match) {
        return None;
    }

    let (mut reset_hint, mut retry_after) = parse_reset(message);
    let resets_at = [
        obj.get("resets_at"),
        obj.get("resetsAt"),
        error.and_then(|e| e.get("resets_at")),
        error.and_then(|e| e.get("resetsAt")),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_i64);
    if let Some(epoch) = resets_at {
        (reset_hint, retry_after) = epoch_reset(epoch);
    }
    if retry_after.is_none()
        && let Some(secs) = [obj.get("retry_after"), error.and_then(|e| e.get("retry_after"))]
            .into_iter()
            .flatten()
            .find_map(Value::as_u64)
    {
        retry_after = Some(Duration::from_secs(secs));
    }

    let message = if message.is_empty() {
        value.to_string()
    } else {
        message.to_string()
    };
    Some(RateLimitSignal {
        message,
        reset_hint,
        retry_after,
    })
}

/// Tolerance for clock skew between our spawn time and the tool's own stamp.
const DISCOVERY_SKEW: Duration = Duration::from_secs(2);

/// Find the newest session file started at or after `started_at`.
///
/// The first line of each `*.jsonl` file is a JSON record carrying the session
/// id and its start timestamp, either at the top level or under `payload`.
pub fn discover_thread_id(root: &Path, started_at: SystemTime) -> Option<String> {
    let threshold: DateTime<Utc> = (started_at - DISCOVERY_SKEW).into();
    let mut best: Option<(DateTime<Utc>, String)> = None;

    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "jsonl") {
            continue;
        }
        let recent = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|modified| DateTime::<Utc>::from(modified) >= threshold);
        if !recent {
            continue;
        }
        let Some((stamp, id)) = read_session_meta(path) else {
            continue;
        };
        if stamp < threshold {
            continue;
        }
        // Earliest session after our start is the one we spawned.
        if best.as_ref().is_none_or(|(current, _)| stamp < *current) {
            best = Some((stamp, id));
        }
    }

    debug!(root = %root.display(), found = best.is_some(), "thread discovery");
    best.map(|(_, id)| id)
}

fn read_session_meta(path: &Path) -> Option<(DateTime<Utc>, String)> {
    let file = File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    let value: Value = serde_json::from_str(first.trim()).ok()?;
    let meta = value.get("payload").unwrap_or(&value);
    let id = meta
        .get("id")
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)?
        .to_string();
    let stamp = meta
        .get("timestamp")
        .or_else(|| value.get("timestamp"))
        .and_then(Value::as_str)?;
    let stamp = DateTime::parse_from_rfc3339(stamp).ok()?.with_timezone(&Utc);
    Some((stamp, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn detects_plain_usage_limit() {
        let signal = detect_rate_limit_line("Usage limit reached. Try again in 15 minutes.")
            .expect("signal");
        assert_eq!(signal.retry_after, Some(Duration::from_secs(900)));
        assert!(signal.reset_hint.is_some());
    }

    #[test]
    fn detects_error_shaped_429() {
        assert!(detect_rate_limit_line("ERROR: request failed: 429 Too Many Requests").is_some());
        assert!(detect_rate_limit_line("HTTP/1.1 429 Too Many Requests").is_some());
    }

    #[test]
    fn ignores_chatter_and_incidental_numbers() {
        assert!(detect_rate_limit_line("I will add retry logic for rate limiting").is_none());
        assert!(detect_rate_limit_line("wrote 429 lines to src/lib.rs").is_none());
        assert!(
            detect_rate_limit_line(r#"{"type":"item","text":"handle HTTP 429 in the client"}"#)
                .is_none()
        );
    }

    #[test]
    fn detects_json_error_envelopes() {
        let line = r#"{"type":"error","error":{"type":"rate_limit_error","message":"Rate limit exceeded"}}"#;
        let signal = detect_rate_limit_line(line).expect("signal");
        assert_eq!(signal.message, "Rate limit exceeded");

        let result = r#"{"type":"result","is_error":true,"result":"Claude AI usage limit reached|1700000000"}"#;
        let signal = detect_rate_limit_line(result).expect("signal");
        assert!(signal.reset_hint.as_deref().is_some_and(|h| h.starts_with("2023-11-14")));
    }

    #[test]
    fn json_resets_at_wins() {
        let future = Utc::now().timestamp() + 120;
        let line = format!(
            r#"{{"type":"error","message":"usage limit reached","resets_at":{future}}}"#
        );
        let signal = detect_rate_limit_line(&line).expect("signal");
        let wait = signal.retry_after.expect("wait");
        assert!(wait <= Duration::from_secs(120) && wait >= Duration::from_secs(100));
    }

    #[test]
    fn absurd_retry_amounts_saturate() {
        let (hint, wait) = parse_reset("Rate limit exceeded, try again in 99999999999999999 hours");
        assert_eq!(hint.as_deref(), Some("try again in 99999999999999999 hours"));
        assert_eq!(wait, Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn parses_resets_at_clock_time() {
        let (hint, wait) = parse_reset("5-hour limit reached ∙ resets 3pm (Europe/Berlin)");
        assert_eq!(hint.as_deref(), Some("resets 3pm (Europe/Berlin)"));
        assert!(wait.is_none());
    }

    #[test]
    fn discovers_thread_started_after_invocation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let day = temp.path().join("2026").join("01");
        fs::create_dir_all(&day).expect("mkdir");
        let started = SystemTime::now();
        let now: DateTime<Utc> = started.into();
        let old = now - chrono::Duration::hours(1);

        fs::write(
            day.join("old.jsonl"),
            format!(
                "{{\"type\":\"session_meta\",\"payload\":{{\"id\":\"old-thread\",\"timestamp\":\"{}\"}}}}\n",
                old.to_rfc3339()
            ),
        )
        .expect("write old");
        fs::write(
            day.join("new.jsonl"),
            format!(
                "{{\"type\":\"session_meta\",\"payload\":{{\"id\":\"new-thread\",\"timestamp\":\"{}\"}}}}\n",
                (now + chrono::Duration::seconds(1)).to_rfc3339()
            ),
        )
        .expect("write new");

        assert_eq!(
            discover_thread_id(temp.path(), started).as_deref(),
            Some("new-thread")
        );
    }

    #[test]
    fn session_parser_returns_minted_id() {
        let parser = SessionIdTranscripts;
        assert_eq!(
            parser.resume_hint(SystemTime::now(), Some("abc")),
            Some(ResumeHint::SessionId("abc".to_string()))
        );
        assert_eq!(PlainTranscripts.resume_hint(SystemTime::now(), Some("abc")), None);
    }
}
