//! Agent Process Runner: one supervised invocation of an agent CLI.
//!
//! stdout and stderr are merged line-by-line into one channel. The supervising
//! loop enforces an absolute deadline and a rolling inactivity deadline, tees
//! every line to the log file, and hands each line to the vendor transcript
//! parser so a rate limit can stop the process early.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::core::types::{ResumeHint, ResumeStrategy, TimeoutReason};
use crate::io::config::{PromptMode, RunnerSpec};
use crate::io::process::{TERMINATE_GRACE, isolate_process_group, terminate};
use crate::io::transcript::{AgentTranscriptParser, parser_for};

/// Synthesized exit code for a timed-out invocation.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Synthesized exit code for a rate-limited invocation.
pub const RATE_LIMIT_EXIT_CODE: i32 = 125;

/// Upper bound on how long trailing context is collected after a rate-limit line.
const RATE_LIMIT_CONTEXT_WINDOW: Duration = Duration::from_secs(2);

/// Trailing lines used as the last message when the agent wrote no file.
const FALLBACK_MESSAGE_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Stable label used in logs and events (`implementer`, `planner/wave-1/scan`).
    pub label: String,
    pub runner: RunnerSpec,
    pub prompt: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub last_message_path: PathBuf,
    /// Structured file the prompt asks the agent to write, if any.
    pub output_file: Option<PathBuf>,
    pub max_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub resume: Option<ResumeHint>,
    pub output_limit_bytes: usize,
    pub rate_limit_context_lines: usize,
}

/// Rate limit observed during an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHit {
    pub message: String,
    pub reset_hint: Option<String>,
    pub retry_after: Option<Duration>,
    pub context: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// Raw process exit code (`None` when killed by a signal).
    pub exit_code: Option<i32>,
    pub timed_out: Option<TimeoutReason>,
    pub rate_limit: Option<RateLimitHit>,
    pub resume_hint: Option<ResumeHint>,
    /// Tail of the merged output, bounded by `output_limit_bytes`.
    pub output: String,
    pub last_message: Option<String>,
    pub duration: Duration,
}

impl AgentInvocation {
    pub fn rate_limited(&self) -> bool {
        self.rate_limit.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.timed_out.is_none() && self.rate_limit.is_none() && self.exit_code == Some(0)
    }

    /// Exit status as reported to callers: 124 for timeouts, 125 for rate limits.
    pub fn exit_status(&self) -> i32 {
        if self.timed_out.is_some() {
            TIMEOUT_EXIT_CODE
        } else if self.rate_limit.is_some() {
            RATE_LIMIT_EXIT_CODE
        } else {
            self.exit_code.unwrap_or(1)
        }
    }
}

/// Seam between orchestration and agent processes.
pub trait AgentRunner: Sync {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentInvocation>;
}

/// Receives `(label, line)` for every output line, for live display.
pub type LineSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Runs agents as real child processes.
#[derive(Clone)]
pub struct ProcessAgentRunner {
    sink: Option<LineSink>,
    grace: Duration,
}

impl Default for ProcessAgentRunner {
    fn default() -> Self {
        Self {
            sink: None,
            grace: TERMINATE_GRACE,
        }
    }
}

impl ProcessAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: LineSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Command line plus the payload to write on stdin.
struct PreparedCommand {
    command: Command,
    stdin: Option<Vec<u8>>,
    display: String,
}

fn prepare_command(request: &AgentRequest, minted: Option<&str>) -> Result<PreparedCommand> {
    let spec = &request.runner;
    let (program, base) = spec
        .command
        .split_first()
        .ok_or_else(|| anyhow!("runner command is empty"))?;
    let resume_id = request.resume.as_ref().map(ResumeHint::id).unwrap_or_default();
    let last_message = request.last_message_path.to_string_lossy();
    let workdir = request.workdir.to_string_lossy();
    let expand = |arg: &String| {
        arg.replace("{session_id}", minted.unwrap_or_default())
            .replace("{resume_id}", resume_id)
            .replace("{last_message_file}", &last_message)
            .replace("{workdir}", &workdir)
    };

    let mut args: Vec<String> = base.iter().map(expand).collect();
    let resuming = request.resume.is_some() && !spec.resume_args.is_empty();
    if resuming {
        args.extend(spec.resume_args.iter().map(expand));
    } else if minted.is_some() {
        args.extend(spec.session_args.iter().map(expand));
    }
    args.extend(spec.last_message_args.iter().map(expand));

    let prompt = if resuming {
        spec.resume_prompt.as_str()
    } else {
        request.prompt.as_str()
    };
    let stdin = match spec.prompt_mode {
        PromptMode::Stdin => Some(prompt.as_bytes().to_vec()),
        PromptMode::Arg => {
            args.push(prompt.to_string());
            None
        }
    };

    let display = std::iter::once(program.as_str())
        .chain(args.iter().map(String::as_str).take(base.len() + 4))
        .collect::<Vec<_>>()
        .join(" ");

    let mut command = Command::new(program);
    command
        .args(&args)
        .current_dir(&request.workdir)
        .envs(&spec.env);
    Ok(PreparedCommand {
        command,
        stdin,
        display,
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Bounded tail of recent output lines.
struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    dropped: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit: limit.max(1),
            dropped: 0,
        }
    }

    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
                self.dropped += old.len() + 1;
            }
        }
    }

    fn last_lines(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render(&self) -> String {
        let mut text = String::new();
        if self.dropped > 0 {
            text.push_str(&format!("[output truncated {} bytes]\n", self.dropped));
        }
        text.push_str(&self.last_lines(self.lines.len()));
        text
    }
}

struct Supervision<'a> {
    runner: &'a ProcessAgentRunner,
    request: &'a AgentRequest,
    log: BufWriter<File>,
    tail: OutputTail,
}

impl Supervision<'_> {
    fn record(&mut self, line: &str) -> Result<()> {
        writeln!(self.log, "{line}").context("write agent log")?;
        self.log.flush().context("flush agent log")?;
        self.tail.push(line);
        if let Some(sink) = &self.runner.sink {
            sink(&self.request.label, line);
        }
        Ok(())
    }

    fn capture_context(&mut self, rx: &Receiver<String>, hard_deadline: Instant) -> Result<Vec<String>> {
        let wanted = self.request.rate_limit_context_lines;
        let until = (Instant::now() + RATE_LIMIT_CONTEXT_WINDOW).min(hard_deadline);
        let mut context = Vec::new();
        while context.len() < wanted {
            let now = Instant::now();
            if now >= until {
                break;
            }
            match rx.recv_timeout(until - now) {
                Ok(line) => {
                    self.record(&line)?;
                    context.push(line);
                }
                Err(_) => break,
            }
        }
        Ok(context)
    }
}

fn open_log(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open agent log {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn read_last_message(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .filter(|text| !text.trim().is_empty())
}

impl AgentRunner for ProcessAgentRunner {
    #[instrument(skip_all, fields(label = %request.label))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentInvocation> {
        let parser: Box<dyn AgentTranscriptParser> = parser_for(&request.runner);
        let minted = (request.runner.resume == ResumeStrategy::SessionId
            && request.resume.is_none())
        .then(|| Uuid::new_v4().to_string());

        let PreparedCommand {
            mut command,
            stdin,
            display: cmd_line,
        } = prepare_command(request, minted.as_deref())?;
        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        if let Some(parent) = request.last_message_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        match fs::remove_file(&request.last_message_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("remove stale {}", request.last_message_path.display())
                });
            }
        }

        let mut log = open_log(&request.log_path)?;
        writeln!(
            log,
            "[superloop] start label={} resume={} cmd={cmd_line}",
            request.label,
            request.resume.as_ref().map_or("none", ResumeHint::id)
        )
        .context("write agent log header")?;
        log.flush().context("flush agent log")?;

        let started = Instant::now();
        let started_wall = SystemTime::now();
        debug!(cmd = %cmd_line, "spawning agent");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(err = %e, cmd = %cmd_line, "failed to spawn agent");
                return Err(e).with_context(|| format!("spawn agent `{cmd_line}`"));
            }
        };

        if let Some(payload) = stdin {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            thread::spawn(move || {
                // A child that exits without reading stdin closes the pipe.
                let _ = child_stdin.write_all(&payload);
            });
        }

        let (tx, rx) = mpsc::channel::<String>();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        spawn_line_reader(stdout, tx.clone());
        spawn_line_reader(stderr, tx);

        let mut sup = Supervision {
            runner: self,
            request,
            log,
            tail: OutputTail::new(request.output_limit_bytes),
        };

        let hard_deadline = started + request.max_timeout;
        let mut idle_deadline = started + request.inactivity_timeout;
        let mut timed_out = None;
        let mut rate_limit = None;

        loop {
            let now = Instant::now();
            if now >= hard_deadline {
                timed_out = Some(TimeoutReason::MaxTimeout);
                break;
            }
            if now >= idle_deadline {
                timed_out = Some(TimeoutReason::Inactivity);
                break;
            }
            match rx.recv_timeout(hard_deadline.min(idle_deadline) - now) {
                Ok(line) => {
                    idle_deadline = Instant::now() + request.inactivity_timeout;
                    sup.record(&line)?;
                    if let Some(signal) = parser.detect_rate_limit(&line) {
                        warn!(message = %signal.message, reset = ?signal.reset_hint, "rate limit detected");
                        let context = sup.capture_context(&rx, hard_deadline)?;
                        rate_limit = Some(RateLimitHit {
                            message: signal.message,
                            reset_hint: signal.reset_hint,
                            retry_after: signal.retry_after,
                            context,
                        });
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status: ExitStatus = if timed_out.is_some() || rate_limit.is_some() {
            if let Some(reason) = timed_out {
                warn!(%reason, elapsed_ms = started.elapsed().as_millis() as u64, "agent timed out, terminating");
            }
            terminate(&mut child, self.grace)?
        } else {
            // Output closed; the process still has to exit within its deadlines.
            let deadline = hard_deadline.min(idle_deadline);
            let remaining = deadline.saturating_duration_since(Instant::now());
            match child.wait_timeout(remaining).context("wait for agent")? {
                Some(status) => status,
                None => {
                    let reason = if idle_deadline < hard_deadline {
                        TimeoutReason::Inactivity
                    } else {
                        TimeoutReason::MaxTimeout
                    };
                    warn!(%reason, "agent closed its output but did not exit, terminating");
                    timed_out = Some(reason);
                    terminate(&mut child, self.grace)?
                }
            }
        };
        drop(rx);
        let duration = started.elapsed();

        let resume_hint = if rate_limit.is_some() {
            parser
                .resume_hint(started_wall, minted.as_deref())
                .or_else(|| request.resume.clone())
        } else {
            minted
                .as_deref()
                .map(|id| ResumeHint::SessionId(id.to_string()))
                .or_else(|| request.resume.clone())
        };

        let last_message = match read_last_message(&request.last_message_path) {
            Some(text) => Some(text),
            None => {
                let fallback = sup.tail.last_lines(FALLBACK_MESSAGE_LINES);
                if fallback.trim().is_empty() {
                    None
                } else {
                    fs::write(&request.last_message_path, &fallback).with_context(|| {
                        format!("write {}", request.last_message_path.display())
                    })?;
                    Some(fallback)
                }
            }
        };

        writeln!(
            sup.log,
            "[superloop] end exit_code={:?} timed_out={} rate_limited={} duration_ms={}",
            status.code(),
            timed_out.map_or("no".to_string(), |r| r.to_string()),
            rate_limit.is_some(),
            duration.as_millis()
        )
        .context("write agent log footer")?;
        sup.log.flush().context("flush agent log")?;

        info!(
            exit_code = ?status.code(),
            timed_out = ?timed_out,
            rate_limited = rate_limit.is_some(),
            duration_ms = duration.as_millis() as u64,
            "agent finished"
        );
        Ok(AgentInvocation {
            exit_code: status.code(),
            timed_out,
            rate_limit,
            resume_hint,
            output: sup.tail.render(),
            last_message,
            duration,
        })
    }
}
