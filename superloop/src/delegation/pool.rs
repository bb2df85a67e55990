//! Bounded worker pool over OS threads.
//!
//! `workers` threads pull jobs from a rendezvous channel. The coordinating
//! thread only hands out a job while fewer than `workers` are in flight, and
//! observes completions in the order they arrive.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

/// Coordinator decision after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Launch nothing further; in-flight jobs still finish.
    Halt,
}

/// Jobs in completion order plus the ones never launched.
pub struct PoolRun<J, R> {
    pub completed: Vec<(J, Result<R>)>,
    pub not_started: Vec<J>,
}

/// Run `jobs` on at most `workers` threads.
///
/// `on_complete` runs on the coordinating thread after every completion with
/// the jobs still queued. Returning `Flow::Halt` stops dispatch for good;
/// queued jobs are returned in `not_started`. A panicking job is reported as
/// an error.
pub fn run_pool<J, R, W, C>(
    workers: usize,
    jobs: Vec<J>,
    work: W,
    mut on_complete: C,
) -> PoolRun<J, R>
where
    J: Send + Clone,
    R: Send,
    W: Fn(&J) -> Result<R> + Sync,
    C: FnMut(&J, &Result<R>, &VecDeque<J>) -> Flow,
{
    let workers = workers.max(1).min(jobs.len().max(1));
    let mut queue: VecDeque<J> = jobs.into();
    let mut completed = Vec::with_capacity(queue.len());
    let mut not_started = Vec::new();

    let (job_tx, job_rx) = mpsc::sync_channel::<J>(0);
    let (done_tx, done_rx) = mpsc::channel::<(J, Result<R>)>();
    // Scoped workers borrow the receiver, so it must outlive the scope.
    let job_rx = Mutex::new(job_rx);

    thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = &job_rx;
            let done_tx = done_tx.clone();
            let work = &work;
            scope.spawn(move || {
                loop {
                    let next = match job_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(job) = next else {
                        break;
                    };
                    let result = catch_unwind(AssertUnwindSafe(|| work(&job)))
                        .unwrap_or_else(|_| Err(anyhow!("worker {worker} panicked")));
                    if done_tx.send((job, result)).is_err() {
                        break;
                    }
                }
                debug!(worker, "pool worker exiting");
            });
        }
        drop(done_tx);

        let mut in_flight = 0usize;
        let mut halted = false;
        loop {
            while !halted && in_flight < workers {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                if let Err(mpsc::SendError(job)) = job_tx.send(job) {
                    warn!("pool workers gone before dispatch");
                    not_started.push(job);
                    halted = true;
                    break;
                }
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Ok((job, result)) = done_rx.recv() else {
                break;
            };
            in_flight -= 1;
            if on_complete(&job, &result, &queue) == Flow::Halt {
                halted = true;
            }
            completed.push((job, result));
        }
        drop(job_tx);
        not_started.extend(queue.drain(..));
    });

    PoolRun {
        completed,
        not_started,
    }
}
