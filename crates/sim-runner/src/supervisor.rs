//! Bounded-concurrency dispatch of external processes.
//!
//! A single dispatcher loop owns every child process. It starts queued jobs in
//! staged order while fewer than `async_runs` are running, polls children for
//! exit, and on a stop request interrupts the running children and abandons
//! the queue. Completion order is whatever order the processes exit in.

use std::collections::VecDeque;
use std::fs::File;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::command::Invocation;
use crate::error::{Result, RunnerError};
use crate::run::Run;

/// One queued invocation: a staged run paired with the run number it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub index: usize,
    pub run: Run,
    pub run_number: Option<String>,
}

impl Job {
    pub fn label(&self) -> String {
        format!(
            "{}_{}",
            self.run,
            self.run_number.as_deref().unwrap_or("NA")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub index: usize,
    pub label: String,
    pub run: Run,
    pub run_number: Option<String>,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub control_file: Option<std::path::PathBuf>,
    pub output_file: Option<std::path::PathBuf>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunOutcome {
    fn queued(job: &Job) -> Self {
        Self {
            index: job.index,
            label: job.label(),
            run: job.run.clone(),
            run_number: job.run_number.clone(),
            state: RunState::Queued,
            exit_code: None,
            control_file: None,
            output_file: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }
}

/// Lifecycle notifications, sent in the order the dispatcher observes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started {
        index: usize,
        label: String,
        pid: u32,
    },
    Finished {
        index: usize,
        label: String,
        state: RunState,
        exit_code: Option<i32>,
    },
    /// Left in the queue because the batch was stopped.
    Abandoned { index: usize, label: String },
}

/// Result of one batch. Outcomes are in staged order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<RunOutcome>,
    pub cancelled: bool,
    pub peak_running: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn count(&self, state: RunState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn completed(&self) -> usize {
        self.count(RunState::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(RunState::Failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == RunState::Failed)
    }

    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(|o| o.state == RunState::Completed)
    }
}

#[derive(Debug, Default)]
struct StopState {
    requested: AtomicBool,
    // nesting depth of active batch guards
    active: Mutex<usize>,
    drained: Condvar,
}

/// Cooperative cancellation shared between a runner and outside callers.
///
/// `request` only flips a flag and is safe to call from anywhere, including a
/// signal watcher thread. `stop` additionally blocks until the batch in
/// progress (if any) has drained.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Requests a stop and waits for interrupted processes to exit on their
    /// own. Returns at once when no batch is running.
    pub fn stop(&self) {
        self.request();
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while *active > 0 {
            active = self
                .inner
                .drained
                .wait(active)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn is_active(&self) -> bool {
        *self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            > 0
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Clears any earlier request and marks a batch active. A stop issued
    /// from here on cancels the batch and waits for the guard to drop.
    pub(crate) fn begin(&self) -> ActiveGuard {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *active == 0 {
            self.inner.requested.store(false, Ordering::SeqCst);
        }
        *active += 1;
        ActiveGuard {
            handle: self.clone(),
        }
    }

    fn activate(&self) -> ActiveGuard {
        *self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner()) += 1;
        ActiveGuard {
            handle: self.clone(),
        }
    }
}

pub(crate) struct ActiveGuard {
    handle: StopHandle,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let state = &self.handle.inner;
        let mut active = state.active.lock().unwrap_or_else(|e| e.into_inner());
        *active = active.saturating_sub(1);
        if *active == 0 {
            state.drained.notify_all();
        }
    }
}

struct Slot {
    outcome: usize,
    label: String,
    child: Child,
    started: Instant,
    interrupted: bool,
}

/// Dispatches jobs with at most `async_runs` processes alive at once.
#[derive(Debug, Clone)]
pub struct Supervisor {
    async_runs: usize,
    poll_interval: Duration,
    stop: StopHandle,
}

impl Supervisor {
    pub fn new(async_runs: usize, stop: StopHandle) -> Self {
        Self {
            async_runs: async_runs.max(1),
            poll_interval: Duration::from_millis(100),
            stop,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs every job to a terminal state, or until a stop request drains the
    /// batch. `prepare` is called for a job at the moment a slot frees up for
    /// it; an error there fails that job only.
    pub fn execute<F>(
        &self,
        jobs: Vec<Job>,
        mut prepare: F,
        events: Option<&Sender<RunEvent>>,
    ) -> BatchReport
    where
        F: FnMut(&Job) -> Result<Invocation>,
    {
        let _active = self.stop.activate();
        let started_at = Utc::now();
        let mut outcomes: Vec<RunOutcome> = jobs.iter().map(RunOutcome::queued).collect();
        let mut queue: VecDeque<(usize, Job)> = jobs.into_iter().enumerate().collect();
        let mut running: Vec<Slot> = Vec::new();
        let mut peak_running = 0;

        loop {
            self.reap(&mut running, &mut outcomes, events);

            if self.stop.is_requested() {
                for slot in running.iter_mut().filter(|s| !s.interrupted) {
                    info!(label = %slot.label, pid = slot.child.id(), "interrupting");
                    if let Err(e) = interrupt(&mut slot.child) {
                        warn!(label = %slot.label, error = %e, "failed to interrupt process");
                    }
                    slot.interrupted = true;
                }
            } else {
                while running.len() < self.async_runs && !self.stop.is_requested() {
                    let Some((pos, job)) = queue.pop_front() else {
                        break;
                    };
                    if let Some(slot) = self.start(pos, &job, &mut prepare, &mut outcomes[pos], events)
                    {
                        running.push(slot);
                        peak_running = peak_running.max(running.len());
                    }
                }
            }

            if running.is_empty() && (queue.is_empty() || self.stop.is_requested()) {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        let cancelled = self.stop.is_requested();
        for (pos, _) in queue {
            let outcome = &outcomes[pos];
            emit(
                events,
                RunEvent::Abandoned {
                    index: outcome.index,
                    label: outcome.label.clone(),
                },
            );
        }

        let report = BatchReport {
            outcomes,
            cancelled,
            peak_running,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.count(RunState::Cancelled),
            abandoned = report.count(RunState::Queued),
            "all runs complete"
        );
        report
    }

    fn start<F>(
        &self,
        pos: usize,
        job: &Job,
        prepare: &mut F,
        outcome: &mut RunOutcome,
        events: Option<&Sender<RunEvent>>,
    ) -> Option<Slot>
    where
        F: FnMut(&Job) -> Result<Invocation>,
    {
        let label = job.label();
        outcome.started_at = Some(Utc::now());
        let spawned = prepare(job).and_then(|invocation| {
            outcome.control_file = Some(invocation.control_file.clone());
            outcome.output_file = Some(invocation.output_file.clone());
            spawn(&invocation)
        });
        match spawned {
            Ok(child) => {
                info!("executing: {}", label);
                outcome.state = RunState::Running;
                emit(
                    events,
                    RunEvent::Started {
                        index: job.index,
                        label: label.clone(),
                        pid: child.id(),
                    },
                );
                Some(Slot {
                    outcome: pos,
                    label,
                    child,
                    started: Instant::now(),
                    interrupted: false,
                })
            }
            Err(e) => {
                warn!(label = %label, error = %e, "run failed before start");
                outcome.state = RunState::Failed;
                outcome.error = Some(e.to_string());
                outcome.finished_at = Some(Utc::now());
                emit(
                    events,
                    RunEvent::Finished {
                        index: job.index,
                        label,
                        state: RunState::Failed,
                        exit_code: None,
                    },
                );
                None
            }
        }
    }

    fn reap(
        &self,
        running: &mut Vec<Slot>,
        outcomes: &mut [RunOutcome],
        events: Option<&Sender<RunEvent>>,
    ) {
        let mut i = 0;
        while i < running.len() {
            let slot = &mut running[i];
            let polled = slot.child.try_wait();
            if let Err(e) = &polled {
                warn!(label = %slot.label, error = %e, "cannot poll process, retrying");
            }
            let Some((state, exit_code, error)) = settle(polled, slot.interrupted, &slot.label)
            else {
                i += 1;
                continue;
            };

            let slot = running.remove(i);
            let outcome = &mut outcomes[slot.outcome];
            outcome.state = state;
            outcome.exit_code = exit_code;
            outcome.error = error;
            outcome.finished_at = Some(Utc::now());
            outcome.duration_ms = Some(slot.started.elapsed().as_millis() as u64);
            match state {
                RunState::Failed => warn!(
                    label = %slot.label,
                    exit_code = ?exit_code,
                    "run failed, check output"
                ),
                _ => info!(label = %slot.label, state = ?state, "run finished"),
            }
            emit(
                events,
                RunEvent::Finished {
                    index: outcome.index,
                    label: slot.label,
                    state,
                    exit_code,
                },
            );
        }
    }
}

/// Terminal state for a polled child, or `None` while it must stay in its
/// slot. A failed poll keeps the slot so the process stays counted against
/// the concurrency budget and is reaped later.
fn settle(
    polled: std::io::Result<Option<ExitStatus>>,
    interrupted: bool,
    label: &str,
) -> Option<(RunState, Option<i32>, Option<String>)> {
    let status = polled.ok()??;
    let code = status.code();
    Some(if interrupted {
        (RunState::Cancelled, code, None)
    } else if status.success() {
        (RunState::Completed, code, None)
    } else {
        let err = RunnerError::ProcessExit {
            label: label.to_string(),
            code,
        };
        (RunState::Failed, code, Some(err.to_string()))
    })
}

fn spawn(invocation: &Invocation) -> Result<Child> {
    let stdout = File::create(&invocation.output_file)?;
    let stderr = stdout.try_clone()?;
    let mut cmd = invocation.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
        // own process group, so a console break reaches only this child
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
    cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: invocation.program.clone(),
        source,
    })
}

fn emit(events: Option<&Sender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(child.id() as i32), Signal::SIGINT) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// CTRL_C cannot be targeted at a process group, CTRL_BREAK can.
#[cfg(windows)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    // SAFETY: plain FFI call; the group id is the child's pid by construction.
    if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, child.id()) } == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    warn!(pid = child.id(), "no console interrupt on this platform, terminating");
    child.kill()
}


#[cfg(all(test, windows))]
mod windows_tests {
    use super::*;
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::sync::mpsc;

    #[test]
    fn stop_sends_a_console_break_to_the_engine_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().to_path_buf();
        let jobs = vec![Job {
            index: 0,
            run: Run::from_pairs([("s1", "Exg")]),
            run_number: None,
        }];
        let prepare = move |job: &Job| {
            Ok(Invocation {
                program: PathBuf::from("cmd"),
                args: ["/C", "ping -n 30 127.0.0.1 > nul"]
                    .into_iter()
                    .map(OsString::from)
                    .collect(),
                control_file: PathBuf::from("model.tcf"),
                output_file: out.join(format!("job_{}.out", job.index)),
            })
        };
        let stop = StopHandle::new();
        let sup = Supervisor::new(1, stop.clone()).with_poll_interval(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();

        let report = thread::scope(|s| {
            let worker = s.spawn(|| sup.execute(jobs, prepare, Some(&tx)));
            match rx.recv_timeout(Duration::from_secs(10)).expect("event") {
                RunEvent::Started { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
            stop.stop();
            worker.join().expect("dispatcher thread")
        });

        assert!(report.cancelled);
        assert_eq!(report.outcomes[0].state, RunState::Cancelled);
    }
}
