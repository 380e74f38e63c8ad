//! External process execution with soft CPU-time limits.
//!
//! A child is spawned with its three stdio streams redirected to files or
//! discarded. The timeout is enforced by a one-shot timer thread delivering
//! `SIGXCPU`, the same signal an OS CPU-time limit would send, so the parent
//! can tell a time-limit kill from any other crash by the raw wait status
//! alone.

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use parking_lot::{Condvar, Mutex};

use crate::codes::{RunResult, RunStatus};
use crate::taskgraph::{Task, TaskError, TaskInput, TaskStep, TaskValue};

/// Raw wait status of a terminated child: the exit code, or the negated
/// signal number when the child was killed by a signal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessOutcome {
    pub code: i32,
    pub elapsed: f64,
}

impl ProcessOutcome {
    pub fn is_tle(&self) -> bool {
        self.code == -libc::SIGXCPU
    }
}

fn raw_status(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[derive(Clone, Debug)]
pub enum InputSource {
    File(PathBuf),
    Null,
}

#[derive(Clone, Debug)]
pub enum OutputSink {
    File(PathBuf),
    Null,
}

#[derive(Clone, Debug)]
pub enum ErrorSink {
    File(PathBuf),
    Null,
    /// Merge into whatever stdout writes to.
    Stdout,
}

/// One-shot timer that delivers `SIGXCPU` to a child unless cancelled first.
struct CpuTimeTimer {
    shared: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl CpuTimeTimer {
    fn arm(pid: i32, timeout: Duration) -> Self {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            let (cancelled, signal) = &*thread_shared;
            let deadline = Instant::now() + timeout;
            let mut cancelled = cancelled.lock();
            while !*cancelled {
                if signal.wait_until(&mut cancelled, deadline).timed_out() {
                    break;
                }
            }
            if !*cancelled {
                unsafe {
                    libc::kill(pid, libc::SIGXCPU);
                }
            }
        });
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn cancel(&mut self) {
        let (cancelled, signal) = &*self.shared;
        *cancelled.lock() = true;
        signal.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpuTimeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawns a child with redirected stdio, measures wall-clock time from just
/// before the spawn to just after the wait, and enforces the soft timeout.
#[derive(Default)]
pub struct ProcessRunner {
    child: Option<Child>,
    timer: Option<CpuTimeTimer>,
    start_time: Option<Instant>,
    outcome: Option<ProcessOutcome>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &mut self,
        argv: &[String],
        cwd: &Path,
        stdin: &InputSource,
        stdout: &OutputSink,
        stderr: &ErrorSink,
        timeout: Option<f64>,
    ) -> Result<()> {
        ensure!(!argv.is_empty(), "empty command line");
        let stdin_stdio = match stdin {
            InputSource::File(path) => Stdio::from(
                fs::File::open(path)
                    .with_context(|| format!("cannot open input {}", path.display()))?,
            ),
            InputSource::Null => Stdio::null(),
        };
        let mut stdout_file = None;
        let stdout_stdio = match stdout {
            OutputSink::File(path) => {
                let file = fs::File::create(path)
                    .with_context(|| format!("cannot create output {}", path.display()))?;
                let stdio = Stdio::from(file.try_clone()?);
                stdout_file = Some(file);
                stdio
            }
            OutputSink::Null => Stdio::null(),
        };
        let stderr_stdio = match stderr {
            ErrorSink::File(path) => Stdio::from(
                fs::File::create(path)
                    .with_context(|| format!("cannot create output {}", path.display()))?,
            ),
            ErrorSink::Null => Stdio::null(),
            ErrorSink::Stdout => match stdout_file {
                Some(file) => Stdio::from(file),
                None => Stdio::null(),
            },
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(cwd)
            .stdin(stdin_stdio)
            .stdout(stdout_stdio)
            .stderr(stderr_stdio);

        self.start_time = Some(Instant::now());
        let child = cmd
            .spawn()
            .with_context(|| format!("cannot execute {}", argv[0]))?;
        if let Some(secs) = timeout {
            self.timer = Some(CpuTimeTimer::arm(
                child.id() as i32,
                Duration::from_secs_f64(secs),
            ));
        }
        self.child = Some(child);
        Ok(())
    }

    /// Non-blocking completion check; true once the child has been reaped.
    pub fn poll(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                true
            }
            Ok(None) => false,
            Err(_) => {
                self.record_exit(ExitStatus::from_raw(-1));
                true
            }
        }
    }

    /// Blocks until the child completes.
    pub fn wait(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let status = child.wait().unwrap_or(ExitStatus::from_raw(-1));
            self.record_exit(status);
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        let elapsed = self
            .start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel();
        }
        self.timer = None;
        self.child = None;
        self.outcome = Some(ProcessOutcome {
            code: raw_status(status),
            elapsed,
        });
    }

    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.outcome
    }

    /// Cancels the timer and, if the child is still running, force-kills and
    /// reaps it. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel();
        }
        self.timer = None;
        if let Some(mut child) = self.child.take() {
            unsafe {
                libc::kill(child.id() as i32, libc::SIGKILL);
            }
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything needed to spawn one child under the scheduler.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: InputSource,
    pub stdout: OutputSink,
    pub stderr: ErrorSink,
    pub timeout: Option<f64>,
    pub exclusive: bool,
}

/// Task wrapper around [`ProcessRunner`].
///
/// Non-exclusive: starts the child and blocks, letting the graph poll it.
/// Exclusive: runs the child synchronously so no other work overlaps with a
/// timing-sensitive measurement. Never cached.
pub struct ExternalProcessTask {
    spec: ProcessSpec,
    runner: ProcessRunner,
    started: bool,
}

impl ExternalProcessTask {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            runner: ProcessRunner::new(),
            started: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        self.runner.start(
            &self.spec.argv,
            &self.spec.cwd,
            &self.spec.stdin,
            &self.spec.stdout,
            &self.spec.stderr,
            self.spec.timeout,
        )
    }

    fn finish(&self) -> TaskStep {
        match self.runner.outcome() {
            Some(outcome) => TaskStep::Return(TaskValue::Process(outcome)),
            None => TaskStep::Raise(TaskError::Failed(
                "process finished without an outcome".to_string(),
            )),
        }
    }
}

impl Task for ExternalProcessTask {
    fn label(&self) -> String {
        format!("process {}", self.spec.argv.first().map_or("?", String::as_str))
    }

    fn is_exclusive(&self) -> bool {
        self.spec.exclusive
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        if self.spec.exclusive {
            if let Err(e) = self.start() {
                return TaskStep::Raise(TaskError::Failed(format!("{e:#}")));
            }
            self.runner.wait();
            return self.finish();
        }
        if !self.started {
            self.started = true;
            return match self.start() {
                Ok(()) => TaskStep::Block,
                Err(e) => TaskStep::Raise(TaskError::Failed(format!("{e:#}"))),
            };
        }
        if self.runner.poll() {
            self.finish()
        } else {
            TaskStep::Block
        }
    }

    fn poll(&mut self) -> bool {
        self.runner.poll()
    }

    fn wait(&mut self) {
        self.runner.wait();
    }

    fn close(&mut self) {
        self.runner.close();
    }
}

/// Spec for a cross-connected judge/solution pair.
#[derive(Clone, Debug)]
pub struct ReactivePairSpec {
    pub solution_argv: Vec<String>,
    pub solution_cwd: PathBuf,
    pub judge_argv: Vec<String>,
    pub judge_cwd: PathBuf,
    pub judge_log: PathBuf,
    pub timeout: Option<f64>,
    pub exclusive: bool,
}

/// Runs a reactive judge concurrently with the solution, the judge's stdout
/// feeding the solution's stdin and vice versa. The CPU-time timer is armed
/// on the solution. Blocks until both ends have exited.
pub struct ReactivePairTask {
    spec: ReactivePairSpec,
    solution: Option<Child>,
    judge: Option<Child>,
    timer: Option<CpuTimeTimer>,
    start_time: Option<Instant>,
    solution_code: Option<i32>,
    judge_code: Option<i32>,
    started: bool,
}

impl ReactivePairTask {
    pub fn new(spec: ReactivePairSpec) -> Self {
        Self {
            spec,
            solution: None,
            judge: None,
            timer: None,
            start_time: None,
            solution_code: None,
            judge_code: None,
            started: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        ensure!(!self.spec.solution_argv.is_empty(), "empty solution command");
        ensure!(!self.spec.judge_argv.is_empty(), "empty judge command");
        self.start_time = Some(Instant::now());

        let mut solution = Command::new(&self.spec.solution_argv[0])
            .args(&self.spec.solution_argv[1..])
            .current_dir(&self.spec.solution_cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("cannot execute {}", self.spec.solution_argv[0]))?;
        let to_judge = solution.stdout.take().expect("piped stdout missing");
        let from_judge = solution.stdin.take().expect("piped stdin missing");

        let judge_log = fs::File::create(&self.spec.judge_log)
            .with_context(|| format!("cannot create {}", self.spec.judge_log.display()))?;
        let judge = Command::new(&self.spec.judge_argv[0])
            .args(&self.spec.judge_argv[1..])
            .current_dir(&self.spec.judge_cwd)
            .stdin(Stdio::from(to_judge))
            .stdout(Stdio::from(from_judge))
            .stderr(Stdio::from(judge_log))
            .spawn()
            .with_context(|| format!("cannot execute {}", self.spec.judge_argv[0]))?;

        if let Some(secs) = self.spec.timeout {
            self.timer = Some(CpuTimeTimer::arm(
                solution.id() as i32,
                Duration::from_secs_f64(secs),
            ));
        }
        self.solution = Some(solution);
        self.judge = Some(judge);
        Ok(())
    }

    fn poll_pair(&mut self) -> bool {
        if let Some(child) = self.solution.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                self.solution_code = Some(raw_status(status));
                self.solution = None;
                if let Some(timer) = self.timer.as_mut() {
                    timer.cancel();
                }
            }
        }
        if let Some(child) = self.judge.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                self.judge_code = Some(raw_status(status));
                self.judge = None;
            }
        }
        self.solution.is_none() && self.judge.is_none()
    }

    fn wait_pair(&mut self) {
        if let Some(mut child) = self.solution.take() {
            let status = child.wait().unwrap_or(ExitStatus::from_raw(-1));
            self.solution_code = Some(raw_status(status));
            if let Some(timer) = self.timer.as_mut() {
                timer.cancel();
            }
        }
        if let Some(mut child) = self.judge.take() {
            let status = child.wait().unwrap_or(ExitStatus::from_raw(-1));
            self.judge_code = Some(raw_status(status));
        }
    }

    /// The solution decides TLE/RE; the judge decides accept/reject.
    fn finish_pair(&self) -> TaskStep {
        let elapsed = self
            .start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let solution = self.solution_code.unwrap_or(-1);
        let judge = self.judge_code.unwrap_or(-1);
        let status = if solution == -libc::SIGXCPU {
            RunStatus::Tle
        } else if solution != 0 {
            RunStatus::Re
        } else if judge == 0 {
            RunStatus::Ok
        } else if judge > 0 {
            RunStatus::Ng
        } else {
            RunStatus::Re
        };
        let time = (status == RunStatus::Ok).then_some(elapsed);
        TaskStep::Return(TaskValue::Run(RunResult { status, time }))
    }
}

impl Task for ReactivePairTask {
    fn label(&self) -> String {
        format!(
            "reactive {}",
            self.spec.judge_argv.first().map_or("?", String::as_str)
        )
    }

    fn is_exclusive(&self) -> bool {
        self.spec.exclusive
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        if self.spec.exclusive {
            if let Err(e) = self.start() {
                return TaskStep::Raise(crate::taskgraph::TaskError::Failed(format!("{e:#}")));
            }
            self.wait_pair();
            return self.finish_pair();
        }
        if !self.started {
            self.started = true;
            return match self.start() {
                Ok(()) => TaskStep::Block,
                Err(e) => TaskStep::Raise(crate::taskgraph::TaskError::Failed(format!("{e:#}"))),
            };
        }
        if self.poll_pair() {
            self.finish_pair()
        } else {
            TaskStep::Block
        }
    }

    fn poll(&mut self) -> bool {
        self.poll_pair()
    }

    fn wait(&mut self) {
        self.wait_pair();
    }

    fn close(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel();
        }
        self.timer = None;
        for child in [self.solution.take(), self.judge.take()].into_iter().flatten() {
            let mut child = child;
            unsafe {
                libc::kill(child.id() as i32, libc::SIGKILL);
            }
            let _ = child.wait();
        }
    }
}
