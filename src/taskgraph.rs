//! Cooperative task scheduling for single-threaded parallel processing.
//!
//! A [`Task`] is an explicit state machine driven through [`Task::step`]. It
//! suspends by returning [`TaskStep::Branch`]/[`TaskStep::Single`] (waiting on
//! sub-tasks) or [`TaskStep::Block`] (waiting on an external process), and
//! terminates with [`TaskStep::Return`] or [`TaskStep::Raise`]. Two graph
//! back-ends drive tasks to completion: [`serial::SerialTaskGraph`] (plain
//! depth-first recursion) and [`fiber::FiberTaskGraph`] (cooperative, with
//! parallelism bounded by the number of simultaneously blocked processes).

pub mod fiber;
pub mod serial;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::codes::RunResult;
use crate::process::ProcessOutcome;
use crate::results::{TestCaseResult, TestsetResult};

pub use fiber::FiberTaskGraph;
pub use serial::SerialTaskGraph;

pub type BoxTask = Box<dyn Task>;

/// Identity under which a task's outcome is cached and shared.
///
/// Two tasks with equal keys are interchangeable: within one graph run at
/// most one of them executes and all waiters observe the same outcome.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: &str, ident: impl fmt::Display) -> Self {
        CacheKey(format!("{kind}:{ident}"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Values produced by tasks and shared through the result cache.
#[derive(Clone, Debug)]
pub enum TaskValue {
    Unit,
    Bool(bool),
    List(Vec<TaskValue>),
    /// Execution status of a compile or run step.
    Run(RunResult),
    /// Raw outcome of a finished external process.
    Process(ProcessOutcome),
    /// Per-case evaluation outcome.
    Case(TestCaseResult),
    /// Aggregated testset results flowing back to the command layer.
    Tests(Vec<Rc<RefCell<TestsetResult>>>),
}

impl TaskValue {
    pub fn as_bool(&self) -> bool {
        matches!(self, TaskValue::Bool(true))
    }
}

/// Failure of a task, kept clonable so it can live in the result cache.
#[derive(Clone, Debug)]
pub enum TaskError {
    /// Fast-fail carrying a known result; the enclosing branch collapses and
    /// the parent is resumed with the value instead of the failure.
    Bailout(TaskValue),
    /// Produced by the scheduler when a sibling failure under an interrupt
    /// branch cancels this task.
    Interrupted,
    /// Any other failure, stringified at the task boundary.
    Failed(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Bailout(_) => write!(f, "bailout"),
            TaskError::Interrupted => write!(f, "task interrupted"),
            TaskError::Failed(msg) => f.write_str(msg),
        }
    }
}

pub type TaskOutcome = Result<TaskValue, TaskError>;

/// What a task is resumed with.
#[derive(Debug)]
pub enum TaskInput {
    /// First activation.
    Start,
    /// Result of a single sub-task, a bailout value, or a block resumption
    /// (in which case it is [`TaskValue::Unit`]).
    Value(TaskValue),
    /// Results of a multi-task branch, in declaration order.
    Values(Vec<TaskValue>),
    /// A sub-task failed; the parent decides how to proceed.
    Error(TaskError),
}

/// What a task does next.
pub enum TaskStep {
    /// Finish with a value.
    Return(TaskValue),
    /// Finish with a failure.
    Raise(TaskError),
    /// Suspend on one sub-task; resumes with its bare value.
    Single(BoxTask),
    /// Suspend on several sub-tasks; resumes with their values in order.
    /// With `interrupt`, any sibling failure cancels the unfinished rest.
    Branch { tasks: Vec<BoxTask>, interrupt: bool },
    /// Suspend on an external process; the graph polls until ready.
    Block,
}

impl TaskStep {
    pub fn branch(tasks: Vec<BoxTask>) -> Self {
        TaskStep::Branch {
            tasks,
            interrupt: false,
        }
    }

    pub fn interrupt_branch(tasks: Vec<BoxTask>) -> Self {
        TaskStep::Branch {
            tasks,
            interrupt: true,
        }
    }
}

/// A cooperatively scheduled unit of work.
pub trait Task {
    /// Short name used in scheduler traces.
    fn label(&self) -> String;

    /// `None` means never cache and never share.
    fn cache_key(&self) -> Option<CacheKey> {
        None
    }

    /// Exclusive tasks only run while no other task is blocked, and nothing
    /// else starts until they finish. Used for trustworthy timing.
    fn is_exclusive(&self) -> bool {
        false
    }

    /// Drive the task one step.
    fn step(&mut self, input: TaskInput) -> TaskStep;

    /// Non-blocking readiness check; only called in the blocked state.
    fn poll(&mut self) -> bool {
        true
    }

    /// Blocking completion wait; only called in the blocked state.
    fn wait(&mut self) {}

    /// Release held resources (processes, timers). Must be idempotent; called
    /// exactly once by the graph after the task finishes, fails, or is
    /// interrupted.
    fn close(&mut self) {}
}

/// Common driver interface over the two back-ends.
pub trait TaskGraph {
    fn run(&mut self, task: BoxTask) -> TaskOutcome;
}

/// Picks the back-end for the requested parallelism (0 selects serial).
pub fn new_graph(parallelism: usize) -> Box<dyn TaskGraph> {
    if parallelism == 0 {
        Box::new(SerialTaskGraph::new())
    } else {
        Box::new(FiberTaskGraph::new(parallelism))
    }
}
