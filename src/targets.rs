//! The four-level target tree (project → problem → solution/testset) and the
//! glue that fans Build/Test/Clean out across it.

pub mod problem;
pub mod project;
pub mod solution;
pub mod testset;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::console::Ui;
use crate::judge::{JudgeVariants, ReactiveVariants};
use crate::taskgraph::{
    BoxTask, Task, TaskError, TaskInput, TaskOutcome, TaskStep, TaskValue,
};

pub use problem::Problem;
pub use project::Project;
pub use solution::Solution;
pub use testset::Testset;

/// Shared run context handed to every pipeline task.
pub struct Ctx {
    pub ui: Ui,
    pub judge_variants: JudgeVariants,
    pub reactive_variants: ReactiveVariants,
    pub library_dir: Option<PathBuf>,
}

pub type CtxRef = Rc<Ctx>;

impl Ctx {
    pub fn new(ui: Ui) -> Self {
        Self {
            ui,
            judge_variants: JudgeVariants::with_builtins(),
            reactive_variants: ReactiveVariants::with_builtins(),
            library_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Build,
    Test,
    Clean,
}

/// A resolved command target somewhere in the tree.
pub enum Target {
    Project(Rc<Project>),
    Problem(Rc<Problem>),
    Solution(Rc<Problem>, Rc<Solution>),
    Testset(Rc<Problem>),
}

/// Maps a directory back to the entity whose base directory it is.
pub fn find_target(project: &Rc<Project>, dir: &Path) -> Option<Target> {
    if project.base_dir == dir {
        return Some(Target::Project(project.clone()));
    }
    for problem in &project.problems {
        if problem.base_dir == dir {
            return Some(Target::Problem(problem.clone()));
        }
        for solution in &problem.solutions {
            if solution.base_dir == dir {
                return Some(Target::Solution(problem.clone(), solution.clone()));
            }
        }
        if problem.testset.base_dir == dir {
            return Some(Target::Testset(problem.clone()));
        }
    }
    None
}

impl Target {
    /// The root task for one command invocation on this target.
    pub fn command_task(&self, command: CommandKind, ctx: &CtxRef) -> BoxTask {
        match (command, self) {
            (CommandKind::Build, Target::Project(p)) => project::build_task(ctx, p),
            (CommandKind::Build, Target::Problem(p)) => problem::build_task(ctx, p),
            (CommandKind::Build, Target::Solution(p, s)) => {
                solution::SolutionBuildTask::boxed(ctx, p, s)
            }
            (CommandKind::Build, Target::Testset(p)) => testset::TestsetBuildTask::boxed(ctx, p),
            (CommandKind::Test, Target::Project(p)) => project::test_task(ctx, p),
            (CommandKind::Test, Target::Problem(p)) => problem::test_task(ctx, p),
            (CommandKind::Test, Target::Solution(p, s)) => {
                testset::TestSolutionTask::boxed(ctx, p, s)
            }
            (CommandKind::Test, Target::Testset(p)) => testset::test_all_task(ctx, p),
            (CommandKind::Clean, Target::Project(p)) => project::clean_task(ctx, p),
            (CommandKind::Clean, Target::Problem(p)) => problem::clean_task(ctx, p),
            (CommandKind::Clean, Target::Solution(p, s)) => solution::clean_task(ctx, p, s),
            (CommandKind::Clean, Target::Testset(p)) => testset::clean_task(ctx, p),
        }
    }
}

/// True when every branch result came back `Bool(true)`. A bailed-out
/// branch delivers its `Bool(false)` as a single value; failures count as
/// false.
pub fn branch_all_true(input: &TaskInput) -> bool {
    match input {
        TaskInput::Values(values) => values.iter().all(TaskValue::as_bool),
        TaskInput::Value(TaskValue::List(values)) => values.iter().all(TaskValue::as_bool),
        TaskInput::Value(value) => value.as_bool(),
        _ => false,
    }
}

/// Flattens branch results into the combined testset-result list.
pub fn collect_tests(input: TaskInput) -> TaskOutcome {
    match input {
        TaskInput::Values(values) => {
            let mut all = Vec::new();
            for value in values {
                match value {
                    TaskValue::Tests(results) => all.extend(results),
                    other => {
                        return Err(TaskError::Failed(format!(
                            "expected test results, got {other:?}"
                        )));
                    }
                }
            }
            Ok(TaskValue::Tests(all))
        }
        TaskInput::Value(TaskValue::Tests(results)) => Ok(TaskValue::Tests(results)),
        TaskInput::Error(e) => Err(e),
        other => Err(TaskError::Failed(format!(
            "expected test results, got {other:?}"
        ))),
    }
}

/// Branches over sub-tasks and folds their boolean results.
pub struct AllTask {
    label: String,
    tasks: Option<Vec<BoxTask>>,
}

impl AllTask {
    pub fn boxed(label: impl Into<String>, tasks: Vec<BoxTask>) -> BoxTask {
        Box::new(Self {
            label: label.into(),
            tasks: Some(tasks),
        })
    }
}

impl Task for AllTask {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        match self.tasks.take() {
            Some(tasks) => TaskStep::branch(tasks),
            None => TaskStep::Return(TaskValue::Bool(branch_all_true(&input))),
        }
    }
}

/// Branches over test tasks and concatenates their result lists.
pub struct GatherTestsTask {
    label: String,
    tasks: Option<Vec<BoxTask>>,
}

impl GatherTestsTask {
    pub fn boxed(label: impl Into<String>, tasks: Vec<BoxTask>) -> BoxTask {
        Box::new(Self {
            label: label.into(),
            tasks: Some(tasks),
        })
    }
}

impl Task for GatherTestsTask {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        match self.tasks.take() {
            Some(tasks) => TaskStep::branch(tasks),
            None => match collect_tests(input) {
                Ok(value) => TaskStep::Return(value),
                Err(e) => TaskStep::Raise(e),
            },
        }
    }
}

/// A task that runs a closure synchronously; used for clean-up steps that
/// never suspend.
pub struct FnTask {
    label: String,
    body: Option<Box<dyn FnOnce() -> TaskValue>>,
}

impl FnTask {
    pub fn boxed(label: impl Into<String>, body: impl FnOnce() -> TaskValue + 'static) -> BoxTask {
        Box::new(Self {
            label: label.into(),
            body: Some(Box::new(body)),
        })
    }
}

impl Task for FnTask {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        match self.body.take() {
            Some(body) => TaskStep::Return(body()),
            None => TaskStep::Return(TaskValue::Unit),
        }
    }
}

/// Sort key that compares embedded digit runs numerically, so `test2.in`
/// orders before `test10.in`.
pub fn natural_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut digits = String::new();
    for ch in name.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            if !digits.is_empty() {
                key.push_str(&format!("{digits:0>8}"));
                digits.clear();
            }
            key.push(ch);
        }
    }
    if !digits.is_empty() {
        key.push_str(&format!("{digits:0>8}"));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn natural_key_orders_digit_runs_numerically() {
        let mut names = vec!["test10.in", "test2.in", "small-10.in", "small-2.in"];
        names.sort_by_key(|n| natural_key(n));
        assert_eq!(names, vec!["small-2.in", "small-10.in", "test2.in", "test10.in"]);
    }

    #[test]
    fn branch_all_true_handles_bailout_values() {
        let ok = TaskInput::Values(vec![TaskValue::Bool(true), TaskValue::Bool(true)]);
        assert!(branch_all_true(&ok));
        let mixed = TaskInput::Values(vec![TaskValue::Bool(true), TaskValue::Bool(false)]);
        assert!(!branch_all_true(&mixed));
        let bailed = TaskInput::Value(TaskValue::Bool(false));
        assert!(!branch_all_true(&bailed));
        let failed = TaskInput::Error(TaskError::Interrupted);
        assert!(!branch_all_true(&failed));
    }
}
