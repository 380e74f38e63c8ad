//! Solution targets: one contestant program with a declared expectation.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;

use crate::codes::CodeRef;
use crate::consts;
use crate::fileutil;
use crate::results::Verdict;
use crate::taskgraph::{BoxTask, CacheKey, Task, TaskInput, TaskStep, TaskValue};

use super::{CtxRef, Problem};

/// A single solution. Exactly one expectation applies: correct (the
/// default), a set of challenge-case patterns it must fail, or a set of
/// verdicts every case must stay within.
pub struct Solution {
    pub name: String,
    /// `problem/solution`, used in every message about this solution.
    pub full_name: String,
    pub base_dir: PathBuf,
    pub out_dir: PathBuf,
    pub code: CodeRef,
    pub correct: bool,
    pub challenge_cases: Option<Vec<String>>,
    pub expected_verdicts: Option<Vec<Verdict>>,
}

impl Solution {
    pub fn stamp_file(&self) -> PathBuf {
        self.out_dir.join(consts::STAMP_FILE)
    }

    pub fn last_modified(&self, library_dir: Option<&std::path::Path>) -> SystemTime {
        let mut stamp = fileutil::last_modified_under(&self.base_dir);
        if let Some(dir) = library_dir {
            stamp = stamp.max(fileutil::last_modified_under(dir));
        }
        stamp
    }

    pub fn is_build_cached(&self, library_dir: Option<&std::path::Path>) -> bool {
        self.last_modified(library_dir) < fileutil::modified_time(&self.stamp_file())
    }

    pub fn set_stamp(&self) -> anyhow::Result<()> {
        fileutil::create_empty_file(&self.stamp_file())
    }
}

/// Compiles a solution, surfaces warnings, and stamps the build. Shared by
/// key, so a solution referenced as the reference solution and tested in
/// the same run compiles once.
pub struct SolutionBuildTask {
    ctx: CtxRef,
    solution: Rc<Solution>,
    started: bool,
}

impl SolutionBuildTask {
    pub fn boxed(ctx: &CtxRef, _problem: &Rc<Problem>, solution: &Rc<Solution>) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            solution: solution.clone(),
            started: false,
        })
    }
}

impl Task for SolutionBuildTask {
    fn label(&self) -> String {
        format!("build {}", self.solution.full_name)
    }

    fn cache_key(&self) -> Option<CacheKey> {
        Some(CacheKey::new(
            "solution-build",
            self.solution.base_dir.display(),
        ))
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        let solution = self.solution.clone();
        let ctx = self.ctx.clone();
        let ui = &ctx.ui;
        if !self.started {
            self.started = true;
            if solution.is_build_cached(ctx.library_dir.as_deref()) {
                ui.console
                    .print_action("COMPILE", &solution.full_name, "up-to-date");
                return TaskStep::Return(TaskValue::Bool(true));
            }
            if !solution.code.quiet_compile() {
                ui.console.print_action("COMPILE", &solution.full_name, "");
            }
            return TaskStep::Single(solution.code.compile());
        }
        let result = match input {
            TaskInput::Value(TaskValue::Run(result)) => result,
            other => {
                ui.error(&solution.full_name, &format!("Compile Error ({other:?})"));
                return TaskStep::Return(TaskValue::Bool(false));
            }
        };
        let log = solution.code.read_compile_log().unwrap_or_default();
        if !result.is_ok() {
            ui.error(
                &solution.full_name,
                &format!("Compile Error ({})", result.status),
            );
            ui.console.print_log(&log);
            return TaskStep::Return(TaskValue::Bool(false));
        }
        if !log.trim().is_empty() {
            ui.console.print("Compiler warnings found:");
            ui.console.print_log(&log);
        }
        if let Err(e) = solution.set_stamp() {
            ui.error(&solution.full_name, &format!("{e:#}"));
            return TaskStep::Return(TaskValue::Bool(false));
        }
        TaskStep::Return(TaskValue::Bool(true))
    }
}

/// Removes the solution's build outputs.
pub fn clean_task(ctx: &CtxRef, _problem: &Rc<Problem>, solution: &Rc<Solution>) -> BoxTask {
    let ctx = ctx.clone();
    let solution = solution.clone();
    super::FnTask::boxed(format!("clean {}", solution.full_name), move || {
        ctx.ui.console.print_action("CLEAN", &solution.full_name, "");
        match solution.code.clean() {
            Ok(()) => TaskValue::Bool(true),
            Err(e) => {
                ctx.ui.error(&solution.full_name, &format!("{e:#}"));
                TaskValue::Bool(false)
            }
        }
    })
}
