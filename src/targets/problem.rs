//! Problem targets: one task statement with its solutions and testset.

use std::path::PathBuf;
use std::rc::Rc;

use crate::fileutil;
use crate::taskgraph::{BoxTask, TaskValue};

use super::solution::SolutionBuildTask;
use super::{AllTask, CtxRef, FnTask, Solution, Testset, testset};

/// A problem groups an ordered set of solutions with the testset that
/// judges them. Immutable after loading.
pub struct Problem {
    pub name: String,
    pub id: String,
    pub title: String,
    /// Per-case CPU time limit in seconds; positive and finite.
    pub timeout: f64,
    pub base_dir: PathBuf,
    pub out_dir: PathBuf,
    pub testset: Rc<Testset>,
    pub solutions: Vec<Rc<Solution>>,
    /// The solution whose outputs are the canonical `.diff` files. Either
    /// named explicitly or the first solution marked correct.
    pub reference_solution: Option<Rc<Solution>>,
}

/// Builds every solution and the testset.
pub fn build_task(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
    let mut tasks: Vec<BoxTask> = problem
        .solutions
        .iter()
        .map(|solution| SolutionBuildTask::boxed(ctx, problem, solution))
        .collect();
    tasks.push(testset::TestsetBuildTask::boxed(ctx, problem));
    AllTask::boxed(format!("build {}", problem.name), tasks)
}

/// Tests every solution against the testset.
pub fn test_task(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
    testset::test_all_task(ctx, problem)
}

/// Removes the problem's whole output directory.
pub fn clean_task(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
    let ctx = ctx.clone();
    let problem = problem.clone();
    FnTask::boxed(format!("clean {}", problem.name), move || {
        ctx.ui.console.print_action("CLEAN", &problem.name, "");
        match fileutil::remove_tree(&problem.out_dir) {
            Ok(()) => TaskValue::Bool(true),
            Err(e) => {
                ctx.ui.error(&problem.name, &format!("{e:#}"));
                TaskValue::Bool(false)
            }
        }
    })
}
