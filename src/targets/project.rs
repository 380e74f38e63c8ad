//! Project targets: the root of the tree, fanning commands out over all
//! problems.

use std::path::PathBuf;
use std::rc::Rc;

use crate::taskgraph::BoxTask;

use super::{AllTask, CtxRef, GatherTestsTask, Problem, problem};

/// The loaded contest. Immutable after loading.
pub struct Project {
    pub base_dir: PathBuf,
    /// Shared library directory for code dependencies, when declared.
    pub library_dir: Option<PathBuf>,
    pub problems: Vec<Rc<Problem>>,
}

pub fn build_task(ctx: &CtxRef, project: &Rc<Project>) -> BoxTask {
    AllTask::boxed(
        "build project",
        project
            .problems
            .iter()
            .map(|p| problem::build_task(ctx, p))
            .collect(),
    )
}

pub fn test_task(ctx: &CtxRef, project: &Rc<Project>) -> BoxTask {
    GatherTestsTask::boxed(
        "test project",
        project
            .problems
            .iter()
            .map(|p| problem::test_task(ctx, p))
            .collect(),
    )
}

pub fn clean_task(ctx: &CtxRef, project: &Rc<Project>) -> BoxTask {
    AllTask::boxed(
        "clean project",
        project
            .problems
            .iter()
            .map(|p| problem::clean_task(ctx, p))
            .collect(),
    )
}
