//! Depth-first serial execution of a task tree.

use std::collections::HashMap;

use super::{BoxTask, CacheKey, TaskError, TaskGraph, TaskInput, TaskOutcome, TaskStep, TaskValue};

/// Runs tasks by plain recursion, with no concurrency and no parallelism
/// accounting. Branch children execute left to right; the first failing
/// child stops its siblings and is delivered to the parent.
pub struct SerialTaskGraph {
    /// `None` marks a key whose task is still on the recursion stack, which
    /// is how cyclic dependencies are detected.
    cache: HashMap<CacheKey, Option<TaskOutcome>>,
}

impl SerialTaskGraph {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    fn run_task(&mut self, mut task: BoxTask) -> TaskOutcome {
        let key = task.cache_key();
        if let Some(k) = &key {
            match self.cache.get(k) {
                Some(Some(outcome)) => return outcome.clone(),
                Some(None) => {
                    return Err(TaskError::Failed(format!(
                        "cyclic task dependency found at {k}"
                    )));
                }
                None => {
                    self.cache.insert(k.clone(), None);
                }
            }
        }

        let mut input = TaskInput::Start;
        let outcome = loop {
            match task.step(input) {
                TaskStep::Return(v) => break Ok(v),
                TaskStep::Raise(e) => break Err(e),
                TaskStep::Block => {
                    task.wait();
                    input = TaskInput::Value(TaskValue::Unit);
                }
                TaskStep::Single(sub) => {
                    input = match self.run_task(sub) {
                        Ok(v) => TaskInput::Value(v),
                        Err(TaskError::Bailout(v)) => TaskInput::Value(v),
                        Err(e) => TaskInput::Error(e),
                    };
                }
                TaskStep::Branch { tasks, .. } => {
                    let mut values = Vec::with_capacity(tasks.len());
                    let mut failure = None;
                    for sub in tasks {
                        match self.run_task(sub) {
                            Ok(v) => values.push(v),
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    input = match failure {
                        None => TaskInput::Values(values),
                        Some(TaskError::Bailout(v)) => TaskInput::Value(v),
                        Some(e) => TaskInput::Error(e),
                    };
                }
            }
        };
        task.close();

        if let Some(k) = key {
            self.cache.insert(k, Some(outcome.clone()));
        }
        outcome
    }
}

impl Default for SerialTaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph for SerialTaskGraph {
    fn run(&mut self, task: BoxTask) -> TaskOutcome {
        match self.run_task(task) {
            Err(TaskError::Bailout(v)) => Ok(v),
            outcome => outcome,
        }
    }
}
