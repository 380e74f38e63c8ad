//! Scheduler behaviour: branch ordering, result sharing, parallelism
//! accounting, bailouts, and interrupt-driven cancellation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use rime::taskgraph::{
    BoxTask, CacheKey, FiberTaskGraph, SerialTaskGraph, Task, TaskError, TaskGraph, TaskInput,
    TaskStep, TaskValue,
};

/// Shared observation point for the synthetic tasks below.
#[derive(Clone, Default)]
struct Probe {
    log: Rc<RefCell<Vec<String>>>,
    closes: Rc<RefCell<HashMap<String, usize>>>,
    runs: Rc<RefCell<HashMap<String, usize>>>,
    blocked_now: Rc<Cell<usize>>,
}

impl Probe {
    fn record(&self, event: &str) {
        self.log.borrow_mut().push(event.to_string());
    }

    fn record_run(&self, name: &str) {
        *self.runs.borrow_mut().entry(name.to_string()).or_insert(0) += 1;
    }

    fn record_close(&self, name: &str) {
        *self
            .closes
            .borrow_mut()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    fn runs_of(&self, name: &str) -> usize {
        self.runs.borrow().get(name).copied().unwrap_or(0)
    }

    fn closes_of(&self, name: &str) -> usize {
        self.closes.borrow().get(name).copied().unwrap_or(0)
    }
}

enum LeafBehavior {
    Value(bool),
    Fail,
    Bailout(bool),
}

/// Runs in one step and finishes according to its behaviour.
struct Leaf {
    probe: Probe,
    name: String,
    key: Option<CacheKey>,
    behavior: LeafBehavior,
}

impl Leaf {
    fn boxed(probe: &Probe, name: &str, key: Option<&str>, behavior: LeafBehavior) -> BoxTask {
        Box::new(Self {
            probe: probe.clone(),
            name: name.to_string(),
            key: key.map(|k| CacheKey::new("leaf", k)),
            behavior,
        })
    }
}

impl Task for Leaf {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn cache_key(&self) -> Option<CacheKey> {
        self.key.clone()
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        self.probe.record(&format!("run:{}", self.name));
        self.probe.record_run(&self.name);
        match self.behavior {
            LeafBehavior::Value(v) => TaskStep::Return(TaskValue::Bool(v)),
            LeafBehavior::Fail => TaskStep::Raise(TaskError::Failed(format!(
                "{} failed",
                self.name
            ))),
            LeafBehavior::Bailout(v) => TaskStep::Raise(TaskError::Bailout(TaskValue::Bool(v))),
        }
    }

    fn close(&mut self) {
        self.probe.record_close(&self.name);
    }
}

/// Blocks like an external process and resolves after a fixed number of
/// polls; optionally fails once resumed.
struct BlockyLeaf {
    probe: Probe,
    name: String,
    value: bool,
    polls_left: usize,
    fail_on_resume: bool,
    started: bool,
    blocked: bool,
}

impl BlockyLeaf {
    fn boxed(probe: &Probe, name: &str, polls: usize, value: bool) -> BoxTask {
        Box::new(Self {
            probe: probe.clone(),
            name: name.to_string(),
            value,
            polls_left: polls,
            fail_on_resume: false,
            started: false,
            blocked: false,
        })
    }

    fn failing(probe: &Probe, name: &str, polls: usize) -> BoxTask {
        Box::new(Self {
            probe: probe.clone(),
            name: name.to_string(),
            value: false,
            polls_left: polls,
            fail_on_resume: true,
            started: false,
            blocked: false,
        })
    }

    fn unblock(&mut self) {
        if self.blocked {
            self.blocked = false;
            self.probe.blocked_now.set(self.probe.blocked_now.get() - 1);
        }
    }
}

impl Task for BlockyLeaf {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            self.probe.record_run(&self.name);
            self.blocked = true;
            self.probe.blocked_now.set(self.probe.blocked_now.get() + 1);
            return TaskStep::Block;
        }
        self.probe.record(&format!("done:{}", self.name));
        if self.fail_on_resume {
            TaskStep::Raise(TaskError::Failed(format!("{} failed", self.name)))
        } else {
            TaskStep::Return(TaskValue::Bool(self.value))
        }
    }

    fn poll(&mut self) -> bool {
        if self.polls_left > 0 {
            self.polls_left -= 1;
        }
        if self.polls_left == 0 {
            self.unblock();
            true
        } else {
            false
        }
    }

    fn wait(&mut self) {
        self.polls_left = 0;
        self.unblock();
    }

    fn close(&mut self) {
        self.unblock();
        self.probe.record_close(&self.name);
    }
}

/// Asserts that nothing is blocked while it runs.
struct ExclusiveLeaf {
    probe: Probe,
}

impl Task for ExclusiveLeaf {
    fn label(&self) -> String {
        "exclusive".to_string()
    }

    fn is_exclusive(&self) -> bool {
        true
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        assert_eq!(
            self.probe.blocked_now.get(),
            0,
            "an exclusive task ran while other tasks were blocked"
        );
        self.probe.record("run:exclusive");
        TaskStep::Return(TaskValue::Bool(true))
    }
}

/// Suspends on its children once and returns what it was resumed with.
struct BranchParent {
    children: Option<Vec<BoxTask>>,
    interrupt: bool,
}

impl BranchParent {
    fn boxed(children: Vec<BoxTask>) -> BoxTask {
        Box::new(Self {
            children: Some(children),
            interrupt: false,
        })
    }

    fn interrupting(children: Vec<BoxTask>) -> BoxTask {
        Box::new(Self {
            children: Some(children),
            interrupt: true,
        })
    }
}

impl Task for BranchParent {
    fn label(&self) -> String {
        "parent".to_string()
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if let Some(children) = self.children.take() {
            return TaskStep::Branch {
                tasks: children,
                interrupt: self.interrupt,
            };
        }
        match input {
            TaskInput::Values(values) => TaskStep::Return(TaskValue::List(values)),
            TaskInput::Value(value) => TaskStep::Return(value),
            TaskInput::Error(e) => TaskStep::Raise(e),
            TaskInput::Start => unreachable!("parent resumed with Start"),
        }
    }
}

fn bools(value: &TaskValue) -> Vec<bool> {
    match value {
        TaskValue::List(items) => items.iter().map(TaskValue::as_bool).collect(),
        other => panic!("expected a list, got {other:?}"),
    }
}

#[test]
fn serial_runs_branches_left_to_right() {
    let probe = Probe::default();
    let parent = BranchParent::boxed(vec![
        Leaf::boxed(&probe, "a", None, LeafBehavior::Value(true)),
        Leaf::boxed(&probe, "b", None, LeafBehavior::Value(false)),
        Leaf::boxed(&probe, "c", None, LeafBehavior::Value(true)),
    ]);
    let outcome = SerialTaskGraph::new().run(parent).unwrap();
    assert_eq!(bools(&outcome), vec![true, false, true]);
    assert_eq!(*probe.log.borrow(), vec!["run:a", "run:b", "run:c"]);
}

#[test]
fn branch_results_keep_declaration_order() {
    // Completion order is scrambled by the poll counts; result order is not.
    let probe = Probe::default();
    let parent = BranchParent::boxed(vec![
        BlockyLeaf::boxed(&probe, "slow", 3, true),
        BlockyLeaf::boxed(&probe, "fast", 1, false),
        BlockyLeaf::boxed(&probe, "mid", 2, true),
    ]);
    let outcome = FiberTaskGraph::new(4).run(parent).unwrap();
    assert_eq!(bools(&outcome), vec![true, false, true]);
}

#[test]
fn equal_cache_keys_execute_once_and_share_the_value() {
    for parallelism in [0, 4] {
        let probe = Probe::default();
        let parent = BranchParent::boxed(vec![
            Leaf::boxed(&probe, "dup", Some("k"), LeafBehavior::Value(true)),
            Leaf::boxed(&probe, "dup", Some("k"), LeafBehavior::Value(true)),
            Leaf::boxed(&probe, "other", None, LeafBehavior::Value(false)),
        ]);
        let outcome = rime::taskgraph::new_graph(parallelism).run(parent).unwrap();
        assert_eq!(bools(&outcome), vec![true, true, false]);
        assert_eq!(probe.runs_of("dup"), 1, "parallelism {parallelism}");
    }
}

#[test]
fn cached_failures_are_shared_without_rerunning() {
    let probe = Probe::default();
    // The failing task aborts the parent; the later task with the same key
    // must observe the cached failure instead of executing.
    let parent = BranchParent::boxed(vec![
        Leaf::boxed(&probe, "boom", Some("fail-key"), LeafBehavior::Fail),
        Leaf::boxed(&probe, "boom", Some("fail-key"), LeafBehavior::Fail),
    ]);
    let outcome = FiberTaskGraph::new(2).run(parent);
    assert!(matches!(outcome, Err(TaskError::Failed(_))));
    assert_eq!(probe.runs_of("boom"), 1);
}

#[test]
fn bailout_delivers_its_value_and_skips_unstarted_siblings() {
    for parallelism in [0, 2] {
        let probe = Probe::default();
        let parent = BranchParent::boxed(vec![
            Leaf::boxed(&probe, "bail", None, LeafBehavior::Bailout(false)),
            Leaf::boxed(&probe, "after", None, LeafBehavior::Value(true)),
        ]);
        let outcome = rime::taskgraph::new_graph(parallelism).run(parent).unwrap();
        assert!(matches!(outcome, TaskValue::Bool(false)));
        assert_eq!(probe.runs_of("after"), 0, "parallelism {parallelism}");
    }
}

#[test]
fn blocked_tasks_never_exceed_the_parallelism_limit() {
    let probe = Probe::default();
    let children = (0..6)
        .map(|i| BlockyLeaf::boxed(&probe, &format!("t{i}"), 2 + i % 3, true))
        .collect();
    let mut graph = FiberTaskGraph::new(2);
    let outcome = graph.run(BranchParent::boxed(children)).unwrap();
    assert_eq!(bools(&outcome).len(), 6);
    assert!(graph.max_blocked() <= 2, "blocked {} > 2", graph.max_blocked());
}

#[test]
fn sibling_failure_interrupts_and_closes_the_rest_exactly_once() {
    let probe = Probe::default();
    let mut children: Vec<BoxTask> = Vec::new();
    for i in 0..10 {
        if i == 2 {
            children.push(BlockyLeaf::failing(&probe, "failing", 1));
        } else {
            children.push(BlockyLeaf::boxed(&probe, &format!("t{i}"), 50, true));
        }
    }
    let outcome = FiberTaskGraph::new(16).run(BranchParent::interrupting(children));
    assert!(matches!(outcome, Err(TaskError::Failed(_))));

    for i in 0..10 {
        if i == 2 {
            continue;
        }
        let name = format!("t{i}");
        assert_eq!(probe.closes_of(&name), 1, "{name} closed more than once");
        // Interrupted tasks never produced a result.
        assert!(!probe.log.borrow().contains(&format!("done:{name}")));
    }
    assert_eq!(probe.closes_of("failing"), 1);
    assert_eq!(probe.blocked_now.get(), 0);
}

#[test]
fn exclusive_tasks_wait_for_blocked_tasks_to_drain() {
    let probe = Probe::default();
    let parent = BranchParent::boxed(vec![
        BlockyLeaf::boxed(&probe, "a", 2, true),
        Box::new(ExclusiveLeaf {
            probe: probe.clone(),
        }),
        BlockyLeaf::boxed(&probe, "b", 2, true),
    ]);
    let outcome = FiberTaskGraph::new(4).run(parent).unwrap();
    assert_eq!(bools(&outcome), vec![true, true, true]);
    assert!(probe.log.borrow().contains(&"run:exclusive".to_string()));
}

#[test]
fn empty_branches_resume_immediately() {
    for parallelism in [0, 2] {
        let outcome = rime::taskgraph::new_graph(parallelism)
            .run(BranchParent::boxed(Vec::new()))
            .unwrap();
        assert_eq!(bools(&outcome), Vec::<bool>::new());
    }
}

/// A task that branches into a copy of itself with the same cache key.
struct CycleTask;

impl Task for CycleTask {
    fn label(&self) -> String {
        "cycle".to_string()
    }

    fn cache_key(&self) -> Option<CacheKey> {
        Some(CacheKey::new("cycle", "self"))
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        match input {
            TaskInput::Start => TaskStep::Single(Box::new(CycleTask)),
            TaskInput::Error(e) => TaskStep::Raise(e),
            _ => TaskStep::Return(TaskValue::Unit),
        }
    }
}

#[test]
fn cyclic_dependencies_are_reported() {
    let outcome = SerialTaskGraph::new().run(Box::new(CycleTask));
    match outcome {
        Err(TaskError::Failed(msg)) => assert!(msg.contains("cyclic"), "{msg}"),
        other => panic!("expected a cycle error, got {other:?}"),
    }
}
