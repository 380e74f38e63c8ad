//! Cooperative back-end with bounded process-level parallelism.
//!
//! Tasks time-slice on a single thread; the only concurrency comes from
//! letting several child processes sit in the blocked state at once. Each
//! task is in exactly one of six states:
//!
//! - `Running`: being stepped right now
//! - `Waiting`: suspended on a branch of sub-tasks
//! - `Blocked`: suspended on an external process (counted against the
//!   parallelism limit)
//! - `Ready`: resolved, queued for its next step
//! - `Finished`: terminal, with a value
//! - `Aborted`: terminal, with a failure

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::{BoxTask, CacheKey, TaskError, TaskGraph, TaskInput, TaskOutcome, TaskStep, TaskValue};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type TaskId = usize;

/// Sentinel entry standing in for "the caller of the root task".
const ROOT: TaskId = 0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Running,
    Waiting,
    Blocked,
    Ready,
    Finished,
    Aborted,
}

impl State {
    fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Aborted)
    }
}

/// The children a suspended task is waiting on. Slots are filled in as the
/// pending stack expands them; a slot left empty belongs to a child that was
/// skipped because a sibling already bailed the branch out.
struct ChildGraph {
    multi: bool,
    slots: Vec<Option<TaskId>>,
}

struct Entry {
    task: Option<BoxTask>,
    label: String,
    state: State,
    exclusive: bool,
    graph: Option<ChildGraph>,
    interrupt: bool,
    /// Remaining unresolved sub-tasks; `None` once resolved or bailed out.
    counter: Option<usize>,
    /// Bumped on every new branch so pending children of an earlier,
    /// bailed-out branch cannot be credited against a later one.
    epoch: usize,
    /// Parents waiting on this task's outcome.
    waiters: Vec<TaskId>,
    outcome: Option<TaskOutcome>,
    closed: bool,
}

impl Entry {
    fn placeholder(label: &str) -> Self {
        Entry {
            task: None,
            label: label.to_string(),
            state: State::Running,
            exclusive: false,
            graph: None,
            interrupt: false,
            counter: None,
            epoch: 0,
            waiters: Vec::new(),
            outcome: None,
            closed: true,
        }
    }
}

pub struct FiberTaskGraph {
    parallelism: usize,
    entries: Vec<Entry>,
    key_index: HashMap<CacheKey, TaskId>,
    ready: VecDeque<TaskId>,
    blocked: Vec<TaskId>,
    /// Half-expanded branches, popped child-by-child so that at most one
    /// branch frontier is open at a time. Children are pushed in reverse so
    /// the pop order matches declaration order. Each entry carries the
    /// parent's branch epoch at push time.
    pending: Vec<(TaskId, usize, usize, BoxTask)>,
    max_blocked: usize,
    first_tick: Instant,
    last_tick: Instant,
    cumulative_parallelism: f64,
}

impl FiberTaskGraph {
    pub fn new(parallelism: usize) -> Self {
        assert!(parallelism >= 1, "fiber graph needs parallelism >= 1");
        let now = Instant::now();
        Self {
            parallelism,
            entries: Vec::new(),
            key_index: HashMap::new(),
            ready: VecDeque::new(),
            blocked: Vec::new(),
            pending: Vec::new(),
            max_blocked: 0,
            first_tick: now,
            last_tick: now,
            cumulative_parallelism: 0.0,
        }
    }

    /// Highest number of simultaneously blocked tasks seen so far.
    pub fn max_blocked(&self) -> usize {
        self.max_blocked
    }

    fn run_root(&mut self, init: BoxTask) -> TaskOutcome {
        self.entries.clear();
        self.key_index.clear();
        self.ready.clear();
        self.blocked.clear();
        self.pending.clear();
        self.entries.push(Entry::placeholder("<root>"));
        self.first_tick = Instant::now();
        self.last_tick = self.first_tick;
        self.cumulative_parallelism = 0.0;

        self.branch_task(ROOT, vec![init], false, false);
        while self.run_next_task() {}

        for id in 1..self.entries.len() {
            if !self.entries[id].state.is_terminal() {
                self.interrupt_task(id);
            }
        }
        self.update_cumulative_parallelism();

        let wall = (self.last_tick - self.first_tick).as_secs_f64();
        let efficiency = if wall > 0.0 {
            self.cumulative_parallelism / (self.parallelism as f64 * wall)
        } else {
            1.0
        };
        log::debug!("parallelism efficiency: {:.2}%", 100.0 * efficiency);

        let init_id = self.entries[ROOT]
            .graph
            .as_ref()
            .and_then(|g| g.slots.first().copied().flatten())
            .expect("root task was never started");
        self.entries[init_id]
            .outcome
            .clone()
            .expect("root task has no outcome")
    }

    /// Drives one ready task. Returns false once the root sentinel resolves.
    fn run_next_task(&mut self) -> bool {
        loop {
            if !self.ready.is_empty() {
                break;
            }
            if !self.visit_branch() {
                self.wait_blocked_tasks();
            }
        }
        let id = self.ready.pop_front().unwrap();
        if id == ROOT {
            return false;
        }
        if self.entries[id].state != State::Ready {
            // Interrupted while queued.
            return true;
        }

        let input = match self.entries[id].graph.take() {
            None => TaskInput::Value(TaskValue::Unit),
            Some(graph) => self.collect_branch_input(&graph),
        };
        self.set_state(id, State::Running);
        self.step_task(id, input);
        true
    }

    /// Assembles the resumption input from a branch's child outcomes.
    ///
    /// Successful values are collected in declaration order. If any child
    /// failed, the first non-interruption failure wins; a bailout is
    /// delivered as a plain value.
    fn collect_branch_input(&self, graph: &ChildGraph) -> TaskInput {
        let mut values = Vec::new();
        let mut failure: Option<TaskError> = None;
        for slot in &graph.slots {
            let Some(child) = slot else { continue };
            match &self.entries[*child].outcome {
                Some(Ok(v)) => values.push(v.clone()),
                Some(Err(e)) => {
                    if failure.is_none() || matches!(failure, Some(TaskError::Interrupted)) {
                        failure = Some(e.clone());
                    }
                }
                // Still running after a sibling bailed the branch out; its
                // eventual value is discarded.
                None => {}
            }
        }
        match failure {
            None if graph.multi => TaskInput::Values(values),
            None => TaskInput::Value(values.into_iter().next().unwrap_or(TaskValue::Unit)),
            Some(TaskError::Bailout(v)) => TaskInput::Value(v),
            Some(e) => TaskInput::Error(e),
        }
    }

    /// Expands one pending (parent, child) pair into a live task.
    fn visit_branch(&mut self) -> bool {
        match self.pending.pop() {
            Some((parent, epoch, slot, task)) => {
                self.begin_task(parent, epoch, slot, task);
                true
            }
            None => false,
        }
    }

    fn begin_task(&mut self, parent: TaskId, epoch: usize, slot: usize, task: BoxTask) {
        if self.entries[parent].epoch != epoch {
            // Leftover child of a branch the parent already bailed out of.
            log::trace!("begin {}: stale branch, skipped", task.label());
            return;
        }
        let key = task.cache_key();
        if let Some(k) = &key {
            if let Some(&existing) = self.key_index.get(k) {
                if let Some(graph) = self.entries[parent].graph.as_mut() {
                    graph.slots[slot] = Some(existing);
                }
                match &self.entries[existing].outcome {
                    Some(Ok(_)) => {
                        log::trace!("begin {}: cache hit", task.label());
                        self.resolve_task(parent);
                    }
                    Some(Err(_)) => {
                        log::trace!("begin {}: cached failure", task.label());
                        self.bailout_task(parent);
                    }
                    None => {
                        // Identical task already underway; share its outcome.
                        if self.entries[parent].counter.is_some() {
                            self.entries[existing].waiters.push(parent);
                        }
                    }
                }
                return;
            }
        }
        if self.entries[parent].counter.is_none() {
            // A sibling already bailed this branch out; drop unstarted work.
            log::trace!("begin {}: sibling bailed out, skipped", task.label());
            return;
        }

        let id = self.entries.len();
        let exclusive = task.is_exclusive();
        let label = task.label();
        log::trace!("begin {label}: starting");
        self.entries.push(Entry {
            task: Some(task),
            label,
            state: State::Running,
            exclusive,
            graph: None,
            interrupt: false,
            counter: None,
            epoch: 0,
            waiters: vec![parent],
            outcome: None,
            closed: false,
        });
        if let Some(graph) = self.entries[parent].graph.as_mut() {
            graph.slots[slot] = Some(id);
        }
        if let Some(k) = key {
            self.key_index.insert(k, id);
        }
        if exclusive {
            self.wait_blocked_tasks_until_empty();
        }
        self.step_task(id, TaskInput::Start);
    }

    fn step_task(&mut self, id: TaskId, input: TaskInput) {
        debug_assert_eq!(self.entries[id].state, State::Running);
        debug_assert!(!self.entries[id].exclusive || self.blocked.is_empty());
        let mut task = self.entries[id].task.take().expect("stepping a taskless entry");
        let step = task.step(input);
        self.entries[id].task = Some(task);
        match step {
            TaskStep::Single(sub) => self.branch_task(id, vec![sub], false, false),
            TaskStep::Branch { tasks, interrupt } => self.branch_task(id, tasks, true, interrupt),
            TaskStep::Return(v) => self.finish_task(id, v),
            TaskStep::Raise(e) => {
                self.close_task(id);
                self.except_task(id, e);
            }
            TaskStep::Block => self.block_task(id),
        }
    }

    fn branch_task(&mut self, id: TaskId, tasks: Vec<BoxTask>, multi: bool, interrupt: bool) {
        if tasks.is_empty() {
            // Zero branch: resume immediately with an empty result list.
            self.entries[id].graph = Some(ChildGraph {
                multi,
                slots: Vec::new(),
            });
            self.ready.push_front(id);
            self.set_state(id, State::Ready);
            return;
        }
        self.entries[id].graph = Some(ChildGraph {
            multi,
            slots: vec![None; tasks.len()],
        });
        self.entries[id].interrupt = interrupt;
        self.entries[id].counter = Some(tasks.len());
        self.entries[id].epoch += 1;
        let epoch = self.entries[id].epoch;
        for (slot, task) in tasks.into_iter().enumerate().rev() {
            self.pending.push((id, epoch, slot, task));
        }
        self.set_state(id, State::Waiting);
    }

    fn finish_task(&mut self, id: TaskId, value: TaskValue) {
        debug_assert_eq!(self.entries[id].state, State::Running);
        self.close_task(id);
        log::trace!("finish {}", self.entries[id].label);
        self.entries[id].outcome = Some(Ok(value));
        let waiters = std::mem::take(&mut self.entries[id].waiters);
        self.set_state(id, State::Finished);
        for waiter in waiters {
            self.resolve_task(waiter);
        }
    }

    fn except_task(&mut self, id: TaskId, error: TaskError) {
        debug_assert!(self.entries[id].outcome.is_none());
        log::trace!("abort {}: {}", self.entries[id].label, error);
        self.entries[id].outcome = Some(Err(error));
        self.entries[id].counter = None;
        let waiters = std::mem::take(&mut self.entries[id].waiters);
        self.set_state(id, State::Aborted);
        for waiter in waiters {
            self.bailout_task(waiter);
        }
    }

    fn block_task(&mut self, id: TaskId) {
        debug_assert_eq!(self.entries[id].state, State::Running);
        assert!(self.blocked.len() < self.parallelism);
        self.entries[id].counter = Some(1);
        self.update_cumulative_parallelism();
        self.blocked.insert(0, id);
        self.max_blocked = self.max_blocked.max(self.blocked.len());
        self.set_state(id, State::Blocked);
        self.wait_blocked_tasks_until_not_full();
        debug_assert!(self.blocked.len() < self.parallelism);
    }

    /// A parent's sub-task resolved; resume the parent once all have.
    fn resolve_task(&mut self, id: TaskId) {
        let Some(counter) = self.entries[id].counter else {
            // Already bailed out; late sibling results are discarded.
            return;
        };
        debug_assert!(matches!(
            self.entries[id].state,
            State::Waiting | State::Blocked
        ));
        if counter > 1 {
            self.entries[id].counter = Some(counter - 1);
            return;
        }
        self.push_ready(id);
        self.entries[id].interrupt = false;
        self.entries[id].counter = None;
        self.set_state(id, State::Ready);
    }

    /// A parent's sub-task failed; resume the parent right away and, for
    /// interrupt branches, cancel the unfinished siblings.
    fn bailout_task(&mut self, id: TaskId) {
        if self.entries[id].counter.is_none() {
            // Multiple bailouts collapse into one resumption.
            return;
        }
        debug_assert!(matches!(
            self.entries[id].state,
            State::Waiting | State::Blocked
        ));
        self.push_ready(id);
        let interrupt = std::mem::replace(&mut self.entries[id].interrupt, false);
        self.entries[id].counter = None;
        self.set_state(id, State::Ready);
        if interrupt {
            let children: Vec<TaskId> = self.entries[id]
                .graph
                .as_ref()
                .map(|g| g.slots.iter().copied().flatten().collect())
                .unwrap_or_default();
            for child in children {
                self.interrupt_task(child);
            }
        }
    }

    /// Ready-queue discipline: multi-branch resumptions go to the back
    /// (breadth across a fan-out), single and blocked resumptions to the
    /// front (depth along a chain).
    fn push_ready(&mut self, id: TaskId) {
        let multi = self.entries[id].graph.as_ref().is_some_and(|g| g.multi);
        if multi {
            self.ready.push_back(id);
        } else {
            self.ready.push_front(id);
        }
    }

    /// Cooperatively cancels a non-terminal task and its whole subtree.
    fn interrupt_task(&mut self, id: TaskId) {
        if !matches!(
            self.entries[id].state,
            State::Waiting | State::Blocked | State::Ready
        ) {
            return;
        }
        log::trace!("interrupt {}", self.entries[id].label);
        self.close_task(id);
        let children: Vec<TaskId> = self.entries[id]
            .graph
            .take()
            .map(|g| g.slots.into_iter().flatten().collect())
            .unwrap_or_default();
        self.entries[id].interrupt = false;
        self.entries[id].counter = None;
        if self.entries[id].state == State::Blocked {
            self.update_cumulative_parallelism();
            self.blocked.retain(|&b| b != id);
        }
        self.set_state(id, State::Running);
        self.except_task(id, TaskError::Interrupted);
        for child in children {
            self.interrupt_task(child);
        }
    }

    fn wait_blocked_tasks_until_empty(&mut self) {
        while !self.blocked.is_empty() {
            self.wait_blocked_tasks();
        }
    }

    fn wait_blocked_tasks_until_not_full(&mut self) {
        if self.blocked.len() == self.parallelism {
            log::trace!("maximum parallelism reached, waiting for blocked tasks");
            self.wait_blocked_tasks();
        }
    }

    fn wait_blocked_tasks(&mut self) {
        assert!(
            !self.blocked.is_empty(),
            "scheduler stalled with nothing to wait on"
        );
        loop {
            if self.poll_blocked_tasks() > 0 {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn poll_blocked_tasks(&mut self) -> usize {
        let mut resolved = 0;
        let mut i = 0;
        while i < self.blocked.len() {
            let id = self.blocked[i];
            debug_assert_eq!(self.entries[id].state, State::Blocked);
            let mut task = self.entries[id].task.take().expect("blocked entry lost its task");
            let done = task.poll();
            self.entries[id].task = Some(task);
            if done {
                self.resolve_task(id);
                resolved += 1;
                self.update_cumulative_parallelism();
                self.blocked.remove(i);
            } else {
                i += 1;
            }
        }
        resolved
    }

    fn close_task(&mut self, id: TaskId) {
        if self.entries[id].closed {
            return;
        }
        self.entries[id].closed = true;
        if let Some(task) = self.entries[id].task.as_mut() {
            task.close();
        }
    }

    fn set_state(&mut self, id: TaskId, state: State) {
        log::trace!("{}: -> {:?}", self.entries[id].label, state);
        self.entries[id].state = state;
    }

    fn update_cumulative_parallelism(&mut self) {
        let now = Instant::now();
        self.cumulative_parallelism +=
            (now - self.last_tick).as_secs_f64() * self.blocked.len() as f64;
        self.last_tick = now;
    }
}

impl TaskGraph for FiberTaskGraph {
    fn run(&mut self, task: BoxTask) -> TaskOutcome {
        match self.run_root(task) {
            Err(TaskError::Bailout(v)) => Ok(v),
            outcome => outcome,
        }
    }
}
