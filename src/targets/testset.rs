//! Testset targets: building test data and judging solutions against it.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use crate::cache;
use crate::codes::{CodeRef, RunSpec, RunStatus};
use crate::consts;
use crate::fileutil;
use crate::judge::{JudgeRequest, ReactiveRequest};
use crate::process::{InputSource, OutputSink};
use crate::results::{TestCase, TestCaseResult, TestsetResult, TestsetResultRef, Verdict};
use crate::taskgraph::{BoxTask, CacheKey, Task, TaskError, TaskInput, TaskStep, TaskValue};

use super::solution::SolutionBuildTask;
use super::{AllTask, CtxRef, GatherTestsTask, Problem, Solution, branch_all_true, natural_key};

/// The test data of one problem: generators produce inputs, validators
/// check them, judges rule on outputs. After a successful build the out-dir
/// is a fresh snapshot of the source dir plus the generated `.in`/`.diff`
/// files.
pub struct Testset {
    pub name: String,
    pub full_name: String,
    pub base_dir: PathBuf,
    pub out_dir: PathBuf,
    pub generators: Vec<CodeRef>,
    pub validators: Vec<CodeRef>,
    /// Never empty; defaults to the internal diff judge.
    pub judges: Vec<CodeRef>,
    pub reactives: Vec<CodeRef>,
}

impl Testset {
    pub fn stamp_file(&self) -> PathBuf {
        self.out_dir.join(consts::STAMP_FILE)
    }

    /// Testsets also depend on the reference solution whose outputs they
    /// snapshot, and on the shared library directory when one is declared.
    pub fn last_modified(&self, problem: &Problem, library_dir: Option<&Path>) -> SystemTime {
        let mut stamp = fileutil::last_modified_under(&self.base_dir);
        if let Some(reference) = &problem.reference_solution {
            stamp = stamp.max(reference.last_modified(library_dir));
        }
        if let Some(dir) = library_dir {
            stamp = stamp.max(fileutil::last_modified_under(dir));
        }
        stamp
    }

    pub fn is_build_cached(&self, problem: &Problem, library_dir: Option<&Path>) -> bool {
        self.last_modified(problem, library_dir) < fileutil::modified_time(&self.stamp_file())
    }

    pub fn set_stamp(&self) -> anyhow::Result<()> {
        fileutil::create_empty_file(&self.stamp_file())
    }

    /// Recreates the out-dir as a fresh copy of the source dir.
    pub fn init_out_dir(&self) -> anyhow::Result<()> {
        fileutil::remove_tree(&self.out_dir)?;
        if self.base_dir.is_dir() {
            fileutil::copy_tree(&self.base_dir, &self.out_dir)?;
        } else {
            fileutil::make_dir(&self.out_dir)?;
        }
        Ok(())
    }

    /// A test case exists iff its `.in` file exists in the out-dir.
    pub fn list_test_cases(&self) -> Vec<TestCase> {
        let mut names: Vec<String> = fileutil::list_dir(&self.out_dir, false)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                p.extension().is_some_and(|e| e == consts::IN_EXT)
                    && self.out_dir.join(p).is_file()
            })
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        names.sort_by_key(|n| natural_key(n));
        names
            .into_iter()
            .map(|n| TestCase::new(self.out_dir.join(n)))
            .collect()
    }
}

fn bail_false() -> TaskStep {
    TaskStep::Raise(TaskError::Bailout(TaskValue::Bool(false)))
}

// ---------------------------------------------------------------------------
// Build pipeline

enum BuildState {
    Start,
    Compile,
    Generate,
    Validate,
    BuildReference,
    RunReference,
}

/// Builds the testset: snapshot sources, compile everything, generate and
/// validate inputs, produce reference outputs, stamp. Shared by key so a
/// run testing many solutions builds the testset once.
pub struct TestsetBuildTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    state: BuildState,
}

impl TestsetBuildTask {
    pub fn boxed(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            state: BuildState::Start,
        })
    }

    fn compile_groups(&self) -> Vec<BoxTask> {
        let ts = &self.problem.testset;
        let group = |kind: &str, codes: &[CodeRef]| {
            AllTask::boxed(
                format!("compile {kind} {}", ts.full_name),
                codes
                    .iter()
                    .map(|code| CompileCodeTask::boxed(&self.ctx, code, &ts.full_name))
                    .collect(),
            )
        };
        vec![
            group("generators", &ts.generators),
            group("validators", &ts.validators),
            group("judges", &ts.judges),
            group("reactives", &ts.reactives),
        ]
    }

    fn finish(&self) -> TaskStep {
        let ts = &self.problem.testset;
        match ts.set_stamp() {
            Ok(()) => TaskStep::Return(TaskValue::Bool(true)),
            Err(e) => {
                self.ctx.ui.error(&ts.full_name, &format!("{e:#}"));
                TaskStep::Return(TaskValue::Bool(false))
            }
        }
    }
}

impl Task for TestsetBuildTask {
    fn label(&self) -> String {
        format!("build {}", self.problem.testset.full_name)
    }

    fn cache_key(&self) -> Option<CacheKey> {
        Some(CacheKey::new(
            "testset-build",
            self.problem.testset.out_dir.display(),
        ))
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        let ctx = self.ctx.clone();
        let ui = &ctx.ui;
        let problem = self.problem.clone();
        let ts = &problem.testset;
        match self.state {
            BuildState::Start => {
                if ts.is_build_cached(&problem, ctx.library_dir.as_deref()) {
                    if ts.list_test_cases().is_empty() {
                        ui.warning(&ts.full_name, "No test case found");
                    }
                    return TaskStep::Return(TaskValue::Bool(true));
                }
                if let Err(e) = ts.init_out_dir() {
                    ui.error(&ts.full_name, &format!("{e:#}"));
                    return TaskStep::Return(TaskValue::Bool(false));
                }
                self.state = BuildState::Compile;
                TaskStep::branch(self.compile_groups())
            }
            BuildState::Compile => {
                if !branch_all_true(&input) {
                    return TaskStep::Return(TaskValue::Bool(false));
                }
                self.state = BuildState::Generate;
                TaskStep::Single(AllTask::boxed(
                    format!("generate {}", ts.full_name),
                    ts.generators
                        .iter()
                        .map(|code| RunGeneratorTask::boxed(&ctx, code, ts))
                        .collect(),
                ))
            }
            BuildState::Generate => {
                if !branch_all_true(&input) {
                    return TaskStep::Return(TaskValue::Bool(false));
                }
                self.state = BuildState::Validate;
                TaskStep::Single(ValidateTask::boxed(&ctx, &problem))
            }
            BuildState::Validate => {
                if !branch_all_true(&input) {
                    return TaskStep::Return(TaskValue::Bool(false));
                }
                if ts.list_test_cases().is_empty() {
                    ui.warning(&ts.full_name, "No test case found");
                    return self.finish();
                }
                let Some(reference) = &problem.reference_solution else {
                    ui.error(&ts.full_name, "Reference solution unavailable");
                    return TaskStep::Return(TaskValue::Bool(false));
                };
                self.state = BuildState::BuildReference;
                TaskStep::Single(SolutionBuildTask::boxed(&ctx, &problem, reference))
            }
            BuildState::BuildReference => {
                if !branch_all_true(&input) {
                    return TaskStep::Return(TaskValue::Bool(false));
                }
                let reference = problem
                    .reference_solution
                    .clone()
                    .expect("reference checked before building");
                self.state = BuildState::RunReference;
                TaskStep::Single(AllTask::boxed(
                    format!("refrun {}", ts.full_name),
                    ts.list_test_cases()
                        .into_iter()
                        .map(|case| RunReferenceTask::boxed(&ctx, &problem, &reference, case))
                        .collect(),
                ))
            }
            BuildState::RunReference => {
                if !branch_all_true(&input) {
                    return TaskStep::Return(TaskValue::Bool(false));
                }
                if let Some(reference) = &problem.reference_solution {
                    ui.console.print_action("REFRUN", &reference.full_name, "");
                }
                self.finish()
            }
        }
    }
}

/// Compiles one generator/validator/judge/reactive; a failure collapses the
/// whole build with its compile log surfaced.
struct CompileCodeTask {
    ctx: CtxRef,
    code: CodeRef,
    owner: String,
    started: bool,
}

impl CompileCodeTask {
    fn boxed(ctx: &CtxRef, code: &CodeRef, owner: &str) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            code: code.clone(),
            owner: owner.to_string(),
            started: false,
        })
    }
}

impl Task for CompileCodeTask {
    fn label(&self) -> String {
        format!("compile {}/{}", self.owner, self.code.src_name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            if !self.code.quiet_compile() {
                self.ctx
                    .ui
                    .console
                    .print_action("COMPILE", &self.owner, self.code.src_name());
            }
            return TaskStep::Single(self.code.compile());
        }
        match input {
            TaskInput::Value(TaskValue::Run(result)) if result.is_ok() => {
                TaskStep::Return(TaskValue::Bool(true))
            }
            TaskInput::Value(TaskValue::Run(result)) => {
                self.ctx.ui.error(
                    &self.owner,
                    &format!("{}: Compile Error ({})", self.code.src_name(), result.status),
                );
                if let Some(log) = self.code.read_compile_log() {
                    self.ctx.ui.console.print_log(&log);
                }
                bail_false()
            }
            _ => bail_false(),
        }
    }
}

/// Runs one generator inside the out-dir with its stdio discarded.
struct RunGeneratorTask {
    ctx: CtxRef,
    code: CodeRef,
    owner: String,
    cwd: PathBuf,
    started: bool,
}

impl RunGeneratorTask {
    fn boxed(ctx: &CtxRef, code: &CodeRef, testset: &Testset) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            code: code.clone(),
            owner: testset.full_name.clone(),
            cwd: testset.out_dir.clone(),
            started: false,
        })
    }
}

impl Task for RunGeneratorTask {
    fn label(&self) -> String {
        format!("generate {}/{}", self.owner, self.code.src_name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            self.ctx
                .ui
                .console
                .print_action("GENERATE", &self.owner, self.code.src_name());
            let spec = RunSpec::new(self.cwd.clone(), InputSource::Null, OutputSink::Null);
            return TaskStep::Single(self.code.run(spec));
        }
        match input {
            TaskInput::Value(TaskValue::Run(result)) if result.is_ok() => {
                TaskStep::Return(TaskValue::Bool(true))
            }
            TaskInput::Value(TaskValue::Run(result)) => {
                self.ctx.ui.error(
                    &self.owner,
                    &format!("{}: {}", self.code.src_name(), result.status),
                );
                bail_false()
            }
            _ => bail_false(),
        }
    }
}

/// Runs every validator over every test case. A testset with no validators
/// warns but still builds.
struct ValidateTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    started: bool,
}

impl ValidateTask {
    fn boxed(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            started: false,
        })
    }
}

impl Task for ValidateTask {
    fn label(&self) -> String {
        format!("validate {}", self.problem.testset.full_name)
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        let ts = &self.problem.testset;
        if !self.started {
            self.started = true;
            if ts.validators.is_empty() {
                self.ctx.ui.warning(&ts.full_name, "Validator unavailable");
                return TaskStep::Return(TaskValue::Bool(true));
            }
            let cases = ts.list_test_cases();
            let tasks = ts
                .validators
                .iter()
                .flat_map(|validator| {
                    cases
                        .iter()
                        .map(|case| RunValidatorTask::boxed(&self.ctx, validator, ts, case.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            return TaskStep::branch(tasks);
        }
        if !branch_all_true(&input) {
            return TaskStep::Return(TaskValue::Bool(false));
        }
        self.ctx.ui.console.print_action("VALIDATE", &ts.full_name, "OK");
        TaskStep::Return(TaskValue::Bool(true))
    }
}

/// One validator over one input; rejection surfaces the validation journal.
struct RunValidatorTask {
    ctx: CtxRef,
    code: CodeRef,
    owner: String,
    cwd: PathBuf,
    case: TestCase,
    started: bool,
}

impl RunValidatorTask {
    fn boxed(ctx: &CtxRef, code: &CodeRef, testset: &Testset, case: TestCase) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            code: code.clone(),
            owner: testset.full_name.clone(),
            cwd: testset.out_dir.clone(),
            case,
            started: false,
        })
    }

    fn validation_file(&self) -> PathBuf {
        self.case.infile.with_extension(consts::VALIDATION_EXT)
    }
}

impl Task for RunValidatorTask {
    fn label(&self) -> String {
        format!("validate {}/{}", self.owner, self.case.name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            let mut spec = RunSpec::new(
                self.cwd.clone(),
                InputSource::File(self.case.infile.clone()),
                OutputSink::File(self.validation_file()),
            );
            spec.redirect_error = true;
            return TaskStep::Single(self.code.run(spec));
        }
        let ui = &self.ctx.ui;
        match input {
            TaskInput::Value(TaskValue::Run(result)) => match result.status {
                RunStatus::Ok => {
                    ui.console
                        .print_progress("VALIDATE", &self.owner, &format!("{}: PASSED", self.case.name()));
                    TaskStep::Return(TaskValue::Bool(true))
                }
                RunStatus::Ng => {
                    ui.error(
                        &self.owner,
                        &format!("{}: Validation Failed", self.case.name()),
                    );
                    if let Some(log) = fileutil::read_file(&self.validation_file()) {
                        ui.console.print_log(&log);
                    }
                    bail_false()
                }
                status => {
                    ui.error(
                        &self.owner,
                        &format!("{}: Validator Failed: {status}", self.case.name()),
                    );
                    bail_false()
                }
            },
            _ => bail_false(),
        }
    }
}

/// Produces the reference output for one case unless it already exists.
struct RunReferenceTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    reference: Rc<Solution>,
    case: TestCase,
    started: bool,
}

impl RunReferenceTask {
    fn boxed(
        ctx: &CtxRef,
        problem: &Rc<Problem>,
        reference: &Rc<Solution>,
        case: TestCase,
    ) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            reference: reference.clone(),
            case,
            started: false,
        })
    }
}

impl Task for RunReferenceTask {
    fn label(&self) -> String {
        format!("refrun {}/{}", self.reference.full_name, self.case.name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        let ts = &self.problem.testset;
        if !self.started {
            self.started = true;
            if self.case.difffile.is_file() {
                return TaskStep::Return(TaskValue::Bool(true));
            }
            if let Some(reactive) = ts.reactives.first() {
                let runner = reactive
                    .variant()
                    .and_then(|name| self.ctx.reactive_variants.get(name))
                    .unwrap_or_else(|| self.ctx.reactive_variants.default_variant());
                let request = ReactiveRequest {
                    solution_argv: self.reference.code.run_argv(),
                    solution_cwd: self.reference.out_dir.clone(),
                    infile: self.case.infile.clone(),
                    outfile: self.case.difffile.clone(),
                    judgefile: self.case.infile.with_extension(consts::JUDGE_EXT),
                    cwd: ts.out_dir.clone(),
                    timeout: None,
                    precise: false,
                };
                return TaskStep::Single(runner.run(reactive.as_ref(), &request));
            }
            let spec = RunSpec::new(
                self.reference.out_dir.clone(),
                InputSource::File(self.case.infile.clone()),
                OutputSink::File(self.case.difffile.clone()),
            );
            return TaskStep::Single(self.reference.code.run(spec));
        }
        match input {
            TaskInput::Value(TaskValue::Run(result)) if result.is_ok() => {
                self.ctx.ui.console.print_progress(
                    "REFRUN",
                    &self.reference.full_name,
                    &format!("{}: DONE", self.case.name()),
                );
                TaskStep::Return(TaskValue::Bool(true))
            }
            TaskInput::Value(TaskValue::Run(result)) => {
                self.ctx
                    .ui
                    .error(&self.reference.full_name, &result.status.to_string());
                bail_false()
            }
            _ => bail_false(),
        }
    }
}

// ---------------------------------------------------------------------------
// Solution testing

/// Tests every solution of the problem.
pub fn test_all_task(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
    GatherTestsTask::boxed(
        format!("test {}", problem.name),
        problem
            .solutions
            .iter()
            .map(|solution| TestSolutionTask::boxed(ctx, problem, solution))
            .collect(),
    )
}

/// Removes the testset's build outputs.
pub fn clean_task(ctx: &CtxRef, problem: &Rc<Problem>) -> BoxTask {
    let ctx = ctx.clone();
    let problem = problem.clone();
    super::FnTask::boxed(format!("clean {}", problem.testset.full_name), move || {
        let ts = &problem.testset;
        ctx.ui.console.print_action("CLEAN", &ts.full_name, "");
        match fileutil::remove_tree(&ts.out_dir) {
            Ok(()) => TaskValue::Bool(true),
            Err(e) => {
                ctx.ui.error(&ts.full_name, &format!("{e:#}"));
                TaskValue::Bool(false)
            }
        }
    })
}

enum TestState {
    Start,
    BuildTests,
    BuildSolution,
    Cases,
}

/// Evaluates one solution over the testset and reconciles the outcome with
/// the solution's declared expectation.
pub struct TestSolutionTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    state: TestState,
}

impl TestSolutionTask {
    pub fn boxed(ctx: &CtxRef, problem: &Rc<Problem>, solution: &Rc<Solution>) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            state: TestState::Start,
        })
    }

    fn finalized_result(&self, detail: &str) -> TaskStep {
        let result = TestsetResult::shared(&self.problem.name, &self.solution.name, Vec::new());
        result.borrow_mut().finalize(false, detail);
        TaskStep::Return(TaskValue::Tests(vec![result]))
    }
}

impl Task for TestSolutionTask {
    fn label(&self) -> String {
        format!("test {}", self.solution.full_name)
    }

    fn cache_key(&self) -> Option<CacheKey> {
        Some(CacheKey::new(
            "test-solution",
            self.solution.out_dir.display(),
        ))
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        match self.state {
            TestState::Start => {
                self.state = TestState::BuildTests;
                TaskStep::Single(TestsetBuildTask::boxed(&self.ctx, &self.problem))
            }
            TestState::BuildTests => {
                if !branch_all_true(&input) {
                    return self.finalized_result("Failed to build tests");
                }
                self.state = TestState::BuildSolution;
                TaskStep::Single(SolutionBuildTask::boxed(
                    &self.ctx,
                    &self.problem,
                    &self.solution,
                ))
            }
            TestState::BuildSolution => {
                if !branch_all_true(&input) {
                    return self.finalized_result("Compile Error");
                }
                self.ctx
                    .ui
                    .console
                    .print_progress("TEST", &self.solution.full_name, "");
                self.state = TestState::Cases;
                let use_challenge =
                    !self.solution.correct && self.solution.challenge_cases.is_some();
                if use_challenge {
                    TaskStep::Single(ChallengeCasesTask::boxed(
                        &self.ctx,
                        &self.problem,
                        &self.solution,
                    ))
                } else {
                    TaskStep::Single(AllCasesTask::boxed(&self.ctx, &self.problem, &self.solution))
                }
            }
            TestState::Cases => {
                let results = match input {
                    TaskInput::Value(TaskValue::Tests(results)) => results,
                    TaskInput::Error(e) => {
                        return self.finalized_result(&format!("{e}"));
                    }
                    other => {
                        return self.finalized_result(&format!("unexpected result {other:?}"));
                    }
                };
                if let Some(result) = results.first() {
                    let result = result.borrow();
                    let status = if result.expected {
                        self.ctx.ui.console.status_ok()
                    } else {
                        self.ctx.ui.console.status_fail()
                    };
                    let cached = if result.is_cached() { " (cached)" } else { "" };
                    self.ctx.ui.console.print_action(
                        "TEST",
                        &self.solution.full_name,
                        &format!("{status} {}{cached}", result.detail),
                    );
                }
                TaskStep::Return(TaskValue::Tests(results))
            }
        }
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(pattern == name)
}

/// Tests a wrong solution against its declared challenge cases. The
/// solution passes iff it fails at least one case and accepts none.
struct ChallengeCasesTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    result: Option<TestsetResultRef>,
}

impl ChallengeCasesTask {
    fn boxed(ctx: &CtxRef, problem: &Rc<Problem>, solution: &Rc<Solution>) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            result: None,
        })
    }
}

impl Task for ChallengeCasesTask {
    fn label(&self) -> String {
        format!("challenge {}", self.solution.full_name)
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        let Some(result) = self.result.clone() else {
            let all_cases = self.problem.testset.list_test_cases();
            let patterns = self.solution.challenge_cases.clone().unwrap_or_default();
            let mut cases: Vec<TestCase> = Vec::new();
            for pattern in &patterns {
                let matched: Vec<TestCase> = all_cases
                    .iter()
                    .filter(|c| matches_pattern(pattern, &c.name()))
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    let detail = format!("Challenge case not found: {pattern}");
                    self.ctx.ui.error(&self.solution.full_name, &detail);
                    let result =
                        TestsetResult::shared(&self.problem.name, &self.solution.name, Vec::new());
                    result.borrow_mut().finalize(false, detail);
                    return TaskStep::Return(TaskValue::Tests(vec![result]));
                }
                for case in matched {
                    if !cases.contains(&case) {
                        cases.push(case);
                    }
                }
            }
            let result =
                TestsetResult::shared(&self.problem.name, &self.solution.name, cases.clone());
            self.result = Some(result.clone());
            let tasks = cases
                .into_iter()
                .map(|case| {
                    ChallengeCaseTask::boxed(&self.ctx, &self.problem, &self.solution, case, &result)
                })
                .collect();
            return TaskStep::interrupt_branch(tasks);
        };
        if !result.borrow().is_finalized() {
            result.borrow_mut().finalize(true, "Expectedly Failed");
        }
        TaskStep::Return(TaskValue::Tests(vec![result]))
    }
}

/// One challenge case: the solution must not accept it.
struct ChallengeCaseTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    case: TestCase,
    result: TestsetResultRef,
    started: bool,
}

impl ChallengeCaseTask {
    fn boxed(
        ctx: &CtxRef,
        problem: &Rc<Problem>,
        solution: &Rc<Solution>,
        case: TestCase,
        result: &TestsetResultRef,
    ) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            case,
            result: result.clone(),
            started: false,
        })
    }
}

impl Task for ChallengeCaseTask {
    fn label(&self) -> String {
        format!("challenge {}/{}", self.solution.full_name, self.case.name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            return TaskStep::Single(TestOneCaseTask::boxed(
                &self.ctx,
                &self.problem,
                &self.solution,
                self.case.clone(),
            ));
        }
        let case_result = match input {
            TaskInput::Value(TaskValue::Case(r)) => r,
            TaskInput::Error(e) => return TaskStep::Raise(e),
            _ => TestCaseResult::new(Verdict::Err, None, false),
        };
        let ui = &self.ctx.ui;
        self.result
            .borrow_mut()
            .record_case(&self.case.infile, case_result.clone());
        match case_result.verdict {
            Verdict::Ac => {
                let detail = format!("{}: Unexpectedly Accepted", self.case.name());
                self.result.borrow_mut().finalize_with(
                    false,
                    &detail,
                    Some(self.case.clone()),
                    false,
                );
                ui.error(&self.solution.full_name, &detail);
                if ui.options.keep_going {
                    TaskStep::Return(TaskValue::Bool(false))
                } else {
                    bail_false()
                }
            }
            Verdict::Wa | Verdict::Tle | Verdict::Re => {
                ui.console.print_progress(
                    "TEST",
                    &self.solution.full_name,
                    &format!("{}: PASSED", self.case.name()),
                );
                TaskStep::Return(TaskValue::Bool(true))
            }
            _ => {
                let detail = format!("{}: Judge Error", self.case.name());
                self.result.borrow_mut().finalize_with(
                    false,
                    &detail,
                    Some(self.case.clone()),
                    false,
                );
                let judgefile = self
                    .solution
                    .out_dir
                    .join(format!("{}.{}", self.case.stem(), consts::JUDGE_EXT));
                ui.error(
                    &self.solution.full_name,
                    &format!("{detail}\n  judge log: {}", judgefile.display()),
                );
                if ui.options.keep_going {
                    TaskStep::Return(TaskValue::Bool(false))
                } else {
                    bail_false()
                }
            }
        }
    }
}

/// Tests a solution over every case, reconciling each verdict with the
/// expectation (correct, or a declared verdict set).
struct AllCasesTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    result: Option<TestsetResultRef>,
}

impl AllCasesTask {
    fn boxed(ctx: &CtxRef, problem: &Rc<Problem>, solution: &Rc<Solution>) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            result: None,
        })
    }
}

impl Task for AllCasesTask {
    fn label(&self) -> String {
        format!("cases {}", self.solution.full_name)
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        let Some(result) = self.result.clone() else {
            let cases = self.problem.testset.list_test_cases();
            let result =
                TestsetResult::shared(&self.problem.name, &self.solution.name, cases.clone());
            self.result = Some(result.clone());
            let tasks = cases
                .into_iter()
                .map(|case| {
                    SolutionCaseTask::boxed(&self.ctx, &self.problem, &self.solution, case, &result)
                })
                .collect();
            return TaskStep::interrupt_branch(tasks);
        };
        if !result.borrow().is_finalized() {
            let timing = self.ctx.ui.options.timing_precise();
            let mut result_mut = result.borrow_mut();
            if self.solution.correct || self.solution.expected_verdicts.is_some() {
                let stats = result_mut.time_stats(timing);
                result_mut.finalize(true, stats);
            } else {
                result_mut.finalize(false, "Unexpectedly accepted all test cases");
                drop(result_mut);
                self.ctx
                    .ui
                    .error(&self.solution.full_name, "Unexpectedly accepted all test cases");
            }
        }
        TaskStep::Return(TaskValue::Tests(vec![result]))
    }
}

/// One ordinary case of a solution run.
struct SolutionCaseTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    case: TestCase,
    result: TestsetResultRef,
    started: bool,
}

impl SolutionCaseTask {
    fn boxed(
        ctx: &CtxRef,
        problem: &Rc<Problem>,
        solution: &Rc<Solution>,
        case: TestCase,
        result: &TestsetResultRef,
    ) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            case,
            result: result.clone(),
            started: false,
        })
    }

    fn judge_log_path(&self) -> PathBuf {
        self.solution
            .out_dir
            .join(format!("{}.{}", self.case.stem(), consts::JUDGE_EXT))
    }

    fn fail_case(&self, expected: bool, detail: String, surface_judge_log: bool) -> TaskStep {
        self.result
            .borrow_mut()
            .finalize_with(expected, &detail, Some(self.case.clone()), false);
        if !expected {
            if surface_judge_log {
                self.ctx.ui.error(
                    &self.solution.full_name,
                    &format!("{detail}\n  judge log: {}", self.judge_log_path().display()),
                );
            } else {
                self.ctx.ui.error(&self.solution.full_name, &detail);
            }
        }
        if self.ctx.ui.options.keep_going {
            TaskStep::Return(TaskValue::Bool(false))
        } else {
            bail_false()
        }
    }
}

impl Task for SolutionCaseTask {
    fn label(&self) -> String {
        format!("case {}/{}", self.solution.full_name, self.case.name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            return TaskStep::Single(TestOneCaseTask::boxed(
                &self.ctx,
                &self.problem,
                &self.solution,
                self.case.clone(),
            ));
        }
        let case_result = match input {
            TaskInput::Value(TaskValue::Case(r)) => r,
            TaskInput::Error(e) => return TaskStep::Raise(e),
            _ => TestCaseResult::new(Verdict::Err, None, false),
        };
        self.result
            .borrow_mut()
            .record_case(&self.case.infile, case_result.clone());
        let verdict = case_result.verdict.clone();
        let name = self.case.name();

        if !verdict.is_regular() {
            return self.fail_case(false, format!("{name}: Judge Error"), true);
        }
        if let Some(expected_verdicts) = &self.solution.expected_verdicts {
            if !expected_verdicts.contains(&verdict) {
                let surface = verdict == Verdict::Wa;
                return self.fail_case(
                    false,
                    format!("{name}: Unexpected Verdict ({verdict})"),
                    surface,
                );
            }
        } else if verdict != Verdict::Ac {
            let expected = !self.solution.correct;
            let surface = self.solution.correct && verdict == Verdict::Wa;
            return self.fail_case(expected, format!("{name}: {verdict}"), surface);
        }
        self.ctx.ui.console.print_progress(
            "TEST",
            &self.solution.full_name,
            &format!("{name}: PASSED"),
        );
        TaskStep::Return(TaskValue::Bool(true))
    }
}

// ---------------------------------------------------------------------------
// Per-case execution

/// Cache wrapper around one case run.
struct TestOneCaseTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    case: TestCase,
    started: bool,
}

impl TestOneCaseTask {
    fn boxed(
        ctx: &CtxRef,
        problem: &Rc<Problem>,
        solution: &Rc<Solution>,
        case: TestCase,
    ) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            case,
            started: false,
        })
    }

    fn cache_file(&self) -> PathBuf {
        self.solution
            .out_dir
            .join(format!("{}.{}", self.case.stem(), consts::CACHE_EXT))
    }
}

impl Task for TestOneCaseTask {
    fn label(&self) -> String {
        format!("case {}/{}", self.solution.full_name, self.case.name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            if self.ctx.ui.options.cache_tests {
                if let Some(hit) = cache::load(
                    &self.cache_file(),
                    &self.solution.code.src_path(),
                    &self.case.infile,
                ) {
                    return TaskStep::Return(TaskValue::Case(hit));
                }
            }
            return TaskStep::Single(RunOneCaseTask::boxed(
                &self.ctx,
                &self.problem,
                &self.solution,
                self.case.clone(),
            ));
        }
        match input {
            TaskInput::Value(TaskValue::Case(result)) => {
                if self.ctx.ui.options.cache_tests {
                    cache::store(&self.cache_file(), &result);
                }
                TaskStep::Return(TaskValue::Case(result))
            }
            TaskInput::Error(e) => TaskStep::Raise(e),
            _ => TaskStep::Return(TaskValue::Case(TestCaseResult::new(
                Verdict::Err,
                None,
                false,
            ))),
        }
    }
}

#[derive(Clone, Copy)]
enum CaseState {
    Run,
    Judge(usize),
}

/// Runs the solution (or the reactive session) on one case, then drives the
/// judge chain over the output.
struct RunOneCaseTask {
    ctx: CtxRef,
    problem: Rc<Problem>,
    solution: Rc<Solution>,
    case: TestCase,
    state: CaseState,
    elapsed: Option<f64>,
    reactive_rejects: bool,
}

impl RunOneCaseTask {
    fn boxed(
        ctx: &CtxRef,
        problem: &Rc<Problem>,
        solution: &Rc<Solution>,
        case: TestCase,
    ) -> BoxTask {
        Box::new(Self {
            ctx: ctx.clone(),
            problem: problem.clone(),
            solution: solution.clone(),
            case,
            state: CaseState::Run,
            elapsed: None,
            reactive_rejects: false,
        })
    }

    fn outfile(&self) -> PathBuf {
        self.solution
            .out_dir
            .join(format!("{}.{}", self.case.stem(), consts::OUT_EXT))
    }

    fn judgefile(&self) -> PathBuf {
        self.solution
            .out_dir
            .join(format!("{}.{}", self.case.stem(), consts::JUDGE_EXT))
    }

    fn case_result(&self, verdict: Verdict, time: Option<f64>) -> TaskStep {
        TaskStep::Return(TaskValue::Case(TestCaseResult::new(verdict, time, false)))
    }

    fn next_judge(&mut self, index: usize) -> TaskStep {
        let ts = &self.problem.testset;
        let Some(judge) = ts.judges.get(index) else {
            return self.case_result(Verdict::Ac, self.elapsed);
        };
        self.state = CaseState::Judge(index);
        let runner = judge
            .variant()
            .and_then(|name| self.ctx.judge_variants.get(name))
            .unwrap_or_else(|| self.ctx.judge_variants.default_variant());
        let request = JudgeRequest {
            infile: self.case.infile.clone(),
            difffile: self.case.difffile.clone(),
            outfile: self.outfile(),
            cwd: ts.out_dir.clone(),
            judgefile: self.judgefile(),
        };
        TaskStep::Single(runner.run(judge.as_ref(), &request))
    }
}

impl Task for RunOneCaseTask {
    fn label(&self) -> String {
        format!("run {}/{}", self.solution.full_name, self.case.name())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        let precise = self.ctx.ui.options.timing_precise();
        match self.state {
            CaseState::Run => match input {
                TaskInput::Start => {
                    let ts = &self.problem.testset;
                    if let Some(reactive) = ts.reactives.first() {
                        let runner = reactive
                            .variant()
                            .and_then(|name| self.ctx.reactive_variants.get(name))
                            .unwrap_or_else(|| self.ctx.reactive_variants.default_variant());
                        self.reactive_rejects = runner.rejects_by_exit();
                        let request = ReactiveRequest {
                            solution_argv: self.solution.code.run_argv(),
                            solution_cwd: self.solution.out_dir.clone(),
                            infile: self.case.infile.clone(),
                            outfile: self.outfile(),
                            judgefile: self.judgefile(),
                            cwd: ts.out_dir.clone(),
                            timeout: Some(self.problem.timeout),
                            precise,
                        };
                        return TaskStep::Single(runner.run(reactive.as_ref(), &request));
                    }
                    let mut spec = RunSpec::new(
                        self.solution.out_dir.clone(),
                        InputSource::File(self.case.infile.clone()),
                        OutputSink::File(self.outfile()),
                    );
                    spec.timeout = Some(self.problem.timeout);
                    spec.precise = precise;
                    TaskStep::Single(self.solution.code.run(spec))
                }
                TaskInput::Value(TaskValue::Run(result)) => match result.status {
                    RunStatus::Tle => self.case_result(Verdict::Tle, None),
                    RunStatus::Ng if self.reactive_rejects => self.case_result(Verdict::Wa, None),
                    RunStatus::Ok => {
                        self.elapsed = result.time;
                        self.next_judge(0)
                    }
                    _ => self.case_result(Verdict::Re, None),
                },
                _ => self.case_result(Verdict::Err, None),
            },
            CaseState::Judge(index) => match input {
                TaskInput::Value(TaskValue::Run(result)) => match result.status {
                    RunStatus::Ok => self.next_judge(index + 1),
                    RunStatus::Ng => self.case_result(Verdict::Wa, None),
                    status => self.case_result(Verdict::Validator(status.to_string()), None),
                },
                _ => self.case_result(Verdict::Err, None),
            },
        }
    }
}
