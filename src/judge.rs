//! Judge and reactive invocation variants.
//!
//! All judges rule on the same triple (input, reference output, solution
//! output); variants only differ in how the triple is marshalled onto the
//! judge's command line. Variants are looked up by name from a table frozen
//! at startup, so configurations can select them per judge.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::codes::{Code, ExitProtocol, RunSpec};
use crate::fileutil;
use crate::process::{InputSource, OutputSink, ReactivePairSpec, ReactivePairTask};
use crate::taskgraph::BoxTask;

/// What a judge rules on, and where its notes go.
#[derive(Clone, Debug)]
pub struct JudgeRequest {
    pub infile: PathBuf,
    pub difffile: PathBuf,
    pub outfile: PathBuf,
    pub cwd: PathBuf,
    pub judgefile: PathBuf,
}

pub trait JudgeRunner {
    fn name(&self) -> &'static str;

    /// Builds the task that invokes `judge` on the request; the task yields
    /// a `RunResult` whose status is OK (accept) / NG (reject) / other
    /// (infrastructure failure).
    fn run(&self, judge: &dyn Code, request: &JudgeRequest) -> BoxTask;
}

/// Named flags, the convention of the built-in diff judge.
struct RimeJudgeRunner;

impl JudgeRunner for RimeJudgeRunner {
    fn name(&self) -> &'static str {
        "rime"
    }

    fn run(&self, judge: &dyn Code, request: &JudgeRequest) -> BoxTask {
        let mut spec = RunSpec::new(
            request.cwd.clone(),
            InputSource::Null,
            OutputSink::File(request.judgefile.clone()),
        );
        spec.args = vec![
            "--infile".to_string(),
            request.infile.display().to_string(),
            "--difffile".to_string(),
            request.difffile.display().to_string(),
            "--outfile".to_string(),
            request.outfile.display().to_string(),
        ];
        spec.redirect_error = true;
        spec.protocol = ExitProtocol::Judge;
        judge.run(spec)
    }
}

/// Positional `<infile> <outfile> <difffile>`, as testlib checkers expect.
struct TestlibJudgeRunner;

impl JudgeRunner for TestlibJudgeRunner {
    fn name(&self) -> &'static str {
        "testlib"
    }

    fn run(&self, judge: &dyn Code, request: &JudgeRequest) -> BoxTask {
        let mut spec = RunSpec::new(
            request.cwd.clone(),
            InputSource::Null,
            OutputSink::File(request.judgefile.clone()),
        );
        spec.args = vec![
            request.infile.display().to_string(),
            request.outfile.display().to_string(),
            request.difffile.display().to_string(),
        ];
        spec.redirect_error = true;
        spec.protocol = ExitProtocol::Judge;
        judge.run(spec)
    }
}

/// DOMJudge output validators: `<infile> <difffile> <feedback_dir>` with the
/// solution output streamed on stdin; exit 42 accepts, 43 rejects.
struct DomJudgeRunner;

impl JudgeRunner for DomJudgeRunner {
    fn name(&self) -> &'static str {
        "domjudge"
    }

    fn run(&self, judge: &dyn Code, request: &JudgeRequest) -> BoxTask {
        let feedback_dir = request.judgefile.with_extension(crate::consts::FEEDBACK_EXT);
        let _ = fileutil::make_dir(&feedback_dir);
        let mut spec = RunSpec::new(
            request.cwd.clone(),
            InputSource::File(request.outfile.clone()),
            OutputSink::File(request.judgefile.clone()),
        );
        spec.args = vec![
            request.infile.display().to_string(),
            request.difffile.display().to_string(),
            feedback_dir.display().to_string(),
        ];
        spec.redirect_error = true;
        spec.protocol = ExitProtocol::DomJudge;
        judge.run(spec)
    }
}

/// Judge-variant table, frozen before the scheduler starts.
pub struct JudgeVariants {
    variants: Vec<Rc<dyn JudgeRunner>>,
}

impl JudgeVariants {
    pub fn with_builtins() -> Self {
        Self {
            variants: vec![
                Rc::new(RimeJudgeRunner),
                Rc::new(TestlibJudgeRunner),
                Rc::new(DomJudgeRunner),
            ],
        }
    }

    pub fn register(&mut self, runner: Rc<dyn JudgeRunner>) -> Result<()> {
        if self.get(runner.name()).is_some() {
            bail!("duplicate judge variant: {}", runner.name());
        }
        self.variants.push(runner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn JudgeRunner>> {
        self.variants.iter().find(|v| v.name() == name).cloned()
    }

    pub fn default_variant(&self) -> Rc<dyn JudgeRunner> {
        self.get("rime").expect("rime judge variant is built in")
    }
}

/// One interactive session between a reactive judge and a solution.
#[derive(Clone, Debug)]
pub struct ReactiveRequest {
    pub solution_argv: Vec<String>,
    pub solution_cwd: PathBuf,
    pub infile: PathBuf,
    /// Transcript target; doubles as the reference output on REFRUN.
    pub outfile: PathBuf,
    pub judgefile: PathBuf,
    pub cwd: PathBuf,
    pub timeout: Option<f64>,
    pub precise: bool,
}

pub trait ReactiveRunner {
    fn name(&self) -> &'static str;

    /// True when the runner's exit status already encodes accept/reject;
    /// false when rejection only shows in the transcript left for the
    /// ordinary judges.
    fn rejects_by_exit(&self) -> bool;

    fn run(&self, reactive: &dyn Code, request: &ReactiveRequest) -> BoxTask;
}

/// Cross-connected pipes: the reactive talks to the solution directly and
/// its exit status is the ruling. The transcript file is left empty.
struct PipeReactiveRunner;

impl ReactiveRunner for PipeReactiveRunner {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn rejects_by_exit(&self) -> bool {
        true
    }

    fn run(&self, reactive: &dyn Code, request: &ReactiveRequest) -> BoxTask {
        let _ = fileutil::create_empty_file(&request.outfile);
        let mut judge_argv = reactive.run_argv();
        judge_argv.push(request.infile.display().to_string());
        Box::new(ReactivePairTask::new(ReactivePairSpec {
            solution_argv: request.solution_argv.clone(),
            solution_cwd: request.solution_cwd.clone(),
            judge_argv,
            judge_cwd: request.cwd.clone(),
            judge_log: request.judgefile.clone(),
            timeout: request.timeout,
            exclusive: request.precise,
        }))
    }
}

/// The reactive receives the solution's command line as one argument and
/// drives it itself, writing the transcript to its stdout.
struct CommandReactiveRunner;

impl ReactiveRunner for CommandReactiveRunner {
    fn name(&self) -> &'static str {
        "command"
    }

    fn rejects_by_exit(&self) -> bool {
        false
    }

    fn run(&self, reactive: &dyn Code, request: &ReactiveRequest) -> BoxTask {
        let mut spec = RunSpec::new(
            request.cwd.clone(),
            InputSource::File(request.infile.clone()),
            OutputSink::File(request.outfile.clone()),
        );
        spec.args = vec![request.solution_argv.join(" ")];
        spec.redirect_error = true;
        spec.timeout = request.timeout;
        spec.precise = request.precise;
        reactive.run(spec)
    }
}

/// Reactive-variant table, frozen before the scheduler starts.
pub struct ReactiveVariants {
    variants: Vec<Rc<dyn ReactiveRunner>>,
}

impl ReactiveVariants {
    pub fn with_builtins() -> Self {
        Self {
            variants: vec![Rc::new(PipeReactiveRunner), Rc::new(CommandReactiveRunner)],
        }
    }

    pub fn register(&mut self, runner: Rc<dyn ReactiveRunner>) -> Result<()> {
        if self.get(runner.name()).is_some() {
            bail!("duplicate reactive variant: {}", runner.name());
        }
        self.variants.push(runner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn ReactiveRunner>> {
        self.variants.iter().find(|v| v.name() == name).cloned()
    }

    pub fn default_variant(&self) -> Rc<dyn ReactiveRunner> {
        self.get("pipe").expect("pipe reactive variant is built in")
    }
}
