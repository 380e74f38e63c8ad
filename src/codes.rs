//! Per-language program adapters: how a source file is compiled, invoked,
//! and cleaned up, plus the execution tasks shared by all of them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, bail};

use crate::consts;
use crate::fileutil;
use crate::process::{ErrorSink, ExternalProcessTask, InputSource, OutputSink, ProcessSpec};
use crate::taskgraph::{BoxTask, Task, TaskInput, TaskStep, TaskValue};

/// Execution status of a single spawn. Not a judgement, just how the
/// process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    /// Exited abnormally (non-zero exit code).
    Ng,
    /// Killed by a signal other than the CPU-time signal.
    Re,
    /// Killed by the CPU-time signal.
    Tle,
    /// Infrastructure failure, with the reason.
    Failed(String),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => f.write_str("OK"),
            RunStatus::Ng => f.write_str("NG"),
            RunStatus::Re => f.write_str("RE"),
            RunStatus::Tle => f.write_str("TLE"),
            RunStatus::Failed(msg) => f.write_str(msg),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub status: RunStatus,
    pub time: Option<f64>,
}

impl RunResult {
    pub fn new(status: RunStatus) -> Self {
        Self { status, time: None }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}

/// How a child's exit code is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitProtocol {
    /// 0 OK, CPU-time signal TLE, other signals RE, non-zero exits NG.
    Standard,
    /// External judges: 0 accept, 1 reject, anything else is an
    /// infrastructure failure rather than a wrong answer.
    Judge,
    /// DOMJudge output validators: 42 accept, 43 reject.
    DomJudge,
}

impl ExitProtocol {
    fn classify(self, code: i32, elapsed: f64) -> RunResult {
        let status = match self {
            ExitProtocol::Standard => {
                if code == 0 {
                    RunStatus::Ok
                } else if code == -libc::SIGXCPU {
                    RunStatus::Tle
                } else if code < 0 {
                    RunStatus::Re
                } else {
                    RunStatus::Ng
                }
            }
            ExitProtocol::Judge => match code {
                0 => RunStatus::Ok,
                1 => RunStatus::Ng,
                c if c < 0 => RunStatus::Re,
                c => RunStatus::Failed(format!("Exited Abnormally (code {c})")),
            },
            ExitProtocol::DomJudge => match code {
                42 => RunStatus::Ok,
                43 => RunStatus::Ng,
                c => RunStatus::Failed(format!("judge exited with status {c}")),
            },
        };
        RunResult {
            status,
            time: Some(elapsed),
        }
    }
}

/// One invocation of a built code.
#[derive(Clone, Debug)]
pub struct RunSpec {
    /// Extra arguments appended after the code's own `run_argv`.
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub input: InputSource,
    pub output: OutputSink,
    /// Merge stderr into the output instead of discarding it.
    pub redirect_error: bool,
    pub timeout: Option<f64>,
    pub precise: bool,
    pub protocol: ExitProtocol,
}

impl RunSpec {
    pub fn new(cwd: PathBuf, input: InputSource, output: OutputSink) -> Self {
        Self {
            args: Vec::new(),
            cwd,
            input,
            output,
            redirect_error: false,
            timeout: None,
            precise: false,
            protocol: ExitProtocol::Standard,
        }
    }
}

/// A program that can be compiled, run, and cleaned.
pub trait Code {
    fn src_name(&self) -> &str;
    fn out_dir(&self) -> &Path;

    fn src_path(&self) -> PathBuf;

    /// Skip the COMPILE progress line for trivial codes.
    fn quiet_compile(&self) -> bool {
        false
    }

    /// Judge/reactive runner variant selected in the configuration.
    fn variant(&self) -> Option<&str> {
        None
    }

    /// Command line that invokes the built artifact.
    fn run_argv(&self) -> Vec<String>;

    /// Task producing a [`RunResult`] for the compilation.
    fn compile(&self) -> BoxTask;

    /// Task producing a [`RunResult`] for one run.
    fn run(&self, spec: RunSpec) -> BoxTask;

    fn clean(&self) -> Result<()> {
        fileutil::remove_tree(self.out_dir())
    }

    fn log_name(&self) -> String {
        format!("{}.{}", stem(self.src_name()), consts::LOG_EXT)
    }

    fn read_compile_log(&self) -> Option<String> {
        fileutil::read_file(&self.out_dir().join(self.log_name()))
    }
}

pub type CodeRef = Rc<dyn Code>;

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// Copies the code's sources and declared library dependencies into its
/// out-dir so compilation sees generated files and headers side by side.
fn prepare_out_dir(src_dir: &Path, out_dir: &Path, dependencies: &[PathBuf]) -> Result<()> {
    fileutil::make_dir(out_dir)?;
    if src_dir.is_dir() {
        fileutil::copy_tree(src_dir, out_dir)?;
    }
    for dep in dependencies {
        let name = dep
            .file_name()
            .with_context(|| format!("bad dependency path {}", dep.display()))?;
        fileutil::copy_any(dep, &out_dir.join(name))?;
    }
    Ok(())
}

/// Shared construction parameters for code factories.
#[derive(Clone, Debug)]
pub struct CodeParams {
    pub src_name: String,
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    pub dependencies: Vec<PathBuf>,
    pub variant: Option<String>,
}

// ---------------------------------------------------------------------------
// Compiled and interpreted languages

/// A code whose compile/run command lines are fixed at construction from a
/// per-language template. Covers both natively compiled languages and
/// interpreters with an empty compile step.
pub struct CompiledCode {
    params: CodeParams,
    compile_argv: Vec<String>,
    run_argv: Vec<String>,
    quiet: bool,
}

impl Code for CompiledCode {
    fn src_name(&self) -> &str {
        &self.params.src_name
    }

    fn out_dir(&self) -> &Path {
        &self.params.out_dir
    }

    fn src_path(&self) -> PathBuf {
        self.params.src_dir.join(&self.params.src_name)
    }

    fn quiet_compile(&self) -> bool {
        self.quiet
    }

    fn variant(&self) -> Option<&str> {
        self.params.variant.as_deref()
    }

    fn run_argv(&self) -> Vec<String> {
        self.run_argv.clone()
    }

    fn compile(&self) -> BoxTask {
        Box::new(CompileTask {
            src_dir: self.params.src_dir.clone(),
            out_dir: self.params.out_dir.clone(),
            dependencies: self.params.dependencies.clone(),
            compile_argv: self.compile_argv.clone(),
            log_name: self.log_name(),
            started: false,
        })
    }

    fn run(&self, spec: RunSpec) -> BoxTask {
        Box::new(ExecTask::new(self.run_argv(), spec))
    }
}

/// Compilation: prepare the out-dir, then run the compiler inside it with
/// stderr merged into the log file.
struct CompileTask {
    src_dir: PathBuf,
    out_dir: PathBuf,
    dependencies: Vec<PathBuf>,
    compile_argv: Vec<String>,
    log_name: String,
    started: bool,
}

impl Task for CompileTask {
    fn label(&self) -> String {
        format!("compile {}", self.out_dir.display())
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        if !self.started {
            self.started = true;
            if let Err(e) = prepare_out_dir(&self.src_dir, &self.out_dir, &self.dependencies) {
                return TaskStep::Return(TaskValue::Run(RunResult::new(RunStatus::Failed(
                    format!("On compiling: {e:#}"),
                ))));
            }
            if self.compile_argv.is_empty() {
                return TaskStep::Return(TaskValue::Run(RunResult::new(RunStatus::Ok)));
            }
            return TaskStep::Single(Box::new(ExternalProcessTask::new(ProcessSpec {
                argv: self.compile_argv.clone(),
                cwd: self.out_dir.clone(),
                stdin: InputSource::Null,
                stdout: OutputSink::File(self.out_dir.join(&self.log_name)),
                stderr: ErrorSink::Stdout,
                timeout: None,
                exclusive: false,
            })));
        }
        match input {
            TaskInput::Value(TaskValue::Process(outcome)) => TaskStep::Return(TaskValue::Run(
                ExitProtocol::Standard.classify(outcome.code, outcome.elapsed),
            )),
            TaskInput::Error(e) => TaskStep::Return(TaskValue::Run(RunResult::new(
                RunStatus::Failed(format!("On compiling: {e}")),
            ))),
            other => TaskStep::Return(TaskValue::Run(RunResult::new(RunStatus::Failed(format!(
                "On compiling: unexpected resumption {other:?}"
            ))))),
        }
    }
}

/// One run of a built code, including the TLE re-run rule: a non-precise
/// run that times out is repeated once in exclusive mode, because contention
/// with concurrent jobs can inflate the first measurement. The second run's
/// verdict is authoritative. Stdio is reopened per attempt, so output files
/// start empty again.
struct ExecTask {
    argv: Vec<String>,
    spec: RunSpec,
    reran: bool,
}

impl ExecTask {
    fn new(mut run_argv: Vec<String>, spec: RunSpec) -> Self {
        run_argv.extend(spec.args.iter().cloned());
        Self {
            argv: run_argv,
            spec,
            reran: false,
        }
    }

    fn process_task(&self, exclusive: bool) -> BoxTask {
        Box::new(ExternalProcessTask::new(ProcessSpec {
            argv: self.argv.clone(),
            cwd: self.spec.cwd.clone(),
            stdin: self.spec.input.clone(),
            stdout: self.spec.output.clone(),
            stderr: if self.spec.redirect_error {
                ErrorSink::Stdout
            } else {
                ErrorSink::Null
            },
            timeout: self.spec.timeout,
            exclusive,
        }))
    }
}

impl Task for ExecTask {
    fn label(&self) -> String {
        format!("run {}", self.argv.first().map_or("?", String::as_str))
    }

    fn step(&mut self, input: TaskInput) -> TaskStep {
        match input {
            TaskInput::Start => TaskStep::Single(self.process_task(self.spec.precise)),
            TaskInput::Value(TaskValue::Process(outcome)) => {
                let retry = self.spec.protocol == ExitProtocol::Standard
                    && !self.spec.precise
                    && !self.reran
                    && outcome.is_tle();
                if retry {
                    self.reran = true;
                    return TaskStep::Single(self.process_task(true));
                }
                TaskStep::Return(TaskValue::Run(
                    self.spec.protocol.classify(outcome.code, outcome.elapsed),
                ))
            }
            TaskInput::Error(e) => TaskStep::Return(TaskValue::Run(RunResult::new(
                RunStatus::Failed(format!("On execution: {e}")),
            ))),
            other => TaskStep::Return(TaskValue::Run(RunResult::new(RunStatus::Failed(format!(
                "On execution: unexpected resumption {other:?}"
            ))))),
        }
    }
}

// ---------------------------------------------------------------------------
// Shebang scripts

/// Interpreted code driven by the source file's `#!` line. Compilation only
/// checks that the interpreter actually exists.
pub struct ScriptCode {
    params: CodeParams,
}

impl ScriptCode {
    fn interpreter_argv(&self) -> Result<Vec<String>> {
        let path = self.src_path();
        let content = fileutil::read_file(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let first = content.lines().next().unwrap_or("");
        let Some(line) = first.strip_prefix("#!") else {
            bail!("{} has no shebang line", self.params.src_name);
        };
        let mut tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            bail!("{} has an empty shebang line", self.params.src_name);
        }
        if Path::new(&tokens[0]).file_name().is_some_and(|n| n == "env") {
            tokens.remove(0);
            if tokens.is_empty() {
                bail!("{} shebang names no interpreter", self.params.src_name);
            }
            let resolved = fileutil::locate_binary(&tokens[0])
                .with_context(|| format!("interpreter not found on PATH: {}", tokens[0]))?;
            tokens[0] = resolved.display().to_string();
        } else if !Path::new(&tokens[0]).is_file() {
            bail!("interpreter not found: {}", tokens[0]);
        }
        Ok(tokens)
    }
}

impl Code for ScriptCode {
    fn src_name(&self) -> &str {
        &self.params.src_name
    }

    fn out_dir(&self) -> &Path {
        &self.params.out_dir
    }

    fn src_path(&self) -> PathBuf {
        self.params.src_dir.join(&self.params.src_name)
    }

    fn quiet_compile(&self) -> bool {
        true
    }

    fn variant(&self) -> Option<&str> {
        self.params.variant.as_deref()
    }

    fn run_argv(&self) -> Vec<String> {
        let script = self.params.out_dir.join(&self.params.src_name);
        match self.interpreter_argv() {
            Ok(mut argv) => {
                argv.push(script.display().to_string());
                argv
            }
            // Let the spawn fail with a readable status.
            Err(_) => vec![script.display().to_string()],
        }
    }

    fn compile(&self) -> BoxTask {
        let outcome = prepare_out_dir(
            &self.params.src_dir,
            &self.params.out_dir,
            &self.params.dependencies,
        )
        .and_then(|()| self.interpreter_argv().map(|_| ()));
        let result = match outcome {
            Ok(()) => RunResult::new(RunStatus::Ok),
            Err(e) => RunResult::new(RunStatus::Failed(format!("On compiling: {e:#}"))),
        };
        Box::new(ImmediateTask {
            label: format!("check {}", self.params.src_name),
            value: Some(TaskValue::Run(result)),
        })
    }

    fn run(&self, spec: RunSpec) -> BoxTask {
        Box::new(ExecTask::new(self.run_argv(), spec))
    }
}

/// A task that already knows its answer.
struct ImmediateTask {
    label: String,
    value: Option<TaskValue>,
}

impl Task for ImmediateTask {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn step(&mut self, _input: TaskInput) -> TaskStep {
        TaskStep::Return(self.value.take().unwrap_or(TaskValue::Unit))
    }
}

// ---------------------------------------------------------------------------
// Internal diff judge

/// The default judge: a textual `diff -u` between the reference output and
/// the solution output. No compilation.
pub struct DiffCode {
    out_dir: PathBuf,
}

impl DiffCode {
    pub fn new(out_dir: PathBuf) -> Self {
        Self { out_dir }
    }

    fn named_arg(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    }
}

impl Code for DiffCode {
    fn src_name(&self) -> &str {
        "diff"
    }

    fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn src_path(&self) -> PathBuf {
        self.out_dir.join("diff")
    }

    fn quiet_compile(&self) -> bool {
        true
    }

    fn run_argv(&self) -> Vec<String> {
        vec!["diff".to_string(), "-u".to_string()]
    }

    fn compile(&self) -> BoxTask {
        Box::new(ImmediateTask {
            label: "check diff".to_string(),
            value: Some(TaskValue::Run(RunResult::new(RunStatus::Ok))),
        })
    }

    /// `args` is the judge's named-parameter list; only `--difffile` and
    /// `--outfile` take part in the comparison.
    fn run(&self, spec: RunSpec) -> BoxTask {
        let difffile = Self::named_arg(&spec.args, "--difffile");
        let outfile = Self::named_arg(&spec.args, "--outfile");
        let (Some(difffile), Some(outfile)) = (difffile, outfile) else {
            return Box::new(ImmediateTask {
                label: "diff".to_string(),
                value: Some(TaskValue::Run(RunResult::new(RunStatus::Failed(
                    "On execution: diff judge needs --difffile and --outfile".to_string(),
                )))),
            });
        };
        let argv = vec!["diff".to_string(), "-u".to_string(), difffile, outfile];
        let mut spec = spec;
        spec.args = Vec::new();
        spec.protocol = ExitProtocol::Standard;
        Box::new(ExecTask::new(argv, spec))
    }

    fn clean(&self) -> Result<()> {
        Ok(())
    }

    fn read_compile_log(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Language registry

type CodeFactory = fn(CodeParams) -> CodeRef;

pub struct LanguageEntry {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    factory: CodeFactory,
}

/// Name- and extension-keyed table of language adapters. Built once at
/// startup and frozen before the scheduler runs, so lookups need no
/// synchronisation.
pub struct Registry {
    entries: Vec<LanguageEntry>,
}

impl Registry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
        };
        for entry in builtin_languages() {
            registry
                .register(entry)
                .expect("builtin language table is consistent");
        }
        registry
    }

    pub fn register(&mut self, entry: LanguageEntry) -> Result<()> {
        for existing in &self.entries {
            if existing.name == entry.name {
                bail!("duplicate language name: {}", entry.name);
            }
            if let Some(ext) = existing
                .extensions
                .iter()
                .find(|e| entry.extensions.contains(e))
            {
                bail!("duplicate language extension: {ext}");
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn create_by_name(&self, name: &str, params: CodeParams) -> Option<CodeRef> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| (e.factory)(params))
    }

    pub fn create_by_extension(&self, params: CodeParams) -> Option<CodeRef> {
        let ext = params.src_name.rsplit_once('.')?.1.to_string();
        self.entries
            .iter()
            .find(|e| e.extensions.contains(&ext.as_str()))
            .map(|e| (e.factory)(params))
    }
}

fn builtin_languages() -> Vec<LanguageEntry> {
    vec![
        LanguageEntry {
            name: "c",
            extensions: &["c"],
            factory: |p| {
                let exe = p.out_dir.join(stem(&p.src_name)).display().to_string();
                compiled(
                    p.clone(),
                    vec!["gcc".into(), "-O2".into(), "-o".into(), exe.clone(), p.src_name, "-lm".into()],
                    vec![exe],
                    false,
                )
            },
        },
        LanguageEntry {
            name: "cxx",
            extensions: &["cc", "cpp", "cxx"],
            factory: |p| {
                let exe = p.out_dir.join(stem(&p.src_name)).display().to_string();
                compiled(
                    p.clone(),
                    vec!["g++".into(), "-O2".into(), "-std=gnu++17".into(), "-o".into(), exe.clone(), p.src_name],
                    vec![exe],
                    false,
                )
            },
        },
        LanguageEntry {
            name: "rust",
            extensions: &["rs"],
            factory: |p| {
                let exe = p.out_dir.join(stem(&p.src_name)).display().to_string();
                compiled(
                    p.clone(),
                    vec!["rustc".into(), "-O".into(), "-o".into(), exe.clone(), p.src_name],
                    vec![exe],
                    false,
                )
            },
        },
        LanguageEntry {
            name: "go",
            extensions: &["go"],
            factory: |p| {
                let exe = p.out_dir.join(stem(&p.src_name)).display().to_string();
                compiled(
                    p.clone(),
                    vec!["go".into(), "build".into(), "-o".into(), exe.clone(), p.src_name],
                    vec![exe],
                    false,
                )
            },
        },
        LanguageEntry {
            name: "kotlin",
            extensions: &["kt"],
            factory: |p| {
                let jar = p
                    .out_dir
                    .join(format!("{}.jar", stem(&p.src_name)))
                    .display()
                    .to_string();
                compiled(
                    p.clone(),
                    vec!["kotlinc".into(), p.src_name, "-include-runtime".into(), "-d".into(), jar.clone()],
                    vec!["java".into(), "-jar".into(), jar],
                    false,
                )
            },
        },
        LanguageEntry {
            name: "java",
            extensions: &["java"],
            factory: |p| {
                let out = p.out_dir.display().to_string();
                compiled(
                    p.clone(),
                    vec!["javac".into(), "-d".into(), out.clone(), p.src_name.clone()],
                    vec![
                        "java".into(),
                        "-Dline.separator=\n".into(),
                        "-cp".into(),
                        out,
                        stem(&p.src_name).to_string(),
                    ],
                    false,
                )
            },
        },
        LanguageEntry {
            name: "js",
            extensions: &["js", "mjs"],
            factory: |p| {
                let script = p.out_dir.join(&p.src_name).display().to_string();
                compiled(p.clone(), Vec::new(), vec!["node".into(), script], true)
            },
        },
        LanguageEntry {
            name: "script",
            extensions: &["sh", "py", "pl", "rb"],
            factory: |p| Rc::new(ScriptCode { params: p }),
        },
    ]
}

fn compiled(
    params: CodeParams,
    compile_argv: Vec<String>,
    run_argv: Vec<String>,
    quiet: bool,
) -> CodeRef {
    Rc::new(CompiledCode {
        params,
        compile_argv,
        run_argv,
        quiet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(src_name: &str) -> CodeParams {
        CodeParams {
            src_name: src_name.to_string(),
            src_dir: PathBuf::from("/proj/p/sol"),
            out_dir: PathBuf::from("/proj/p/rime-out/sol"),
            dependencies: Vec::new(),
            variant: None,
        }
    }

    #[test]
    fn registry_picks_language_by_extension() {
        let registry = Registry::with_builtins();
        let code = registry.create_by_extension(params("main.cc")).unwrap();
        assert_eq!(code.src_name(), "main.cc");
        assert_eq!(code.run_argv(), vec!["/proj/p/rime-out/sol/main".to_string()]);
        assert!(registry.create_by_extension(params("main.unknown")).is_none());
    }

    #[test]
    fn registry_rejects_duplicate_extensions() {
        let mut registry = Registry::with_builtins();
        let err = registry
            .register(LanguageEntry {
                name: "c2",
                extensions: &["c"],
                factory: |p| compiled(p, Vec::new(), Vec::new(), true),
            })
            .unwrap_err();
        assert!(err.to_string().contains("duplicate language extension"));
    }

    #[test]
    fn standard_protocol_classifies_raw_statuses() {
        let classify = |code| ExitProtocol::Standard.classify(code, 0.5).status;
        assert_eq!(classify(0), RunStatus::Ok);
        assert_eq!(classify(2), RunStatus::Ng);
        assert_eq!(classify(-libc::SIGXCPU), RunStatus::Tle);
        assert_eq!(classify(-libc::SIGSEGV), RunStatus::Re);
    }

    #[test]
    fn judge_protocol_flags_unexpected_exit_codes() {
        let classify = |code| ExitProtocol::Judge.classify(code, 0.0).status;
        assert_eq!(classify(0), RunStatus::Ok);
        assert_eq!(classify(1), RunStatus::Ng);
        assert_eq!(
            classify(3),
            RunStatus::Failed("Exited Abnormally (code 3)".to_string())
        );
    }

    #[test]
    fn domjudge_protocol_accepts_only_42_and_43() {
        let classify = |code| ExitProtocol::DomJudge.classify(code, 0.0).status;
        assert_eq!(classify(42), RunStatus::Ok);
        assert_eq!(classify(43), RunStatus::Ng);
        assert!(matches!(classify(0), RunStatus::Failed(_)));
    }
}
