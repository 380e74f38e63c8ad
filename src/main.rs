use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;

use rime::cli::{CliArgs, Command, Options};
use rime::codes::Registry;
use rime::config::{self, Loader};
use rime::console::Ui;
use rime::summary;
use rime::targets::{self, CommandKind, Ctx};
use rime::taskgraph::{self, TaskValue};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let default_filter = match args.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let options = Options::from_args(&args);
    let (command, target_dir) = match &args.command {
        Command::Build { target } => (CommandKind::Build, target.clone()),
        Command::Test { target } => (CommandKind::Test, target.clone()),
        Command::Clean { target } => (CommandKind::Clean, target.clone()),
    };
    let target_dir = target_dir.unwrap_or_else(|| PathBuf::from("."));
    let target_dir = match target_dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("rime: {}: {e}", target_dir.display());
            return ExitCode::FAILURE;
        }
    };

    let ui = Ui::new(options.clone());
    let Some(root) = config::find_project_root(&target_dir) else {
        ui.error("", "Target directory is missing or not managed by rime");
        ui.print_error_summary();
        return ExitCode::FAILURE;
    };

    let registry = Registry::with_builtins();
    let project = match Loader::new(&registry, &ui).load_project(&root) {
        Ok(project) => Rc::new(project),
        Err(e) => {
            ui.error("", &format!("{e:#}"));
            ui.print_error_summary();
            return ExitCode::FAILURE;
        }
    };

    let mut ctx = Ctx::new(ui);
    ctx.library_dir = project.library_dir.clone();
    let ctx = Rc::new(ctx);

    let Some(target) = targets::find_target(&project, &target_dir) else {
        ctx.ui
            .error("", "Target directory is missing or not managed by rime");
        ctx.ui.print_error_summary();
        return ExitCode::FAILURE;
    };

    let task = target.command_task(command, &ctx);
    let mut graph = taskgraph::new_graph(options.parallelism);
    match graph.run(task) {
        Ok(TaskValue::Tests(results)) => summary::print_test_summary(&results, &ctx.ui),
        Ok(_) => {}
        Err(e) => ctx.ui.error("", &e.to_string()),
    }

    ctx.ui.print_error_summary();
    if ctx.ui.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
