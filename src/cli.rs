use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rime", version = "0.1.0", about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Run multiple jobs in parallel (0 = serial execution)
    #[arg(short = 'j', long = "jobs", default_value_t = 0)]
    pub jobs: usize,

    /// Turn on debugging (repeat for more detail)
    #[arg(short = 'd', long = "debug", action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Cache test results on disk
    #[arg(short = 'C', long = "cache-tests")]
    pub cache_tests: bool,

    /// Do not run timing tasks concurrently
    #[arg(short = 'p', long = "precise")]
    pub precise: bool,

    /// Do not skip tests on failures
    #[arg(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Suppress normal output
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build a target and its dependencies
    Build { target: Option<PathBuf> },
    /// Run tests in a target
    Test { target: Option<PathBuf> },
    /// Clean intermediate files
    Clean { target: Option<PathBuf> },
}

/// Frozen runtime options consulted throughout the pipeline.
#[derive(Clone, Debug)]
pub struct Options {
    pub parallelism: usize,
    pub debug: u8,
    pub cache_tests: bool,
    pub precise: bool,
    pub keep_going: bool,
    pub quiet: bool,
}

impl Options {
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            parallelism: args.jobs,
            debug: args.debug,
            cache_tests: args.cache_tests,
            precise: args.precise,
            keep_going: args.keep_going,
            quiet: args.quiet,
        }
    }

    /// Timings are only trustworthy without concurrent blocked processes.
    pub fn timing_precise(&self) -> bool {
        self.precise || self.parallelism <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_and_target() {
        let args = CliArgs::parse_from(["rime", "-j", "4", "-C", "-p", "test", "some/dir"]);
        let options = Options::from_args(&args);
        assert_eq!(options.parallelism, 4);
        assert!(options.cache_tests);
        assert!(options.precise);
        assert!(!options.keep_going);
        match args.command {
            Command::Test { target } => {
                assert_eq!(target, Some(PathBuf::from("some/dir")));
            }
            _ => panic!("expected test subcommand"),
        }
    }

    #[test]
    fn timing_is_precise_when_serial() {
        let args = CliArgs::parse_from(["rime", "build"]);
        assert!(Options::from_args(&args).timing_precise());
        let args = CliArgs::parse_from(["rime", "-j", "2", "build"]);
        assert!(!Options::from_args(&args).timing_precise());
    }
}
