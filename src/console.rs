//! User-facing output: action lines, log blocks, and the error recorder.

use std::cell::RefCell;
use std::io::IsTerminal;

use crate::cli::Options;

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Console writer shared by the whole run.
///
/// Action lines look like `[ COMPILE ] problem/solution: detail`. Progress
/// lines (per-case PASSED chatter) are only shown when debugging is on.
#[derive(Clone, Debug)]
pub struct Console {
    quiet: bool,
    debug: u8,
    color: bool,
}

impl Console {
    pub fn new(quiet: bool, debug: u8) -> Self {
        Self {
            quiet,
            debug,
            color: std::io::stdout().is_terminal(),
        }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.color {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    pub fn print(&self, msg: &str) {
        if !self.quiet {
            println!("{msg}");
        }
    }

    /// One pipeline step on one target.
    pub fn print_action(&self, verb: &str, target: &str, detail: &str) {
        if self.quiet {
            return;
        }
        let verb = self.paint(GREEN, &format!("[ {verb:^8} ]"));
        if detail.is_empty() {
            println!("{verb} {target}");
        } else {
            println!("{verb} {target}: {detail}");
        }
    }

    /// Like `print_action`, for high-volume per-case lines.
    pub fn print_progress(&self, verb: &str, target: &str, detail: &str) {
        if self.debug >= 1 {
            self.print_action(verb, target, detail);
        }
    }

    /// Dumps a multi-line artifact (compile log, validator output) verbatim.
    pub fn print_log(&self, log: &str) {
        if self.quiet {
            return;
        }
        for line in log.lines() {
            println!("{line}");
        }
    }

    pub fn print_error(&self, msg: &str) {
        eprintln!("{} {msg}", self.paint(RED, "ERROR:"));
    }

    pub fn print_warning(&self, msg: &str) {
        eprintln!("{} {msg}", self.paint(YELLOW, "WARNING:"));
    }

    pub fn bold(&self, text: &str) -> String {
        self.paint(BOLD, text)
    }

    pub fn status_ok(&self) -> String {
        self.paint(GREEN, " OK ")
    }

    pub fn status_fail(&self) -> String {
        self.paint(RED, "FAIL")
    }

    pub fn problem_heading(&self, text: &str) -> String {
        self.paint(CYAN, text)
    }
}

/// Accumulates errors and warnings over a run.
///
/// Messages are printed when they occur (unless marked quiet) and reprinted
/// with totals in the final summary. The process exit code reflects whether
/// any error was recorded.
#[derive(Debug, Default)]
pub struct ErrorRecorder {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl ErrorRecorder {
    pub fn error(&mut self, console: &Console, source: &str, reason: &str) {
        let msg = Self::format(source, reason);
        console.print_error(&msg);
        self.errors.push(msg);
    }

    pub fn warning(&mut self, console: &Console, source: &str, reason: &str) {
        let msg = Self::format(source, reason);
        console.print_warning(&msg);
        self.warnings.push(msg);
    }

    /// Records without echoing; used for messages already shown inline.
    pub fn error_quiet(&mut self, source: &str, reason: &str) {
        self.errors.push(Self::format(source, reason));
    }

    fn format(source: &str, reason: &str) -> String {
        if source.is_empty() {
            reason.to_string()
        } else {
            format!("{source}: {reason}")
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_summary(&self, console: &Console) {
        for e in &self.errors {
            console.print_error(e);
        }
        for w in &self.warnings {
            console.print_warning(w);
        }
        console.print(&format!(
            "Total {} errors, {} warnings",
            self.errors.len(),
            self.warnings.len()
        ));
    }
}

/// Everything a pipeline task needs to talk to the user: the frozen
/// options, the console, and the error recorder.
#[derive(Debug)]
pub struct Ui {
    pub options: Options,
    pub console: Console,
    errors: RefCell<ErrorRecorder>,
}

impl Ui {
    pub fn new(options: Options) -> Self {
        let console = Console::new(options.quiet, options.debug);
        Self {
            options,
            console,
            errors: RefCell::new(ErrorRecorder::default()),
        }
    }

    pub fn error(&self, source: &str, reason: &str) {
        self.errors.borrow_mut().error(&self.console, source, reason);
    }

    pub fn warning(&self, source: &str, reason: &str) {
        self.errors.borrow_mut().warning(&self.console, source, reason);
    }

    pub fn error_quiet(&self, source: &str, reason: &str) {
        self.errors.borrow_mut().error_quiet(source, reason);
    }

    pub fn has_errors(&self) -> bool {
        self.errors.borrow().has_errors()
    }

    pub fn print_error_summary(&self) {
        self.errors.borrow().print_summary(&self.console);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_counts_and_formats() {
        let console = Console::new(true, 0);
        let mut recorder = ErrorRecorder::default();
        assert!(!recorder.has_errors());

        recorder.error(&console, "p1/sol", "Compile Error (NG)");
        recorder.warning(&console, "p1/tests", "No test case found");
        recorder.error_quiet("", "standalone");

        assert!(recorder.has_errors());
        assert_eq!(recorder.errors.len(), 2);
        assert_eq!(recorder.errors[0], "p1/sol: Compile Error (NG)");
        assert_eq!(recorder.errors[1], "standalone");
        assert_eq!(recorder.warnings[0], "p1/tests: No test case found");
    }
}
