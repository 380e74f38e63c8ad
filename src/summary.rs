//! End-of-run test summary.

use crate::console::Ui;
use crate::results::TestsetResultRef;

/// Prints one line per (problem, solution) with the reconciled outcome.
pub fn print_test_summary(results: &[TestsetResultRef], ui: &Ui) {
    if results.is_empty() {
        return;
    }
    ui.console.print("");
    ui.console.print(&ui.console.bold("Test Summary:"));
    let name_width = results
        .iter()
        .map(|r| r.borrow().solution_name.len())
        .max()
        .unwrap_or(0);
    let mut last_problem: Option<String> = None;
    for result in results {
        let result = result.borrow();
        if last_problem.as_deref() != Some(result.problem_name.as_str()) {
            ui.console
                .print(&ui.console.problem_heading(&result.problem_name));
            last_problem = Some(result.problem_name.clone());
        }
        let status = if result.expected {
            ui.console.status_ok()
        } else {
            ui.console.status_fail()
        };
        let cached = if result.is_cached() { " (cached)" } else { "" };
        ui.console.print(&format!(
            "  {:name_width$} {status} {}{cached}",
            result.solution_name, result.detail
        ));
    }
    if !ui.options.timing_precise() {
        ui.console.print("");
        ui.console
            .print("Note: Timings are not displayed when parallel testing is enabled.");
        ui.console.print("      To show them, try -p (--precise).");
    }
}
