//! End-to-end pipeline scenarios over scratch contest trees built from
//! shell scripts: generation, validation, reference outputs, judging,
//! expectations, the TLE re-run, and the on-disk verdict cache.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use rime::cli::Options;
use rime::codes::Registry;
use rime::config::Loader;
use rime::console::Ui;
use rime::results::{TestsetResultRef, Verdict};
use rime::targets::{self, CommandKind, Ctx};
use rime::taskgraph::{self, TaskOutcome, TaskValue};

fn options(parallelism: usize, cache_tests: bool) -> Options {
    Options {
        parallelism,
        debug: 0,
        cache_tests,
        precise: false,
        keep_going: false,
        quiet: true,
    }
}

fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn run(root: &Path, command: CommandKind, options: &Options) -> (Rc<Ctx>, TaskOutcome) {
    let ui = Ui::new(options.clone());
    let registry = Registry::with_builtins();
    let project = Rc::new(Loader::new(&registry, &ui).load_project(root).unwrap());
    let mut ctx = Ctx::new(ui);
    ctx.library_dir = project.library_dir.clone();
    let ctx = Rc::new(ctx);
    let target = targets::find_target(&project, root).expect("project root is a target");
    let task = target.command_task(command, &ctx);
    let outcome = taskgraph::new_graph(options.parallelism).run(task);
    (ctx, outcome)
}

fn test_results(outcome: TaskOutcome) -> Vec<TestsetResultRef> {
    match outcome {
        Ok(TaskValue::Tests(results)) => results,
        other => panic!("expected test results, got {other:?}"),
    }
}

fn result_for<'a>(
    results: &'a [TestsetResultRef],
    solution: &str,
) -> &'a TestsetResultRef {
    results
        .iter()
        .find(|r| r.borrow().solution_name == solution)
        .unwrap_or_else(|| panic!("no result for {solution}"))
}

/// A+B: twenty generated pairs, a validator, and a reference solution.
fn seed_aplusb(root: &Path, time_limit: f64) {
    write_file(root, "rime_project.json", "{}");
    write_file(
        root,
        "aplusb/rime_problem.json",
        &format!(
            r#"{{"time_limit": {time_limit}, "title": "A+B", "reference_solution": "ref"}}"#
        ),
    );
    write_file(root, "aplusb/ref/rime_solution.json", "{}");
    write_file(
        root,
        "aplusb/ref/main.sh",
        "#!/bin/sh\nread a b\necho $((a + b))\n",
    );
    write_file(
        root,
        "aplusb/tests/rime_testset.json",
        r#"{"generators": ["gen.sh"], "validators": ["validate.sh"]}"#,
    );
    write_file(
        root,
        "aplusb/tests/gen.sh",
        "#!/bin/sh\ni=1\nwhile [ $i -le 20 ]; do\n  echo \"$i $((i * 3))\" > \"test$i.in\"\n  i=$((i + 1))\ndone\n",
    );
    write_file(
        root,
        "aplusb/tests/validate.sh",
        "#!/bin/sh\ngrep -Eq '^[0-9]+ [0-9]+$'\n",
    );
}

#[test]
fn correct_solution_is_accepted_on_all_cases() {
    let tmp = tempfile::tempdir().unwrap();
    seed_aplusb(tmp.path(), 5.0);
    // A second correct solution in another flavour must match the reference.
    write_file(tmp.path(), "aplusb/alt/rime_solution.json", "{}");
    write_file(
        tmp.path(),
        "aplusb/alt/main.sh",
        "#!/bin/sh\nawk '{ print $1 + $2 }'\n",
    );

    let (ctx, outcome) = run(tmp.path(), CommandKind::Test, &options(0, false));
    let results = test_results(outcome);
    assert_eq!(results.len(), 2);
    for result in &results {
        let result = result.borrow();
        assert!(result.expected, "{}: {}", result.solution_name, result.detail);
        assert_eq!(result.testcases.len(), 20);
        for case_result in result.results.values() {
            assert_eq!(case_result.verdict, Verdict::Ac);
        }
        assert!(result.detail.starts_with("max "), "{}", result.detail);
    }
    assert!(!ctx.ui.has_errors());

    let out_dir = tmp.path().join("aplusb/rime-out/tests");
    let diffs = fs::read_dir(&out_dir)
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().is_some_and(|x| x == "diff")
        })
        .count();
    assert_eq!(diffs, 20);
    assert!(out_dir.join(".stamp").is_file());
}

#[test]
fn challenge_case_solution_passes_by_failing() {
    let tmp = tempfile::tempdir().unwrap();
    seed_aplusb(tmp.path(), 5.0);
    write_file(
        tmp.path(),
        "aplusb/wrong/rime_solution.json",
        r#"{"challenge_cases": ["*.in"]}"#,
    );
    write_file(
        tmp.path(),
        "aplusb/wrong/main.sh",
        "#!/bin/sh\nread a b\necho $((a - b))\n",
    );

    let (ctx, outcome) = run(tmp.path(), CommandKind::Test, &options(0, false));
    let results = test_results(outcome);
    {
        let wrong = result_for(&results, "wrong").borrow();
        assert!(wrong.expected, "{}", wrong.detail);
        assert_eq!(wrong.detail, "Expectedly Failed");
        assert_eq!(wrong.testcases.len(), 20);
        for case_result in wrong.results.values() {
            assert_eq!(case_result.verdict, Verdict::Wa);
        }
    }
    assert!(!ctx.ui.has_errors());
}

#[test]
fn unknown_challenge_pattern_fails_the_solution() {
    let tmp = tempfile::tempdir().unwrap();
    seed_aplusb(tmp.path(), 5.0);
    write_file(
        tmp.path(),
        "aplusb/wrong/rime_solution.json",
        r#"{"challenge_cases": ["nonexistent.in"]}"#,
    );
    write_file(
        tmp.path(),
        "aplusb/wrong/main.sh",
        "#!/bin/sh\nread a b\necho $((a - b))\n",
    );

    let (ctx, outcome) = run(tmp.path(), CommandKind::Test, &options(0, false));
    let results = test_results(outcome);
    {
        let wrong = result_for(&results, "wrong").borrow();
        assert!(!wrong.expected);
        assert_eq!(wrong.detail, "Challenge case not found: nonexistent.in");
    }
    assert!(ctx.ui.has_errors());
}

fn seed_single_case(root: &Path, time_limit: f64, testset_json: &str) {
    write_file(root, "rime_project.json", "{}");
    write_file(
        root,
        "p1/rime_problem.json",
        &format!(r#"{{"time_limit": {time_limit}, "reference_solution": "ref"}}"#),
    );
    write_file(root, "p1/ref/rime_solution.json", "{}");
    write_file(
        root,
        "p1/ref/main.sh",
        "#!/bin/sh\nread a b\necho $((a + b))\n",
    );
    write_file(root, "p1/tests/rime_testset.json", testset_json);
    write_file(
        root,
        "p1/tests/gen.sh",
        "#!/bin/sh\necho \"1 2\" > test1.in\n",
    );
}

#[test]
fn tle_verdict_comes_from_a_single_exclusive_rerun() {
    let tmp = tempfile::tempdir().unwrap();
    seed_single_case(tmp.path(), 0.3, r#"{"generators": ["gen.sh"]}"#);
    // Counts its own invocations, then outlives the time limit.
    write_file(tmp.path(), "p1/slow/rime_solution.json", "{}");
    write_file(
        tmp.path(),
        "p1/slow/main.sh",
        "#!/bin/sh\necho run >> runs.cnt\nexec sleep 2\n",
    );
    write_file(
        tmp.path(),
        "p1/expects_tle/rime_solution.json",
        r#"{"expected_verdicts": ["TLE"]}"#,
    );
    write_file(
        tmp.path(),
        "p1/expects_tle/main.sh",
        "#!/bin/sh\nexec sleep 2\n",
    );

    let (ctx, outcome) = run(tmp.path(), CommandKind::Test, &options(2, false));
    let results = test_results(outcome);
    {
        let slow = result_for(&results, "slow").borrow();
        assert!(!slow.expected);
        assert_eq!(slow.detail, "test1.in: Time Limit Exceeded");
        let case = slow.results.values().next().unwrap();
        assert_eq!(case.verdict, Verdict::Tle);
    }
    {
        let expects = result_for(&results, "expects_tle").borrow();
        assert!(expects.expected, "{}", expects.detail);
    }
    assert!(ctx.ui.has_errors());

    // First measurement plus exactly one precise re-run.
    let runs = fs::read_to_string(tmp.path().join("p1/rime-out/slow/runs.cnt")).unwrap();
    assert_eq!(runs.lines().count(), 2);
}

#[test]
fn judge_crash_is_an_infrastructure_failure_not_a_wrong_answer() {
    let tmp = tempfile::tempdir().unwrap();
    seed_single_case(
        tmp.path(),
        5.0,
        r#"{"generators": ["gen.sh"], "judges": ["judge.sh"]}"#,
    );
    write_file(tmp.path(), "p1/tests/judge.sh", "#!/bin/sh\nexit 3\n");

    let (ctx, outcome) = run(tmp.path(), CommandKind::Test, &options(0, false));
    let results = test_results(outcome);
    {
        let reference = result_for(&results, "ref").borrow();
        assert!(!reference.expected);
        assert_eq!(reference.detail, "test1.in: Judge Error");
        let case = reference.results.values().next().unwrap();
        assert!(
            matches!(case.verdict, Verdict::Validator(_)),
            "{:?}",
            case.verdict
        );
    }
    assert!(ctx.ui.has_errors());
    assert!(
        tmp.path().join("p1/rime-out/ref/test1.judge").is_file(),
        "judge journal must be written"
    );
}

#[test]
fn rejecting_judge_yields_wrong_answer() {
    let tmp = tempfile::tempdir().unwrap();
    seed_single_case(
        tmp.path(),
        5.0,
        r#"{"generators": ["gen.sh"], "judges": ["judge.sh"]}"#,
    );
    write_file(tmp.path(), "p1/tests/judge.sh", "#!/bin/sh\nexit 1\n");

    let (_ctx, outcome) = run(tmp.path(), CommandKind::Test, &options(0, false));
    let results = test_results(outcome);
    let reference = result_for(&results, "ref").borrow();
    assert!(!reference.expected);
    assert_eq!(reference.detail, "test1.in: Wrong Answer");
}

#[test]
fn on_disk_cache_skips_untouched_cases() {
    let tmp = tempfile::tempdir().unwrap();
    write_file(tmp.path(), "rime_project.json", "{}");
    write_file(
        tmp.path(),
        "p1/rime_problem.json",
        r#"{"time_limit": 5.0, "reference_solution": "ref"}"#,
    );
    write_file(tmp.path(), "p1/ref/rime_solution.json", "{}");
    write_file(
        tmp.path(),
        "p1/ref/main.sh",
        "#!/bin/sh\necho run >> runs.cnt\nread a b\necho $((a + b))\n",
    );
    write_file(
        tmp.path(),
        "p1/tests/rime_testset.json",
        r#"{"generators": ["gen.sh"]}"#,
    );
    write_file(
        tmp.path(),
        "p1/tests/gen.sh",
        "#!/bin/sh\nfor i in 1 2 3; do echo \"$i $i\" > \"test$i.in\"; done\n",
    );

    let cached = options(0, true);
    let (_ctx, outcome) = run(tmp.path(), CommandKind::Test, &cached);
    let results = test_results(outcome);
    assert!(!result_for(&results, "ref").borrow().is_cached());
    let runs_file = tmp.path().join("p1/rime-out/ref/runs.cnt");
    // Three reference runs plus three judged runs.
    let first_count = fs::read_to_string(&runs_file).unwrap().lines().count();
    assert_eq!(first_count, 6);

    let (_ctx, outcome) = run(tmp.path(), CommandKind::Test, &cached);
    let results = test_results(outcome);
    assert!(result_for(&results, "ref").borrow().is_cached());
    let second_count = fs::read_to_string(&runs_file).unwrap().lines().count();
    assert_eq!(second_count, first_count, "cached cases must not re-run");

    // Touching the source invalidates both the build stamp and the cache.
    std::thread::sleep(std::time::Duration::from_millis(30));
    write_file(
        tmp.path(),
        "p1/ref/main.sh",
        "#!/bin/sh\necho run >> runs.cnt\nread a b\necho $((a + b))\n",
    );
    let (_ctx, outcome) = run(tmp.path(), CommandKind::Test, &cached);
    let results = test_results(outcome);
    assert!(!result_for(&results, "ref").borrow().is_cached());
    let third_count = fs::read_to_string(&runs_file).unwrap().lines().count();
    assert!(third_count > second_count);
}

#[test]
fn validation_failure_fails_the_build() {
    let tmp = tempfile::tempdir().unwrap();
    seed_aplusb(tmp.path(), 5.0);
    // One generated case breaks the input format.
    write_file(
        tmp.path(),
        "aplusb/tests/gen.sh",
        "#!/bin/sh\necho \"1 2\" > test1.in\necho \"bad line\" > test2.in\n",
    );

    let (ctx, outcome) = run(tmp.path(), CommandKind::Build, &options(0, false));
    assert!(matches!(outcome, Ok(TaskValue::Bool(false))));
    assert!(ctx.ui.has_errors());
    assert!(
        !tmp.path().join("aplusb/rime-out/tests/.stamp").exists(),
        "a failed build must not be stamped"
    );
}

#[test]
fn second_build_is_fully_cached() {
    let tmp = tempfile::tempdir().unwrap();
    seed_aplusb(tmp.path(), 5.0);
    // Leave a marker outside the testset out-dir, which rebuilds recreate.
    write_file(
        tmp.path(),
        "aplusb/tests/gen.sh",
        "#!/bin/sh\necho g >> ../genmark.cnt\necho \"1 2\" > test1.in\n",
    );

    let plain = options(0, false);
    let (ctx, outcome) = run(tmp.path(), CommandKind::Build, &plain);
    assert!(matches!(outcome, Ok(TaskValue::Bool(true))), "{outcome:?}");
    assert!(!ctx.ui.has_errors());
    let marker = tmp.path().join("aplusb/rime-out/genmark.cnt");
    assert_eq!(fs::read_to_string(&marker).unwrap().lines().count(), 1);

    let (_ctx, outcome) = run(tmp.path(), CommandKind::Build, &plain);
    assert!(matches!(outcome, Ok(TaskValue::Bool(true))));
    assert_eq!(
        fs::read_to_string(&marker).unwrap().lines().count(),
        1,
        "a cached build must not re-run generators"
    );
}

#[test]
fn empty_testset_warns_but_builds() {
    let tmp = tempfile::tempdir().unwrap();
    write_file(tmp.path(), "rime_project.json", "{}");
    write_file(
        tmp.path(),
        "p1/rime_problem.json",
        r#"{"time_limit": 1.0}"#,
    );
    write_file(tmp.path(), "p1/ref/rime_solution.json", "{}");
    write_file(tmp.path(), "p1/ref/main.sh", "#!/bin/sh\ncat\n");
    write_file(tmp.path(), "p1/tests/rime_testset.json", "{}");

    let (ctx, outcome) = run(tmp.path(), CommandKind::Build, &options(0, false));
    assert!(matches!(outcome, Ok(TaskValue::Bool(true))), "{outcome:?}");
    assert!(!ctx.ui.has_errors());
    assert!(tmp.path().join("p1/rime-out/tests/.stamp").is_file());
}

#[test]
fn clean_removes_build_outputs() {
    let tmp = tempfile::tempdir().unwrap();
    seed_single_case(tmp.path(), 5.0, r#"{"generators": ["gen.sh"]}"#);

    let plain = options(0, false);
    let (_ctx, outcome) = run(tmp.path(), CommandKind::Build, &plain);
    assert!(matches!(outcome, Ok(TaskValue::Bool(true))));
    assert!(tmp.path().join("p1/rime-out").is_dir());

    let (ctx, outcome) = run(tmp.path(), CommandKind::Clean, &plain);
    assert!(matches!(outcome, Ok(TaskValue::Bool(true))));
    assert!(!ctx.ui.has_errors());
    assert!(!tmp.path().join("p1/rime-out").exists());
}
