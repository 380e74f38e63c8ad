//! Judgement records: per-case verdicts and per-(solution, testset) results.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::consts;

/// Judgement of one solution on one test case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Not run yet.
    Na,
    Ac,
    Wa,
    Tle,
    Re,
    /// Infrastructure failure.
    Err,
    /// A judge finished with a status other than accept/reject.
    Validator(String),
}

impl Verdict {
    /// Verdicts a judge is allowed to produce; anything else is treated as
    /// infrastructure failure.
    pub fn is_regular(&self) -> bool {
        matches!(self, Verdict::Ac | Verdict::Wa | Verdict::Tle | Verdict::Re)
    }

    pub fn from_display(text: &str) -> Option<Verdict> {
        match text {
            "-" => Some(Verdict::Na),
            "Accepted" => Some(Verdict::Ac),
            "Wrong Answer" => Some(Verdict::Wa),
            "Time Limit Exceeded" => Some(Verdict::Tle),
            "Runtime Error" => Some(Verdict::Re),
            "System Error" => Some(Verdict::Err),
            _ => None,
        }
    }

    /// Short form used in expectation sets ("AC", "WA", "TLE", "RE").
    pub fn from_short(text: &str) -> Option<Verdict> {
        match text {
            "AC" => Some(Verdict::Ac),
            "WA" => Some(Verdict::Wa),
            "TLE" => Some(Verdict::Tle),
            "RE" => Some(Verdict::Re),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Na => f.write_str("-"),
            Verdict::Ac => f.write_str("Accepted"),
            Verdict::Wa => f.write_str("Wrong Answer"),
            Verdict::Tle => f.write_str("Time Limit Exceeded"),
            Verdict::Re => f.write_str("Runtime Error"),
            Verdict::Err => f.write_str("System Error"),
            Verdict::Validator(status) => write!(f, "Validator {status}"),
        }
    }
}

/// A test case is the pair of a generated input and its reference output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub infile: PathBuf,
    pub difffile: PathBuf,
}

impl TestCase {
    pub fn new(infile: PathBuf) -> Self {
        let difffile = infile.with_extension(consts::DIFF_EXT);
        Self { infile, difffile }
    }

    /// Case name used in messages and for derived file names.
    pub fn name(&self) -> String {
        self.infile
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        self.infile
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct TestCaseResult {
    pub verdict: Verdict,
    pub time: Option<f64>,
    pub cached: bool,
}

impl TestCaseResult {
    pub fn new(verdict: Verdict, time: Option<f64>, cached: bool) -> Self {
        Self {
            verdict,
            time,
            cached,
        }
    }
}

pub type TestsetResultRef = Rc<RefCell<TestsetResult>>;

/// Aggregated outcome of one solution over one testset.
///
/// `finalized` flips false→true exactly once; later finalisations are
/// ignored unless explicitly overridden.
#[derive(Clone, Debug)]
pub struct TestsetResult {
    pub problem_name: String,
    pub solution_name: String,
    pub testcases: Vec<TestCase>,
    pub results: HashMap<PathBuf, TestCaseResult>,
    finalized: bool,
    pub expected: bool,
    pub detail: String,
    pub notable_testcase: Option<TestCase>,
}

impl TestsetResult {
    pub fn new(problem_name: &str, solution_name: &str, testcases: Vec<TestCase>) -> Self {
        let results = testcases
            .iter()
            .map(|c| {
                (
                    c.infile.clone(),
                    TestCaseResult::new(Verdict::Na, None, false),
                )
            })
            .collect();
        Self {
            problem_name: problem_name.to_string(),
            solution_name: solution_name.to_string(),
            testcases,
            results,
            finalized: false,
            expected: false,
            detail: String::new(),
            notable_testcase: None,
        }
    }

    pub fn shared(problem_name: &str, solution_name: &str, testcases: Vec<TestCase>) -> TestsetResultRef {
        Rc::new(RefCell::new(Self::new(
            problem_name,
            solution_name,
            testcases,
        )))
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn finalize(&mut self, expected: bool, detail: impl Into<String>) {
        self.finalize_with(expected, detail, None, false);
    }

    pub fn finalize_with(
        &mut self,
        expected: bool,
        detail: impl Into<String>,
        notable_testcase: Option<TestCase>,
        allow_override: bool,
    ) {
        if self.finalized && !allow_override {
            return;
        }
        self.expected = expected;
        self.detail = detail.into();
        self.notable_testcase = notable_testcase;
        self.finalized = true;
    }

    pub fn record_case(&mut self, infile: &Path, result: TestCaseResult) {
        self.results.insert(infile.to_path_buf(), result);
    }

    pub fn is_cached(&self) -> bool {
        self.results.values().any(|r| r.cached)
    }

    pub fn is_accepted(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|r| r.verdict == Verdict::Ac)
    }

    /// Time stats are only meaningful when nothing else competed for the
    /// machine and every case was accepted.
    pub fn is_timing_valid(&self, timing_precise: bool) -> bool {
        timing_precise && self.is_accepted()
    }

    pub fn time_stats(&self, timing_precise: bool) -> String {
        if !self.is_timing_valid(timing_precise) {
            return "max *.**s, acc *.**s".to_string();
        }
        let times: Vec<f64> = self.results.values().filter_map(|r| r.time).collect();
        let max = times.iter().cloned().fold(0.0_f64, f64::max);
        let total: f64 = times.iter().sum();
        format!("max {max:.2}s, acc {total:.2}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn case(name: &str) -> TestCase {
        TestCase::new(PathBuf::from(format!("/out/{name}")))
    }

    #[test]
    fn difffile_defaults_to_in_with_diff_extension() {
        let c = case("t1.in");
        assert_eq!(c.difffile, PathBuf::from("/out/t1.diff"));
        assert_eq!(c.name(), "t1.in");
        assert_eq!(c.stem(), "t1");
    }

    #[test]
    fn finalize_happens_exactly_once() {
        let mut result = TestsetResult::new("p", "sol", vec![case("t1.in")]);
        assert!(!result.is_finalized());
        result.finalize(true, "first");
        result.finalize(false, "second");
        assert!(result.expected);
        assert_eq!(result.detail, "first");

        result.finalize_with(false, "forced", None, true);
        assert_eq!(result.detail, "forced");
        assert!(!result.expected);
    }

    #[test]
    fn time_stats_require_all_accepted_and_precise_timing() {
        let c = case("t1.in");
        let mut result = TestsetResult::new("p", "sol", vec![c.clone()]);
        result.record_case(&c.infile, TestCaseResult::new(Verdict::Ac, Some(0.25), false));
        assert_eq!(result.time_stats(true), "max 0.25s, acc 0.25s");
        assert_eq!(result.time_stats(false), "max *.**s, acc *.**s");

        result.record_case(&c.infile, TestCaseResult::new(Verdict::Wa, None, false));
        assert_eq!(result.time_stats(true), "max *.**s, acc *.**s");
    }

    #[test]
    fn verdict_round_trips_through_display() {
        for v in [Verdict::Ac, Verdict::Wa, Verdict::Tle, Verdict::Re] {
            assert_eq!(Verdict::from_display(&v.to_string()), Some(v.clone()));
            assert!(v.is_regular());
        }
        assert!(!Verdict::Validator("NG".to_string()).is_regular());
        assert_eq!(Verdict::from_short("TLE"), Some(Verdict::Tle));
    }
}
