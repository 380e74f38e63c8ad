//! File-name conventions shared by the whole pipeline.

/// Marker file identifying the project root.
pub const PROJECT_FILE: &str = "rime_project.json";
/// Marker file identifying a problem directory.
pub const PROBLEM_FILE: &str = "rime_problem.json";
/// Marker file identifying a solution directory.
pub const SOLUTION_FILE: &str = "rime_solution.json";
/// Marker file identifying a testset directory.
pub const TESTSET_FILE: &str = "rime_testset.json";

/// Empty marker whose mtime records the last successful build.
pub const STAMP_FILE: &str = ".stamp";

pub const IN_EXT: &str = "in";
pub const DIFF_EXT: &str = "diff";
pub const OUT_EXT: &str = "out";
pub const JUDGE_EXT: &str = "judge";
pub const CACHE_EXT: &str = "cache";
pub const LOG_EXT: &str = "log";
pub const VALIDATION_EXT: &str = "validation";
pub const FEEDBACK_EXT: &str = "feedback";

/// Name of the build output directory created under each problem.
pub const OUT_DIR: &str = "rime-out";
