//! Opt-in on-disk cache of per-case verdicts.
//!
//! Each (solution, case) pair gets a `<case>.cache` file holding a small
//! JSON record. A cached verdict is only trusted when both the solution
//! source and the case input are older than the cache file. Read and write
//! failures are non-fatal and degrade to a normal run.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fileutil;
use crate::results::{TestCaseResult, Verdict};

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    verdict: String,
    time: Option<f64>,
}

/// Returns the cached result when it is still fresh and readable. Files in
/// any other serialisation than the JSON record are rejected as misses.
pub fn load(cache_file: &Path, solution_src: &Path, infile: &Path) -> Option<TestCaseResult> {
    let cache_mtime = fileutil::modified_time(cache_file);
    if fileutil::modified_time(solution_src) >= cache_mtime
        || fileutil::modified_time(infile) >= cache_mtime
    {
        return None;
    }
    let content = fileutil::read_file(cache_file)?;
    let record: CacheRecord = serde_json::from_str(&content).ok()?;
    let verdict = Verdict::from_display(&record.verdict)?;
    Some(TestCaseResult::new(verdict, record.time, true))
}

/// Overwrites the cache record; failures are silently ignored.
pub fn store(cache_file: &Path, result: &TestCaseResult) {
    let record = CacheRecord {
        verdict: result.verdict.to_string(),
        time: result.time,
    };
    if let Ok(json) = serde_json::to_string(&record) {
        if let Err(e) = fs::write(cache_file, json) {
            log::debug!("cannot write cache {}: {e}", cache_file.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn cache_round_trips_when_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("main.sh");
        let infile = tmp.path().join("t1.in");
        let cache_file = tmp.path().join("t1.cache");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::write(&infile, "1 2\n").unwrap();
        // Cache files must be newer than both inputs for the hit to count.
        std::thread::sleep(Duration::from_millis(20));
        store(
            &cache_file,
            &TestCaseResult::new(Verdict::Ac, Some(0.5), false),
        );

        let hit = load(&cache_file, &src, &infile).unwrap();
        assert_eq!(hit.verdict, Verdict::Ac);
        assert_eq!(hit.time, Some(0.5));
        assert!(hit.cached);
    }

    #[test]
    fn touched_source_invalidates_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("main.sh");
        let infile = tmp.path().join("t1.in");
        let cache_file = tmp.path().join("t1.cache");
        fs::write(&infile, "1 2\n").unwrap();
        store(&cache_file, &TestCaseResult::new(Verdict::Wa, None, false));
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&src, "#!/bin/sh\n").unwrap();

        assert!(load(&cache_file, &src, &infile).is_none());
    }

    #[test]
    fn unknown_format_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("main.sh");
        let infile = tmp.path().join("t1.in");
        let cache_file = tmp.path().join("t1.cache");
        fs::write(&src, "").unwrap();
        fs::write(&infile, "").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&cache_file, b"\x80\x03legacy-binary-record").unwrap();

        assert!(load(&cache_file, &src, &infile).is_none());
    }
}
