//! Configuration records and project discovery.
//!
//! Each level of the target tree is marked by a JSON file
//! (`rime_project.json`, `rime_problem.json`, `rime_solution.json`,
//! `rime_testset.json`). The loader walks the directory tree, deserialises
//! the records, and materialises the immutable target entities. Bad
//! configurations are recorded and skip their problem; they never abort the
//! other problems.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::codes::{CodeParams, CodeRef, DiffCode, Registry};
use crate::console::Ui;
use crate::consts;
use crate::results::Verdict;
use crate::targets::{Problem, Project, Solution, Testset};

#[derive(Deserialize, Debug, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub library_dir: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ProblemConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Per-case time limit in seconds; must be positive and finite.
    pub time_limit: f64,
    #[serde(default)]
    pub reference_solution: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
pub struct SolutionConfig {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub correct: bool,
    #[serde(default)]
    pub challenge_cases: Option<Vec<String>>,
    #[serde(default)]
    pub expected_verdicts: Option<Vec<String>>,
}

/// A code declaration: either a bare source name or a record with options.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum CodeEntry {
    Src(String),
    Full {
        src: String,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        variant: Option<String>,
        #[serde(default)]
        dependency: Vec<String>,
    },
}

impl CodeEntry {
    fn src(&self) -> &str {
        match self {
            CodeEntry::Src(src) => src,
            CodeEntry::Full { src, .. } => src,
        }
    }

    fn language(&self) -> Option<&str> {
        match self {
            CodeEntry::Src(_) => None,
            CodeEntry::Full { language, .. } => language.as_deref(),
        }
    }

    fn variant(&self) -> Option<String> {
        match self {
            CodeEntry::Src(_) => None,
            CodeEntry::Full { variant, .. } => variant.clone(),
        }
    }

    fn dependencies(&self) -> &[String] {
        match self {
            CodeEntry::Src(_) => &[],
            CodeEntry::Full { dependency, .. } => dependency,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct TestsetConfig {
    #[serde(default)]
    pub generators: Vec<CodeEntry>,
    #[serde(default)]
    pub validators: Vec<CodeEntry>,
    #[serde(default)]
    pub judges: Vec<CodeEntry>,
    #[serde(default)]
    pub reactives: Vec<CodeEntry>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file =
        std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("cannot parse {}", path.display()))
}

/// The project root is the nearest ancestor carrying the project marker.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(consts::PROJECT_FILE).is_file())
        .map(Path::to_path_buf)
}

/// Sorted immediate subdirectories containing `marker`.
fn subdirs_with_marker(dir: &Path, marker: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join(marker).is_file())
        .collect();
    found.sort();
    found
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct Loader<'a> {
    registry: &'a Registry,
    ui: &'a Ui,
}

impl<'a> Loader<'a> {
    pub fn new(registry: &'a Registry, ui: &'a Ui) -> Self {
        Self { registry, ui }
    }

    pub fn load_project(&self, root: &Path) -> Result<Project> {
        let config: ProjectConfig = read_json(&root.join(consts::PROJECT_FILE))?;
        let library_dir = config.library_dir.as_ref().map(|d| root.join(d));
        if let Some(dir) = &library_dir {
            if !dir.is_dir() {
                self.ui.error(
                    &dir_name(root),
                    &format!("library_dir not found: {}", dir.display()),
                );
            }
        }

        let mut problems = Vec::new();
        for problem_dir in subdirs_with_marker(root, consts::PROBLEM_FILE) {
            match self.load_problem(&problem_dir, library_dir.as_deref()) {
                Ok(problem) => problems.push(Rc::new(problem)),
                Err(e) => {
                    self.ui.error(&dir_name(&problem_dir), &format!("{e:#}"));
                }
            }
        }
        Ok(Project {
            base_dir: root.to_path_buf(),
            library_dir,
            problems,
        })
    }

    fn load_problem(&self, dir: &Path, library_dir: Option<&Path>) -> Result<Problem> {
        let config: ProblemConfig = read_json(&dir.join(consts::PROBLEM_FILE))?;
        let name = dir_name(dir);
        if !config.time_limit.is_finite() || config.time_limit <= 0.0 {
            anyhow::bail!("time limit must be positive and finite");
        }
        let out_dir = dir.join(consts::OUT_DIR);

        let mut solutions = Vec::new();
        for solution_dir in subdirs_with_marker(dir, consts::SOLUTION_FILE) {
            match self.load_solution(&solution_dir, &name, &out_dir) {
                Ok(solution) => solutions.push(Rc::new(solution)),
                Err(e) => {
                    self.ui.error(
                        &format!("{name}/{}", dir_name(&solution_dir)),
                        &format!("{e:#}"),
                    );
                }
            }
        }

        let testset_dirs = subdirs_with_marker(dir, consts::TESTSET_FILE);
        if testset_dirs.len() > 1 {
            anyhow::bail!("multiple testsets found");
        }
        let testset = match testset_dirs.first() {
            Some(testset_dir) => self.load_testset(testset_dir, &name, &out_dir, library_dir)?,
            None => {
                // A problem without tests still builds; it just warns later.
                let base = dir.join("tests");
                Testset {
                    name: "tests".to_string(),
                    full_name: format!("{name}/tests"),
                    base_dir: base,
                    out_dir: out_dir.join("tests"),
                    generators: Vec::new(),
                    validators: Vec::new(),
                    judges: vec![Rc::new(DiffCode::new(out_dir.join("tests")))],
                    reactives: Vec::new(),
                }
            }
        };

        let reference_solution = match &config.reference_solution {
            Some(wanted) => {
                let found = solutions.iter().find(|s| &s.name == wanted).cloned();
                if found.is_none() {
                    anyhow::bail!("reference solution \"{wanted}\" does not exist");
                }
                found
            }
            None => solutions.iter().find(|s| s.correct).cloned(),
        };

        Ok(Problem {
            name: name.clone(),
            id: config.id.unwrap_or_else(|| name.clone()),
            title: config.title.unwrap_or_else(|| name.clone()),
            timeout: config.time_limit,
            base_dir: dir.to_path_buf(),
            out_dir,
            testset: Rc::new(testset),
            solutions,
            reference_solution,
        })
    }

    fn load_solution(
        &self,
        dir: &Path,
        problem_name: &str,
        problem_out_dir: &Path,
    ) -> Result<Solution> {
        let config: SolutionConfig = read_json(&dir.join(consts::SOLUTION_FILE))?;
        let name = dir_name(dir);
        let out_dir = problem_out_dir.join(&name);

        let src_name = match config.source {
            Some(src) => src,
            None => self.guess_source(dir)?,
        };
        let params = CodeParams {
            src_name,
            src_dir: dir.to_path_buf(),
            out_dir: out_dir.clone(),
            dependencies: Vec::new(),
            variant: None,
        };
        let code = self.create_code(params, config.language.as_deref())?;

        let expected_verdicts = match config.expected_verdicts {
            None => None,
            Some(names) => {
                let mut verdicts = Vec::new();
                for n in &names {
                    let v = Verdict::from_short(n)
                        .with_context(|| format!("unknown verdict \"{n}\""))?;
                    verdicts.push(v);
                }
                Some(verdicts)
            }
        };
        // A solution with declared failure modes is not the correct one.
        let correct =
            config.correct && config.challenge_cases.is_none() && expected_verdicts.is_none();

        Ok(Solution {
            name: name.clone(),
            full_name: format!("{problem_name}/{name}"),
            base_dir: dir.to_path_buf(),
            out_dir,
            code,
            correct,
            challenge_cases: config.challenge_cases,
            expected_verdicts,
        })
    }

    fn load_testset(
        &self,
        dir: &Path,
        problem_name: &str,
        problem_out_dir: &Path,
        library_dir: Option<&Path>,
    ) -> Result<Testset> {
        let config: TestsetConfig = read_json(&dir.join(consts::TESTSET_FILE))?;
        let name = dir_name(dir);
        let out_dir = problem_out_dir.join(&name);

        let build = |entries: &[CodeEntry]| -> Result<Vec<CodeRef>> {
            entries
                .iter()
                .map(|entry| {
                    let dependencies = self.resolve_dependencies(entry, library_dir)?;
                    let params = CodeParams {
                        src_name: entry.src().to_string(),
                        src_dir: dir.to_path_buf(),
                        out_dir: out_dir.clone(),
                        dependencies,
                        variant: entry.variant(),
                    };
                    self.create_code(params, entry.language())
                })
                .collect()
        };

        let generators = build(&config.generators)?;
        let validators = build(&config.validators)?;
        let mut judges = build(&config.judges)?;
        let reactives = build(&config.reactives)?;
        if judges.is_empty() {
            judges.push(Rc::new(DiffCode::new(out_dir.clone())));
        }
        if reactives.len() > 1 {
            anyhow::bail!("at most one reactive judge is allowed");
        }

        Ok(Testset {
            name: name.clone(),
            full_name: format!("{problem_name}/{name}"),
            base_dir: dir.to_path_buf(),
            out_dir,
            generators,
            validators,
            judges,
            reactives,
        })
    }

    fn resolve_dependencies(
        &self,
        entry: &CodeEntry,
        library_dir: Option<&Path>,
    ) -> Result<Vec<PathBuf>> {
        let deps = entry.dependencies();
        if deps.is_empty() {
            return Ok(Vec::new());
        }
        let library_dir = library_dir
            .with_context(|| format!("{}: dependency needs a project library_dir", entry.src()))?;
        Ok(deps.iter().map(|d| library_dir.join(d)).collect())
    }

    fn create_code(&self, params: CodeParams, language: Option<&str>) -> Result<CodeRef> {
        let src_name = params.src_name.clone();
        match language {
            Some(lang) => self
                .registry
                .create_by_name(lang, params)
                .with_context(|| format!("unknown language \"{lang}\" for {src_name}")),
            None => self
                .registry
                .create_by_extension(params)
                .with_context(|| format!("no language known for {src_name}")),
        }
    }

    /// When the config names no source, exactly one recognised file in the
    /// directory must qualify.
    fn guess_source(&self, dir: &Path) -> Result<String> {
        let mut candidates = Vec::new();
        for entry in crate::fileutil::list_dir(dir, false)? {
            let file_name = entry.to_string_lossy().into_owned();
            if file_name == consts::SOLUTION_FILE {
                continue;
            }
            let probe = CodeParams {
                src_name: file_name.clone(),
                src_dir: dir.to_path_buf(),
                out_dir: PathBuf::new(),
                dependencies: Vec::new(),
                variant: None,
            };
            if self.registry.create_by_extension(probe).is_some() {
                candidates.push(file_name);
            }
        }
        match candidates.len() {
            0 => anyhow::bail!("no solution source found"),
            1 => Ok(candidates.remove(0)),
            _ => anyhow::bail!(
                "multiple solution sources found: {}",
                candidates.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn code_entry_accepts_bare_and_full_forms() {
        let config: TestsetConfig = serde_json::from_str(
            r#"{
                "generators": ["gen.py"],
                "judges": [{"src": "judge.cc", "variant": "testlib", "dependency": ["testlib.h"]}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.generators[0].src(), "gen.py");
        assert_eq!(config.judges[0].src(), "judge.cc");
        assert_eq!(config.judges[0].variant().as_deref(), Some("testlib"));
        assert_eq!(config.judges[0].dependencies(), ["testlib.h".to_string()]);
        assert!(config.validators.is_empty());
    }

    #[test]
    fn solution_config_defaults_to_correct() {
        let config: SolutionConfig = serde_json::from_str("{}").unwrap();
        assert!(config.correct);
        assert!(config.source.is_none());
        assert!(config.challenge_cases.is_none());
    }

    #[test]
    fn project_root_is_nearest_marked_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("contest");
        let deep = root.join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(root.join(consts::PROJECT_FILE), "{}").unwrap();

        assert_eq!(find_project_root(&deep), Some(root.clone()));
        assert_eq!(find_project_root(tmp.path()), None);
    }
}
