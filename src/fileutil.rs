//! Small filesystem helpers used across the build pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Creates `dir` and any missing parents.
pub fn make_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

/// Removes `dir` recursively. Missing directories are fine.
pub fn remove_tree(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
    }
    Ok(())
}

/// Copies the contents of `src` into `dst`, recursing into subdirectories.
/// Dotfiles are skipped, matching the directory listing rules used elsewhere.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    make_dir(dst)?;
    for entry in list_dir(src, true)? {
        let from = src.join(&entry);
        let to = dst.join(&entry);
        if from.is_dir() {
            make_dir(&to)?;
        } else {
            copy_file(&from, &to)?;
        }
    }
    Ok(())
}

/// Copies a single file, or a directory recursively.
pub fn copy_any(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        copy_tree(src, dst)
    } else {
        copy_file(src, dst)
    }
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))
}

/// Lists entries under `dir` relative to it, skipping dot-prefixed names.
/// Returns an empty list when the directory cannot be read.
pub fn list_dir(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    let depth = if recursive { usize::MAX } else { 1 };
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(depth)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry?;
        out.push(entry.path().strip_prefix(dir).unwrap().to_path_buf());
    }
    Ok(out)
}

/// Returns the mtime of `path`, or the epoch when it is missing.
pub fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Returns the newest mtime of anything under `dir`, the directory itself
/// included. Missing directories report the epoch so comparisons against a
/// stamp read as stale.
pub fn last_modified_under(dir: &Path) -> SystemTime {
    let mut latest = modified_time(dir);
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            if let Ok(mtime) = meta.modified() {
                latest = latest.max(mtime);
            }
        }
    }
    latest
}

/// Creates (or truncates) an empty file, refreshing its mtime.
pub fn create_empty_file(path: &Path) -> Result<()> {
    fs::File::create(path)
        .map(|_| ())
        .with_context(|| format!("failed to create {}", path.display()))
}

/// Reads a file to a string, returning `None` on any error.
pub fn read_file(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// Resolves `name` against the PATH environment variable.
pub fn locate_binary(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn copy_tree_recurses_and_skips_dotfiles() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("sub/b.txt"), "b").unwrap();
        fs::write(src.join(".hidden"), "x").unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
        assert!(!dst.join(".hidden").exists());
    }

    #[test]
    fn last_modified_tracks_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tree");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/file"), "x").unwrap();

        let before = last_modified_under(&dir);
        assert!(before > SystemTime::UNIX_EPOCH);
        assert!(modified_time(&dir.join("missing")) == SystemTime::UNIX_EPOCH);
    }
}
