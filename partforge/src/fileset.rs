//! Deterministic file selection from include/exclude glob patterns, used
//! by the stage and prime steps to decide which installed files a part
//! contributes to the shared directories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use glob::Pattern;
use walkdir::WalkDir;

use crate::errors::{Error, Result};

/// An ordered pair of include and exclude pattern lists. In the raw part
/// property a leading `-` marks an exclusion; a further leading `-` inside
/// the exclude list negates it back into an inclusion, and for those the
/// relative order of excludes matters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fileset {
    includes: Vec<String>,
    excludes: Vec<String>,
}

/// The outcome of resolving a fileset against a directory tree: the files
/// selected, plus the directories implied by them (recorded separately so
/// cleaning can prune empty directories afterwards).
#[derive(Clone, Debug, Default)]
pub struct ResolvedFiles {
    pub files: BTreeSet<PathBuf>,
    pub dirs: BTreeSet<PathBuf>,
}

impl Fileset {
    pub fn new(includes: Vec<String>, excludes: Vec<String>) -> Fileset {
        Fileset { includes, excludes }
    }

    /// Split a raw fileset property (e.g. `["bin", "-bin/test"]`) into the
    /// include/exclude pair.
    pub fn from_entries(entries: &[String]) -> Fileset {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for entry in entries {
            match entry.strip_prefix('-') {
                Some(rest) => excludes.push(rest.to_string()),
                None => includes.push(entry.clone()),
            }
        }
        Fileset { includes, excludes }
    }

    pub fn entries(&self) -> Vec<String> {
        let mut entries = self.includes.clone();
        entries.extend(self.excludes.iter().map(|e| format!("-{}", e)));
        entries
    }

    fn includes_everything(&self) -> bool {
        self.includes.is_empty() || self.includes.iter().any(|i| i == "*")
    }

    /// Resolve the fileset against all regular files and symlinks under
    /// `root`. Selected paths are relative to `root` and sorted.
    pub fn resolve(&self, root: &Path) -> Result<ResolvedFiles> {
        let mut all_files = BTreeSet::new();
        let mut all_dirs = BTreeSet::new();
        for entry in WalkDir::new(root).min_depth(1) {
            let entry = entry.map_err(|e| {
                Error::InvalidInput(format!("cannot walk {:?}: {}", root, e))
            })?;
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            if entry.file_type().is_dir() {
                all_dirs.insert(relative);
            } else {
                all_files.insert(relative);
            }
        }

        let files = self.select(&all_files)?;
        let selected_dirs = self.select(&all_dirs)?;

        let mut dirs = BTreeSet::new();
        for dir in selected_dirs {
            dirs.insert(dir);
        }
        for file in &files {
            let mut parent = file.parent();
            while let Some(dir) = parent {
                if dir.as_os_str().is_empty() {
                    break;
                }
                dirs.insert(dir.to_path_buf());
                parent = dir.parent();
            }
        }

        Ok(ResolvedFiles { files, dirs })
    }

    /// Apply the fileset to an explicit list of relative paths, e.g. the
    /// staged files recorded in a part's stage state.
    pub fn select(&self, paths: &BTreeSet<PathBuf>) -> Result<BTreeSet<PathBuf>> {
        let mut selected: BTreeSet<PathBuf> = if self.includes_everything() {
            paths.clone()
        } else {
            let patterns = compile(&self.includes)?;
            paths
                .iter()
                .filter(|p| patterns.iter().any(|pat| pattern_matches(pat, p)))
                .cloned()
                .collect()
        };

        for exclude in &self.excludes {
            match exclude.strip_prefix('-') {
                Some(negated) => {
                    let pattern = compile_one(negated)?;
                    for path in paths {
                        if pattern_matches(&pattern, path) {
                            selected.insert(path.clone());
                        }
                    }
                }
                None => {
                    let pattern = compile_one(exclude)?;
                    selected.retain(|p| !pattern_matches(&pattern, p));
                }
            }
        }

        Ok(selected)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns.iter().map(|p| compile_one(p)).collect()
}

fn compile_one(pattern: &str) -> Result<Pattern> {
    let trimmed = pattern.trim_end_matches('/');
    Pattern::new(trimmed)
        .map_err(|e| Error::InvalidInput(format!("invalid fileset pattern {:?}: {}", pattern, e)))
}

/// A pattern selects a path if it matches the path itself or any of its
/// ancestors, so that `bin` selects everything below `bin/`.
fn pattern_matches(pattern: &Pattern, path: &Path) -> bool {
    if pattern.matches_path(path) {
        return true;
    }
    let mut parent = path.parent();
    while let Some(dir) = parent {
        if dir.as_os_str().is_empty() {
            break;
        }
        if pattern.matches_path(dir) {
            return true;
        }
        parent = dir.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> BTreeSet<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn empty_fileset_selects_everything() {
        let fileset = Fileset::from_entries(&[]);
        let all = paths(&["bin/tool", "etc/conf"]);
        assert_eq!(fileset.select(&all).unwrap(), all);
    }

    #[test]
    fn star_selects_everything() {
        let fileset = Fileset::from_entries(&["*".to_string()]);
        let all = paths(&["bin/tool", "etc/conf"]);
        assert_eq!(fileset.select(&all).unwrap(), all);
    }

    #[test]
    fn includes_select_by_directory_prefix() {
        let fileset = Fileset::from_entries(&["bin".to_string()]);
        let all = paths(&["bin/tool", "bin/sub/other", "etc/conf"]);
        assert_eq!(fileset.select(&all).unwrap(), paths(&["bin/tool", "bin/sub/other"]));
    }

    #[test]
    fn excludes_remove_matches() {
        let fileset =
            Fileset::from_entries(&["bin".to_string(), "-bin/test".to_string()]);
        let all = paths(&["bin/tool", "bin/test"]);
        assert_eq!(fileset.select(&all).unwrap(), paths(&["bin/tool"]));
    }

    #[test]
    fn negated_exclude_reincludes() {
        let fileset = Fileset::from_entries(&[
            "-usr".to_string(),
            "--usr/share/doc".to_string(),
        ]);
        let all = paths(&["usr/lib/libz.so", "usr/share/doc/readme", "bin/tool"]);
        assert_eq!(
            fileset.select(&all).unwrap(),
            paths(&["bin/tool", "usr/share/doc/readme"])
        );
    }

    #[test]
    fn glob_patterns_match_single_level() {
        let fileset = Fileset::from_entries(&["bin/*".to_string()]);
        let all = paths(&["bin/tool", "etc/conf"]);
        assert_eq!(fileset.select(&all).unwrap(), paths(&["bin/tool"]));
    }

    #[test]
    fn resolve_walks_the_tree_and_records_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("bin/sub")).unwrap();
        std::fs::write(root.path().join("bin/tool"), b"x").unwrap();
        std::fs::write(root.path().join("bin/sub/other"), b"y").unwrap();
        std::fs::write(root.path().join("top"), b"z").unwrap();

        let fileset = Fileset::from_entries(&["bin".to_string()]);
        let resolved = fileset.resolve(root.path()).unwrap();
        assert_eq!(resolved.files, paths(&["bin/tool", "bin/sub/other"]));
        assert!(resolved.dirs.contains(&PathBuf::from("bin")));
        assert!(resolved.dirs.contains(&PathBuf::from("bin/sub")));
    }
}
