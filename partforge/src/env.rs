//! Build and runtime environment assembly. Environments are ordered lists
//! of shell-assignment strings composed from the part, stage and project
//! directories; they are embedded verbatim into the generated step
//! scripts.

use std::path::{Path, PathBuf};

use crate::part::Part;
use crate::steps::Step;

pub fn get_bin_paths(root: &Path, existing_only: bool) -> Vec<PathBuf> {
    let paths: Vec<PathBuf> =
        ["usr/sbin", "usr/bin", "sbin", "bin"].iter().map(|p| root.join(p)).collect();
    filter_existing(paths, existing_only)
}

pub fn get_library_paths(root: &Path, arch_triplet: &str, existing_only: bool) -> Vec<PathBuf> {
    let paths = vec![
        root.join("lib"),
        root.join("usr").join("lib"),
        root.join("lib").join(arch_triplet),
        root.join("usr").join("lib").join(arch_triplet),
    ];
    filter_existing(paths, existing_only)
}

pub fn get_include_paths(root: &Path, arch_triplet: &str) -> Vec<PathBuf> {
    let paths = vec![
        root.join("include"),
        root.join("usr").join("include"),
        root.join("include").join(arch_triplet),
        root.join("usr").join("include").join(arch_triplet),
    ];
    filter_existing(paths, true)
}

pub fn get_pkg_config_paths(root: &Path, arch_triplet: &str) -> Vec<PathBuf> {
    let paths = vec![
        root.join("lib").join("pkgconfig"),
        root.join("lib").join(arch_triplet).join("pkgconfig"),
        root.join("usr").join("lib").join("pkgconfig"),
        root.join("usr").join("lib").join(arch_triplet).join("pkgconfig"),
        root.join("usr").join("share").join("pkgconfig"),
        root.join("usr").join("local").join("lib").join("pkgconfig"),
        root.join("usr").join("local").join("lib").join(arch_triplet).join("pkgconfig"),
        root.join("usr").join("local").join("share").join("pkgconfig"),
    ];
    filter_existing(paths, true)
}

fn filter_existing(paths: Vec<PathBuf>, existing_only: bool) -> Vec<PathBuf> {
    if existing_only {
        paths.into_iter().filter(|p| p.exists()).collect()
    } else {
        paths
    }
}

pub fn combine_paths(paths: &[PathBuf], prepend: &str, separator: &str) -> String {
    let combined: Vec<String> =
        paths.iter().map(|p| format!("{}{}", prepend, p.display())).collect();
    combined.join(separator)
}

/// Environment needed to *run* binaries under `root`.
pub fn runtime_env(root: &Path, arch_triplet: &str) -> Vec<String> {
    let mut env = Vec::new();

    let bin_paths = get_bin_paths(root, true);
    if !bin_paths.is_empty() {
        env.push(format!("PATH=\"{}:$PATH\"", combine_paths(&bin_paths, "", ":")));
    }

    let library_paths = get_library_paths(root, arch_triplet, true);
    if !library_paths.is_empty() {
        env.push(format!(
            "LD_LIBRARY_PATH=\"$LD_LIBRARY_PATH:{}\"",
            combine_paths(&library_paths, "", ":")
        ));
    }

    env
}

/// Environment needed to *compile* against the artifacts under `root`.
pub fn build_env(root: &Path, arch_triplet: &str) -> Vec<String> {
    let mut env = Vec::new();

    let include_paths = get_include_paths(root, arch_triplet);
    if !include_paths.is_empty() {
        let includes = combine_paths(&include_paths, "-isystem", " ");
        for variable in &["CPPFLAGS", "CFLAGS", "CXXFLAGS"] {
            env.push(format!("{}=\"${} {}\"", variable, variable, includes));
        }
    }

    let library_paths = get_library_paths(root, arch_triplet, true);
    if !library_paths.is_empty() {
        env.push(format!("LDFLAGS=\"$LDFLAGS {}\"", combine_paths(&library_paths, "-L", " ")));
    }

    let pkg_config_paths = get_pkg_config_paths(root, arch_triplet);
    if !pkg_config_paths.is_empty() {
        env.push(format!(
            "PKG_CONFIG_PATH=\"{}:$PKG_CONFIG_PATH\"",
            combine_paths(&pkg_config_paths, "", ":")
        ));
    }

    env
}

pub fn build_env_for_stage(stage_dir: &Path, arch_triplet: &str) -> Vec<String> {
    build_env(stage_dir, arch_triplet)
}

/// The per-part directory variables exposed to plugins, scriptlets and
/// callbacks.
pub fn part_directory_env(part: &Part, step: Option<Step>) -> Vec<(String, String)> {
    let mut env = vec![
        ("PART_SRC".to_string(), part.source_dir().display().to_string()),
        ("PART_SRC_WORK".to_string(), part.source_dir().display().to_string()),
    ];

    if step.is_none() || step == Some(Step::Build) {
        env.push(("PART_BUILD".to_string(), part.build_dir().display().to_string()));
        env.push(("PART_BUILD_WORK".to_string(), part.build_dir().display().to_string()));
        env.push(("PART_INSTALL".to_string(), part.install_dir().display().to_string()));
    }

    env
}

/// Drop duplicate entries, keeping the first occurrence. Dependent parts
/// sharing a plugin produce identical entries; the first one wins.
pub fn dedup_env(env: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::with_capacity(env.len());
    for entry in env {
        if seen.insert(entry.clone()) {
            deduped.push(entry);
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn runtime_env_probes_existing_directories_only() {
        let root = tempfile::tempdir().unwrap();
        assert!(runtime_env(root.path(), "x86_64-linux-gnu").is_empty());

        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::create_dir_all(root.path().join("lib/x86_64-linux-gnu")).unwrap();
        let env = runtime_env(root.path(), "x86_64-linux-gnu");
        assert_eq!(env.len(), 2);
        assert!(env[0].starts_with("PATH=\""));
        assert!(env[0].contains("usr/bin"));
        assert!(env[1].starts_with("LD_LIBRARY_PATH=\"$LD_LIBRARY_PATH:"));
        assert!(env[1].contains("lib/x86_64-linux-gnu"));
    }

    #[test]
    fn build_env_emits_compiler_flags() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("usr/include")).unwrap();
        fs::create_dir_all(root.path().join("usr/lib/pkgconfig")).unwrap();

        let env = build_env(root.path(), "x86_64-linux-gnu");
        assert!(env.iter().any(|e| e.starts_with("CPPFLAGS=") && e.contains("-isystem")));
        assert!(env.iter().any(|e| e.starts_with("CFLAGS=")));
        assert!(env.iter().any(|e| e.starts_with("CXXFLAGS=")));
        assert!(env.iter().any(|e| e.starts_with("PKG_CONFIG_PATH=")));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let env = vec!["A=1".to_string(), "B=2".to_string(), "A=1".to_string()];
        assert_eq!(dedup_env(env), vec!["A=1".to_string(), "B=2".to_string()]);
    }
}
