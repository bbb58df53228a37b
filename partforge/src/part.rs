//! A part: one named unit of build work with its own source, build,
//! install, stage and prime contributions. Parts carry no reference back
//! to the lifecycle; whatever context a step needs is passed in.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::fileset::{Fileset, ResolvedFiles};
use crate::plugins::{Plugin, PluginInit, Registry, StepContext};
use crate::project::ProjectOptions;
use crate::runner::Runner;
use crate::scriptlets::Scriptlets;
use crate::sources::{self, SourceHandler, SourceIdentity, SourceSpec};
use crate::states::{self, PrimeState, StageState};
use crate::steps::{Step, STEPS};

/// Keys every part understands regardless of plugin.
const SOURCE_KEYS: &[&str] = &[
    "source",
    "source-type",
    "source-branch",
    "source-tag",
    "source-commit",
    "source-depth",
    "source-checksum",
];

pub struct Part {
    name: String,
    plugin_name: String,
    pub(crate) plugin: Plugin,
    properties: serde_json::Map<String, Value>,
    source_spec: Option<SourceSpec>,
    pub(crate) source_handler: Option<Box<dyn SourceHandler>>,
    build_environment: Vec<String>,
    build_attributes: Vec<String>,
    stage_packages: Vec<String>,
    build_packages: Vec<String>,
    organize_map: BTreeMap<String, String>,
    stage_entries: Vec<String>,
    prime_entries: Vec<String>,
    scriptlets: Scriptlets,
    source_dir: PathBuf,
    build_dir: PathBuf,
    install_dir: PathBuf,
    state_dir: PathBuf,
}

impl Part {
    pub fn new(
        name: &str,
        properties: serde_json::Map<String, Value>,
        options: &ProjectOptions,
        registry: &Registry,
    ) -> Result<Part> {
        let plugin_name = match properties.get("plugin") {
            Some(Value::String(plugin)) => Some(plugin.clone()),
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "plugin of part {:?} must be a string, not {}",
                    name, other
                )));
            }
            None => None,
        };

        let init = PluginInit { part_name: name, properties: &properties, options };
        let plugin = registry.load_plugin(plugin_name.as_deref(), &init)?;

        let source_spec = SourceSpec::from_properties(&properties)?;
        let source_handler = match &source_spec {
            Some(spec) => Some(sources::resolve_handler(
                spec,
                options.work_dir(),
                registry.source_factories(),
            )?),
            None => None,
        };

        let build_environment = build_environment_entries(name, &properties)?;
        let organize_map = organize_entries(name, &properties)?;

        let part_dir = options.parts_dir().join(name);
        Ok(Part {
            name: name.to_string(),
            plugin_name: plugin_name.unwrap_or_else(|| "nil".to_string()),
            plugin,
            source_spec,
            source_handler,
            build_environment,
            build_attributes: string_list(&properties, "build-attributes")?,
            stage_packages: string_list(&properties, "stage-packages")?,
            build_packages: string_list(&properties, "build-packages")?,
            organize_map,
            stage_entries: string_list(&properties, "stage")?,
            prime_entries: string_list(&properties, "prime")?,
            scriptlets: Scriptlets::from_properties(&properties),
            properties,
            source_dir: part_dir.join("src"),
            build_dir: part_dir.join("build"),
            install_dir: part_dir.join("install"),
            state_dir: part_dir.join("state"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn properties(&self) -> &serde_json::Map<String, Value> {
        &self.properties
    }

    pub fn build_environment(&self) -> &[String] {
        &self.build_environment
    }

    pub fn build_attributes(&self) -> &[String] {
        &self.build_attributes
    }

    pub fn stage_packages(&self) -> &[String] {
        &self.stage_packages
    }

    pub fn stage_entries(&self) -> &[String] {
        &self.stage_entries
    }

    /// The part's declared build packages plus whatever the plugin
    /// requires, sorted and deduplicated.
    pub fn build_packages_list(&self) -> Vec<String> {
        let mut packages: BTreeSet<String> = self.build_packages.iter().cloned().collect();
        packages.extend(self.plugin.build_packages());
        packages.into_iter().collect()
    }

    pub fn build_snaps_list(&self) -> Vec<String> {
        self.plugin.build_snaps().into_iter().collect()
    }

    pub fn prime_entries(&self) -> &[String] {
        &self.prime_entries
    }

    pub fn scriptlets(&self) -> &Scriptlets {
        &self.scriptlets
    }

    pub fn source_spec(&self) -> Option<&SourceSpec> {
        self.source_spec.as_ref()
    }

    pub fn source_identity(&self) -> Option<SourceIdentity> {
        self.source_handler.as_ref().map(|handler| handler.identity())
    }

    /// Environment entries this part contributes when others build
    /// against `root`.
    pub fn env(&self, root: &Path) -> Vec<String> {
        self.plugin.env(root)
    }

    pub fn makedirs(&self) -> Result<()> {
        for dir in &[&self.source_dir, &self.build_dir, &self.install_dir, &self.state_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Snapshot of the plugin's declared pull properties.
    pub fn pull_properties_snapshot(&self) -> BTreeMap<String, Value> {
        self.property_snapshot(&self.plugin.pull_properties())
    }

    /// Snapshot of the plugin's declared build properties.
    pub fn build_properties_snapshot(&self) -> BTreeMap<String, Value> {
        self.property_snapshot(&self.plugin.build_properties())
    }

    /// Snapshot of the source-related keys.
    pub fn source_options_snapshot(&self) -> BTreeMap<String, Value> {
        self.property_snapshot(&SOURCE_KEYS.iter().map(|k| k.to_string()).collect::<Vec<_>>())
    }

    fn property_snapshot(&self, keys: &[String]) -> BTreeMap<String, Value> {
        keys.iter()
            .filter_map(|key| self.properties.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Give an imperative plugin its pre-step hook.
    pub fn prepare(
        &mut self,
        step: Step,
        runner: &Runner,
        env: &[String],
        parallel_build_count: usize,
        arch_triplet: &str,
    ) -> Result<()> {
        if let Plugin::V1(ref mut plugin) = self.plugin {
            debug!("preparing to {} {:?}", step, self.name);
            let ctx = StepContext {
                part_name: &self.name,
                source_dir: &self.source_dir,
                build_dir: &self.build_dir,
                install_dir: &self.install_dir,
                arch_triplet,
                parallel_build_count,
                env,
                runner,
            };
            plugin.prepare(step, &ctx)?;
        }
        Ok(())
    }

    /// Default pull body: fetch the declared source into the source dir,
    /// then let an imperative plugin refine it.
    pub fn pull(&mut self, runner: &Runner, env: &[String], parallel_build_count: usize, arch_triplet: &str) -> Result<()> {
        fs::create_dir_all(&self.source_dir)?;
        if let Some(ref handler) = self.source_handler {
            handler.pull(&self.source_dir)?;
        }

        if let Plugin::V1(ref mut plugin) = self.plugin {
            let ctx = StepContext {
                part_name: &self.name,
                source_dir: &self.source_dir,
                build_dir: &self.build_dir,
                install_dir: &self.install_dir,
                arch_triplet,
                parallel_build_count,
                env,
                runner,
            };
            plugin.pull(&ctx)?;
        }
        Ok(())
    }

    /// Default build body: refresh the build tree from the source tree,
    /// run the plugin, then apply the organize mapping to the install dir.
    pub fn build(
        &mut self,
        runner: &Runner,
        env: &[String],
        extra_env: &BTreeMap<String, String>,
        parallel_build_count: usize,
        arch_triplet: &str,
    ) -> Result<()> {
        if self.build_dir.exists() {
            fs::remove_dir_all(&self.build_dir)?;
        }
        sources::copy_tree(&self.source_dir, &self.build_dir)?;
        fs::create_dir_all(&self.install_dir)?;

        match self.plugin {
            Plugin::V1(ref mut plugin) => {
                let ctx = StepContext {
                    part_name: &self.name,
                    source_dir: &self.source_dir,
                    build_dir: &self.build_dir,
                    install_dir: &self.install_dir,
                    arch_triplet,
                    parallel_build_count,
                    env,
                    runner,
                };
                plugin.build(&ctx)?;
            }
            Plugin::V2(ref plugin) => {
                let commands = plugin.get_build_commands();
                if !commands.is_empty() {
                    let mut build_env = env.to_vec();
                    for (key, value) in plugin.get_build_environment() {
                        build_env.push(format!("{}=\"{}\"", key, value));
                    }
                    runner.run(
                        &[
                            "/bin/sh".to_string(),
                            "-e".to_string(),
                            "-c".to_string(),
                            commands.join("\n"),
                        ],
                        &build_env,
                        extra_env,
                        &self.build_dir,
                    )?;
                }
            }
        }

        self.organize()
    }

    /// Run the plugin's in-place updater for an outdated step.
    pub fn update(
        &mut self,
        step: Step,
        runner: &Runner,
        env: &[String],
        parallel_build_count: usize,
        arch_triplet: &str,
    ) -> Result<()> {
        match self.plugin {
            Plugin::V1(ref mut plugin) => {
                let ctx = StepContext {
                    part_name: &self.name,
                    source_dir: &self.source_dir,
                    build_dir: &self.build_dir,
                    install_dir: &self.install_dir,
                    arch_triplet,
                    parallel_build_count,
                    env,
                    runner,
                };
                plugin.update(step, &ctx)
            }
            Plugin::V2(_) => Err(Error::InvalidInput(format!(
                "plugin of part {:?} cannot update the {} step in place",
                self.name, step
            ))),
        }
    }

    /// Apply the `organize` mapping inside the install directory.
    fn organize(&self) -> Result<()> {
        for (src_glob, destination) in &self.organize_map {
            let pattern = self.install_dir.join(src_glob);
            let matches = glob::glob(&pattern.display().to_string()).map_err(|e| {
                Error::InvalidInput(format!(
                    "part {:?} has an invalid organize pattern {:?}: {}",
                    self.name, src_glob, e
                ))
            })?;

            for source in matches.filter_map(|m| m.ok()) {
                let target = if destination.ends_with('/') {
                    let file_name = source.file_name().ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "part {:?} cannot organize {:?}",
                            self.name, source
                        ))
                    })?;
                    self.install_dir.join(destination).join(file_name)
                } else {
                    self.install_dir.join(destination)
                };

                if target.is_file() {
                    return Err(Error::InvalidInput(format!(
                        "part {:?} organize would overwrite {:?} with {:?}",
                        self.name, target, source
                    )));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                debug!("organize: {:?} -> {:?}", source, target);
                fs::rename(&source, &target)?;
            }
        }
        Ok(())
    }

    /// The files this part would stage right now.
    pub fn stage_files(&self) -> Result<ResolvedFiles> {
        if !self.install_dir.exists() {
            return Ok(ResolvedFiles::default());
        }
        Fileset::from_entries(&self.stage_entries).resolve(&self.install_dir)
    }

    /// The subset of this part's staged files selected for priming.
    pub fn prime_files(&self, staged: &BTreeSet<PathBuf>) -> Result<BTreeSet<PathBuf>> {
        Fileset::from_entries(&self.prime_entries).select(staged)
    }

    /// Remove this part's contribution from the shared directories and
    /// delete the state of `step` and everything after it. Files also
    /// listed by another part's state are left in place.
    pub fn clean(
        &self,
        staged_states: &BTreeMap<String, StageState>,
        primed_states: &BTreeMap<String, PrimeState>,
        step: Step,
        stage_dir: &Path,
        prime_dir: &Path,
    ) -> Result<()> {
        for current in STEPS.iter().rev().filter(|s| **s >= step) {
            match current {
                Step::Prime => {
                    if let Some(own) = primed_states.get(&self.name) {
                        let shared = shared_files(&self.name, primed_states.iter().map(|(name, state)| (name, &state.files)));
                        clean_shared_area(prime_dir, &own.files, &own.directories, &shared)?;
                    }
                }
                Step::Stage => {
                    if let Some(own) = staged_states.get(&self.name) {
                        let shared = shared_files(&self.name, staged_states.iter().map(|(name, state)| (name, &state.files)));
                        clean_shared_area(stage_dir, &own.files, &own.directories, &shared)?;
                    }
                }
                Step::Build => {
                    remove_dir(&self.build_dir)?;
                    remove_dir(&self.install_dir)?;
                }
                Step::Pull => {
                    remove_dir(&self.source_dir)?;
                }
            }
            states::remove(&self.state_dir, *current)?;
        }
        info!("cleaned {} step (and later) of {:?}", step, self.name);
        Ok(())
    }
}

fn string_list(properties: &serde_json::Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match properties.get(key) {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| match entry {
                Value::String(s) => Ok(s.clone()),
                other => Err(Error::InvalidInput(format!(
                    "{} entries must be strings, not {}",
                    key, other
                ))),
            })
            .collect(),
        Some(other) => {
            Err(Error::InvalidInput(format!("{} must be a list, not {}", key, other)))
        }
        None => Ok(Vec::new()),
    }
}

/// `build-environment` is a list of single-key mappings so the order of
/// assignments is preserved.
fn build_environment_entries(
    part_name: &str,
    properties: &serde_json::Map<String, Value>,
) -> Result<Vec<String>> {
    let entries = match properties.get("build-environment") {
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(Error::InvalidInput(format!(
                "build-environment of part {:?} must be a list, not {}",
                part_name, other
            )));
        }
        None => return Ok(Vec::new()),
    };

    let mut environment = Vec::new();
    for entry in entries {
        match entry {
            Value::Object(mapping) if mapping.len() == 1 => {
                for (key, value) in mapping {
                    match value {
                        Value::String(value) => {
                            environment.push(format!("{}=\"{}\"", key, value))
                        }
                        other => {
                            return Err(Error::InvalidInput(format!(
                                "build-environment value for {:?} must be a string, not {}",
                                key, other
                            )));
                        }
                    }
                }
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "build-environment entries of part {:?} must be single-key mappings, got {}",
                    part_name, other
                )));
            }
        }
    }
    Ok(environment)
}

fn organize_entries(
    part_name: &str,
    properties: &serde_json::Map<String, Value>,
) -> Result<BTreeMap<String, String>> {
    match properties.get("organize") {
        Some(Value::Object(mapping)) => {
            let mut organize = BTreeMap::new();
            for (src, dest) in mapping {
                match dest {
                    Value::String(dest) => {
                        organize.insert(src.clone(), dest.clone());
                    }
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "organize target for {:?} must be a string, not {}",
                            src, other
                        )));
                    }
                }
            }
            Ok(organize)
        }
        Some(other) => Err(Error::InvalidInput(format!(
            "organize of part {:?} must be a mapping, not {}",
            part_name, other
        ))),
        None => Ok(BTreeMap::new()),
    }
}

/// Relative paths contributed by parts other than `except`.
fn shared_files<'a, I>(except: &str, states: I) -> BTreeSet<PathBuf>
where
    I: Iterator<Item = (&'a String, &'a Vec<PathBuf>)>,
{
    let mut shared = BTreeSet::new();
    for (name, files) in states {
        if name != except {
            shared.extend(files.iter().cloned());
        }
    }
    shared
}

/// Remove `files` from `root` unless another part still provides them,
/// then prune any of `dirs` that ended up empty.
fn clean_shared_area(
    root: &Path,
    files: &[PathBuf],
    dirs: &[PathBuf],
    shared: &BTreeSet<PathBuf>,
) -> Result<()> {
    for file in files {
        if shared.contains(file) {
            continue;
        }
        let path = root.join(file);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    // Deepest directories first so empty parents can fall too.
    let mut dirs: Vec<&PathBuf> = dirs.iter().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let path = root.join(dir);
        if path.is_dir() && fs::read_dir(&path)?.next().is_none() {
            fs::remove_dir(&path)?;
        }
    }
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

/// Copy the selected files and directories from one tree into another,
/// hard-linking content where possible.
pub(crate) fn migrate_files(
    files: &BTreeSet<PathBuf>,
    dirs: &BTreeSet<PathBuf>,
    from: &Path,
    to: &Path,
) -> Result<()> {
    fs::create_dir_all(to)?;
    for dir in dirs {
        fs::create_dir_all(to.join(dir))?;
    }
    for file in files {
        let source = from.join(file);
        let target = to.join(file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.symlink_metadata().is_ok() {
            fs::remove_file(&target)?;
        }
        let metadata = source.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&source)?, &target)?;
        } else if fs::hard_link(&source, &target).is_err() {
            fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_part(properties: serde_json::Value) -> Result<Part> {
        let options = ProjectOptions::new("/work").unwrap();
        let registry = Registry::new();
        let map = match properties {
            Value::Object(map) => map,
            _ => panic!("properties must be an object"),
        };
        Part::new("thing", map, &options, &registry)
    }

    #[test]
    fn directories_derive_from_work_dir_and_name() {
        let part = make_part(json!({ "plugin": "nil" })).unwrap();
        assert_eq!(part.source_dir(), Path::new("/work/parts/thing/src"));
        assert_eq!(part.build_dir(), Path::new("/work/parts/thing/build"));
        assert_eq!(part.install_dir(), Path::new("/work/parts/thing/install"));
        assert_eq!(part.state_dir(), Path::new("/work/parts/thing/state"));
    }

    #[test]
    fn missing_plugin_defaults_to_nil() {
        let part = make_part(json!({})).unwrap();
        assert_eq!(part.plugin_name(), "nil");
    }

    #[test]
    fn build_environment_preserves_order() {
        let part = make_part(json!({
            "plugin": "nil",
            "build-environment": [{"CC": "gcc"}, {"LANG": "C"}],
        }))
        .unwrap();
        assert_eq!(
            part.build_environment(),
            &["CC=\"gcc\"".to_string(), "LANG=\"C\"".to_string()]
        );
    }

    #[test]
    fn multi_key_build_environment_entries_are_rejected() {
        assert!(matches!(
            make_part(json!({
                "plugin": "nil",
                "build-environment": [{"CC": "gcc", "LANG": "C"}],
            })),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn prime_files_filter_the_staged_set() {
        let part =
            make_part(json!({ "plugin": "nil", "prime": ["bin/*"] })).unwrap();
        let staged: BTreeSet<PathBuf> =
            vec![PathBuf::from("bin/tool"), PathBuf::from("etc/conf")].into_iter().collect();
        let primed = part.prime_files(&staged).unwrap();
        assert_eq!(primed, vec![PathBuf::from("bin/tool")].into_iter().collect());
    }

    #[test]
    fn migrate_files_links_and_preserves_symlinks() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        fs::create_dir_all(from.path().join("bin")).unwrap();
        fs::write(from.path().join("bin/tool"), b"binary").unwrap();
        std::os::unix::fs::symlink("tool", from.path().join("bin/alias")).unwrap();

        let files: BTreeSet<PathBuf> =
            vec![PathBuf::from("bin/tool"), PathBuf::from("bin/alias")].into_iter().collect();
        let dirs: BTreeSet<PathBuf> = vec![PathBuf::from("bin")].into_iter().collect();
        migrate_files(&files, &dirs, from.path(), to.path()).unwrap();

        assert_eq!(fs::read(to.path().join("bin/tool")).unwrap(), b"binary");
        let link = to.path().join("bin/alias");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("tool"));
    }

    #[test]
    fn clean_spares_files_other_parts_still_provide() {
        let stage = tempfile::tempdir().unwrap();
        fs::create_dir_all(stage.path().join("bin")).unwrap();
        fs::write(stage.path().join("bin/shared"), b"s").unwrap();
        fs::write(stage.path().join("bin/mine"), b"m").unwrap();

        let part = make_part(json!({ "plugin": "nil" })).unwrap();
        let mut staged_states = BTreeMap::new();
        staged_states.insert(
            "thing".to_string(),
            StageState {
                schema_version: crate::states::SCHEMA_VERSION,
                files: vec![PathBuf::from("bin/shared"), PathBuf::from("bin/mine")],
                directories: vec![PathBuf::from("bin")],
                stage_entries: vec![],
            },
        );
        staged_states.insert(
            "other".to_string(),
            StageState {
                schema_version: crate::states::SCHEMA_VERSION,
                files: vec![PathBuf::from("bin/shared")],
                directories: vec![PathBuf::from("bin")],
                stage_entries: vec![],
            },
        );

        part.clean(
            &staged_states,
            &BTreeMap::new(),
            Step::Stage,
            stage.path(),
            Path::new("/nonexistent-prime"),
        )
        .unwrap();

        assert!(stage.path().join("bin/shared").exists());
        assert!(!stage.path().join("bin/mine").exists());
        assert!(stage.path().join("bin").exists());
    }
}
