//! The lifecycle façade: owns the parts, the dependency graph and the
//! shared caches, installs build prerequisites, keeps global state, and
//! drives the step executor over the ordered graph while holding an
//! exclusive lock on the work directory.

mod executor;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use fs2::FileExt;
use log::{debug, warn};
use serde_json::Value;

use crate::elf::SonameCache;
use crate::env;
use crate::errors::{Error, Result};
use crate::graph::PartGraph;
use crate::part::Part;
use crate::plugins::Registry;
use crate::project::{PartData, ProjectOptions};
use crate::repo::PackageRepository;
use crate::runner::Runner;
use crate::states::{self, GlobalState, Grade, PartState, PrimeState, StageState};
use crate::steps::Step;

pub use self::executor::OutdatedStepAction;

pub struct LifecycleManager {
    options: ProjectOptions,
    registry: Registry,
    repo: Box<dyn PackageRepository>,
    runner: Runner,
    graph: PartGraph,
    parts: BTreeMap<String, Part>,
    soname_cache: SonameCache,
    outdated_step_action: OutdatedStepAction,
}

impl LifecycleManager {
    /// Validate the parts document, build the graph and load a plugin for
    /// every part. Fails before touching the work directory.
    pub fn new(
        document: &Value,
        registry: Registry,
        repo: Box<dyn PackageRepository>,
        options: ProjectOptions,
    ) -> Result<LifecycleManager> {
        let parts_data = match document.get("parts") {
            Some(Value::Object(parts)) => parts,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "parts must be a mapping, not {}",
                    other
                )));
            }
            None => {
                return Err(Error::InvalidInput("no parts defined".to_string()));
            }
        };

        let mut after_requests = BTreeMap::new();
        for (name, properties) in parts_data {
            let after = match properties.get("after") {
                Some(Value::Array(entries)) => entries
                    .iter()
                    .map(|entry| match entry {
                        Value::String(s) => Ok(s.clone()),
                        other => Err(Error::InvalidInput(format!(
                            "after entries of part {:?} must be strings, not {}",
                            name, other
                        ))),
                    })
                    .collect::<Result<Vec<String>>>()?,
                Some(other) => {
                    return Err(Error::InvalidInput(format!(
                        "after of part {:?} must be a list, not {}",
                        name, other
                    )));
                }
                None => Vec::new(),
            };
            after_requests.insert(name.clone(), after);
        }

        // Ordering and cycle detection happen before any part directory
        // can come into existence.
        let graph = PartGraph::new(after_requests)?;

        let mut parts = BTreeMap::new();
        for (name, properties) in parts_data {
            let properties = match properties {
                Value::Object(map) => map.clone(),
                Value::Null => serde_json::Map::new(),
                other => {
                    return Err(Error::InvalidInput(format!(
                        "part {:?} must be a mapping, not {}",
                        name, other
                    )));
                }
            };
            let part = Part::new(name, properties, &options, &registry)?;
            parts.insert(name.clone(), part);
        }

        Ok(LifecycleManager {
            options,
            registry,
            repo,
            runner: Runner::new(),
            graph,
            parts,
            soname_cache: SonameCache::default(),
            outdated_step_action: OutdatedStepAction::Clean,
        })
    }

    /// Part names in execution order.
    pub fn part_names(&self) -> Vec<String> {
        self.graph.ordered_names().to_vec()
    }

    pub fn options(&self) -> &ProjectOptions {
        &self.options
    }

    /// What to do when a step would be silently cleaned but its
    /// `clean_if_dirty` policy forbids it.
    pub fn set_outdated_step_action(&mut self, action: OutdatedStepAction) {
        self.outdated_step_action = action;
    }

    pub fn pull(&mut self, part_names: &[String]) -> Result<bool> {
        self.execute(Step::Pull, part_names)
    }

    pub fn build(&mut self, part_names: &[String]) -> Result<bool> {
        self.execute(Step::Build, part_names)
    }

    pub fn stage(&mut self, part_names: &[String]) -> Result<bool> {
        self.execute(Step::Stage, part_names)
    }

    pub fn prime(&mut self, part_names: &[String]) -> Result<bool> {
        self.execute(Step::Prime, part_names)
    }

    /// Run the lifecycle up to and including `step` for the given parts
    /// (all parts when empty). Returns whether any step actually ran, as
    /// opposed to every requested step being reused from cache.
    pub fn execute(&mut self, step: Step, part_names: &[String]) -> Result<bool> {
        self.validate(part_names)?;
        let _lock = WorkDirLock::acquire(&self.options)?;

        self.install_prerequisites()?;

        let mut executor = executor::Executor::new(self.outdated_step_action);
        executor.run(self, step, part_names)?;
        if !executor.steps_were_run() {
            warn!(
                "The requested action has already been taken. Consider\n\
                 specifying parts, or clean the steps you want to run again."
            );
        }
        Ok(executor.steps_were_run())
    }

    /// Remove the work of `step` and everything after it for the given
    /// parts; with no parts and `Pull`, wipe the whole work area.
    pub fn clean(&mut self, part_names: &[String], step: Step) -> Result<()> {
        self.validate(part_names)?;
        let _lock = WorkDirLock::acquire(&self.options)?;

        if part_names.is_empty() && step == Step::Pull {
            for dir in
                &[self.options.parts_dir(), self.options.stage_dir(), self.options.prime_dir()]
            {
                if dir.exists() {
                    debug!("removing {:?}", dir);
                    fs::remove_dir_all(dir)?;
                }
            }
            return Ok(());
        }

        let staged_states = self.stage_states()?;
        let primed_states = self.prime_states()?;
        let names: Vec<String> = if part_names.is_empty() {
            self.part_names()
        } else {
            part_names.to_vec()
        };
        for name in names {
            self.parts[&name].clean(
                &staged_states,
                &primed_states,
                step,
                &self.options.stage_dir(),
                &self.options.prime_dir(),
            )?;
        }
        Ok(())
    }

    pub fn get_dependencies(&self, part_name: &str, recursive: bool) -> BTreeSet<String> {
        self.graph.get_dependencies(part_name, recursive)
    }

    pub fn get_reverse_dependencies(&self, part_name: &str, recursive: bool) -> BTreeSet<String> {
        self.graph.get_reverse_dependencies(part_name, recursive)
    }

    /// The state of `step` for every part, keyed by part name.
    pub fn get_project_state(&self, step: Step) -> Result<BTreeMap<String, Option<PartState>>> {
        let mut project_state = BTreeMap::new();
        for (name, part) in &self.parts {
            project_state.insert(name.clone(), states::read(part.state_dir(), step)?);
        }
        Ok(project_state)
    }

    fn validate(&self, part_names: &[String]) -> Result<()> {
        for name in part_names {
            if !self.graph.contains(name) {
                return Err(Error::UnknownPart(name.clone()));
            }
        }
        Ok(())
    }

    /// Install every declared build prerequisite and record it in global
    /// state, deciding the required grade on the first run.
    fn install_prerequisites(&mut self) -> Result<()> {
        let mut build_packages: BTreeSet<String> = BTreeSet::new();
        let mut build_snaps: BTreeSet<String> = BTreeSet::new();

        build_packages.extend(self.options.cross_build_packages());
        for part in self.parts.values() {
            build_packages.extend(part.build_packages_list());
            build_snaps.extend(part.build_snaps_list());
            if let Some(spec) = part.source_spec() {
                let source_type = spec.detect_type()?;
                build_packages.extend(self.repo.packages_for_source_type(&source_type));
            }
        }

        let packages: Vec<String> = build_packages.into_iter().collect();
        let snaps: Vec<String> = build_snaps.into_iter().collect();
        let installed_packages = self.repo.install_build_packages(&packages)?;
        let installed_snaps = self.repo.install_build_snaps(&snaps)?;

        let path = self.options.global_state_path();
        let mut global_state = GlobalState::load(&path)?;
        global_state.append_build_packages(installed_packages);
        global_state.append_build_snaps(installed_snaps);
        if global_state.required_grade().is_none() {
            global_state.set_required_grade(required_grade(&self.options));
        }
        global_state.save(&path)
    }

    /// Build environment for a part: its own artifacts first, then the
    /// stage view, the project variables, the part's declared environment
    /// and finally every dependency's contribution, first occurrence
    /// winning.
    pub(crate) fn build_env_for_part(&self, name: &str, root_part: bool) -> Vec<String> {
        let part = &self.parts[name];
        let stage_dir = self.options.stage_dir();
        let triplet = self.options.arch_triplet();
        let mut entries = Vec::new();

        if root_part {
            // The part's own install tree has to come before any stage
            // bin directory.
            entries.extend(part.env(part.install_dir()));
            entries.extend(env::runtime_env(part.install_dir(), triplet));
            entries.extend(env::runtime_env(&stage_dir, triplet));
            entries.extend(env::build_env(part.install_dir(), triplet));
            entries.extend(env::build_env_for_stage(&stage_dir, triplet));

            for (key, value) in env::part_directory_env(part, None) {
                entries.push(format!("{}=\"{}\"", key, value));
            }
            entries.extend(self.project_env());

            entries.extend(part.build_environment().iter().cloned());
        } else {
            entries.extend(part.env(&stage_dir));
            entries.extend(env::runtime_env(&stage_dir, triplet));
        }

        for dependency in self.graph.direct_dependencies(name) {
            entries.extend(self.parts[dependency].env(&stage_dir));
            entries.extend(self.build_env_for_part(dependency, false));
        }

        env::dedup_env(entries)
    }

    /// Project-wide variables exported to every step.
    pub(crate) fn project_env(&self) -> Vec<String> {
        self.project_env_pairs()
            .into_iter()
            .map(|(key, value)| format!("{}=\"{}\"", key, value))
            .collect()
    }

    pub(crate) fn project_env_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("PARTFORGE_ARCH_TRIPLET".to_string(), self.options.arch_triplet().to_string()),
            (
                "PARTFORGE_PARALLEL_BUILD_COUNT".to_string(),
                self.options.parallel_build_count().to_string(),
            ),
            ("PARTFORGE_PROJECT_DIR".to_string(), self.options.work_dir().display().to_string()),
            ("PARTFORGE_STAGE".to_string(), self.options.stage_dir().display().to_string()),
            ("PARTFORGE_PRIME".to_string(), self.options.prime_dir().display().to_string()),
        ]
    }

    pub(crate) fn part_data<'a>(&'a self, name: &'a str, step: Step) -> PartData<'a> {
        let part = &self.parts[name];
        PartData {
            arch_triplet: self.options.arch_triplet(),
            deb_arch: self.options.deb_arch(),
            parallel_build_count: self.options.parallel_build_count(),
            is_cross_compiling: self.options.is_cross_compiling(),
            work_dir: self.options.work_dir(),
            parts_dir: self.options.parts_dir(),
            stage_dir: self.options.stage_dir(),
            prime_dir: self.options.prime_dir(),
            part: name,
            step,
            part_build_dir: part.build_dir().to_path_buf(),
            part_install_dir: part.install_dir().to_path_buf(),
            extras: self.options.extras(),
        }
    }

    pub(crate) fn stage_states(&self) -> Result<BTreeMap<String, StageState>> {
        let mut stage_states = BTreeMap::new();
        for (name, part) in &self.parts {
            if let Some(PartState::Stage(state)) = states::read(part.state_dir(), Step::Stage)? {
                stage_states.insert(name.clone(), state);
            }
        }
        Ok(stage_states)
    }

    pub(crate) fn prime_states(&self) -> Result<BTreeMap<String, PrimeState>> {
        let mut prime_states = BTreeMap::new();
        for (name, part) in &self.parts {
            if let Some(PartState::Prime(state)) = states::read(part.state_dir(), Step::Prime)? {
                prime_states.insert(name.clone(), state);
            }
        }
        Ok(prime_states)
    }
}

/// The grade recorded on first run. Without a store lookup everything
/// built here is development quality.
fn required_grade(_options: &ProjectOptions) -> Grade {
    Grade::Devel
}

/// Advisory exclusive lock over the work directory, held for the duration
/// of a lifecycle operation.
struct WorkDirLock {
    file: fs::File,
    path: PathBuf,
}

impl WorkDirLock {
    fn acquire(options: &ProjectOptions) -> Result<WorkDirLock> {
        fs::create_dir_all(options.work_dir())?;
        let path = options.work_dir().join(".partforge.lock");
        let file = fs::OpenOptions::new().create(true).write(true).open(&path)?;
        file.lock_exclusive()?;
        debug!("acquired work dir lock {:?}", path);
        Ok(WorkDirLock { file, path })
    }
}

impl Drop for WorkDirLock {
    fn drop(&mut self) {
        debug!("releasing work dir lock {:?}", self.path);
        let _ = self.file.unlock();
    }
}
