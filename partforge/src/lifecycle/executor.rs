//! The step executor: walks the requested step and its predecessors over
//! the parts in dependency order, reusing cached work where the status
//! cache allows, cleaning and re-running where it does not, and pulling
//! dependencies up to their prerequisite step on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::collisions;
use crate::elf::{self, SonameCache};
use crate::env;
use crate::errors::{Error, Result};
use crate::part::{self, Part};
use crate::runner::Runner;
use crate::scriptlets::{self, CtlRequest};
use crate::states::{
    self, BuildState, PartState, PrimeState, PullState, StageState, SCHEMA_VERSION,
};
use crate::status::{StatusCache, StatusContext};
use crate::steps::{dependency_prerequisite_step, Step};

use super::LifecycleManager;

/// Policy for steps that are dirty or outdated but not silently
/// cleanable (`clean_if_dirty` is false).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutdatedStepAction {
    Error,
    Clean,
}

pub(super) struct Executor {
    cache: StatusCache,
    steps_were_run: bool,
    outdated_step_action: OutdatedStepAction,
}

impl Executor {
    pub(super) fn new(outdated_step_action: OutdatedStepAction) -> Executor {
        Executor { cache: StatusCache::new(), steps_were_run: false, outdated_step_action }
    }

    pub(super) fn steps_were_run(&self) -> bool {
        self.steps_were_run
    }

    /// Execute up to `step` for the selected parts, walking earlier steps
    /// first across all of them.
    pub(super) fn run(
        &mut self,
        manager: &mut LifecycleManager,
        step: Step,
        part_names: &[String],
    ) -> Result<()> {
        debug!("executor run: step={}, part_names={:?}", step, part_names);
        let selected: Vec<String> = if part_names.is_empty() {
            manager.graph.ordered_names().to_vec()
        } else {
            manager
                .graph
                .ordered_names()
                .iter()
                .filter(|name| part_names.contains(*name))
                .cloned()
                .collect()
        };

        let mut steps: Vec<Step> = step.previous_steps().to_vec();
        steps.push(step);
        for current_step in steps {
            if current_step == Step::Stage {
                collisions::check_for_collisions(
                    manager.graph.ordered_names().iter().map(|name| &manager.parts[name]),
                )?;
            }
            if current_step == Step::Prime {
                // Resolutions into the prime tree may be stale after a
                // clean; keep only what still lives in the stage tree.
                let stage_dir = manager.options.stage_dir();
                manager.soname_cache.reset_except_root(&stage_dir);
            }
            for name in &selected {
                self.handle_step(manager, part_names, name, step, current_step)?;
            }
        }
        Ok(())
    }

    fn handle_step(
        &mut self,
        manager: &mut LifecycleManager,
        requested_part_names: &[String],
        name: &str,
        requested_step: Step,
        current_step: Step,
    ) -> Result<()> {
        // Never ran: just run it.
        if !self.cache.has_step_run(&manager.parts[name], current_step) {
            return self.run_step(manager, name, current_step, "");
        }

        // Explicitly requested for this exact step: clean and re-run.
        if !requested_part_names.is_empty()
            && current_step == requested_step
            && requested_part_names.iter().any(|requested| requested.as_str() == name)
        {
            return self.rerun_step(manager, name, current_step, "");
        }

        // Configuration drifted: clean and re-run (or error, per policy).
        let dirty_report = {
            let ctx = status_context(manager);
            self.cache.get_dirty_report(&ctx, name, current_step)?
        };
        if let Some(report) = dirty_report {
            return self.handle_dirty(manager, name, current_step, &report.summary());
        }

        // Inputs on disk drifted: update in place if the plugin can,
        // otherwise clean and re-run.
        let outdated_report = {
            let ctx = status_context(manager);
            self.cache.get_outdated_report(&ctx, name, current_step)?
        };
        if let Some(report) = outdated_report {
            return self.handle_outdated(manager, name, current_step, &report.summary());
        }

        info!("Skipping {} {} (already ran)", current_step, name);
        Ok(())
    }

    fn handle_dirty(
        &mut self,
        manager: &mut LifecycleManager,
        name: &str,
        step: Step,
        summary: &str,
    ) -> Result<()> {
        if !step.clean_if_dirty() && self.outdated_step_action == OutdatedStepAction::Error {
            return Err(Error::StepOutdated {
                step,
                part: name.to_string(),
                report: summary.to_string(),
            });
        }
        self.rerun_step(manager, name, step, summary)
    }

    fn handle_outdated(
        &mut self,
        manager: &mut LifecycleManager,
        name: &str,
        step: Step,
        summary: &str,
    ) -> Result<()> {
        if !step.clean_if_dirty() && self.outdated_step_action == OutdatedStepAction::Error {
            return Err(Error::StepOutdated {
                step,
                part: name.to_string(),
                report: summary.to_string(),
            });
        }

        if manager.parts[name].plugin.supports_update(step) {
            self.prepare_step(manager, name, step)?;
            info!("Updating {} step for {} ({})", step, name, summary);

            let environment = manager.build_env_for_part(name, true);
            let parallel_build_count = manager.options.parallel_build_count();
            let arch_triplet = manager.options.arch_triplet();
            {
                let LifecycleManager { ref mut parts, ref runner, .. } = *manager;
                let part = parts.get_mut(name).unwrap();
                part.update(step, runner, &environment, parallel_build_count, arch_triplet)?;
            }
            write_state(manager, name, step, &BTreeSet::new())?;
            self.complete_step(name, step);
            return Ok(());
        }

        self.rerun_step(manager, name, step, summary)
    }

    /// The cache-miss path: bring dependencies to their prerequisite
    /// step, assemble the environment, run callbacks around the step body
    /// and persist the new state.
    fn run_step(
        &mut self,
        manager: &mut LifecycleManager,
        name: &str,
        step: Step,
        hint: &str,
    ) -> Result<()> {
        self.prepare_step(manager, name, step)?;

        let progress = match step {
            Step::Pull => "Pulling",
            Step::Build => "Building",
            Step::Stage => "Staging",
            Step::Prime => "Priming",
        };
        if hint.is_empty() {
            info!("{} {}", progress, name);
        } else {
            info!("{} {} ({})", progress, name, hint);
        }

        manager.parts[name].makedirs()?;

        // The plugin's preparation hook runs once dependencies are ready,
        // before the environment is composed and any callback fires.
        let parallel_build_count = manager.options.parallel_build_count();
        let arch_triplet = manager.options.arch_triplet();
        {
            let LifecycleManager { ref mut parts, ref runner, .. } = *manager;
            let part = parts.get_mut(name).unwrap();
            part.prepare(step, runner, &[], parallel_build_count, arch_triplet)?;
        }

        let environment = manager.build_env_for_part(name, true);

        {
            let data = manager.part_data(name, step);
            for callback in manager.registry.pre_step_callbacks() {
                callback(&data);
            }
        }

        let mut prime_dependencies = BTreeSet::new();
        execute_step_body(manager, name, step, &environment, &mut prime_dependencies)?;

        {
            let data = manager.part_data(name, step);
            for callback in manager.registry.post_step_callbacks() {
                callback(&data);
            }
        }

        write_state(manager, name, step, &prime_dependencies)?;

        self.complete_step(name, step);
        Ok(())
    }

    /// Clean the step and everything after it, then run it again.
    fn rerun_step(
        &mut self,
        manager: &mut LifecycleManager,
        name: &str,
        step: Step,
        hint: &str,
    ) -> Result<()> {
        let staged_states = manager.stage_states()?;
        let primed_states = manager.prime_states()?;
        manager.parts[name].clean(
            &staged_states,
            &primed_states,
            step,
            &manager.options.stage_dir(),
            &manager.options.prime_dir(),
        )?;

        self.cache.clear_step(name, step);
        for later in step.next_steps() {
            self.cache.clear_step(name, *later);
        }

        let rerun_hint = if hint.is_empty() {
            "re-running".to_string()
        } else {
            format!("re-running: {}", hint)
        };
        self.run_step(manager, name, step, &rerun_hint)
    }

    /// Make sure every dependency has reached the prerequisite step for
    /// `step`, recursing into a nested run when some have not.
    fn prepare_step(
        &mut self,
        manager: &mut LifecycleManager,
        name: &str,
        step: Step,
    ) -> Result<()> {
        let prerequisite = match dependency_prerequisite_step(step) {
            Some(prerequisite) => prerequisite,
            None => return Ok(()),
        };

        let mut pending = Vec::new();
        for dependency in manager.graph.get_dependencies(name, false) {
            let ctx = status_context(manager);
            if self.cache.should_step_run(&ctx, &dependency, prerequisite)? {
                pending.push(dependency);
            }
        }

        if !pending.is_empty() {
            info!(
                "{:?} has dependencies that need to be {}d: {}",
                name,
                prerequisite,
                pending.join(" ")
            );
            self.run(manager, prerequisite, &pending)?;
        }
        Ok(())
    }

    fn complete_step(&mut self, name: &str, step: Step) {
        self.cache.clear_step(name, step);
        self.steps_were_run = true;
    }
}

fn status_context(manager: &LifecycleManager) -> StatusContext<'_> {
    StatusContext { parts: &manager.parts, graph: &manager.graph, options: &manager.options }
}

/// Variables exported (quoted) into the step script on top of the
/// assembled environment.
fn step_extra_env(manager: &LifecycleManager, name: &str, step: Step) -> BTreeMap<String, String> {
    let mut extra: BTreeMap<String, String> = manager.project_env_pairs().into_iter().collect();
    for (key, value) in env::part_directory_env(&manager.parts[name], Some(step)) {
        extra.insert(key, value);
    }
    extra
}

/// Run the step body: the override scriptlet when one is declared (its
/// ctl calls dispatch back into the default body), the default body
/// otherwise.
fn execute_step_body(
    manager: &mut LifecycleManager,
    name: &str,
    step: Step,
    environment: &[String],
    prime_dependencies: &mut BTreeSet<PathBuf>,
) -> Result<()> {
    let extra_env = step_extra_env(manager, name, step);
    let stage_dir = manager.options.stage_dir();
    let prime_dir = manager.options.prime_dir();
    let parallel_build_count = manager.options.parallel_build_count();
    let arch_triplet = manager.options.arch_triplet();

    let LifecycleManager { ref mut parts, ref runner, ref options, ref mut soname_cache, .. } =
        *manager;
    let part = parts.get_mut(name).unwrap();
    let cwd = match step {
        Step::Pull => part.source_dir().to_path_buf(),
        Step::Build => part.build_dir().to_path_buf(),
        Step::Stage => options.stage_dir(),
        Step::Prime => options.prime_dir(),
    };
    std::fs::create_dir_all(&cwd)?;

    let scriptlet = part.scriptlets().get(step).map(|text| text.to_string());
    match scriptlet {
        Some(scriptlet) => {
            let scriptlet_name = format!("override-{} of part {:?}", step, name);
            let mut handler = |request: &CtlRequest| -> Result<()> {
                let requested: Step = request.function.parse().map_err(|_| {
                    Error::InvalidInput(format!("unknown ctl function {:?}", request.function))
                })?;
                if requested != step {
                    return Err(Error::InvalidInput(format!(
                        "cannot run the {} step from an override of the {} step",
                        requested, step
                    )));
                }
                default_step_body(
                    part,
                    runner,
                    step,
                    environment,
                    &extra_env,
                    &stage_dir,
                    &prime_dir,
                    parallel_build_count,
                    arch_triplet,
                    soname_cache,
                    prime_dependencies,
                )
            };
            scriptlets::run_scriptlet(
                runner,
                &scriptlet_name,
                &scriptlet,
                environment,
                &extra_env,
                &cwd,
                &mut handler,
            )
        }
        None => default_step_body(
            part,
            runner,
            step,
            environment,
            &extra_env,
            &stage_dir,
            &prime_dir,
            parallel_build_count,
            arch_triplet,
            soname_cache,
            prime_dependencies,
        ),
    }
}

fn default_step_body(
    part: &mut Part,
    runner: &Runner,
    step: Step,
    environment: &[String],
    extra_env: &BTreeMap<String, String>,
    stage_dir: &Path,
    prime_dir: &Path,
    parallel_build_count: usize,
    arch_triplet: &str,
    soname_cache: &mut SonameCache,
    prime_dependencies: &mut BTreeSet<PathBuf>,
) -> Result<()> {
    match step {
        Step::Pull => part.pull(runner, environment, parallel_build_count, arch_triplet),
        Step::Build => {
            part.build(runner, environment, extra_env, parallel_build_count, arch_triplet)
        }
        Step::Stage => {
            let resolved = part.stage_files()?;
            part::migrate_files(&resolved.files, &resolved.dirs, part.install_dir(), stage_dir)
        }
        Step::Prime => {
            let staged = staged_files(part)?;
            let primed = part.prime_files(&staged)?;
            let dirs = implied_dirs(&primed);
            part::migrate_files(&primed, &dirs, stage_dir, prime_dir)?;

            let primed_list: Vec<PathBuf> = primed.iter().cloned().collect();
            let elf_files = elf::get_elf_files(prime_dir, &primed_list);
            let mut dependencies = BTreeSet::new();
            for elf_file in elf_files.values() {
                dependencies.extend(elf_file.load_dependencies(
                    prime_dir,
                    None,
                    &[],
                    arch_triplet,
                    soname_cache,
                ));
            }

            // Closure entries living in the stage tree ride along into
            // the payload.
            for dependency in &dependencies {
                if let Ok(relative) = dependency.strip_prefix(stage_dir) {
                    let mut files = BTreeSet::new();
                    files.insert(relative.to_path_buf());
                    part::migrate_files(&files, &implied_dirs(&files), stage_dir, prime_dir)?;
                }
            }

            *prime_dependencies = dependencies;
            Ok(())
        }
    }
}

/// Persist the state record for a freshly run (or updated) step.
fn write_state(
    manager: &LifecycleManager,
    name: &str,
    step: Step,
    prime_dependencies: &BTreeSet<PathBuf>,
) -> Result<()> {
    let part = &manager.parts[name];
    let options = &manager.options;

    let state = match step {
        Step::Pull => PartState::Pull(PullState {
            schema_version: SCHEMA_VERSION,
            source: part.source_identity(),
            pull_properties: part.pull_properties_snapshot(),
            source_options: part.source_options_snapshot(),
            stage_packages: part.stage_packages().to_vec(),
            scriptlet_digests: part.scriptlets().digests(),
        }),
        Step::Build => PartState::Build(BuildState {
            schema_version: SCHEMA_VERSION,
            build_properties: part.build_properties_snapshot(),
            build_packages: part.build_packages_list(),
            build_attributes: part.build_attributes().to_vec(),
            cross_compiling: options.is_cross_compiling(),
            arch_triplet: options.arch_triplet().to_string(),
            scriptlet_digests: part.scriptlets().digests(),
        }),
        Step::Stage => {
            let resolved = part.stage_files()?;
            PartState::Stage(StageState {
                schema_version: SCHEMA_VERSION,
                files: resolved.files.into_iter().collect(),
                directories: resolved.dirs.into_iter().collect(),
                stage_entries: part.stage_entries().to_vec(),
            })
        }
        Step::Prime => {
            let staged = staged_files(part)?;
            let primed = part.prime_files(&staged)?;
            let directories = implied_dirs(&primed);
            PartState::Prime(PrimeState {
                schema_version: SCHEMA_VERSION,
                files: primed.into_iter().collect(),
                directories: directories.into_iter().collect(),
                dependency_paths: prime_dependencies.iter().cloned().collect(),
                prime_entries: part.prime_entries().to_vec(),
                scriptlet_digests: part.scriptlets().digests(),
            })
        }
    };

    states::write(part.state_dir(), &state)
}

/// The files this part staged, from its own stage state.
fn staged_files(part: &Part) -> Result<BTreeSet<PathBuf>> {
    match states::read(part.state_dir(), Step::Stage)? {
        Some(PartState::Stage(state)) => Ok(state.files.into_iter().collect()),
        _ => Err(Error::MissingState { part: part.name().to_string(), step: Step::Stage }),
    }
}

fn implied_dirs(files: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    let mut dirs = BTreeSet::new();
    for file in files {
        let mut parent = file.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }
    dirs
}
