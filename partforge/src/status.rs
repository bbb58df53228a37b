//! Step status: deciding whether persisted work can be reused. A step is
//! *dirty* when the recorded inputs no longer match the current
//! configuration (directly, through an earlier step of the same part, or
//! through a dependency), and *outdated* when its on-disk inputs changed
//! after the state was written. Reports carry the differing keys for
//! diagnostics and clean hints.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use log::debug;

use crate::errors::Result;
use crate::graph::PartGraph;
use crate::part::Part;
use crate::project::ProjectOptions;
use crate::sources;
use crate::states::{self, PartState};
use crate::steps::{dependency_prerequisite_step, Step};

/// Why a step's configuration no longer matches its recorded state.
#[derive(Clone, Debug, Default)]
pub struct DirtyReport {
    /// Part property names that changed.
    pub dirty_properties: Vec<String>,
    /// Project-level option names that changed.
    pub dirty_project_options: Vec<String>,
    /// Dependencies whose prerequisite step changed or re-ran.
    pub changed_dependencies: Vec<ChangedDependency>,
    /// An earlier step of the same part is itself no longer valid.
    pub previous_step_modified: Option<Step>,
}

#[derive(Clone, Debug)]
pub struct ChangedDependency {
    pub name: String,
    pub step: Step,
}

impl DirtyReport {
    pub fn summary(&self) -> String {
        let mut reasons = Vec::new();
        if !self.dirty_properties.is_empty() {
            reasons.push(format!(
                "{} properties changed",
                self.dirty_properties.iter().map(|p| format!("{:?}", p)).join(", ")
            ));
        }
        if !self.dirty_project_options.is_empty() {
            reasons.push(format!(
                "{} options changed",
                self.dirty_project_options.iter().map(|o| format!("{:?}", o)).join(", ")
            ));
        }
        if !self.changed_dependencies.is_empty() {
            reasons.push(format!(
                "{} changed",
                self.changed_dependencies.iter().map(|d| format!("{:?}", d.name)).join(", ")
            ));
        }
        if let Some(step) = self.previous_step_modified {
            reasons.push(format!("the {} step changed", step));
        }
        reasons.join(" and ")
    }
}

/// Why a step's on-disk inputs are newer than its recorded state.
#[derive(Clone, Debug, Default)]
pub struct OutdatedReport {
    pub reasons: Vec<String>,
}

impl OutdatedReport {
    pub fn summary(&self) -> String {
        self.reasons.join(" and ")
    }
}

/// Everything status decisions need to look at.
pub struct StatusContext<'a> {
    pub parts: &'a BTreeMap<String, Part>,
    pub graph: &'a PartGraph,
    pub options: &'a ProjectOptions,
}

/// Memoizes per-(part, step) status over one executor run. Must be
/// invalidated (`clear_step`) whenever a step is cleaned or re-run.
#[derive(Default)]
pub struct StatusCache {
    dirty_reports: HashMap<(String, Step), Option<DirtyReport>>,
    outdated_reports: HashMap<(String, Step), Option<OutdatedReport>>,
}

impl StatusCache {
    pub fn new() -> StatusCache {
        StatusCache::default()
    }

    pub fn has_step_run(&self, part: &Part, step: Step) -> bool {
        states::state_file(part.state_dir(), step).exists()
    }

    /// Forget everything cached about `(part, step)`.
    pub fn clear_step(&mut self, name: &str, step: Step) {
        self.dirty_reports.remove(&(name.to_string(), step));
        self.outdated_reports.remove(&(name.to_string(), step));
    }

    /// Whether the step needs to run: it never ran, or its state is dirty
    /// or outdated.
    pub fn should_step_run(
        &mut self,
        ctx: &StatusContext<'_>,
        name: &str,
        step: Step,
    ) -> Result<bool> {
        let part = &ctx.parts[name];
        Ok(!self.has_step_run(part, step)
            || self.get_dirty_report(ctx, name, step)?.is_some()
            || self.get_outdated_report(ctx, name, step)?.is_some())
    }

    pub fn get_dirty_report(
        &mut self,
        ctx: &StatusContext<'_>,
        name: &str,
        step: Step,
    ) -> Result<Option<DirtyReport>> {
        let key = (name.to_string(), step);
        if let Some(report) = self.dirty_reports.get(&key) {
            return Ok(report.clone());
        }
        let report = self.compute_dirty_report(ctx, name, step)?;
        self.dirty_reports.insert(key, report.clone());
        Ok(report)
    }

    fn compute_dirty_report(
        &mut self,
        ctx: &StatusContext<'_>,
        name: &str,
        step: Step,
    ) -> Result<Option<DirtyReport>> {
        let part = &ctx.parts[name];
        if !self.has_step_run(part, step) {
            return Ok(None);
        }

        if let Some(report) = part_dirty_report(part, ctx.options, step)? {
            debug!("{} step of {:?} is dirty: {}", step, name, report.summary());
            return Ok(Some(report));
        }

        // A step sitting on top of an invalid earlier step is itself
        // invalid, even if its own inputs still match.
        for previous in step.previous_steps() {
            if self.should_step_run(ctx, name, *previous)? {
                return Ok(Some(DirtyReport {
                    previous_step_modified: Some(*previous),
                    ..Default::default()
                }));
            }
        }

        if let Some(prerequisite) = dependency_prerequisite_step(step) {
            let mut changed = Vec::new();
            for dependency in ctx.graph.direct_dependencies(name).to_vec() {
                let rerun = self.should_step_run(ctx, &dependency, prerequisite)?;
                let newer = dependency_state_is_newer(ctx, &dependency, prerequisite, part, step);
                if rerun || newer {
                    changed.push(ChangedDependency { name: dependency, step: prerequisite });
                }
            }
            if !changed.is_empty() {
                return Ok(Some(DirtyReport {
                    changed_dependencies: changed,
                    ..Default::default()
                }));
            }
        }

        Ok(None)
    }

    pub fn get_outdated_report(
        &mut self,
        ctx: &StatusContext<'_>,
        name: &str,
        step: Step,
    ) -> Result<Option<OutdatedReport>> {
        let key = (name.to_string(), step);
        if let Some(report) = self.outdated_reports.get(&key) {
            return Ok(report.clone());
        }
        let report = compute_outdated_report(&ctx.parts[name], ctx.options, step)?;
        self.outdated_reports.insert(key, report.clone());
        Ok(report)
    }
}

/// Was the dependency's prerequisite state written after this part's step
/// state? A missing dependency state (cleaned) also counts as changed.
fn dependency_state_is_newer(
    ctx: &StatusContext<'_>,
    dependency: &str,
    prerequisite: Step,
    part: &Part,
    step: Step,
) -> bool {
    let own_mtime = match states::state_mtime(part.state_dir(), step) {
        Some(mtime) => mtime,
        None => return false,
    };
    match states::state_mtime(ctx.parts[dependency].state_dir(), prerequisite) {
        Some(dependency_mtime) => dependency_mtime > own_mtime,
        None => true,
    }
}

/// Diff the persisted record against the current configuration for one
/// part and step.
fn part_dirty_report(
    part: &Part,
    options: &ProjectOptions,
    step: Step,
) -> Result<Option<DirtyReport>> {
    let state = match states::read(part.state_dir(), step)? {
        Some(state) => state,
        None => return Ok(None),
    };

    let mut report = DirtyReport::default();
    match state {
        PartState::Pull(state) => {
            if state.source != part.source_identity() {
                report.dirty_properties.push("source".to_string());
            }
            diff_maps(&state.pull_properties, &part.pull_properties_snapshot(), &mut report.dirty_properties);
            diff_maps(&state.source_options, &part.source_options_snapshot(), &mut report.dirty_properties);
            if state.stage_packages != part.stage_packages() {
                report.dirty_properties.push("stage-packages".to_string());
            }
            if state.scriptlet_digests != part.scriptlets().digests() {
                report.dirty_properties.push("override-pull".to_string());
            }
        }
        PartState::Build(state) => {
            diff_maps(&state.build_properties, &part.build_properties_snapshot(), &mut report.dirty_properties);
            if state.build_packages != part.build_packages_list() {
                report.dirty_properties.push("build-packages".to_string());
            }
            if state.build_attributes != part.build_attributes() {
                report.dirty_properties.push("build-attributes".to_string());
            }
            if state.scriptlet_digests != part.scriptlets().digests() {
                report.dirty_properties.push("override-build".to_string());
            }
            if state.cross_compiling != options.is_cross_compiling() {
                report.dirty_project_options.push("cross-compiling".to_string());
            }
            if state.arch_triplet != options.arch_triplet() {
                report.dirty_project_options.push("arch-triplet".to_string());
            }
        }
        PartState::Stage(state) => {
            if state.stage_entries != part.stage_entries() {
                report.dirty_properties.push("stage".to_string());
            }
        }
        PartState::Prime(state) => {
            if state.prime_entries != part.prime_entries() {
                report.dirty_properties.push("prime".to_string());
            }
            if state.scriptlet_digests != part.scriptlets().digests() {
                report.dirty_properties.push("override-prime".to_string());
            }
        }
    }

    if report.dirty_properties.is_empty() && report.dirty_project_options.is_empty() {
        Ok(None)
    } else {
        Ok(Some(report))
    }
}

fn diff_maps(
    recorded: &BTreeMap<String, serde_json::Value>,
    current: &BTreeMap<String, serde_json::Value>,
    dirty: &mut Vec<String>,
) {
    for key in recorded.keys().chain(current.keys()).unique() {
        if recorded.get(key) != current.get(key) {
            dirty.push(key.clone());
        }
    }
}

/// Did the step's declared on-disk inputs change after its state was
/// written?
fn compute_outdated_report(
    part: &Part,
    options: &ProjectOptions,
    step: Step,
) -> Result<Option<OutdatedReport>> {
    let state_mtime = match states::state_mtime(part.state_dir(), step) {
        Some(mtime) => mtime,
        None => return Ok(None),
    };

    let mut reasons = Vec::new();
    match step {
        Step::Pull => {
            if let Some(ref handler) = part.source_handler {
                if handler.is_outdated_since(state_mtime)? {
                    reasons.push("source changed".to_string());
                }
            }
        }
        Step::Build => {
            if tree_newer_than(part.source_dir(), state_mtime)? {
                reasons.push(format!("{:?} changed", part.source_dir()));
            }
        }
        Step::Stage => {
            if tree_newer_than(part.install_dir(), state_mtime)? {
                reasons.push(format!("{:?} changed", part.install_dir()));
            }
        }
        Step::Prime => {
            if tree_newer_than(part.install_dir(), state_mtime)? {
                reasons.push(format!("{:?} changed", part.install_dir()));
            }
            // Staged files this part contributes can also go stale.
            if let Some(PartState::Stage(stage_state)) =
                states::read(part.state_dir(), Step::Stage)?
            {
                let stage_dir = options.stage_dir();
                let staged_newer = stage_state.files.iter().any(|file| {
                    std::fs::metadata(stage_dir.join(file))
                        .and_then(|m| m.modified())
                        .map(|mtime| mtime > state_mtime)
                        .unwrap_or(false)
                });
                if staged_newer {
                    reasons.push("staged files changed".to_string());
                }
            }
        }
    }

    if reasons.is_empty() {
        Ok(None)
    } else {
        debug!("{} step of {:?} is outdated: {}", step, part.name(), reasons.join(", "));
        Ok(Some(OutdatedReport { reasons }))
    }
}

fn tree_newer_than(root: &std::path::Path, since: std::time::SystemTime) -> Result<bool> {
    Ok(sources::newest_mtime(root)?.map(|newest| newest > since).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_report_summaries_name_what_changed() {
        let report = DirtyReport {
            dirty_properties: vec!["stage".to_string()],
            dirty_project_options: vec![],
            changed_dependencies: vec![ChangedDependency { name: "base".to_string(), step: Step::Stage }],
            previous_step_modified: None,
        };
        let summary = report.summary();
        assert!(summary.contains("\"stage\" properties changed"));
        assert!(summary.contains("\"base\" changed"));
    }

    #[test]
    fn outdated_report_summary_joins_reasons() {
        let report = OutdatedReport {
            reasons: vec!["source changed".to_string(), "install changed".to_string()],
        };
        assert_eq!(report.summary(), "source changed and install changed");
    }
}
