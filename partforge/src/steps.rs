//! The lifecycle steps and their total order. Each part walks the same
//! four steps; dependents additionally require their dependencies to have
//! reached the prerequisite step before they can proceed.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// A step in a part's lifecycle. The derived `Ord` follows the execution
/// order: `Pull < Build < Stage < Prime`.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Pull,
    Build,
    Stage,
    Prime,
}

/// All steps, in execution order.
pub const STEPS: [Step; 4] = [Step::Pull, Step::Build, Step::Stage, Step::Prime];

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::Pull => "pull",
            Step::Build => "build",
            Step::Stage => "stage",
            Step::Prime => "prime",
        }
    }

    /// Steps that come before this one, in execution order.
    pub fn previous_steps(self) -> &'static [Step] {
        let index = STEPS.iter().position(|s| *s == self).unwrap();
        &STEPS[..index]
    }

    /// Steps that come after this one, in execution order.
    pub fn next_steps(self) -> &'static [Step] {
        let index = STEPS.iter().position(|s| *s == self).unwrap();
        &STEPS[index + 1..]
    }

    /// Whether a dirty instance of this step is silently cleaned and re-run
    /// under the default policy, without consulting the outdated-step action.
    pub fn clean_if_dirty(self) -> bool {
        match self {
            Step::Pull => false,
            Step::Build | Step::Stage | Step::Prime => true,
        }
    }
}

/// The step a *dependency* must have completed before a dependent may run
/// `step`. Pulling needs nothing from dependencies; everything else needs
/// them staged, since staged output is what dependents build against.
pub fn dependency_prerequisite_step(step: Step) -> Option<Step> {
    match step {
        Step::Pull => None,
        Step::Build | Step::Stage | Step::Prime => Some(Step::Stage),
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Step {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pull" => Ok(Step::Pull),
            "build" => Ok(Step::Build),
            "stage" => Ok(Step::Stage),
            "prime" => Ok(Step::Prime),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_totally_ordered() {
        assert!(Step::Pull < Step::Build);
        assert!(Step::Build < Step::Stage);
        assert!(Step::Stage < Step::Prime);
    }

    #[test]
    fn previous_and_next_steps() {
        assert_eq!(Step::Pull.previous_steps(), &[] as &[Step]);
        assert_eq!(Step::Prime.previous_steps(), &[Step::Pull, Step::Build, Step::Stage]);
        assert_eq!(Step::Pull.next_steps(), &[Step::Build, Step::Stage, Step::Prime]);
        assert_eq!(Step::Prime.next_steps(), &[] as &[Step]);
    }

    #[test]
    fn only_pull_keeps_dirty_state() {
        assert!(!Step::Pull.clean_if_dirty());
        assert!(Step::Build.clean_if_dirty());
        assert!(Step::Stage.clean_if_dirty());
        assert!(Step::Prime.clean_if_dirty());
    }

    #[test]
    fn dependencies_must_be_staged() {
        assert_eq!(dependency_prerequisite_step(Step::Pull), None);
        for step in &[Step::Build, Step::Stage, Step::Prime] {
            assert_eq!(dependency_prerequisite_step(*step), Some(Step::Stage));
        }
    }

    #[test]
    fn step_names_round_trip() {
        for step in &STEPS {
            assert_eq!(step.name().parse::<Step>(), Ok(*step));
        }
    }
}
