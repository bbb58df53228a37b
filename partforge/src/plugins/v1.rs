//! The original plugin contract: the plugin owns the pull and build
//! bodies, declares which of its properties feed pull vs. build state,
//! and runs commands through the host with the environment the host
//! assembled.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::plugins::StepContext;
use crate::steps::Step;

pub trait PluginV1 {
    /// JSON schema fragment for the plugin's own properties.
    fn schema(&self) -> Value {
        Value::Object(Default::default())
    }

    /// Property names whose values determine pull output.
    fn get_pull_properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Property names whose values determine build output.
    fn get_build_properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Extra packages this plugin needs on the build host.
    fn get_build_packages(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Environment entries contributed when building against `root`.
    fn env(&self, _root: &Path) -> Vec<String> {
        Vec::new()
    }

    /// Hook invoked before a step body runs, once dependencies are
    /// ready and the environment is composed.
    fn prepare(&mut self, _step: Step, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn pull(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn build(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Whether the plugin can refresh an outdated step in place instead
    /// of having it cleaned and re-run.
    fn supports_update(&self, _step: Step) -> bool {
        false
    }

    fn update(&mut self, step: Step, _ctx: &StepContext<'_>) -> Result<()> {
        Err(Error::InvalidInput(format!("plugin cannot update the {} step in place", step)))
    }
}
