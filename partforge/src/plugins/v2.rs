//! The declarative plugin contract: the plugin only states what it needs
//! (packages, snaps, environment) and which shell commands build the
//! part; the host owns execution. Pulling is driven entirely by the
//! declared source.

use std::collections::BTreeSet;

use serde_json::Value;

pub trait PluginV2 {
    /// JSON schema for the plugin's own properties.
    fn get_schema(&self) -> Value;

    fn get_build_packages(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn get_build_snaps(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Ordered environment mapping exported before the build commands.
    fn get_build_environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Shell commands executed, in order, in the part build directory.
    fn get_build_commands(&self) -> Vec<String>;
}
