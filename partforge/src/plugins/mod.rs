//! Plugin contracts and the registry that holds everything an embedding
//! application can hook into: plugin constructors, step callbacks and
//! source-handler factories. The registry is a plain value constructed
//! once and handed to the lifecycle manager; there is no process-global
//! mutable state.

pub mod dump;
pub mod nil;
pub mod v1;
pub mod v2;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use log::debug;
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::project::{PartData, ProjectOptions};
use crate::runner::Runner;
use crate::sources::SourceFactory;

pub use self::v1::PluginV1;
pub use self::v2::PluginV2;

/// A loaded plugin instance for one part.
pub enum Plugin {
    V1(Box<dyn PluginV1>),
    V2(Box<dyn PluginV2>),
}

impl Plugin {
    /// Property names that determine the part's pull output.
    pub fn pull_properties(&self) -> Vec<String> {
        match self {
            Plugin::V1(plugin) => plugin.get_pull_properties(),
            Plugin::V2(_) => Vec::new(),
        }
    }

    /// Property names that determine the part's build output. For the
    /// declarative contract every schema property is a build property.
    pub fn build_properties(&self) -> Vec<String> {
        match self {
            Plugin::V1(plugin) => plugin.get_build_properties(),
            Plugin::V2(plugin) => match plugin.get_schema().get("properties") {
                Some(Value::Object(properties)) => properties.keys().cloned().collect(),
                _ => Vec::new(),
            },
        }
    }

    pub fn build_packages(&self) -> BTreeSet<String> {
        match self {
            Plugin::V1(plugin) => plugin.get_build_packages(),
            Plugin::V2(plugin) => plugin.get_build_packages(),
        }
    }

    pub fn build_snaps(&self) -> BTreeSet<String> {
        match self {
            Plugin::V1(_) => BTreeSet::new(),
            Plugin::V2(plugin) => plugin.get_build_snaps(),
        }
    }

    /// Environment entries the plugin contributes against `root`.
    pub fn env(&self, root: &Path) -> Vec<String> {
        match self {
            Plugin::V1(plugin) => plugin.env(root),
            Plugin::V2(_) => Vec::new(),
        }
    }

    pub fn supports_update(&self, step: crate::steps::Step) -> bool {
        match self {
            Plugin::V1(plugin) => plugin.supports_update(step),
            Plugin::V2(_) => false,
        }
    }
}

/// Everything a plugin constructor gets to look at.
pub struct PluginInit<'a> {
    pub part_name: &'a str,
    pub properties: &'a serde_json::Map<String, Value>,
    pub options: &'a ProjectOptions,
}

pub type PluginBuilder = Box<dyn Fn(&PluginInit<'_>) -> Result<Plugin> + Send + Sync>;

/// Callback invoked around each step execution with the current
/// `PartData`. Callbacks run in registration order.
pub type StepCallback = Box<dyn Fn(&PartData<'_>) + Send + Sync>;

/// Host context handed to imperative (v1) plugin bodies.
pub struct StepContext<'a> {
    pub part_name: &'a str,
    pub source_dir: &'a Path,
    pub build_dir: &'a Path,
    pub install_dir: &'a Path,
    pub arch_triplet: &'a str,
    pub parallel_build_count: usize,
    pub env: &'a [String],
    pub(crate) runner: &'a Runner,
}

impl<'a> StepContext<'a> {
    /// Run a command under the assembled step environment.
    pub fn run(&self, cmd: &[String], cwd: &Path) -> Result<()> {
        self.runner.run(cmd, self.env, &BTreeMap::new(), cwd)
    }

    pub fn run_output(&self, cmd: &[String], cwd: &Path) -> Result<String> {
        self.runner.run_output(cmd, self.env, &BTreeMap::new(), cwd)
    }
}

pub struct Registry {
    plugins: HashMap<String, PluginBuilder>,
    pre_step_callbacks: Vec<StepCallback>,
    post_step_callbacks: Vec<StepCallback>,
    source_factories: HashMap<String, SourceFactory>,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

impl Registry {
    /// A registry with the built-in plugins and nothing else.
    pub fn new() -> Registry {
        let mut registry = Registry {
            plugins: HashMap::new(),
            pre_step_callbacks: Vec::new(),
            post_step_callbacks: Vec::new(),
            source_factories: HashMap::new(),
        };
        registry.register_plugin("nil", Box::new(|_| Ok(Plugin::V2(Box::new(nil::NilPlugin)))));
        registry
            .register_plugin("dump", Box::new(|_| Ok(Plugin::V2(Box::new(dump::DumpPlugin)))));
        registry
    }

    /// Register (or replace) a plugin constructor under `name`. Custom
    /// plugins shadow built-ins of the same name.
    pub fn register_plugin(&mut self, name: impl Into<String>, builder: PluginBuilder) {
        self.plugins.insert(name.into(), builder);
    }

    pub fn register_pre_step_callback(&mut self, callback: StepCallback) {
        self.pre_step_callbacks.push(callback);
    }

    pub fn register_post_step_callback(&mut self, callback: StepCallback) {
        self.post_step_callbacks.push(callback);
    }

    /// Register a source handler factory for a source type (e.g. `git`).
    pub fn register_source_handler(&mut self, source_type: impl Into<String>, factory: SourceFactory) {
        self.source_factories.insert(source_type.into(), factory);
    }

    pub(crate) fn load_plugin(&self, name: Option<&str>, init: &PluginInit<'_>) -> Result<Plugin> {
        let name = name.unwrap_or("nil");
        debug!("setting up part {:?} with plugin {:?}", init.part_name, name);
        let builder = self.plugins.get(name).ok_or_else(|| Error::PluginLoad {
            plugin: name.to_string(),
            part: init.part_name.to_string(),
            message: "unknown plugin".to_string(),
        })?;
        builder(init)
    }

    pub(crate) fn pre_step_callbacks(&self) -> &[StepCallback] {
        &self.pre_step_callbacks
    }

    pub(crate) fn post_step_callbacks(&self) -> &[StepCallback] {
        &self.post_step_callbacks
    }

    pub(crate) fn source_factories(&self) -> &HashMap<String, SourceFactory> {
        &self.source_factories
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_args() -> (serde_json::Map<String, Value>, ProjectOptions) {
        (serde_json::Map::new(), ProjectOptions::new("/work").unwrap())
    }

    #[test]
    fn builtin_plugins_load() {
        let registry = Registry::new();
        let (properties, options) = init_args();
        let init = PluginInit { part_name: "x", properties: &properties, options: &options };
        assert!(registry.load_plugin(Some("nil"), &init).is_ok());
        assert!(registry.load_plugin(Some("dump"), &init).is_ok());
        assert!(registry.load_plugin(None, &init).is_ok());
    }

    #[test]
    fn unknown_plugins_fail_to_load() {
        let registry = Registry::new();
        let (properties, options) = init_args();
        let init = PluginInit { part_name: "x", properties: &properties, options: &options };
        assert!(matches!(
            registry.load_plugin(Some("ghost"), &init),
            Err(Error::PluginLoad { .. })
        ));
    }

    #[test]
    fn custom_plugins_shadow_builtins() {
        struct Loud;
        impl PluginV2 for Loud {
            fn get_schema(&self) -> Value {
                serde_json::json!({"properties": {"message": {"type": "string"}}})
            }
            fn get_build_commands(&self) -> Vec<String> {
                vec!["echo hello".to_string()]
            }
        }

        let mut registry = Registry::new();
        registry.register_plugin("nil", Box::new(|_| Ok(Plugin::V2(Box::new(Loud)))));
        let (properties, options) = init_args();
        let init = PluginInit { part_name: "x", properties: &properties, options: &options };
        let plugin = registry.load_plugin(Some("nil"), &init).unwrap();
        assert_eq!(plugin.build_properties(), vec!["message".to_string()]);
    }
}
