use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// Build inputs snapshot: the plugin's declared build options, the
/// toolchain context, and the scriptlet digests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    pub schema_version: u32,
    pub build_properties: BTreeMap<String, Value>,
    pub build_packages: Vec<String>,
    pub build_attributes: Vec<String>,
    pub cross_compiling: bool,
    pub arch_triplet: String,
    pub scriptlet_digests: BTreeMap<String, String>,
}
