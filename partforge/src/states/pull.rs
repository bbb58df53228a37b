use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::sources::SourceIdentity;

/// Everything that determined the output of a pull: what was fetched and
/// under which options, plus the requested stage packages and the digests
/// of any scriptlet that overrides the step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PullState {
    pub schema_version: u32,
    pub source: Option<SourceIdentity>,
    pub pull_properties: BTreeMap<String, Value>,
    pub source_options: BTreeMap<String, Value>,
    pub stage_packages: Vec<String>,
    pub scriptlet_digests: BTreeMap<String, String>,
}
