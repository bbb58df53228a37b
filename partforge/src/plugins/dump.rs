//! The `dump` plugin: the build step copies the pulled source verbatim
//! into the part install directory.

use serde_json::{json, Value};

use crate::plugins::v2::PluginV2;

#[derive(Debug, Default)]
pub struct DumpPlugin;

impl PluginV2 for DumpPlugin {
    fn get_schema(&self) -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-04/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {},
        })
    }

    fn get_build_commands(&self) -> Vec<String> {
        vec!["cp --archive --link --no-dereference . \"$PART_INSTALL\"".to_string()]
    }
}
