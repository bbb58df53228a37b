//! The `nil` plugin: declares nothing and builds nothing. Useful for
//! parts that only stage packages or only exist to order other parts.

use serde_json::{json, Value};

use crate::plugins::v2::PluginV2;

#[derive(Debug, Default)]
pub struct NilPlugin;

impl PluginV2 for NilPlugin {
    fn get_schema(&self) -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-04/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {},
        })
    }

    fn get_build_commands(&self) -> Vec<String> {
        Vec::new()
    }
}
