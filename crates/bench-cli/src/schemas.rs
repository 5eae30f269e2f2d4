use anyhow::{anyhow, Context, Result};
use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub fn schema_json(name: &str) -> Result<Value> {
    let file = SCHEMAS
        .get_file(name)
        .ok_or_else(|| anyhow!("schema not embedded: {}", name))?;
    let raw = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema is not utf-8: {}", name))?;
    serde_json::from_str(raw).with_context(|| format!("schema is not JSON: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let value = schema_json(name)?;
    JSONSchema::compile(&value).map_err(|e| anyhow!("schema {} does not compile: {}", name, e))
}

/// Every violation of `schema` by `instance`, rendered with its location.
pub fn violations(schema: &JSONSchema, instance: &Value) -> Vec<String> {
    match schema.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect(),
    }
}
