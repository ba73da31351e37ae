//! Parameter and output contract validation (JSON-Schema draft-7).
//!
//! Rejections are structured so an AI orchestrator can self-correct without
//! an extra round trip: each error carries the offending path in `$.dotted`
//! form, and callers echo the schema back in the response body.

use anyhow::Result;
use jsonschema::{Draft, Validator, error::ValidationErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    /// Offending location in the instance, e.g. `$.prompt`.
    pub path: String,
    pub message: String,
    /// Location of the violated keyword in the schema.
    pub schema_path: String,
}

/// Compile a draft-7 schema. Invalid schemas are a registration-time error.
pub fn compile(schema: &Value) -> Result<Validator> {
    jsonschema::options()
        .with_draft(Draft::Draft7)
        .build(schema)
        .map_err(|err| anyhow::anyhow!("compiling JSON schema: {err}"))
}

/// Validate an instance, returning every violation. An empty vec means the
/// instance conforms.
pub fn validate(schema: &Value, instance: &Value) -> Result<Vec<ValidationErrorDetail>> {
    let validator = compile(schema)?;

    let details = validator
        .iter_errors(instance)
        .map(|err| {
            let path = match &err.kind {
                // Missing-property errors point at the object, not the
                // property; surface the property itself.
                ValidationErrorKind::Required { property } => {
                    let base = pointer_to_dollar(&err.instance_path.to_string());
                    let name = property.as_str().unwrap_or_default();
                    if base == "$" {
                        format!("$.{}", name)
                    } else {
                        format!("{}.{}", base, name)
                    }
                }
                _ => pointer_to_dollar(&err.instance_path.to_string()),
            };

            ValidationErrorDetail {
                path,
                message: err.to_string(),
                schema_path: err.schema_path.to_string(),
            }
        })
        .collect();

    Ok(details)
}

/// Convert a JSON pointer (`/a/0/b`) into `$.a[0].b`.
fn pointer_to_dollar(pointer: &str) -> String {
    if pointer.is_empty() {
        return "$".to_string();
    }

    let mut out = String::from("$");
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
            out.push('[');
            out.push_str(&segment);
            out.push(']');
        } else {
            out.push('.');
            out.push_str(&segment);
        }
    }
    out
}
