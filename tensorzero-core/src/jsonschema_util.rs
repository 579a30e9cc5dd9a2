use std::path::Path;
use std::sync::Arc;

use jsonschema::Validator;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::{Error, ErrorDetails};

/// A JSON Schema (draft-07) loaded from a config-relative path and compiled lazily in the
/// background. The compiled `Validator` borrows from `value` for its lifetime, so we leak
/// `value` onto the heap to get a `'static` reference we can hand to
/// `jsonschema::validator_for`, rather than re-parsing the schema on every validation call.
#[derive(Debug)]
pub struct JSONSchemaFromPath {
    pub path: String,
    pub value: &'static Value,
    compiled: Arc<OnceCell<Validator>>,
}

impl JSONSchemaFromPath {
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| ErrorDetails::Config {
            message: format!("Failed to read JSON schema at {}: {e}", path.display()),
        })?;
        let value: Value = serde_json::from_str(&contents).map_err(|e| ErrorDetails::Config {
            message: format!("Failed to parse JSON schema at {}: {e}", path.display()),
        })?;
        Ok(Self::new(value, path.display().to_string()))
    }

    pub fn new(value: Value, path: String) -> Self {
        let value: &'static Value = Box::leak(Box::new(value));
        let schema = Self {
            path,
            value,
            compiled: Arc::new(OnceCell::new()),
        };
        // Kick off compilation in the background so the first real validation call doesn't
        // pay for it; config-load-time schema errors should still surface fast (see
        // `validate`).
        let compiled = Arc::clone(&schema.compiled);
        let value_ref = schema.value;
        tokio::spawn(async move {
            let _ = compiled
                .get_or_try_init(|| async { compile(value_ref) })
                .await;
        });
        schema
    }

    pub async fn validate(&self, instance: &Value) -> Result<(), Error> {
        let validator = self
            .compiled
            .get_or_try_init(|| async { compile(self.value) })
            .await?;
        let errors: Vec<String> = validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorDetails::OutputValidation {
                message: errors.join("; "),
            }
            .into())
        }
    }
}

fn compile(value: &'static Value) -> Result<Validator, Error> {
    jsonschema::validator_for(value).map_err(|e| {
        ErrorDetails::JsonSchema {
            message: e.to_string(),
        }
        .into()
    })
}

/// A schema supplied dynamically on a request (`output_schema` override), compiled eagerly
/// since dynamic schemas are expected to be small and request-scoped.
#[derive(Debug, Clone)]
pub struct DynamicJSONSchema {
    pub value: Value,
}

impl DynamicJSONSchema {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn validate(&self, instance: &Value) -> Result<(), Error> {
        let validator = jsonschema::validator_for(&self.value).map_err(|e| ErrorDetails::JsonSchema {
            message: e.to_string(),
        })?;
        let errors: Vec<String> = validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorDetails::OutputValidation {
                message: errors.join("; "),
            }
            .into())
        }
    }
}

/// Either the function's configured schema or a request's dynamic override — whichever
/// applies for a given inference.
#[derive(Debug, Clone)]
pub enum JsonSchemaRef<'a> {
    Static(&'a Value),
    Dynamic(&'a DynamicJSONSchema),
}

impl JsonSchemaRef<'_> {
    pub fn value(&self) -> &Value {
        match self {
            JsonSchemaRef::Static(value) => value,
            JsonSchemaRef::Dynamic(schema) => &schema.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn validates_matching_instance() {
        let schema = JSONSchemaFromPath::new(
            json!({
                "type": "object",
                "properties": {"sentiment": {"type": "string"}},
                "required": ["sentiment"],
            }),
            "inline".to_string(),
        );
        assert!(schema.validate(&json!({"sentiment": "positive"})).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_non_matching_instance() {
        let schema = JSONSchemaFromPath::new(
            json!({
                "type": "object",
                "properties": {"sentiment": {"type": "string"}},
                "required": ["sentiment"],
            }),
            "inline".to_string(),
        );
        assert!(schema.validate(&json!({})).await.is_err());
    }
}
