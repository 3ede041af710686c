//! Schema validation for raw job input.
//!
//! Every problem is collected so a rejected job reports all of its errors at once.

use crate::error::{TrainingError, TrainingResult};
use crate::job::JobInput;
use reqwest::Url;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    /// Integers are accepted and widened.
    Float,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
        }
    }
}

/// One entry of an input schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    /// Inserted when an optional field is absent.
    pub default: Value,
    pub constraint: Option<fn(&Value) -> bool>,
}

impl FieldSpec {
    fn required(name: &'static str, field_type: FieldType, constraint: fn(&Value) -> bool) -> Self {
        Self { name, field_type, required: true, default: Value::Null, constraint: Some(constraint) }
    }

    fn optional(name: &'static str, field_type: FieldType, constraint: fn(&Value) -> bool) -> Self {
        Self { name, field_type, required: false, default: Value::Null, constraint: Some(constraint) }
    }
}

/// Schema for LoRA training job input.
#[must_use]
pub fn input_schema() -> Vec<FieldSpec> {
    use FieldType::{Float, Integer, String};

    vec![
        FieldSpec::required("model_url", String, is_fetchable_url),
        FieldSpec::required("zip_url", String, is_fetchable_url),
        FieldSpec::required("instance_name", String, is_path_token),
        FieldSpec::required("class_name", String, is_path_token),
        FieldSpec::required("steps", Integer, is_positive_u32),
        FieldSpec::required("unet_lr", Float, is_positive_finite),
        FieldSpec::required("network_dim", Integer, is_positive_u32),
        FieldSpec::required("lr_scheduler", String, is_non_empty),
        FieldSpec::required("learning_rate", Float, is_positive_finite),
        FieldSpec::required("lr_scheduler_num_cycles", Integer, is_positive_u32),
        FieldSpec::required("lr_warmup_steps", Integer, is_u32),
        FieldSpec::required("train_batch_size", Integer, is_positive_u32),
        FieldSpec::required("max_train_steps", Integer, is_positive_u32),
        FieldSpec::required("max_data_loader_num_workers", Integer, is_u32),
        FieldSpec::required("optimizer_type", String, is_non_empty),
        FieldSpec::optional("out_id", String, is_path_token),
    ]
}

/// Validate `input` against `schema`.
///
/// Returns the validated mapping (defaults filled in, floats widened) or every error message.
pub fn validate(input: &Value, schema: &[FieldSpec]) -> Result<Map<String, Value>, Vec<String>> {
    let Some(raw) = input.as_object() else {
        return Err(vec!["Job input must be a JSON object.".to_string()]);
    };

    let mut errors: Vec<String> = raw
        .keys()
        .filter(|key| !schema.iter().any(|field| field.name == key.as_str()))
        .map(|key| format!("Unexpected input. {key} is not a valid input option."))
        .collect();

    let mut validated = Map::new();
    for field in schema {
        let value = match raw.get(field.name) {
            None | Some(Value::Null) if field.required => {
                errors.push(format!("{} is a required input.", field.name));
                continue;
            }
            None | Some(Value::Null) => {
                validated.insert(field.name.to_string(), field.default.clone());
                continue;
            }
            Some(value) => value,
        };

        if !field.field_type.accepts(value) {
            errors.push(format!(
                "{} should be {} type, not {}.",
                field.name,
                field.field_type.name(),
                json_type_name(value)
            ));
            continue;
        }

        if let Some(constraint) = field.constraint {
            if !constraint(value) {
                errors.push(format!("{} does not meet the constraints.", field.name));
                continue;
            }
        }

        let value = match (field.field_type, value.as_f64()) {
            (FieldType::Float, Some(widened)) if !value.is_f64() => Value::from(widened),
            _ => value.clone(),
        };
        validated.insert(field.name.to_string(), value);
    }

    if errors.is_empty() { Ok(validated) } else { Err(errors) }
}

/// Validate raw job input and convert it into a typed [`JobInput`].
pub fn validate_job_input(input: &Value) -> TrainingResult<JobInput> {
    let validated = validate(input, &input_schema()).map_err(TrainingError::Validation)?;
    serde_json::from_value(Value::Object(validated))
        .map_err(|e| TrainingError::Validation(vec![e.to_string()]))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_fetchable_url(value: &Value) -> bool {
    value
        .as_str()
        .and_then(|s| Url::parse(s).ok())
        .is_some_and(|url| matches!(url.scheme(), "http" | "https" | "file"))
}

/// Naming tokens end up in directory and file names.
///
/// Usable as a single path component: non-blank, no separators, no `..`.
#[must_use]
pub fn is_file_token(s: &str) -> bool {
    !s.trim().is_empty() && !s.contains(['/', '\\']) && !s.contains("..")
}

fn is_path_token(value: &Value) -> bool {
    value.as_str().is_some_and(is_file_token)
}

fn is_non_empty(value: &Value) -> bool {
    value.as_str().is_some_and(|s| !s.trim().is_empty())
}

fn is_u32(value: &Value) -> bool {
    value.as_u64().is_some_and(|n| n <= u64::from(u32::MAX))
}

fn is_positive_u32(value: &Value) -> bool {
    value.as_u64().is_some_and(|n| n >= 1 && n <= u64::from(u32::MAX))
}

fn is_positive_finite(value: &Value) -> bool {
    value.as_f64().is_some_and(|n| n.is_finite() && n > 0.0)
}
