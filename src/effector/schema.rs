use crate::effector::EffectorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Effector parameters, keyed by name
pub type Params = serde_json::Map<String, Value>;

/// Declared type of an effector parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Any,
}

impl ParameterType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::List => value.is_array(),
            ParameterType::Any => true,
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::String => "a string",
            ParameterType::Integer => "an integer",
            ParameterType::Number => "a number",
            ParameterType::Boolean => "a boolean",
            ParameterType::List => "a list",
            ParameterType::Any => "any value",
        };
        f.write_str(name)
    }
}

/// One declared parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
}

impl ParameterSpec {
    pub fn required(name: &str, param_type: ParameterType) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: &str, param_type: ParameterType, default: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: false,
            default,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Declared shape of an effector
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectorSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl EffectorSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Check `params` against the declared schema and fill in defaults.
    ///
    /// Rejects unknown, missing-required and mistyped parameters. A JSON `null` counts
    /// as absent.
    pub fn validate(&self, mut params: Params) -> Result<Params, EffectorError> {
        if let Some(unknown) = params
            .keys()
            .find(|k| !self.parameters.iter().any(|p| p.name == **k))
        {
            return Err(EffectorError::UnexpectedParameter {
                effector: self.name.clone(),
                parameter: unknown.clone(),
            });
        }

        for spec in &self.parameters {
            match params.get(&spec.name) {
                Some(value) if !value.is_null() => {
                    if !spec.param_type.accepts(value) {
                        return Err(EffectorError::InvalidParameter {
                            effector: self.name.clone(),
                            parameter: spec.name.clone(),
                            expected: spec.param_type,
                            found: describe(value).to_string(),
                        });
                    }
                }
                _ => {
                    params.remove(&spec.name);
                    if let Some(ref default) = spec.default {
                        params.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(EffectorError::MissingParameter {
                            effector: self.name.clone(),
                            parameter: spec.name.clone(),
                        });
                    }
                }
            }
        }

        Ok(params)
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a number",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
