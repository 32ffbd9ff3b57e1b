//! Resolved configuration values

use serde::{Deserialize, Serialize};

/// A configuration value after parsing and validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    StringSlice(Vec<String>),
    BoolSlice(Vec<bool>),
    Int64Slice(Vec<i64>),
    Float64Slice(Vec<f64>),
}

impl ConfigValue {
    /// Render the value the way it is injected into a container environment
    pub fn to_env_string(&self, delimiter: &str) -> String {
        fn join<T: ToString>(items: &[T], delimiter: &str) -> String {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(delimiter)
        }

        match self {
            ConfigValue::String(v) => v.clone(),
            ConfigValue::Bool(v) => v.to_string(),
            ConfigValue::Int64(v) => v.to_string(),
            ConfigValue::Float64(v) => v.to_string(),
            ConfigValue::StringSlice(v) => v.join(delimiter),
            ConfigValue::BoolSlice(v) => join(v, delimiter),
            ConfigValue::Int64Slice(v) => join(v, delimiter),
            ConfigValue::Float64Slice(v) => join(v, delimiter),
        }
    }

    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            ConfigValue::StringSlice(_)
                | ConfigValue::BoolSlice(_)
                | ConfigValue::Int64Slice(_)
                | ConfigValue::Float64Slice(_)
        )
    }
}
