//! Configuration resolution
//!
//! Turns raw user input into typed [`ConfigValue`]s following the module's
//! [`ConfigField`] declarations. Problems with the user's value are
//! `InvalidInput`; a module declaring a validator that cannot apply to the
//! field's type is `Internal`.

use modman_types::{ConfigField, ConfigValue, DataType, Error, Result, Validator};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
}

/// Resolve every declared config; unset optional fields are left out
pub fn resolve_configs(
    fields: &BTreeMap<String, ConfigField>,
    input: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, ConfigValue>> {
    if let Some(unknown) = input.keys().find(|k| !fields.contains_key(*k)) {
        return Err(Error::invalid_input(format!("unknown config '{}'", unknown)));
    }

    let mut resolved = BTreeMap::new();
    for (name, field) in fields {
        let raw = match input.get(name).or(field.default.as_ref()) {
            Some(raw) => raw,
            None if field.required => {
                return Err(Error::invalid_input(format!("config '{}' is required", name)))
            }
            None => continue,
        };
        resolved.insert(name.clone(), resolve_field(name, field, raw)?);
    }
    Ok(resolved)
}

fn resolve_field(name: &str, field: &ConfigField, raw: &Value) -> Result<ConfigValue> {
    let values: Vec<Scalar> = match (field.is_slice, raw) {
        (true, Value::Array(items)) => items
            .iter()
            .map(|v| parse_scalar(name, field.data_type, v))
            .collect::<Result<_>>()?,
        (true, _) => {
            return Err(Error::invalid_input(format!(
                "config '{}' expects a list of {:?}",
                name, field.data_type
            )))
        }
        (false, Value::Array(_)) => {
            return Err(Error::invalid_input(format!(
                "config '{}' expects a single {:?} value",
                name, field.data_type
            )))
        }
        (false, v) => vec![parse_scalar(name, field.data_type, v)?],
    };

    if let Some(validator) = &field.validator {
        let check = compile(name, field.data_type, validator)?;
        for value in &values {
            check(name, value)?;
        }
    }

    if !field.options_ext && !field.options.is_empty() {
        let options = field
            .options
            .iter()
            .map(|o| parse_scalar(name, field.data_type, o))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::internal(format!("invalid options: {}", e.message())))?;
        if let Some(value) = values.iter().find(|v| !options.contains(v)) {
            return Err(Error::invalid_input(format!(
                "config '{}': {} is not one of the allowed options",
                name,
                display(value)
            )));
        }
    }

    Ok(build(field, values))
}

fn parse_scalar(name: &str, data_type: DataType, raw: &Value) -> Result<Scalar> {
    let invalid = || {
        Error::invalid_input(format!(
            "config '{}': {} is not a valid {:?}",
            name, raw, data_type
        ))
    };

    match (data_type, raw) {
        (DataType::String, Value::String(s)) => Ok(Scalar::String(s.clone())),
        (DataType::Bool, Value::Bool(b)) => Ok(Scalar::Bool(*b)),
        (DataType::Bool, Value::String(s)) => s.trim().parse().map(Scalar::Bool).map_err(|_| invalid()),
        (DataType::Int64, Value::Number(n)) => n.as_i64().map(Scalar::Int64).ok_or_else(invalid),
        (DataType::Int64, Value::String(s)) => s.trim().parse().map(Scalar::Int64).map_err(|_| invalid()),
        (DataType::Float64, Value::Number(n)) => n.as_f64().map(Scalar::Float64).ok_or_else(invalid),
        (DataType::Float64, Value::String(s)) => {
            s.trim().parse().map(Scalar::Float64).map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

type Check = Box<dyn Fn(&str, &Scalar) -> Result<()>>;

fn compile(name: &str, data_type: DataType, validator: &Validator) -> Result<Check> {
    let mismatch = || {
        Error::internal(format!(
            "config '{}': validator {:?} does not apply to {:?}",
            name, validator, data_type
        ))
    };

    match validator {
        Validator::Regex { pattern } => {
            if data_type != DataType::String {
                return Err(mismatch());
            }
            let re = Regex::new(pattern).map_err(|e| {
                Error::internal(format!("config '{}': invalid pattern: {}", name, e))
            })?;
            Ok(Box::new(move |name: &str, value: &Scalar| match value {
                Scalar::String(s) if re.is_match(s) => Ok(()),
                other => Err(Error::invalid_input(format!(
                    "config '{}': {} does not match '{}'",
                    name,
                    display(other),
                    re.as_str()
                ))),
            }))
        }
        Validator::NumberRange { min, max } => {
            if !matches!(data_type, DataType::Int64 | DataType::Float64) {
                return Err(mismatch());
            }
            let (min, max) = (*min, *max);
            Ok(Box::new(move |name: &str, value: &Scalar| {
                let n = match value {
                    Scalar::Int64(i) => *i as f64,
                    Scalar::Float64(f) => *f,
                    _ => return Ok(()),
                };
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(Error::invalid_input(format!(
                        "config '{}': {} is out of range",
                        name,
                        display(value)
                    )));
                }
                Ok(())
            }))
        }
        Validator::TextLength { min, max } => {
            if data_type != DataType::String {
                return Err(mismatch());
            }
            let (min, max) = (*min, *max);
            Ok(Box::new(move |name: &str, value: &Scalar| {
                let Scalar::String(s) = value else {
                    return Ok(());
                };
                let len = s.chars().count();
                if min.is_some_and(|m| len < m) || max.is_some_and(|m| len > m) {
                    return Err(Error::invalid_input(format!(
                        "config '{}': length {} is out of range",
                        name, len
                    )));
                }
                Ok(())
            }))
        }
    }
}

fn display(value: &Scalar) -> String {
    match value {
        Scalar::String(s) => format!("'{}'", s),
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int64(i) => i.to_string(),
        Scalar::Float64(f) => f.to_string(),
    }
}

fn build(field: &ConfigField, values: Vec<Scalar>) -> ConfigValue {
    fn collect<T>(values: Vec<Scalar>, pick: impl Fn(Scalar) -> Option<T>) -> Vec<T> {
        values.into_iter().filter_map(pick).collect()
    }

    if field.is_slice {
        return match field.data_type {
            DataType::String => ConfigValue::StringSlice(collect(values, |v| match v {
                Scalar::String(s) => Some(s),
                _ => None,
            })),
            DataType::Bool => ConfigValue::BoolSlice(collect(values, |v| match v {
                Scalar::Bool(b) => Some(b),
                _ => None,
            })),
            DataType::Int64 => ConfigValue::Int64Slice(collect(values, |v| match v {
                Scalar::Int64(i) => Some(i),
                _ => None,
            })),
            DataType::Float64 => ConfigValue::Float64Slice(collect(values, |v| match v {
                Scalar::Float64(f) => Some(f),
                _ => None,
            })),
        };
    }

    match values.into_iter().next() {
        Some(Scalar::String(s)) => ConfigValue::String(s),
        Some(Scalar::Bool(b)) => ConfigValue::Bool(b),
        Some(Scalar::Int64(i)) => ConfigValue::Int64(i),
        Some(Scalar::Float64(f)) => ConfigValue::Float64(f),
        None => ConfigValue::String(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::ErrorKind;
    use serde_json::json;

    fn fields(entries: Vec<(&str, ConfigField)>) -> BTreeMap<String, ConfigField> {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn input(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_user_value_then_default() {
        let mut port = ConfigField::new(DataType::Int64);
        port.default = Some(json!(1883));
        let mut host = ConfigField::new(DataType::String);
        host.default = Some(json!("localhost"));
        let fields = fields(vec![("port", port), ("host", host)]);

        let resolved = resolve_configs(&fields, &input(json!({ "port": "8883" }))).unwrap();
        assert_eq!(resolved["port"], ConfigValue::Int64(8883));
        assert_eq!(resolved["host"], ConfigValue::String("localhost".into()));
    }

    #[test]
    fn test_required_missing_is_invalid_input() {
        let mut token = ConfigField::new(DataType::String);
        token.required = true;
        let fields = fields(vec![("token", token), ("debug", ConfigField::new(DataType::Bool))]);

        let err = resolve_configs(&fields, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().contains("'token'"));

        let resolved = resolve_configs(&fields, &input(json!({ "token": "abc" }))).unwrap();
        assert!(!resolved.contains_key("debug"));
    }

    #[test]
    fn test_slice_given_scalar() {
        let mut topics = ConfigField::new(DataType::String);
        topics.is_slice = true;
        let fields = fields(vec![("topics", topics)]);

        let err = resolve_configs(&fields, &input(json!({ "topics": "a" }))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let resolved = resolve_configs(&fields, &input(json!({ "topics": ["a", "b"] }))).unwrap();
        assert_eq!(
            resolved["topics"],
            ConfigValue::StringSlice(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_scalar_given_array() {
        let fields = fields(vec![("level", ConfigField::new(DataType::Int64))]);
        let err = resolve_configs(&fields, &input(json!({ "level": [1] }))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_closed_option_set() {
        let mut mode = ConfigField::new(DataType::String);
        mode.options = vec![json!("fast"), json!("safe")];
        let fields = fields(vec![("mode", mode.clone())]);

        assert!(resolve_configs(&fields, &input(json!({ "mode": "safe" }))).is_ok());
        let err = resolve_configs(&fields, &input(json!({ "mode": "turbo" }))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        mode.options_ext = true;
        let open = self::fields(vec![("mode", mode)]);
        assert!(resolve_configs(&open, &input(json!({ "mode": "turbo" }))).is_ok());
    }

    #[test]
    fn test_validators() {
        let mut name = ConfigField::new(DataType::String);
        name.validator = Some(Validator::Regex {
            pattern: "^[a-z]+$".into(),
        });
        let mut ratio = ConfigField::new(DataType::Float64);
        ratio.validator = Some(Validator::NumberRange {
            min: Some(0.0),
            max: Some(1.0),
        });
        let fields = fields(vec![("name", name), ("ratio", ratio)]);

        assert!(resolve_configs(&fields, &input(json!({ "name": "edge", "ratio": 0.5 }))).is_ok());
        assert!(resolve_configs(&fields, &input(json!({ "name": "Edge1" }))).is_err());
        assert!(resolve_configs(&fields, &input(json!({ "ratio": 2 }))).is_err());
    }

    #[test]
    fn test_validator_type_mismatch_is_internal() {
        let mut count = ConfigField::new(DataType::Int64);
        count.validator = Some(Validator::TextLength {
            min: Some(1),
            max: None,
        });
        let fields = fields(vec![("count", count)]);

        let err = resolve_configs(&fields, &input(json!({ "count": 3 }))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_unknown_config_rejected() {
        let err = resolve_configs(&BTreeMap::new(), &input(json!({ "x": 1 }))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
