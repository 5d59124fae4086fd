//! The typed parameter model: declared specs, runtime values, and the
//! deterministic string-to-typed coercion between them.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// The declared type of a route parameter.
///
/// The type fully determines coercion; conversion never depends on
/// runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
}

impl ParamType {
    /// Parse a declared type name, accepting the aliases route authors
    /// actually write (`str`, `VARCHAR`, `int`, `timestamp`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "str" | "string" | "varchar" | "text" => Some(Self::String),
            "int" | "integer" | "bigint" => Some(Self::Integer),
            "float" | "double" | "real" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            "datetime" | "timestamp" => Some(Self::Datetime),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Datetime => "datetime",
        }
    }
}

/// A typed runtime value bound to a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
}

impl ParamValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical textual form, used by fingerprints, row keys and CSV output.
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Str(s) => Some(s.clone()),
            Self::Int(n) => Some(n.to_string()),
            Self::Float(f) => Some(canonical_float(*f)),
            Self::Bool(b) => Some(b.to_string()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::Datetime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        }
    }

    /// The engine-bindable form of this value.
    pub fn to_sql(&self) -> duckdb::types::Value {
        use duckdb::types::{TimeUnit, Value};

        match self {
            Self::Null => Value::Null,
            Self::Str(s) => Value::Text(s.clone()),
            Self::Int(n) => Value::BigInt(*n),
            Self::Float(f) => Value::Double(*f),
            Self::Bool(b) => Value::Boolean(*b),
            Self::Date(d) => {
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
                Value::Date32((*d - epoch).num_days() as i32)
            }
            Self::Datetime(dt) => {
                Value::Timestamp(TimeUnit::Microsecond, dt.and_utc().timestamp_micros())
            }
        }
    }

    /// Lift a TOML literal (defaults, dependency args) into a typed value.
    pub fn from_toml(value: &toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::Str(s.clone()),
            toml::Value::Integer(n) => Self::Int(*n),
            toml::Value::Float(f) => Self::Float(*f),
            toml::Value::Boolean(b) => Self::Bool(*b),
            toml::Value::Datetime(dt) => Self::Str(dt.to_string()),
            other => Self::Str(other.to_string()),
        }
    }

    /// The JSON form used in share parameter payloads.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};

        match self {
            Self::Null => Value::Null,
            Self::Str(s) => json!(s),
            Self::Int(n) => json!(n),
            Self::Float(f) => json!(f),
            Self::Bool(b) => json!(b),
            Self::Date(_) | Self::Datetime(_) => json!(self.canonical_text()),
        }
    }

    /// Lift a JSON literal (share params, override payloads) into a typed value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }
}

/// Render a float without the noise `{:?}` would add, keeping integral
/// values in integral form.
pub fn canonical_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

/// A single declared parameter of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<ParamValue>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ui_control: Option<String>,
    #[serde(default)]
    pub ui_label: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
            description: None,
            ui_control: None,
            ui_label: None,
            options: Vec::new(),
            placeholder: None,
        }
    }

    /// Deterministic string-to-typed coercion. Fails with `invalid_parameter`
    /// on malformed input.
    pub fn convert(&self, raw: &str) -> Result<ParamValue, ExecutionError> {
        let invalid = |detail: String| ExecutionError::InvalidParameter {
            name: self.name.clone(),
            detail,
        };

        let trimmed = raw.trim();

        match self.ty {
            ParamType::String => Ok(ParamValue::Str(raw.to_owned())),
            ParamType::Integer => trimmed
                .parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|_| invalid(format!("'{trimmed}' is not an integer"))),
            ParamType::Float => trimmed
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| invalid(format!("'{trimmed}' is not a number"))),
            ParamType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(ParamValue::Bool(true)),
                "false" | "0" | "no" => Ok(ParamValue::Bool(false)),
                _ => Err(invalid(format!("'{trimmed}' is not a boolean"))),
            },
            ParamType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(ParamValue::Date)
                .map_err(|_| invalid(format!("'{trimmed}' is not a YYYY-MM-DD date"))),
            ParamType::Datetime => parse_datetime(trimmed)
                .map(ParamValue::Datetime)
                .ok_or_else(|| invalid(format!("'{trimmed}' is not an ISO 8601 datetime"))),
        }
    }

    /// Coerce an already-typed incoming value against this spec. Strings go
    /// through [`ParameterSpec::convert`]; anything else passes through if it
    /// matches the declared type.
    pub fn coerce(&self, value: &ParamValue) -> Result<ParamValue, ExecutionError> {
        match (value, self.ty) {
            (ParamValue::Null, _) => Ok(ParamValue::Null),
            (ParamValue::Str(s), ty) if ty != ParamType::String => self.convert(s),
            (ParamValue::Str(s), _) => Ok(ParamValue::Str(s.clone())),
            (ParamValue::Int(n), ParamType::Integer) => Ok(ParamValue::Int(*n)),
            (ParamValue::Int(n), ParamType::Float) => Ok(ParamValue::Float(*n as f64)),
            (ParamValue::Float(f), ParamType::Float) => Ok(ParamValue::Float(*f)),
            (ParamValue::Bool(b), ParamType::Boolean) => Ok(ParamValue::Bool(*b)),
            (ParamValue::Date(d), ParamType::Date) => Ok(ParamValue::Date(*d)),
            (ParamValue::Datetime(dt), ParamType::Datetime) => Ok(ParamValue::Datetime(*dt)),
            (other, ty) => Err(ExecutionError::InvalidParameter {
                name: self.name.clone(),
                detail: format!("{other:?} cannot be bound as {}", ty.name()),
            }),
        }
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(ty: ParamType) -> ParameterSpec {
        ParameterSpec::new("p", ty)
    }

    #[test]
    fn integer_coercion() {
        assert_eq!(
            spec(ParamType::Integer).convert("7").unwrap(),
            ParamValue::Int(7)
        );

        let err = spec(ParamType::Integer).convert("x").unwrap_err();
        assert_eq!(err.code(), "invalid_parameter");
    }

    #[test]
    fn boolean_aliases() {
        let spec = spec(ParamType::Boolean);

        for raw in ["true", "TRUE", "1", "yes", "Yes"] {
            assert_eq!(spec.convert(raw).unwrap(), ParamValue::Bool(true));
        }

        for raw in ["false", "0", "no", "No"] {
            assert_eq!(spec.convert(raw).unwrap(), ParamValue::Bool(false));
        }

        assert!(spec.convert("maybe").is_err());
    }

    #[test]
    fn temporal_coercion() {
        assert_eq!(
            spec(ParamType::Date).convert("2024-02-29").unwrap(),
            ParamValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );

        let dt = spec(ParamType::Datetime)
            .convert("2024-02-29T12:30:00")
            .unwrap();
        assert_eq!(
            dt.canonical_text().unwrap(),
            "2024-02-29T12:30:00".to_string()
        );
    }

    #[test]
    fn type_aliases() {
        assert_eq!(ParamType::parse("VARCHAR"), Some(ParamType::String));
        assert_eq!(ParamType::parse("int"), Some(ParamType::Integer));
        assert_eq!(ParamType::parse("timestamp"), Some(ParamType::Datetime));
        assert_eq!(ParamType::parse("blob"), None);
    }

    #[test]
    fn canonical_floats() {
        assert_eq!(canonical_float(2.0), "2");
        assert_eq!(canonical_float(2.5), "2.5");
    }
}
