use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use super::{GateError, Result, Value};

/// Declared type of an attribute or identifier field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
    Uuid,
    Date,
    List,
    /// Embedded record type, identified by name.
    Complex(String),
}

impl DataType {
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Integer, Value::Integer(_)) => true,
            (Self::Float, Value::Float(_)) => true,
            (Self::Float, Value::Integer(_)) => true,
            (Self::Text, Value::Text(_)) => true,
            (Self::Boolean, Value::Boolean(_)) => true,
            (Self::Uuid, Value::Uuid(_)) => true,
            (Self::Date, Value::Date(_)) => true,
            (Self::List, Value::List(_)) => true,
            (Self::Complex(_), Value::Object(_)) => true,
            _ => false,
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Self::Complex(_))
    }

    /// Converts `value` to this type, parsing text where a conversion exists.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if self.is_compatible(&value) {
            return Ok(match (self, value) {
                (Self::Float, Value::Integer(i)) => Value::Float(i as f64),
                (_, v) => v,
            });
        }

        let failed = |v: &Value| {
            GateError::InvalidValue(format!("cannot coerce {} '{}' to {}", v.type_name(), v, self))
        };

        match (self, &value) {
            (Self::Integer, Value::Text(s)) => s.trim().parse::<i64>().map(Value::Integer).map_err(|_| failed(&value)),
            (Self::Integer, Value::Float(_)) => value.as_i64().map(Value::Integer).ok_or_else(|| failed(&value)),
            (Self::Float, Value::Text(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| failed(&value)),
            (Self::Boolean, Value::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(failed(&value)),
            },
            (Self::Uuid, Value::Text(s)) => Uuid::parse_str(s).map(Value::Uuid).map_err(|_| failed(&value)),
            (Self::Date, Value::Text(s)) => parse_date(s).map(Value::Date).ok_or_else(|| failed(&value)),
            (Self::Text, Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Uuid(_)) => {
                Ok(Value::Text(value.to_string()))
            }
            _ => Err(failed(&value)),
        }
    }
}

fn parse_date(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Float => write!(f, "FLOAT"),
            Self::Text => write!(f, "TEXT"),
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Uuid => write!(f, "UUID"),
            Self::Date => write!(f, "DATE"),
            Self::List => write!(f, "LIST"),
            Self::Complex(name) => write!(f, "COMPLEX({})", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_compatibility() {
        let int_type = DataType::Integer;
        assert!(int_type.is_compatible(&Value::Integer(42)));
        assert!(int_type.is_compatible(&Value::Null));
        assert!(!int_type.is_compatible(&Value::Text("hello".into())));
    }

    #[test]
    fn test_coerce_text_ids() {
        assert_eq!(DataType::Integer.coerce(Value::from("42")).unwrap(), Value::Integer(42));
        assert_eq!(DataType::Text.coerce(Value::Integer(42)).unwrap(), Value::from("42"));
        assert_eq!(DataType::Float.coerce(Value::Integer(2)).unwrap(), Value::Float(2.0));

        let id = Uuid::new_v4();
        assert_eq!(
            DataType::Uuid.coerce(Value::Text(id.to_string())).unwrap(),
            Value::Uuid(id)
        );
    }

    #[test]
    fn test_coerce_failure() {
        let err = DataType::Integer.coerce(Value::from("abc")).unwrap_err();
        assert!(matches!(err, GateError::InvalidValue(_)));
        assert!(DataType::Boolean.coerce(Value::from("maybe")).is_err());
    }

    #[test]
    fn test_coerce_date() {
        let value = DataType::Date.coerce(Value::from("2024-03-01")).unwrap();
        assert_eq!(value.id_string(), Some("2024-03-01T00:00:00".to_string()));
    }
}
