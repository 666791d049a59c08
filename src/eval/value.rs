//! Dynamically typed script values and every coercion rule the evaluator
//! relies on: truthiness, numeric coercion, stringification and JSON
//! conversion all live here so the evaluator never inspects raw variants
//! to coerce.

use core::fmt;
use std::collections::HashMap;

// 値の型システム
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// Multi-value `return`.
    Tuple(Vec<Value>),
    #[default]
    Null,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Boolean(_) => "bool",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Tuple(_) => "tuple",
            Value::Null => "nil",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Truthiness used by conditions, `must`, `AND`/`OR` and `NOT`.
    ///
    /// Total over every variant: strings are false when empty, `"false"` or
    /// a numeric zero; collections are false when empty; nil is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
                    return false;
                }
                match trimmed.parse::<f64>() {
                    Ok(n) => n != 0.0,
                    Err(_) => true,
                }
            }
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Null => false,
        }
    }

    /// Integer view: ints, integral floats and numeric strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) => float_to_integer(*f),
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().and_then(float_to_integer))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Equality used by `==`/`!=`: nil equals only nil, ints and floats
    /// compare by numeric value, everything else structurally.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Integer(l), Value::Float(r)) => (*l as f64) == *r,
            (Value::Float(l), Value::Integer(r)) => *l == (*r as f64),
            _ => self == other,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::List(items) | Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Null => serde_json::Value::Null,
        }
    }

    /// Built-in `mustbe` checks. `None` means the name is not a built-in.
    pub fn check(name: &str, value: &Value) -> Option<bool> {
        let result = match name {
            "is_string" => matches!(value, Value::String(_)),
            "is_number" => value.is_numeric(),
            "is_int" => matches!(value, Value::Integer(_)),
            "is_float" => matches!(value, Value::Float(_)),
            "is_bool" => matches!(value, Value::Boolean(_)),
            "is_list" => matches!(value, Value::List(_)),
            "is_map" => matches!(value, Value::Map(_)),
            "not_nil" => !value.is_null(),
            "not_empty" => match value {
                Value::String(s) => !s.is_empty(),
                Value::List(items) | Value::Tuple(items) => !items.is_empty(),
                Value::Map(map) => !map.is_empty(),
                Value::Null => false,
                _ => true,
            },
            _ => return None,
        };
        Some(result)
    }
}

fn float_to_integer(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn fmt_nested(value: &Value, f: &mut fmt::Formatter) -> fmt::Result {
    match value {
        Value::String(s) => write!(f, "{:?}", s),
        other => write!(f, "{}", other),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => write!(f, "nil"),
            Value::List(items) | Value::Tuple(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_nested(item, f)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: ", key)?;
                    fmt_nested(&map[key], f)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Boolean(true).is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(Value::Integer(-3).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from("false").is_truthy());
        assert!(!Value::from("0").is_truthy());
        assert!(Value::from("yes").is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn test_integer_coercion() {
        assert_eq!(Value::Integer(4).as_integer(), Some(4));
        assert_eq!(Value::Float(2.0).as_integer(), Some(2));
        assert_eq!(Value::Float(2.5).as_integer(), None);
        assert_eq!(Value::from(" 7 ").as_integer(), Some(7));
        assert_eq!(Value::from("3.0").as_integer(), Some(3));
        assert_eq!(Value::from("x").as_integer(), None);
        assert_eq!(Value::Boolean(true).as_integer(), None);
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Null.loosely_equals(&Value::Null));
        assert!(!Value::Null.loosely_equals(&Value::Integer(0)));
        assert!(!Value::from("").loosely_equals(&Value::Null));
        assert!(Value::Integer(3).loosely_equals(&Value::Float(3.0)));
        assert!(!Value::Integer(3).loosely_equals(&Value::from("3")));
    }

    #[test]
    fn test_display() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), Value::Integer(1));
        map.insert("a".to_string(), Value::from("x"));
        assert_eq!(Value::Map(map).to_string(), r#"{"a": "x", "b": 1}"#);
        assert_eq!(
            Value::List(vec![Value::Integer(1), Value::from("s"), Value::Null]).to_string(),
            r#"[1, "s", nil]"#
        );
    }

    #[test]
    fn test_checks() {
        assert_eq!(Value::check("is_string", &Value::from("a")), Some(true));
        assert_eq!(Value::check("is_int", &Value::Float(1.0)), Some(false));
        assert_eq!(Value::check("not_empty", &Value::List(vec![])), Some(false));
        assert_eq!(Value::check("unknown_check", &Value::Null), None);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"n": 1, "f": 1.5, "l": [true, null], "s": "x"});
        let value = Value::from(json.clone());
        assert_eq!(value.to_json(), json);
    }

    proptest! {
        #[test]
        fn prop_truthiness_is_total(s in ".*", i in any::<i64>(), f in any::<f64>()) {
            let _ = Value::String(s).is_truthy();
            prop_assert_eq!(Value::Integer(i).is_truthy(), i != 0);
            let _ = Value::Float(f).is_truthy();
        }

        #[test]
        fn prop_integer_strings_coerce(i in any::<i64>()) {
            prop_assert_eq!(Value::String(i.to_string()).as_integer(), Some(i));
        }
    }
}
