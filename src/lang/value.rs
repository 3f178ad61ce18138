use super::types::{Kind, Type};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;

/// A `file` value: name, MIME type and raw body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub mime: String,
    pub body: Vec<u8>,
}

/// Value exchanged across the host boundary.
///
/// Inside the VM every value is a 64-bit slot; hosts see this typed form
/// when passing contract parameters, environment items and host function
/// arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Float(f64),
    Str(String),
    Money(Decimal),
    Bytes(Vec<u8>),
    File(File),
    /// Generic JSON-shaped object (`obj`).
    Object(serde_json::Value),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot read {text:?} as {ty}")]
pub struct ParseValueError {
    pub text: String,
    pub ty: Type,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Money(_) => "money",
            Value::Bytes(_) => "bytes",
            Value::File(_) => "file",
            Value::Object(_) => "obj",
            Value::Array(_) => "arr",
            Value::Map(_) => "map",
        }
    }

    /// Whether the value can be stored in a slot declared as `ty`.
    pub fn fits(&self, ty: Type) -> bool {
        match (self, ty.kind()) {
            (Value::Int(_), Kind::Int)
            | (Value::Bool(_), Kind::Bool)
            | (Value::Float(_), Kind::Float)
            | (Value::Str(_), Kind::Str)
            | (Value::Money(_), Kind::Money)
            | (Value::Bytes(_), Kind::Bytes)
            | (Value::File(_), Kind::File)
            | (Value::Object(_), Kind::Object) => true,
            (Value::Array(items), Kind::Arr) => items.iter().all(|v| v.fits(ty.elem())),
            (Value::Map(items), Kind::Map) => items.values().all(|v| v.fits(ty.elem())),
            _ => false,
        }
    }

    /// Reads a scalar value from its textual form, the way hosts pass
    /// contract parameters on the command line. Bytes are hex encoded;
    /// objects are JSON text.
    pub fn from_text(ty: Type, text: &str) -> Result<Value, ParseValueError> {
        let err = || ParseValueError {
            text: text.to_string(),
            ty,
        };
        Ok(match ty.kind() {
            Kind::Int => Value::Int(text.trim().parse().map_err(|_| err())?),
            Kind::Bool => Value::Bool(match text.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return Err(err()),
            }),
            Kind::Float => Value::Float(text.trim().parse().map_err(|_| err())?),
            Kind::Str => Value::Str(text.to_string()),
            Kind::Money => Value::Money(Decimal::from_str(text.trim()).map_err(|_| err())?),
            Kind::Bytes => Value::Bytes(hex::decode(text.trim()).map_err(|_| err())?),
            Kind::Object => Value::Object(serde_json::from_str(text).map_err(|_| err())?),
            Kind::Void | Kind::Arr | Kind::Map | Kind::File => return Err(err()),
        })
    }
}

impl std::fmt::Display for Value {
    /// Formats a value the way contract results are rendered.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Money(d) => write!(f, "{}", d),
            Value::Bytes(bytes) => {
                write!(f, "[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", b)?;
                }
                write!(f, "]")
            }
            Value::File(file) => write!(
                f,
                "{{{} {} {}}}",
                file.name,
                file.mime,
                hex::encode(&file.body)
            ),
            Value::Object(json) => write!(f, "{}", json),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(items) => {
                write!(f, "map[")?;
                for (i, (key, item)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}:{}", key, item)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_containers() {
        let arr = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(arr.to_string(), "[1 2]");

        let mut items = BTreeMap::new();
        items.insert("b".to_string(), Value::Str("x".to_string()));
        items.insert("a".to_string(), Value::Bool(true));
        assert_eq!(Value::Map(items).to_string(), "map[a:true b:x]");

        assert_eq!(Value::Bytes(vec![1, 255]).to_string(), "[1 255]");
    }

    #[test]
    fn test_from_text() {
        assert_eq!(Value::from_text(Type::INT, "42"), Ok(Value::Int(42)));
        assert_eq!(Value::from_text(Type::BOOL, "false"), Ok(Value::Bool(false)));
        assert_eq!(
            Value::from_text(Type::BYTES, "31325f"),
            Ok(Value::Bytes(vec![0x31, 0x32, 0x5f]))
        );
        assert_eq!(
            Value::from_text(Type::MONEY, "32562365237623").map(|v| v.to_string()),
            Ok("32562365237623".to_string())
        );
        assert!(Value::from_text(Type::INT, "12a").is_err());
        assert!(Value::from_text(Type::ARR, "[]").is_err());
    }

    #[test]
    fn test_fits_checks_elements() {
        let arr_int = Type::array_of(Type::INT).unwrap();
        assert!(Value::Array(vec![Value::Int(1)]).fits(arr_int));
        assert!(!Value::Array(vec![Value::Str("1".into())]).fits(arr_int));
        assert!(!Value::Int(1).fits(Type::FLOAT));
    }
}
