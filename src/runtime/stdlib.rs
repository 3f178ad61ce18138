//! Built-in functions available to every contract.
//!
//! [`STDLIB`] is the single table both sides read: the namespace registers
//! `$name$param...` keys from it and `EMBEDFUNC` dispatches by position in it.
//! Implementations take raw slots and may allocate into the heap.

use crate::lang::types::Type;
use crate::lang::value::File;
use crate::runtime::heap::{Heap, Object};
use crate::runtime::runtime_error::RuntimeError;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

pub type StdFn = fn(&mut Heap, &[i64]) -> Result<i64, RuntimeError>;

/// One entry of the built-in table.
pub struct StdFunc {
    pub name: &'static str,
    pub params: &'static [Type],
    pub result: Type,
    pub gas: i64,
    pub func: StdFn,
}

const ARR_STR: Type = Type::from_tag(Type::STR.tag() << 4 | Type::ARR.tag());
const MAP_STR: Type = Type::from_tag(Type::STR.tag() << 4 | Type::MAP.tag());

const INT: Type = Type::INT;
const BOOL: Type = Type::BOOL;
const STR: Type = Type::STR;
const FLOAT: Type = Type::FLOAT;
const MONEY: Type = Type::MONEY;
const BYTES: Type = Type::BYTES;
const FILE: Type = Type::FILE;
const OBJ: Type = Type::OBJECT;

macro_rules! std_fn {
    ($gas:literal, $name:literal, [$($param:expr),*], $result:expr, $func:path) => {
        StdFunc {
            name: $name,
            params: &[$($param),*],
            result: $result,
            gas: $gas,
            func: $func,
        }
    };
}

pub static STDLIB: &[StdFunc] = &[
    std_fn!(20, "Keys", [Type::MAP], ARR_STR, keys),
    std_fn!(5, "Len", [Type::ARR], INT, len_arr),
    std_fn!(5, "Len", [Type::MAP], INT, len_map),
    std_fn!(5, "Len", [STR], INT, len_str),
    std_fn!(5, "Len", [BYTES], INT, len_bytes),
    std_fn!(5, "str", [INT], STR, str_int),
    std_fn!(5, "str", [BOOL], STR, str_bool),
    std_fn!(5, "str", [MONEY], STR, str_money),
    std_fn!(5, "int", [STR], INT, int_str),
    std_fn!(5, "float", [INT], FLOAT, float_int),
    std_fn!(5, "str", [FLOAT], STR, str_float),
    std_fn!(5, "int", [FLOAT], INT, int_float),
    std_fn!(7, "money", [INT], MONEY, money_int),
    std_fn!(7, "money", [FLOAT], MONEY, money_float),
    std_fn!(7, "money", [STR], MONEY, money_str),
    std_fn!(7, "bytes", [STR], BYTES, bytes_str),
    std_fn!(5, "Floor", [FLOAT], INT, floor),
    std_fn!(5, "Log", [FLOAT], FLOAT, log),
    std_fn!(5, "Log10", [FLOAT], FLOAT, log10),
    std_fn!(10, "Pow", [FLOAT, FLOAT], FLOAT, pow),
    std_fn!(5, "Round", [FLOAT], INT, round),
    std_fn!(10, "Sqrt", [FLOAT], FLOAT, sqrt),
    std_fn!(5, "Replace", [STR, STR, STR], STR, replace),
    std_fn!(7, "Split", [STR, STR], ARR_STR, split),
    std_fn!(5, "Substr", [STR, INT, INT], STR, substr),
    std_fn!(5, "Contains", [STR, STR], BOOL, contains),
    std_fn!(5, "HasPrefix", [STR, STR], BOOL, has_prefix),
    std_fn!(5, "Join", [ARR_STR, STR], STR, join),
    std_fn!(5, "TrimSpace", [STR], STR, trim_space),
    std_fn!(5, "ToLower", [STR], STR, to_lower),
    std_fn!(5, "ToUpper", [STR], STR, to_upper),
    std_fn!(10, "JSONDecode", [STR], OBJ, json_decode),
    std_fn!(10, "JSONEncode", [OBJ], STR, json_encode),
    std_fn!(10, "JSONEncodeIndent", [OBJ, STR], STR, json_encode_indent),
    std_fn!(5, "IsExists", [OBJ, STR], BOOL, is_exists),
    std_fn!(5, "IsString", [OBJ, STR], BOOL, is_string),
    std_fn!(5, "IsArray", [OBJ, STR], BOOL, is_array),
    std_fn!(5, "IsMap", [OBJ, STR], BOOL, is_map),
    std_fn!(5, "GetString", [OBJ, STR], STR, get_string),
    std_fn!(5, "GetArray", [OBJ, STR], ARR_STR, get_array),
    std_fn!(5, "GetMap", [OBJ, STR], MAP_STR, get_map),
    std_fn!(7, "Hex", [BYTES], STR, hex_bytes),
    std_fn!(7, "UnHex", [STR], BYTES, unhex),
    std_fn!(5, "FileName", [FILE], STR, file_name),
    std_fn!(5, "FileMime", [FILE], STR, file_mime),
    std_fn!(5, "FileBody", [FILE], BYTES, file_body),
    std_fn!(5, "FileInit", [STR, STR, BYTES], FILE, file_init),
    std_fn!(7, "Sha256", [BYTES], BYTES, sha256),
];

/// Position of the built-in `name(params)` in [`STDLIB`].
pub fn index_of(name: &str, params: &[Type]) -> Option<u16> {
    STDLIB
        .iter()
        .position(|f| f.name == name && f.params == params)
        .map(|i| i as u16)
}

fn take<const N: usize>(args: &[i64]) -> Result<[i64; N], RuntimeError> {
    args.try_into().map_err(|_| {
        RuntimeError::InvalidParameters(format!("expected {} arguments, got {}", N, args.len()))
    })
}

fn float(slot: i64) -> f64 {
    f64::from_bits(slot as u64)
}

fn float_slot(f: f64) -> Result<i64, RuntimeError> {
    if f.is_finite() {
        Ok(f.to_bits() as i64)
    } else {
        Err(RuntimeError::FloatResult)
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ===========================================================================
// Containers
// ===========================================================================

fn keys(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [m] = take::<1>(args)?;
    let names: Vec<String> = heap.map(m)?.keys().cloned().collect();
    let handles = names.into_iter().map(|k| heap.push_str(k)).collect();
    Ok(heap.push(Object::Array(handles)))
}

fn len_arr(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [a] = take::<1>(args)?;
    Ok(heap.array(a)?.len() as i64)
}

fn len_map(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [m] = take::<1>(args)?;
    Ok(heap.map(m)?.len() as i64)
}

fn len_str(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    Ok(heap.str(s)?.len() as i64)
}

fn len_bytes(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [b] = take::<1>(args)?;
    Ok(heap.bytes(b)?.len() as i64)
}

// ===========================================================================
// Conversions
// ===========================================================================

fn str_int(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [i] = take::<1>(args)?;
    Ok(heap.push_str(i.to_string()))
}

fn str_bool(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [b] = take::<1>(args)?;
    Ok(heap.push_str(if b != 0 { "true" } else { "false" }))
}

fn str_money(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [m] = take::<1>(args)?;
    let text = heap.money(m)?.to_string();
    Ok(heap.push_str(text))
}

fn str_float(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    Ok(heap.push_str(float(f).to_string()))
}

/// Accepts an optional sign and a `0x`, `0o` or `0b` radix prefix.
fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = match digits.get(..2) {
        Some("0x") | Some("0X") => (16, &digits[2..]),
        Some("0o") | Some("0O") => (8, &digits[2..]),
        Some("0b") | Some("0B") => (2, &digits[2..]),
        _ => (10, digits),
    };
    if digits.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    i64::try_from(if negative { -magnitude } else { magnitude }).ok()
}

fn int_str(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let text = heap.str(s)?;
    parse_int(text).ok_or_else(|| RuntimeError::StrToInt(text.to_string()))
}

fn float_int(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [i] = take::<1>(args)?;
    Ok((i as f64).to_bits() as i64)
}

fn int_float(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    Ok(float(f) as i64)
}

fn money_int(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [i] = take::<1>(args)?;
    Ok(heap.push(Object::Money(Decimal::from(i))))
}

fn money_float(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    let value = float(f);
    let d = Decimal::from_f64(value).ok_or_else(|| RuntimeError::InvalidMoney(value.to_string()))?;
    Ok(heap.push(Object::Money(d.floor())))
}

fn money_str(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let text = heap.str(s)?;
    let d = Decimal::from_str(text.trim())
        .map_err(|_| RuntimeError::InvalidMoney(text.to_string()))?;
    Ok(heap.push(Object::Money(d.floor())))
}

fn bytes_str(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let bytes = heap.str(s)?.as_bytes().to_vec();
    Ok(heap.push(Object::Bytes(bytes)))
}

// ===========================================================================
// Math
// ===========================================================================

fn floor(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    let value = float(f);
    if !value.is_finite() {
        return Err(RuntimeError::FloatResult);
    }
    Ok(value.floor() as i64)
}

fn log(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    float_slot(float(f).ln())
}

fn log10(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    float_slot(float(f).log10())
}

fn pow(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [x, y] = take::<2>(args)?;
    float_slot(float(x).powf(float(y)))
}

fn round(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    let value = float(f);
    if !value.is_finite() {
        return Err(RuntimeError::FloatResult);
    }
    Ok(value.round() as i64)
}

fn sqrt(_heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    float_slot(float(f).sqrt())
}

// ===========================================================================
// Strings
// ===========================================================================

fn replace(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s, old, new] = take::<3>(args)?;
    let out = heap.str(s)?.replace(heap.str(old)?, heap.str(new)?);
    Ok(heap.push_str(out))
}

fn split(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s, sep] = take::<2>(args)?;
    let text = heap.str(s)?;
    let sep = heap.str(sep)?;
    let parts: Vec<String> = if sep.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(sep).map(String::from).collect()
    };
    let handles = parts.into_iter().map(|p| heap.push_str(p)).collect();
    Ok(heap.push(Object::Array(handles)))
}

/// Character based: `Substr("héllo", 1, 3)` is `"éll"`.
fn substr(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s, off, len] = take::<3>(args)?;
    let text = heap.str(s)?;
    let total = text.chars().count() as i64;
    if off < 0 || len < 0 || off > total || len > total - off {
        return Err(RuntimeError::InvalidParameters(format!(
            "substring of {} characters at {} of {} characters",
            len, off, total
        )));
    }
    let out: String = text.chars().skip(off as usize).take(len as usize).collect();
    Ok(heap.push_str(out))
}

fn contains(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s, sub] = take::<2>(args)?;
    Ok(heap.str(s)?.contains(heap.str(sub)?) as i64)
}

fn has_prefix(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s, prefix] = take::<2>(args)?;
    Ok(heap.str(s)?.starts_with(heap.str(prefix)?) as i64)
}

fn join(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [a, sep] = take::<2>(args)?;
    let parts = heap
        .array(a)?
        .iter()
        .map(|&h| heap.str(h))
        .collect::<Result<Vec<_>, _>>()?;
    let out = parts.join(heap.str(sep)?);
    Ok(heap.push_str(out))
}

fn trim_space(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let out = heap.str(s)?.trim().to_string();
    Ok(heap.push_str(out))
}

fn to_lower(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let out = heap.str(s)?.to_lowercase();
    Ok(heap.push_str(out))
}

fn to_upper(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let out = heap.str(s)?.to_uppercase();
    Ok(heap.push_str(out))
}

// ===========================================================================
// JSON objects
// ===========================================================================

fn json_decode(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let value: serde_json::Value = serde_json::from_str(heap.str(s)?)?;
    if !value.is_object() {
        return Err(RuntimeError::Json("expecting a JSON object".to_string()));
    }
    Ok(heap.push(Object::Json(value)))
}

fn encode(value: &serde_json::Value, indent: &str) -> Result<String, RuntimeError> {
    if indent.is_empty() {
        return Ok(serde_json::to_string(value)?);
    }
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    serde::Serialize::serialize(value, &mut ser)?;
    String::from_utf8(out).map_err(|e| RuntimeError::Json(e.to_string()))
}

fn json_encode(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o] = take::<1>(args)?;
    let out = encode(heap.json(o)?, "")?;
    Ok(heap.push_str(out))
}

fn json_encode_indent(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, indent] = take::<2>(args)?;
    let out = encode(heap.json(o)?, heap.str(indent)?)?;
    Ok(heap.push_str(out))
}

fn member<'a>(
    heap: &'a Heap,
    obj: i64,
    key: i64,
) -> Result<Option<&'a serde_json::Value>, RuntimeError> {
    let key = heap.str(key)?;
    Ok(heap.json(obj)?.as_object().and_then(|map| map.get(key)))
}

fn is_exists(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    Ok(member(heap, o, k)?.is_some() as i64)
}

fn is_string(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    Ok(member(heap, o, k)?.is_some_and(|v| v.is_string()) as i64)
}

fn is_array(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    Ok(member(heap, o, k)?.is_some_and(|v| v.is_array()) as i64)
}

fn is_map(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    Ok(member(heap, o, k)?.is_some_and(|v| v.is_object()) as i64)
}

fn get_string(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    let text = member(heap, o, k)?.map(json_text).unwrap_or_default();
    Ok(heap.push_str(text))
}

fn get_array(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    let items: Vec<String> = match member(heap, o, k)? {
        Some(serde_json::Value::Array(items)) => items.iter().map(json_text).collect(),
        Some(other) => vec![json_text(other)],
        None => Vec::new(),
    };
    let handles = items.into_iter().map(|s| heap.push_str(s)).collect();
    Ok(heap.push(Object::Array(handles)))
}

fn get_map(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [o, k] = take::<2>(args)?;
    let items: Vec<(String, String)> = match member(heap, o, k)? {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(key, v)| (key.clone(), json_text(v)))
            .collect(),
        _ => Vec::new(),
    };
    let mut out = BTreeMap::new();
    for (key, text) in items {
        let handle = heap.push_str(text);
        out.insert(key, handle);
    }
    Ok(heap.push(Object::Map(out)))
}

// ===========================================================================
// Bytes and files
// ===========================================================================

fn hex_bytes(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [b] = take::<1>(args)?;
    let out = hex::encode(heap.bytes(b)?);
    Ok(heap.push_str(out))
}

fn unhex(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [s] = take::<1>(args)?;
    let bytes =
        hex::decode(heap.str(s)?).map_err(|e| RuntimeError::InvalidParameters(e.to_string()))?;
    Ok(heap.push(Object::Bytes(bytes)))
}

fn file_name(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    let name = heap.file(f)?.name.clone();
    Ok(heap.push_str(name))
}

fn file_mime(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    let mime = heap.file(f)?.mime.clone();
    Ok(heap.push_str(mime))
}

fn file_body(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [f] = take::<1>(args)?;
    let body = heap.file(f)?.body.clone();
    Ok(heap.push(Object::Bytes(body)))
}

fn file_init(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [name, mime, body] = take::<3>(args)?;
    let file = File {
        name: heap.str(name)?.to_string(),
        mime: heap.str(mime)?.to_string(),
        body: heap.bytes(body)?.clone(),
    };
    Ok(heap.push(Object::File(file)))
}

fn sha256(heap: &mut Heap, args: &[i64]) -> Result<i64, RuntimeError> {
    let [b] = take::<1>(args)?;
    let digest = Sha256::digest(heap.bytes(b)?).to_vec();
    Ok(heap.push(Object::Bytes(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(heap: &mut Heap, name: &str, params: &[Type], args: &[i64]) -> Result<i64, RuntimeError> {
        let index = index_of(name, params).expect("builtin registered");
        (STDLIB[index as usize].func)(heap, args)
    }

    #[test]
    fn test_signatures_are_unique() {
        for (i, f) in STDLIB.iter().enumerate() {
            assert_eq!(index_of(f.name, f.params), Some(i as u16), "{}", f.name);
        }
    }

    #[test]
    fn test_keys_are_sorted() {
        let mut heap = Heap::new();
        let mut m = BTreeMap::new();
        m.insert("b".to_string(), 1);
        m.insert("a".to_string(), 2);
        let map = heap.push(Object::Map(m));
        let arr = call(&mut heap, "Keys", &[Type::MAP], &[map]).unwrap();
        assert_eq!(heap.stringify(ARR_STR, arr).unwrap(), "[a b]");
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-0x1f"), Some(-31));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("--1"), None);
        assert_eq!(parse_int("abc"), None);

        let mut heap = Heap::new();
        let bad = heap.push_str("12x");
        assert_eq!(
            call(&mut heap, "int", &[STR], &[bad]),
            Err(RuntimeError::StrToInt("12x".into()))
        );
    }

    #[test]
    fn test_money_from_str_floors() {
        let mut heap = Heap::new();
        let s = heap.push_str("10.75");
        let m = call(&mut heap, "money", &[STR], &[s]).unwrap();
        assert_eq!(heap.money(m).unwrap(), Decimal::from(10));
    }

    #[test]
    fn test_sqrt_of_negative_is_float_error() {
        let mut heap = Heap::new();
        let arg = (-4.0f64).to_bits() as i64;
        assert_eq!(
            call(&mut heap, "Sqrt", &[FLOAT], &[arg]),
            Err(RuntimeError::FloatResult)
        );
    }

    #[test]
    fn test_split_join() {
        let mut heap = Heap::new();
        let s = heap.push_str("a,b,c");
        let sep = heap.push_str(",");
        let parts = call(&mut heap, "Split", &[STR, STR], &[s, sep]).unwrap();
        assert_eq!(heap.array(parts).unwrap().len(), 3);
        let dash = heap.push_str("-");
        let joined = call(&mut heap, "Join", &[ARR_STR, STR], &[parts, dash]).unwrap();
        assert_eq!(heap.str(joined).unwrap(), "a-b-c");
    }

    #[test]
    fn test_substr_bounds() {
        let mut heap = Heap::new();
        let s = heap.push_str("héllo");
        let out = call(&mut heap, "Substr", &[STR, INT, INT], &[s, 1, 3]).unwrap();
        assert_eq!(heap.str(out).unwrap(), "éll");
        assert!(call(&mut heap, "Substr", &[STR, INT, INT], &[s, 3, 3]).is_err());
    }

    #[test]
    fn test_substr_huge_length() {
        let mut heap = Heap::new();
        let s = heap.push_str("abc");
        let result = call(&mut heap, "Substr", &[STR, INT, INT], &[s, 1, i64::MAX]);
        assert!(matches!(result, Err(RuntimeError::InvalidParameters(_))));
        let result = call(&mut heap, "Substr", &[STR, INT, INT], &[s, i64::MAX, 1]);
        assert!(matches!(result, Err(RuntimeError::InvalidParameters(_))));
    }

    #[test]
    fn test_json_members() {
        let mut heap = Heap::new();
        let text = heap.push_str(r#"{"name":"x","tags":["a",1],"sub":{"k":2}}"#);
        let obj = call(&mut heap, "JSONDecode", &[STR], &[text]).unwrap();
        let tags = heap.push_str("tags");
        let sub = heap.push_str("sub");
        let missing = heap.push_str("nope");

        assert_eq!(call(&mut heap, "IsArray", &[OBJ, STR], &[obj, tags]), Ok(1));
        assert_eq!(call(&mut heap, "IsMap", &[OBJ, STR], &[obj, sub]), Ok(1));
        assert_eq!(call(&mut heap, "IsExists", &[OBJ, STR], &[obj, missing]), Ok(0));

        let arr = call(&mut heap, "GetArray", &[OBJ, STR], &[obj, tags]).unwrap();
        assert_eq!(heap.stringify(ARR_STR, arr).unwrap(), "[a 1]");
        let map = call(&mut heap, "GetMap", &[OBJ, STR], &[obj, sub]).unwrap();
        assert_eq!(heap.stringify(MAP_STR, map).unwrap(), "map[k:2]");

        let encoded = call(&mut heap, "JSONEncode", &[OBJ], &[obj]).unwrap();
        assert_eq!(
            heap.str(encoded).unwrap(),
            r#"{"name":"x","tags":["a",1],"sub":{"k":2}}"#
        );
    }

    #[test]
    fn test_json_decode_requires_object() {
        let mut heap = Heap::new();
        let text = heap.push_str("[1,2]");
        assert!(matches!(
            call(&mut heap, "JSONDecode", &[STR], &[text]),
            Err(RuntimeError::Json(_))
        ));
    }

    #[test]
    fn test_hex_and_sha256() {
        let mut heap = Heap::new();
        let s = heap.push_str("abc");
        let b = call(&mut heap, "bytes", &[STR], &[s]).unwrap();
        let digest = call(&mut heap, "Sha256", &[BYTES], &[b]).unwrap();
        let hexed = call(&mut heap, "Hex", &[BYTES], &[digest]).unwrap();
        assert_eq!(
            heap.str(hexed).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let back = call(&mut heap, "UnHex", &[STR], &[hexed]).unwrap();
        assert_eq!(heap.bytes(back).unwrap(), heap.bytes(digest).unwrap());
    }

    #[test]
    fn test_file_roundtrip() {
        let mut heap = Heap::new();
        let name = heap.push_str("a.txt");
        let mime = heap.push_str("text/plain");
        let body = heap.push(Object::Bytes(vec![1, 2]));
        let file = call(&mut heap, "FileInit", &[STR, STR, BYTES], &[name, mime, body]).unwrap();
        let out = call(&mut heap, "FileName", &[FILE], &[file]).unwrap();
        assert_eq!(heap.str(out).unwrap(), "a.txt");
        let out = call(&mut heap, "FileBody", &[FILE], &[file]).unwrap();
        assert_eq!(heap.bytes(out).unwrap(), &vec![1, 2]);
    }
}
