use crate::lang::types::{Kind, Type};
use crate::lang::value::{File, Value};
use crate::runtime::runtime_error::{RuntimeError, type_error};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// A heap-boxed value addressed by handle from a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// `arr.*`: element slots.
    Array(Vec<i64>),
    /// `map.*`: element slots keyed by string.
    Map(BTreeMap<String, i64>),
    Money(Decimal),
    Bytes(Vec<u8>),
    File(File),
    /// `obj` values and object lists.
    Json(serde_json::Value),
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Array(_) => "arr",
            Object::Map(_) => "map",
            Object::Money(_) => "money",
            Object::Bytes(_) => "bytes",
            Object::File(_) => "file",
            Object::Json(_) => "obj",
        }
    }
}

/// Arena lengths recorded by [`Heap::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub strings: usize,
    pub objects: usize,
}

/// The two append-only arenas.
///
/// Nothing is ever freed individually: restoring a checkpoint truncates both
/// arenas, dropping everything allocated since.
#[derive(Debug, Default)]
pub struct Heap {
    strings: Vec<String>,
    objects: Vec<Object>,
}

fn slot_index(handle: i64, len: usize, kind: &'static str) -> Result<usize, RuntimeError> {
    usize::try_from(handle)
        .ok()
        .filter(|&i| i < len)
        .ok_or(RuntimeError::InvalidHandle { kind, handle })
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            strings: self.strings.len(),
            objects: self.objects.len(),
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.strings.truncate(checkpoint.strings);
        self.objects.truncate(checkpoint.objects);
    }

    pub fn strings_len(&self) -> usize {
        self.strings.len()
    }

    pub fn objects_len(&self) -> usize {
        self.objects.len()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub fn push_str(&mut self, s: impl Into<String>) -> i64 {
        self.strings.push(s.into());
        (self.strings.len() - 1) as i64
    }

    pub fn push(&mut self, object: Object) -> i64 {
        self.objects.push(object);
        (self.objects.len() - 1) as i64
    }

    /// The value a freshly declared variable of type `ty` starts with.
    pub fn default_slot(&mut self, ty: Type) -> i64 {
        match ty.kind() {
            Kind::Str => self.push_str(""),
            Kind::Arr => self.push(Object::Array(Vec::new())),
            Kind::Map => self.push(Object::Map(BTreeMap::new())),
            Kind::Money => self.push(Object::Money(Decimal::ZERO)),
            Kind::Bytes => self.push(Object::Bytes(Vec::new())),
            Kind::File => self.push(Object::File(File::default())),
            Kind::Object => self.push(Object::Json(serde_json::Value::Object(
                serde_json::Map::new(),
            ))),
            Kind::Void | Kind::Int | Kind::Bool | Kind::Float => 0,
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn str(&self, handle: i64) -> Result<&str, RuntimeError> {
        let i = slot_index(handle, self.strings.len(), "str")?;
        Ok(&self.strings[i])
    }

    pub fn object(&self, handle: i64) -> Result<&Object, RuntimeError> {
        let i = slot_index(handle, self.objects.len(), "object")?;
        Ok(&self.objects[i])
    }

    pub fn object_mut(&mut self, handle: i64) -> Result<&mut Object, RuntimeError> {
        let i = slot_index(handle, self.objects.len(), "object")?;
        Ok(&mut self.objects[i])
    }

    pub fn array(&self, handle: i64) -> Result<&Vec<i64>, RuntimeError> {
        match self.object(handle)? {
            Object::Array(items) => Ok(items),
            other => Err(type_error("arr", other.kind_name())),
        }
    }

    pub fn array_mut(&mut self, handle: i64) -> Result<&mut Vec<i64>, RuntimeError> {
        match self.object_mut(handle)? {
            Object::Array(items) => Ok(items),
            other => Err(type_error("arr", other.kind_name())),
        }
    }

    pub fn map(&self, handle: i64) -> Result<&BTreeMap<String, i64>, RuntimeError> {
        match self.object(handle)? {
            Object::Map(items) => Ok(items),
            other => Err(type_error("map", other.kind_name())),
        }
    }

    pub fn map_mut(&mut self, handle: i64) -> Result<&mut BTreeMap<String, i64>, RuntimeError> {
        match self.object_mut(handle)? {
            Object::Map(items) => Ok(items),
            other => Err(type_error("map", other.kind_name())),
        }
    }

    pub fn money(&self, handle: i64) -> Result<Decimal, RuntimeError> {
        match self.object(handle)? {
            Object::Money(d) => Ok(*d),
            other => Err(type_error("money", other.kind_name())),
        }
    }

    pub fn bytes(&self, handle: i64) -> Result<&Vec<u8>, RuntimeError> {
        match self.object(handle)? {
            Object::Bytes(bytes) => Ok(bytes),
            other => Err(type_error("bytes", other.kind_name())),
        }
    }

    pub fn bytes_mut(&mut self, handle: i64) -> Result<&mut Vec<u8>, RuntimeError> {
        match self.object_mut(handle)? {
            Object::Bytes(bytes) => Ok(bytes),
            other => Err(type_error("bytes", other.kind_name())),
        }
    }

    pub fn file(&self, handle: i64) -> Result<&File, RuntimeError> {
        match self.object(handle)? {
            Object::File(file) => Ok(file),
            other => Err(type_error("file", other.kind_name())),
        }
    }

    pub fn json(&self, handle: i64) -> Result<&serde_json::Value, RuntimeError> {
        match self.object(handle)? {
            Object::Json(json) => Ok(json),
            other => Err(type_error("obj", other.kind_name())),
        }
    }

    // =========================================================================
    // Copy and conversion
    // =========================================================================

    /// Deep copy of the value held in `slot`, so the copy shares no heap
    /// entry with the original. Scalars are returned unchanged.
    pub fn deep_copy(&mut self, ty: Type, slot: i64) -> Result<i64, RuntimeError> {
        Ok(match ty.kind() {
            Kind::Void | Kind::Int | Kind::Bool | Kind::Float => slot,
            Kind::Str => {
                let s = self.str(slot)?.to_string();
                self.push_str(s)
            }
            Kind::Arr => {
                let items = self.array(slot)?.clone();
                let elem = ty.elem();
                let mut copied = Vec::with_capacity(items.len());
                for item in items {
                    copied.push(self.deep_copy(elem, item)?);
                }
                self.push(Object::Array(copied))
            }
            Kind::Map => {
                let items = self.map(slot)?.clone();
                let elem = ty.elem();
                let mut copied = BTreeMap::new();
                for (key, item) in items {
                    copied.insert(key, self.deep_copy(elem, item)?);
                }
                self.push(Object::Map(copied))
            }
            Kind::Money | Kind::Bytes | Kind::File | Kind::Object => {
                let object = self.object(slot)?.clone();
                self.push(object)
            }
        })
    }

    /// Reads the slot as a typed host value.
    pub fn load(&self, ty: Type, slot: i64) -> Result<Value, RuntimeError> {
        Ok(match ty.kind() {
            Kind::Void | Kind::Int => Value::Int(slot),
            Kind::Bool => Value::Bool(slot != 0),
            Kind::Float => Value::Float(f64::from_bits(slot as u64)),
            Kind::Str => Value::Str(self.str(slot)?.to_string()),
            Kind::Money => Value::Money(self.money(slot)?),
            Kind::Bytes => Value::Bytes(self.bytes(slot)?.clone()),
            Kind::File => Value::File(self.file(slot)?.clone()),
            Kind::Object => Value::Object(self.json(slot)?.clone()),
            Kind::Arr => {
                let elem = ty.elem();
                let items = self
                    .array(slot)?
                    .iter()
                    .map(|&item| self.load(elem, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(items)
            }
            Kind::Map => {
                let elem = ty.elem();
                let mut items = BTreeMap::new();
                for (key, &item) in self.map(slot)? {
                    items.insert(key.clone(), self.load(elem, item)?);
                }
                Value::Map(items)
            }
        })
    }

    /// Allocates `value` as a slot of type `ty`.
    pub fn store(&mut self, ty: Type, value: &Value) -> Result<i64, RuntimeError> {
        Ok(match (ty.kind(), value) {
            (Kind::Int, Value::Int(n)) => *n,
            (Kind::Bool, Value::Bool(b)) => *b as i64,
            (Kind::Float, Value::Float(f)) => f.to_bits() as i64,
            (Kind::Str, Value::Str(s)) => self.push_str(s.clone()),
            (Kind::Money, Value::Money(d)) => self.push(Object::Money(*d)),
            (Kind::Bytes, Value::Bytes(b)) => self.push(Object::Bytes(b.clone())),
            (Kind::File, Value::File(f)) => self.push(Object::File(f.clone())),
            (Kind::Object, Value::Object(json)) => self.push(Object::Json(json.clone())),
            (Kind::Arr, Value::Array(items)) => {
                let elem = ty.elem();
                let mut slots = Vec::with_capacity(items.len());
                for item in items {
                    slots.push(self.store(elem, item)?);
                }
                self.push(Object::Array(slots))
            }
            (Kind::Map, Value::Map(items)) => {
                let elem = ty.elem();
                let mut slots = BTreeMap::new();
                for (key, item) in items {
                    slots.insert(key.clone(), self.store(elem, item)?);
                }
                self.push(Object::Map(slots))
            }
            (kind, value) => return Err(type_error(kind.name(), value.type_name())),
        })
    }

    /// Display form of a slot, as produced by `RETURN`.
    pub fn stringify(&self, ty: Type, slot: i64) -> Result<String, RuntimeError> {
        if ty.is_void() {
            return Ok(String::new());
        }
        Ok(self.load(ty, slot)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_restore_truncates_both_arenas() {
        let mut heap = Heap::new();
        heap.push_str("keep");
        let cp = heap.checkpoint();
        heap.push_str("drop");
        heap.push(Object::Bytes(vec![1]));
        heap.restore(cp);
        assert_eq!(heap.strings_len(), 1);
        assert_eq!(heap.objects_len(), 0);
        assert_eq!(heap.str(0).unwrap(), "keep");
    }

    #[test]
    fn test_deep_copy_nested_array() {
        let mut heap = Heap::new();
        let arr_str = Type::array_of(Type::STR).unwrap();
        let a = heap.push_str("a");
        let arr = heap.push(Object::Array(vec![a]));
        let copy = heap.deep_copy(arr_str, arr).unwrap();
        assert_ne!(copy, arr);
        let copied_elem = heap.array(copy).unwrap()[0];
        assert_ne!(copied_elem, a);
        assert_eq!(heap.str(copied_elem).unwrap(), "a");
    }

    #[test]
    fn test_store_load_map() {
        let mut heap = Heap::new();
        let map_int = Type::map_of(Type::INT).unwrap();
        let mut items = BTreeMap::new();
        items.insert("x".to_string(), Value::Int(7));
        let value = Value::Map(items);
        let slot = heap.store(map_int, &value).unwrap();
        assert_eq!(heap.load(map_int, slot).unwrap(), value);
        assert_eq!(heap.stringify(map_int, slot).unwrap(), "map[x:7]");
    }

    #[test]
    fn test_store_rejects_wrong_kind() {
        let mut heap = Heap::new();
        let err = heap.store(Type::INT, &Value::Str("1".into())).unwrap_err();
        assert_eq!(err, type_error("int", "str"));
    }

    #[test]
    fn test_invalid_handle() {
        let heap = Heap::new();
        assert!(matches!(
            heap.str(3),
            Err(RuntimeError::InvalidHandle { kind: "str", handle: 3 })
        ));
    }

    #[test]
    fn test_float_bits_roundtrip() {
        let mut heap = Heap::new();
        let slot = heap.store(Type::FLOAT, &Value::Float(2.5)).unwrap();
        assert_eq!(heap.stringify(Type::FLOAT, slot).unwrap(), "2.5");
    }
}
