use serde::{Deserialize, Serialize};

/// Outer kind of a language type, stored in the low nibble of a [`Type`].
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Void = 0x0,
    Int = 0x1,
    Bool = 0x2,
    Str = 0x3,
    Arr = 0x4,
    Map = 0x5,
    Float = 0x6,
    Money = 0x7,
    Object = 0x8,
    Bytes = 0x9,
    File = 0xA,
}

impl Kind {
    fn from_nibble(nibble: u16) -> Option<Kind> {
        Some(match nibble {
            0x0 => Kind::Void,
            0x1 => Kind::Int,
            0x2 => Kind::Bool,
            0x3 => Kind::Str,
            0x4 => Kind::Arr,
            0x5 => Kind::Map,
            0x6 => Kind::Float,
            0x7 => Kind::Money,
            0x8 => Kind::Object,
            0x9 => Kind::Bytes,
            0xA => Kind::File,
            _ => return None,
        })
    }

    pub fn from_name(name: &str) -> Option<Kind> {
        Some(match name {
            "void" => Kind::Void,
            "int" => Kind::Int,
            "bool" => Kind::Bool,
            "str" => Kind::Str,
            "arr" => Kind::Arr,
            "map" => Kind::Map,
            "float" => Kind::Float,
            "money" => Kind::Money,
            "obj" => Kind::Object,
            "bytes" => Kind::Bytes,
            "file" => Kind::File,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Void => "void",
            Kind::Int => "int",
            Kind::Bool => "bool",
            Kind::Str => "str",
            Kind::Arr => "arr",
            Kind::Map => "map",
            Kind::Float => "float",
            Kind::Money => "money",
            Kind::Object => "obj",
            Kind::Bytes => "bytes",
            Kind::File => "file",
        }
    }
}

/// A language type packed into one bytecode word.
///
/// The low nibble is the outer [`Kind`]; containers keep their element type
/// in the next nibble up, so `arr.map.str` is `0x354`. Four nesting levels
/// fit into a word. This packing is what `INITVARS`, `PARCONTRACT`, `COPY`
/// and `RETURN` carry as operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Type(u16);

impl Type {
    pub const VOID: Type = Type(Kind::Void as u16);
    pub const INT: Type = Type(Kind::Int as u16);
    pub const BOOL: Type = Type(Kind::Bool as u16);
    pub const STR: Type = Type(Kind::Str as u16);
    pub const ARR: Type = Type(Kind::Arr as u16);
    pub const MAP: Type = Type(Kind::Map as u16);
    pub const FLOAT: Type = Type(Kind::Float as u16);
    pub const MONEY: Type = Type(Kind::Money as u16);
    pub const OBJECT: Type = Type(Kind::Object as u16);
    pub const BYTES: Type = Type(Kind::Bytes as u16);
    pub const FILE: Type = Type(Kind::File as u16);

    pub const fn from_tag(tag: u16) -> Type {
        Type(tag)
    }

    pub const fn tag(self) -> u16 {
        self.0
    }

    /// `arr.<elem>`; `None` when the nesting no longer fits into a word.
    pub const fn array_of(elem: Type) -> Option<Type> {
        if elem.0 >= 0x1000 {
            return None;
        }
        Some(Type((elem.0 << 4) | Kind::Arr as u16))
    }

    /// `map.<elem>`; `None` when the nesting no longer fits into a word.
    pub const fn map_of(elem: Type) -> Option<Type> {
        if elem.0 >= 0x1000 {
            return None;
        }
        Some(Type((elem.0 << 4) | Kind::Map as u16))
    }

    pub fn kind(self) -> Kind {
        Kind::from_nibble(self.0 & 0xf).unwrap_or(Kind::Void)
    }

    /// Reads a dotted type name such as `int` or `arr.map.str`.
    pub fn parse(text: &str) -> Option<Type> {
        let kinds = text
            .split('.')
            .map(Kind::from_name)
            .collect::<Option<Vec<_>>>()?;
        let (&last, outer) = kinds.split_last()?;
        if kinds.len() > 4 || last == Kind::Void {
            return None;
        }
        outer.iter().rev().try_fold(Type(last as u16), |elem, kind| match kind {
            Kind::Arr => Type::array_of(elem),
            Kind::Map => Type::map_of(elem),
            _ => None,
        })
    }

    /// The outer container type with element information dropped.
    pub const fn outer(self) -> Type {
        Type(self.0 & 0xf)
    }

    /// Element type of a container. Bytes index to `int`.
    pub fn elem(self) -> Type {
        match self.kind() {
            Kind::Bytes => Type::INT,
            Kind::Arr | Kind::Map => Type(self.0 >> 4),
            _ => Type::VOID,
        }
    }

    pub const fn is_composite(self) -> bool {
        self.0 > 0xf
    }

    pub fn is_void(self) -> bool {
        self == Type::VOID
    }

    /// Values of this type live in a heap arena and the slot holds a handle.
    pub fn is_heap(self) -> bool {
        matches!(
            self.kind(),
            Kind::Str
                | Kind::Arr
                | Kind::Map
                | Kind::Money
                | Kind::Object
                | Kind::Bytes
                | Kind::File
        )
    }

    /// Containers that are copied element by element on assignment.
    pub fn is_container(self) -> bool {
        matches!(self.kind(), Kind::Arr | Kind::Map | Kind::Bytes)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tag = self.0;
        let mut first = true;
        for _ in 0..4 {
            let kind = match Kind::from_nibble(tag & 0xf) {
                Some(Kind::Void) | None => break,
                Some(kind) => kind,
            };
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", kind.name())?;
            first = false;
            tag >>= 4;
        }
        if first {
            write!(f, "{}", if self.0 == 0 { "void" } else { "unknown" })?;
        }
        Ok(())
    }
}
