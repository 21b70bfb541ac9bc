//! Runtime value representation.
//!
//! Scalars (int, float, str) normally live on their typed stacks and only
//! appear as `Value` when crossing a uniform boundary: the any stack, the
//! constants table, aggregate elements and the embed calling convention.
//! Aggregates are held behind `Arc<RwLock<_>>` handles, so a handle copied
//! into a spawned context aliases the same storage; plain assignment copies
//! structurally via [`Value::deep_copy`], pointer assignment clones the
//! handle.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::types::{self, Storage};

pub type ArrRef = Arc<RwLock<Vec<Value>>>;
pub type MapRef = Arc<RwLock<IndexMap<String, Value>>>;
pub type BufRef = Arc<RwLock<Vec<u8>>>;
pub type SetRef = Arc<RwLock<Vec<u64>>>;
pub type StructRef = Arc<RwLock<StructValue>>;
pub type ObjRef = Arc<RwLock<Value>>;

/// A struct instance: descriptor index plus field values in declared order.
#[derive(Debug, Clone)]
pub struct StructValue {
    pub def: u16,
    pub fields: Vec<Value>,
}

/// The error object surfaced to `recover` blocks by `Catch`: failure kind
/// code, message, and the resolved source position rendered as text.
#[derive(Debug, Clone)]
pub struct ErrInfo {
    pub id: i64,
    pub message: String,
    pub pos: String,
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    None,
    /// int, bool (0/1) and char (code point) share the integer representation.
    Int(i64),
    Float(f64),
    Str(String),
    Arr(ArrRef),
    Map(MapRef),
    Buf(BufRef),
    Set(SetRef),
    Range {
        from: i64,
        to: i64,
    },
    /// Reference to a program function by ID.
    Func(i32),
    Error(Box<ErrInfo>),
    Struct(StructRef),
    Obj(ObjRef),
}

impl Value {
    pub fn arr(items: Vec<Value>) -> Value {
        Value::Arr(Arc::new(RwLock::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Arc::new(RwLock::new(entries)))
    }

    pub fn buf(bytes: Vec<u8>) -> Value {
        Value::Buf(Arc::new(RwLock::new(bytes)))
    }

    pub fn set(words: Vec<u64>) -> Value {
        Value::Set(Arc::new(RwLock::new(words)))
    }

    pub fn obj(inner: Value) -> Value {
        Value::Obj(Arc::new(RwLock::new(inner)))
    }

    /// The type tag this value carries by default. Bool and char collapse to
    /// int here; the declared tag travels separately where it matters (the
    /// constants table keeps the initializer's return tag).
    pub fn tag(&self) -> u16 {
        match self {
            Value::None => types::TYPE_NONE,
            Value::Int(_) => types::TYPE_INT,
            Value::Float(_) => types::TYPE_FLOAT,
            Value::Str(_) => types::TYPE_STR,
            Value::Arr(_) => types::TYPE_ARR,
            Value::Map(_) => types::TYPE_MAP,
            Value::Buf(_) => types::TYPE_BUF,
            Value::Set(_) => types::TYPE_SET,
            Value::Range { .. } => types::TYPE_RANGE,
            Value::Func(_) => types::TYPE_FUNC,
            Value::Error(_) => types::TYPE_ERROR,
            Value::Struct(_) => types::TYPE_STRUCT,
            Value::Obj(_) => types::TYPE_OBJ,
        }
    }

    #[inline]
    pub fn storage(&self) -> Storage {
        Storage::of(self.tag())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Element count of a container; `None` for non-containers.
    /// Strings count characters, ranges their span.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::Arr(a) => Some(a.read().len()),
            Value::Map(m) => Some(m.read().len()),
            Value::Buf(b) => Some(b.read().len()),
            Value::Set(s) => Some(s.read().iter().map(|w| w.count_ones() as usize).sum()),
            Value::Range { from, to } => Some((to - from).unsigned_abs() as usize),
            _ => None,
        }
    }

    /// Structural copy: aggregates are duplicated recursively, scalars and
    /// plain values cloned as-is.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Arr(a) => {
                let items = a.read().iter().map(Value::deep_copy).collect();
                Value::arr(items)
            }
            Value::Map(m) => {
                let entries = m
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::map(entries)
            }
            Value::Buf(b) => Value::buf(b.read().clone()),
            Value::Set(s) => Value::set(s.read().clone()),
            Value::Struct(st) => {
                let src = st.read();
                Value::Struct(Arc::new(RwLock::new(StructValue {
                    def: src.def,
                    fields: src.fields.iter().map(Value::deep_copy).collect(),
                })))
            }
            Value::Obj(o) => Value::obj(o.read().deep_copy()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, ""),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Range { from, to } => write!(f, "{from}..{to}"),
            Value::Func(id) => write!(f, "func#{id}"),
            Value::Error(e) if e.pos.is_empty() => write!(f, "error {}: {}", e.id, e.message),
            Value::Error(e) => write!(f, "error {}: {} [{}]", e.id, e.message, e.pos),
            other => write!(f, "<{}>", storage_name(other.tag())),
        }
    }
}

fn storage_name(tag: u16) -> &'static str {
    match tag {
        types::TYPE_ARR => "arr",
        types::TYPE_MAP => "map",
        types::TYPE_BUF => "buf",
        types::TYPE_SET => "set",
        types::TYPE_STRUCT => "struct",
        types::TYPE_OBJ => "obj",
        _ => "value",
    }
}

/// Read one bit of a set aggregate.
pub fn set_get(set: &SetRef, idx: usize) -> bool {
    let words = set.read();
    words
        .get(idx / 64)
        .map(|w| w & (1 << (idx % 64)) != 0)
        .unwrap_or(false)
}

/// Write one bit of a set aggregate, growing it as needed.
pub fn set_put(set: &SetRef, idx: usize, on: bool) {
    let mut words = set.write();
    let word = idx / 64;
    if words.len() <= word {
        words.resize(word + 1, 0);
    }
    if on {
        words[word] |= 1 << (idx % 64);
    } else {
        words[word] &= !(1 << (idx % 64));
    }
}
