//! Host-side data model
//!
//! The interpreter never sees raw memory. Parameters and pointees are
//! `Value` trees; anything reachable through a pointer lives in a `Memory`
//! arena and is named by a `HeapRef`, so aliasing and cycles are expressed by
//! sharing handles rather than addresses.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use crate::context_handle::LocalHandle;
use crate::pipes::PipeHandle;
use crate::{NdrError, Result};

/// Handle to one allocation in a `Memory` arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub usize);

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An in-memory datum as seen by the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Empty union arm or not-yet-filled node
    Void,
    Boolean(bool),
    Byte(u8),
    Char(u8),
    Small(i8),
    USmall(u8),
    Short(i16),
    UShort(u16),
    Long(i32),
    ULong(u32),
    Hyper(i64),
    UHyper(u64),
    Float(f32),
    Double(f64),
    /// `enum` or `[v1_enum]`
    Enum(i32),
    ErrorStatus(u32),
    /// Fields in host slot order
    Struct(Vec<Value>),
    /// Elements, flattened row-major for multi-dimensional arrays
    Array(Vec<Value>),
    /// Discriminated union
    Union { switch: i64, arm: Box<Value> },
    /// Null or a handle into the arena
    Ptr(Option<HeapRef>),
    /// Local context handle, `None` when the handle is null
    Context(Option<LocalHandle>),
    Pipe(PipeHandle),
}

impl Value {
    /// Short name of this variant for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Small(_) => "small",
            Value::USmall(_) => "unsigned small",
            Value::Short(_) => "short",
            Value::UShort(_) => "unsigned short",
            Value::Long(_) => "long",
            Value::ULong(_) => "unsigned long",
            Value::Hyper(_) => "hyper",
            Value::UHyper(_) => "unsigned hyper",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Enum(_) => "enum",
            Value::ErrorStatus(_) => "error_status_t",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Union { .. } => "union",
            Value::Ptr(_) => "pointer",
            Value::Context(_) => "context handle",
            Value::Pipe(_) => "pipe",
        }
    }

    /// Integer view of a scalar, used for correlations and discriminants
    pub fn as_i64(&self) -> Option<i64> {
        Some(match *self {
            Value::Boolean(v) => i64::from(v),
            Value::Byte(v) | Value::Char(v) | Value::USmall(v) => i64::from(v),
            Value::Small(v) => i64::from(v),
            Value::Short(v) => i64::from(v),
            Value::UShort(v) => i64::from(v),
            Value::Long(v) | Value::Enum(v) => i64::from(v),
            Value::ULong(v) | Value::ErrorStatus(v) => i64::from(v),
            Value::Hyper(v) => v,
            Value::UHyper(v) => v as i64,
            _ => return None,
        })
    }

    /// ANSI string as an array of `char`, without terminator
    pub fn string(s: &str) -> Self {
        Value::Array(s.bytes().map(Value::Char).collect())
    }

    /// Wide string as an array of `unsigned short`, without terminator
    pub fn wstring(s: &str) -> Self {
        Value::Array(s.encode_utf16().map(Value::UShort).collect())
    }

    /// Text of a `char` or `unsigned short` array
    pub fn to_text(&self) -> Option<String> {
        let Value::Array(elems) = self else {
            return None;
        };
        let mut narrow = Vec::new();
        let mut wide = Vec::new();
        for elem in elems {
            match *elem {
                Value::Char(c) | Value::Byte(c) => narrow.push(c),
                Value::UShort(w) => wide.push(w),
                _ => return None,
            }
        }
        if !wide.is_empty() {
            String::from_utf16(&wide).ok()
        } else {
            String::from_utf8(narrow).ok()
        }
    }
}

/// Allocator pair plus access to pointees.
///
/// Every pointee the unmarshaller creates and every node it frees goes
/// through this interface.
pub trait Memory {
    fn allocate(&mut self, value: Value) -> Result<HeapRef>;
    fn free(&mut self, node: HeapRef) -> Result<()>;
    fn load(&self, node: HeapRef) -> Result<&Value>;
    fn store(&mut self, node: HeapRef, value: Value) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Slot {
    Live(Value),
    Tombstone,
}

/// Allocation counters of a `Heap`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: usize,
    pub frees: usize,
    pub live: usize,
}

/// Arena implementation of `Memory`.
///
/// Freed slots become tombstones and are never reused, so a stale `HeapRef`
/// can be diagnosed instead of aliasing a newer allocation.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    stats: HeapStats,
    limit: Option<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena that refuses allocations beyond `limit` live nodes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn is_live(&self, node: HeapRef) -> bool {
        matches!(self.slots.get(node.0), Some(Slot::Live(_)))
    }

    /// Structural equality of `a` in `self` and `b` in `other`, following
    /// pointers and requiring the same aliasing shape on both sides.
    pub fn deep_eq(&self, a: &Value, other: &Heap, b: &Value) -> bool {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        self.deep_eq_inner(a, other, b, &mut forward, &mut backward)
    }

    fn deep_eq_inner(
        &self,
        a: &Value,
        other: &Heap,
        b: &Value,
        forward: &mut HashMap<HeapRef, HeapRef>,
        backward: &mut HashMap<HeapRef, HeapRef>,
    ) -> bool {
        match (a, b) {
            (Value::Ptr(None), Value::Ptr(None)) => true,
            (Value::Ptr(Some(ra)), Value::Ptr(Some(rb))) => {
                match (forward.get(ra), backward.get(rb)) {
                    (Some(mapped), _) => return mapped == rb,
                    (None, Some(_)) => return false,
                    (None, None) => {}
                }
                forward.insert(*ra, *rb);
                backward.insert(*rb, *ra);
                match (self.load(*ra), other.load(*rb)) {
                    (Ok(va), Ok(vb)) => self.deep_eq_inner(va, other, vb, forward, backward),
                    _ => false,
                }
            }
            (Value::Struct(fa), Value::Struct(fb)) | (Value::Array(fa), Value::Array(fb)) => {
                fa.len() == fb.len()
                    && fa
                        .iter()
                        .zip(fb)
                        .all(|(x, y)| self.deep_eq_inner(x, other, y, forward, backward))
            }
            (
                Value::Union { switch: sa, arm: aa },
                Value::Union { switch: sb, arm: ab },
            ) => sa == sb && self.deep_eq_inner(aa, other, ab, forward, backward),
            _ => a == b,
        }
    }
}

impl Memory for Heap {
    fn allocate(&mut self, value: Value) -> Result<HeapRef> {
        if let Some(limit) = self.limit {
            if self.stats.live >= limit {
                return Err(NdrError::AllocationFailed {
                    live: self.stats.live,
                    limit,
                });
            }
        }
        let node = HeapRef(self.slots.len());
        self.slots.push(Slot::Live(value));
        self.stats.allocations += 1;
        self.stats.live += 1;
        trace!("heap: allocated {}", node);
        Ok(node)
    }

    fn free(&mut self, node: HeapRef) -> Result<()> {
        match self.slots.get_mut(node.0) {
            Some(slot @ Slot::Live(_)) => {
                *slot = Slot::Tombstone;
                self.stats.frees += 1;
                self.stats.live -= 1;
                trace!("heap: freed {}", node);
                Ok(())
            }
            Some(Slot::Tombstone) => Err(NdrError::DoubleFree(node.0)),
            None => Err(NdrError::InvalidHeapRef(node.0)),
        }
    }

    fn load(&self, node: HeapRef) -> Result<&Value> {
        match self.slots.get(node.0) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(NdrError::InvalidHeapRef(node.0)),
        }
    }

    fn store(&mut self, node: HeapRef, value: Value) -> Result<()> {
        match self.slots.get_mut(node.0) {
            Some(Slot::Live(slot)) => {
                *slot = value;
                Ok(())
            }
            _ => Err(NdrError::InvalidHeapRef(node.0)),
        }
    }
}
