//! Marshalling walker
//!
//! Walks a parameter list's descriptors against host values and writes NDR.
//! Embedded pointees are collected while the enclosing construct is walked
//! and written after it; a pointee's own embedded pointees follow it
//! directly (depth-first), which is the NDR deferral order.

use tracing::trace;

use crate::buffer::MarshalBuffer;
use crate::config::InterpreterConfig;
use crate::context::NdrContext;
use crate::context_handle::ContextRegistry;
use crate::correlation::{BoundPair, ScopeId, Scopes};
use crate::pointers::{NodeLookup, REF_PLACEHOLDER};
use crate::primitives::{put_count, put_scalar};
use crate::arrays::ArrayShape;
use crate::state::{Bookkeeping, Interface};
use crate::type_vec::{Descriptor, PtrKind, StructDefn, StructKind, TypeDesc};
use crate::{HeapRef, Memory, NdrError, Result, Value};

/// Where a descriptor sits: its correlation scope and whether it is
/// embedded in a struct, array or union
#[derive(Debug, Clone, Copy)]
pub(crate) struct Site {
    pub(crate) scope: ScopeId,
    pub(crate) embedded: bool,
}

impl Site {
    pub(crate) fn embedded(self) -> Self {
        Site {
            embedded: true,
            ..self
        }
    }
}

/// A pointee whose representation follows the enclosing construct
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deferred {
    pub(crate) node: HeapRef,
    pub(crate) pointee: usize,
    pub(crate) scope: ScopeId,
}

pub(crate) struct Marshaller<'a, 't> {
    pub(crate) iface: &'a Interface,
    pub(crate) ctx: NdrContext,
    pub(crate) config: &'a InterpreterConfig,
    pub(crate) memory: &'a dyn Memory,
    pub(crate) book: &'a mut Bookkeeping,
    pub(crate) contexts: Option<&'a ContextRegistry>,
    pub(crate) deleted: &'a [u32],
    pub(crate) buf: &'a mut MarshalBuffer<'t>,
    pub(crate) scopes: Scopes,
    pub(crate) deferred: Vec<Deferred>,
}

impl<'a, 't> Marshaller<'a, 't> {
    pub(crate) fn marshal_params(&mut self, params_at: usize, params: &[Value]) -> Result<()> {
        let list = self.iface.type_vec.param_list(params_at)?;
        let values = params.iter().map(|p| self.correlation_value(p)).collect();
        let scope = self.scopes.open(values);
        let site = Site {
            scope,
            embedded: false,
        };
        for param in &list {
            let value = params.get(param.index as usize).ok_or(NdrError::ParamIndex {
                index: param.index,
                len: params.len(),
            })?;
            trace!("marshal param {} at stream offset {}", param.index, self.buf.position());
            self.marshal_desc(&param.desc, value, site)?;
            self.flush_deferred()?;
        }
        Ok(())
    }

    /// Integer view of a host value for correlation, looking through one
    /// level of pointer for parameters passed by reference
    pub(crate) fn correlation_value(&self, value: &Value) -> Option<i64> {
        match value {
            Value::Ptr(Some(node)) => self.memory.load(*node).ok().and_then(Value::as_i64),
            other => other.as_i64(),
        }
    }

    pub(crate) fn marshal_desc(&mut self, desc: &Descriptor, value: &Value, site: Site) -> Result<()> {
        self.book.descend(self.config.max_nesting_depth, desc.offset)?;
        let result = self.marshal_nested(desc, value, site);
        self.book.ascend();
        result
    }

    fn marshal_nested(&mut self, desc: &Descriptor, value: &Value, site: Site) -> Result<()> {
        match &desc.ty {
            TypeDesc::Scalar(kind) => {
                self.book.range = BoundPair::UNSET;
                put_scalar(self.buf, &self.ctx, *kind, value)?;
            }
            TypeDesc::Struct { kind, defn, .. } => self.marshal_struct(*kind, *defn, value, None)?,
            TypeDesc::NestedStruct {
                align,
                offset_index,
                fields,
            } => {
                let slots = struct_slots(value)?;
                let scope = self.open_struct_scope(*offset_index, fields, slots)?;
                self.buf.align(usize::from(*align))?;
                self.marshal_fields(*offset_index, fields, slots, scope, None)?;
            }
            TypeDesc::Array { kind, dims, defn, .. } => {
                self.marshal_array(desc, *kind, *dims, *defn, value, site, None)?
            }
            TypeDesc::EncUnion { defn, .. } => self.marshal_union(*defn, None, value, site)?,
            TypeDesc::NeUnion {
                switch_field, defn, ..
            } => self.marshal_union(*defn, Some(*switch_field), value, site)?,
            TypeDesc::Pointer { kind, pointee, .. } => self.marshal_pointer(*kind, *pointee, value, site)?,
            TypeDesc::Ignore => put_count(self.buf, &self.ctx, 0)?,
            TypeDesc::Xmit { routine, xmit, .. } => self.marshal_xmit(*routine, *xmit, value, site)?,
            TypeDesc::Pipe { element, .. } => self.marshal_pipe(*element, value, site)?,
            TypeDesc::Context(dir) => self.marshal_context(*dir, value)?,
            TypeDesc::Align(n) => self.buf.align(usize::from(*n))?,
            TypeDesc::DeletedNodes => self.marshal_deleted_nodes()?,
            TypeDesc::Void => {}
            TypeDesc::Unsupported(op) => return Err(NdrError::Unsupported(op.byte())),
        }
        if let Some(index) = desc.modifiers.free_rep {
            self.iface.routine(index)?.free_inst(value);
        }
        Ok(())
    }

    /// Marshal a struct; `preset` carries the shape of its trailing array
    /// when an enclosing struct already wrote the conformance.
    fn marshal_struct(
        &mut self,
        kind: StructKind,
        defn_at: usize,
        value: &Value,
        preset: Option<ArrayShape>,
    ) -> Result<()> {
        let defn = self.iface.type_vec.struct_defn(defn_at)?;
        let slots = struct_slots(value)?;
        let scope = self.open_struct_scope(defn.offset_index, &defn.fields, slots)?;

        // The trailing array's conformance precedes the outermost struct body
        let preset = match preset {
            Some(shape) => Some(shape),
            None if kind != StructKind::Fixed => {
                let (v1, shape) = self.hoisted_shape(&defn, defn_at, slots, scope)?;
                self.put_conformance(&shape, kind == StructKind::V1Conformant || v1)?;
                Some(shape)
            }
            None => None,
        };

        self.buf.align(usize::from(defn.align))?;
        self.marshal_fields(defn.offset_index, &defn.fields, slots, scope, preset)
    }

    /// Shape of the conformant array that ends a struct, found through any
    /// conformant structs that end it in turn
    fn hoisted_shape(
        &mut self,
        defn: &StructDefn,
        defn_at: usize,
        slots: &[Value],
        scope: ScopeId,
    ) -> Result<(bool, ArrayShape)> {
        let conf_at = defn.conf_array.ok_or(NdrError::InvalidDescriptor {
            offset: defn_at,
            reason: "conformant struct without a conformant array",
        })?;
        let mut level = defn.clone();
        let mut slots = slots;
        let mut scope = scope;
        for _ in 0..self.config.max_nesting_depth {
            let tail = conformant_tail(&level.fields, conf_at).ok_or(NdrError::InvalidDescriptor {
                offset: level.offset,
                reason: "conformant array is not the last field",
            })?;
            let slot = self.iface.offsets.slot(level.offset_index, tail.field())?;
            let held = slots.get(slot).ok_or(NdrError::ArraySizeMismatch {
                expected: slot + 1,
                got: slots.len(),
            })?;
            let inner_at = match tail {
                Tail::Array { desc, .. } => {
                    let shape = self.array_shape(desc, conf_at, held, scope)?;
                    return Ok((desc.modifiers.is_v1(), shape));
                }
                Tail::Struct { defn, .. } => defn,
            };
            let inner = self.iface.type_vec.struct_defn(inner_at)?;
            slots = struct_slots(held)?;
            scope = self.open_struct_scope(inner.offset_index, &inner.fields, slots)?;
            level = inner;
        }
        Err(NdrError::NestingTooDeep {
            limit: self.config.max_nesting_depth,
            offset: defn_at,
        })
    }

    /// Correlation scope of a struct instance, prefilled from its host value
    fn open_struct_scope(&mut self, offset_index: u32, fields: &[Descriptor], slots: &[Value]) -> Result<ScopeId> {
        let count = self.iface.offsets.field_count(offset_index)?;
        if slots.len() != count {
            return Err(NdrError::TypeMismatch {
                expected: "struct",
                found: format!("struct with {} fields, layout has {}", slots.len(), count),
            });
        }
        let mut values = Vec::with_capacity(count);
        for (i, _) in fields.iter().filter(|f| f.is_field()).enumerate() {
            let slot = self.iface.offsets.slot(offset_index, i)?;
            values.push(slots[slot].as_i64());
        }
        Ok(self.scopes.open(values))
    }

    fn marshal_fields(
        &mut self,
        offset_index: u32,
        fields: &[Descriptor],
        slots: &[Value],
        scope: ScopeId,
        mut preset: Option<ArrayShape>,
    ) -> Result<()> {
        let site = Site {
            scope,
            embedded: true,
        };
        let last = fields.iter().filter(|f| f.is_field()).count();
        let mut index = 0;
        for field in fields {
            if !field.is_field() {
                self.marshal_desc(field, &Value::Void, site)?;
                continue;
            }
            let slot = self.iface.offsets.slot(offset_index, index)?;
            let value = &slots[slot];
            match (&field.ty, preset.is_some() && index + 1 == last) {
                (TypeDesc::Array { kind, dims, defn, .. }, true) if kind.is_conformant() => {
                    self.marshal_array(field, *kind, *dims, *defn, value, site, preset.take())?;
                }
                (TypeDesc::Struct { kind, defn, .. }, true) if *kind != StructKind::Fixed => {
                    self.marshal_struct(*kind, *defn, value, preset.take())?;
                }
                _ => self.marshal_desc(field, value, site)?,
            }
            index += 1;
        }
        Ok(())
    }

    fn marshal_pointer(&mut self, kind: PtrKind, pointee: usize, value: &Value, site: Site) -> Result<()> {
        let target = match value {
            Value::Ptr(target) => *target,
            other => return Err(NdrError::type_mismatch("pointer", other)),
        };
        match (kind, target) {
            (PtrKind::Ref, None) => Err(NdrError::NullRefPointer),
            (PtrKind::Ref, Some(node)) => {
                if site.embedded {
                    put_count(self.buf, &self.ctx, REF_PLACEHOLDER)?;
                    self.defer(node, pointee, site.scope);
                    Ok(())
                } else {
                    self.marshal_pointee(node, pointee, site.scope)
                }
            }
            (_, None) => put_count(self.buf, &self.ctx, 0),
            (_, Some(node)) => match self.book.nodes.marshal_lookup(node)? {
                NodeLookup::Seen(id) => put_count(self.buf, &self.ctx, id),
                NodeLookup::New(id) => {
                    put_count(self.buf, &self.ctx, id)?;
                    if site.embedded {
                        self.defer(node, pointee, site.scope);
                        Ok(())
                    } else {
                        self.marshal_pointee(node, pointee, site.scope)
                    }
                }
            },
        }
    }

    fn defer(&mut self, node: HeapRef, pointee: usize, scope: ScopeId) {
        trace!("deferring pointee {}", node);
        self.deferred.push(Deferred { node, pointee, scope });
    }

    fn marshal_pointee(&mut self, node: HeapRef, pointee: usize, scope: ScopeId) -> Result<()> {
        let desc = self.iface.type_vec.stream(pointee)?;
        let memory = self.memory;
        let value = memory.load(node)?;
        self.marshal_desc(
            &desc,
            value,
            Site {
                scope,
                embedded: false,
            },
        )
    }

    /// Write every pending pointee, each followed by its own
    fn flush_deferred(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.deferred);
        let mut stack = vec![batch.into_iter()];
        while let Some(frame) = stack.last_mut() {
            let Some(item) = frame.next() else {
                stack.pop();
                continue;
            };
            self.marshal_pointee(item.node, item.pointee, item.scope)?;
            let nested = std::mem::take(&mut self.deferred);
            if !nested.is_empty() {
                stack.push(nested.into_iter());
            }
        }
        Ok(())
    }

    fn marshal_deleted_nodes(&mut self) -> Result<()> {
        let count = u32::try_from(self.deleted.len()).map_err(|_| NdrError::IntegerOverflow)?;
        put_count(self.buf, &self.ctx, count)?;
        for &id in self.deleted {
            put_count(self.buf, &self.ctx, id)?;
        }
        trace!("marshalled {} deleted nodes", count);
        Ok(())
    }
}

/// Host slots of a struct value
pub(crate) fn struct_slots(value: &Value) -> Result<&[Value]> {
    match value {
        Value::Struct(slots) => Ok(slots),
        other => Err(NdrError::type_mismatch("struct", other)),
    }
}

/// Last field of a conformant struct: the conformant array itself, or a
/// conformant struct that ends with it
#[derive(Debug, Clone, Copy)]
pub(crate) enum Tail<'d> {
    Array { field: usize, desc: &'d Descriptor },
    Struct { field: usize, defn: usize },
}

impl Tail<'_> {
    /// Logical index of the field
    pub(crate) fn field(&self) -> usize {
        match *self {
            Tail::Array { field, .. } | Tail::Struct { field, .. } => field,
        }
    }
}

pub(crate) fn conformant_tail(fields: &[Descriptor], conf_at: usize) -> Option<Tail<'_>> {
    let (field, desc) = fields.iter().filter(|f| f.is_field()).enumerate().last()?;
    match desc.ty {
        TypeDesc::Array { kind, defn, .. } if kind.is_conformant() && defn == conf_at => {
            Some(Tail::Array { field, desc })
        }
        TypeDesc::Struct { kind, defn, .. } if kind != StructKind::Fixed => Some(Tail::Struct { field, defn }),
        _ => None,
    }
}
