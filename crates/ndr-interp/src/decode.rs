//! Unmarshalling walker
//!
//! Mirrors the marshaller. Every pointee is allocated through the state
//! block's `Memory` and bound to its node id before its contents are read,
//! so back-references and cycles resolve to the same allocation. Nothing
//! becomes visible to the caller until the whole parameter list decoded:
//! on a fault every allocation made so far is freed once, in reverse order.

use tracing::{trace, warn};

use crate::buffer::UnmarshalBuffer;
use crate::config::InterpreterConfig;
use crate::context::NdrContext;
use crate::context_handle::{ContextRegistry, LocalHandle};
use crate::correlation::{BoundPair, LateCheck, ScopeId, Scopes};
use crate::arrays::Dims;
use crate::encode::{conformant_tail, Deferred, Site, Tail};
use crate::opcode::bound;
use crate::pointers::NodeTable;
use crate::primitives::{get_count, get_scalar, ScalarKind};
use crate::state::{Bookkeeping, Interface, Side};
use crate::type_vec::{ArrayKind, BoundPairRecord, Descriptor, PtrKind, StructDefn, StructKind, TypeDesc};
use crate::{HeapRef, Memory, NdrError, Result, Value};

pub(crate) struct Unmarshaller<'a, 't> {
    pub(crate) iface: &'a Interface,
    pub(crate) ctx: NdrContext,
    pub(crate) config: &'a InterpreterConfig,
    pub(crate) side: Side,
    pub(crate) memory: &'a mut dyn Memory,
    pub(crate) book: &'a mut Bookkeeping,
    pub(crate) contexts: Option<&'a ContextRegistry>,
    /// Node table of the previous operation, for `DELETED_NODES` ids
    pub(crate) previous: &'a NodeTable,
    pub(crate) buf: &'a mut UnmarshalBuffer<'t>,
    pub(crate) scopes: Scopes,
    pub(crate) deferred: Vec<Deferred>,
    pub(crate) late: Vec<LateCheck>,
    pub(crate) allocated: Vec<HeapRef>,
    pub(crate) deleted: Vec<u32>,
    pub(crate) released_contexts: Vec<LocalHandle>,
    pub(crate) adopted_contexts: Vec<LocalHandle>,
}

impl<'a, 't> Unmarshaller<'a, 't> {
    /// Decode the parameter list and commit it to `params`; returns the
    /// number of allocations made
    pub(crate) fn run(&mut self, params_at: usize, params: &mut [Value]) -> Result<usize> {
        match self.unmarshal_params(params_at, params) {
            Ok(decoded) => {
                self.commit(params, decoded);
                Ok(self.allocated.len())
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn unmarshal_params(&mut self, params_at: usize, params: &[Value]) -> Result<Vec<(usize, Value)>> {
        let list = self.iface.type_vec.param_list(params_at)?;
        // Parameters decoded by this list take their correlation values from
        // the wire; the rest keep what the caller holds
        let mut values: Vec<Option<i64>> = params.iter().map(|p| self.correlation_value(p)).collect();
        for param in &list {
            if let Some(v) = values.get_mut(param.index as usize) {
                *v = None;
            }
        }
        let scope = self.scopes.open(values);
        let site = Site {
            scope,
            embedded: false,
        };

        let mut decoded = Vec::with_capacity(list.len());
        for param in &list {
            let index = param.index as usize;
            let current = params.get(index).ok_or(NdrError::ParamIndex {
                index: param.index,
                len: params.len(),
            })?;
            trace!("unmarshal param {} at stream offset {}", index, self.buf.position());
            let value = match param.desc.ty {
                TypeDesc::Pipe { element, .. } => self.unmarshal_pipe(element, current, site)?,
                TypeDesc::Context(dir) => self.unmarshal_context(dir, current)?,
                _ => self.unmarshal_desc(&param.desc, site)?,
            };
            self.flush_deferred()?;
            if let Some(v) = self.correlation_value(&value) {
                self.scopes.set(scope, index, v);
            }
            decoded.push((index, value));
        }
        self.verify_late(scope)?;
        Ok(decoded)
    }

    fn correlation_value(&self, value: &Value) -> Option<i64> {
        match value {
            Value::Ptr(Some(node)) => self.memory.load(*node).ok().and_then(Value::as_i64),
            other => other.as_i64(),
        }
    }

    fn commit(&mut self, params: &mut [Value], decoded: Vec<(usize, Value)>) {
        for id in self.deleted.drain(..) {
            if let Some(node) = self.previous.lookup_id(id) {
                trace!("freeing deleted node {} ({})", id, node);
                if let Err(err) = self.memory.free(node) {
                    warn!("could not free deleted node {}: {}", id, err);
                }
            }
        }
        if let Some(registry) = self.contexts {
            for local in self.released_contexts.drain(..) {
                registry.destroy(local);
            }
        }
        for (index, value) in decoded {
            params[index] = value;
        }
    }

    fn rollback(&mut self) {
        warn!("unmarshal failed; releasing {} allocations", self.allocated.len());
        for node in self.allocated.drain(..).rev() {
            if let Err(err) = self.memory.free(node) {
                warn!("could not free {} during rollback: {}", node, err);
            }
        }
        if let Some(registry) = self.contexts {
            for local in self.adopted_contexts.drain(..) {
                registry.destroy(local);
            }
        }
        self.deleted.clear();
        self.released_contexts.clear();
        self.book.nodes.clear();
    }

    /// Check deferred correlations whose scope is now complete
    fn verify_late(&mut self, scope: ScopeId) -> Result<()> {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.late)
            .into_iter()
            .partition(|check| check.scope == scope);
        self.late = pending;
        for check in &due {
            check.verify(&self.scopes)?;
        }
        Ok(())
    }

    pub(crate) fn unmarshal_desc(&mut self, desc: &Descriptor, site: Site) -> Result<Value> {
        self.book.descend(self.config.max_nesting_depth, desc.offset)?;
        let result = self.unmarshal_nested(desc, site);
        self.book.ascend();
        result
    }

    fn unmarshal_nested(&mut self, desc: &Descriptor, site: Site) -> Result<Value> {
        match &desc.ty {
            TypeDesc::Scalar(kind) => self.unmarshal_scalar(desc, *kind),
            TypeDesc::Struct { kind, defn, .. } => self.unmarshal_struct(*kind, *defn, None),
            TypeDesc::NestedStruct {
                align,
                offset_index,
                fields,
            } => {
                let count = self.iface.offsets.field_count(*offset_index)?;
                let scope = self.scopes.open(vec![None; count]);
                self.buf.align(usize::from(*align))?;
                let slots = self.unmarshal_fields(*offset_index, fields, count, scope, None)?;
                self.verify_late(scope)?;
                Ok(Value::Struct(slots))
            }
            TypeDesc::Array { kind, dims, defn, .. } => self.unmarshal_array(desc, *kind, *dims, *defn, site, None),
            TypeDesc::EncUnion { defn, .. } => self.unmarshal_union(*defn, None, site),
            TypeDesc::NeUnion {
                switch_field, defn, ..
            } => self.unmarshal_union(*defn, Some(*switch_field), site),
            TypeDesc::Pointer { kind, pointee, .. } => self.unmarshal_pointer(*kind, *pointee, site),
            TypeDesc::Ignore => {
                get_count(self.buf, &self.ctx)?;
                Ok(Value::Ptr(None))
            }
            TypeDesc::Xmit { routine, xmit, .. } => self.unmarshal_xmit(*routine, *xmit, site),
            TypeDesc::Pipe { .. } => Err(NdrError::PipeMisuse("pipe outside a parameter list")),
            TypeDesc::Context(dir) => self.unmarshal_context(*dir, &Value::Context(None)),
            TypeDesc::Align(n) => {
                self.buf.align(usize::from(*n))?;
                Ok(Value::Void)
            }
            TypeDesc::DeletedNodes => self.unmarshal_deleted_nodes(),
            TypeDesc::Void => Ok(Value::Void),
            TypeDesc::Unsupported(op) => Err(NdrError::Unsupported(op.byte())),
        }
    }

    fn unmarshal_scalar(&mut self, desc: &Descriptor, kind: ScalarKind) -> Result<Value> {
        if let Some((lower, upper)) = desc.modifiers.range {
            self.book.range = BoundPair::new(kind.normalize(lower), kind.normalize(upper));
        }
        let value = get_scalar(self.buf, &self.ctx, kind)?;
        match value.as_i64() {
            Some(v) => self.book.range.check_and_reset(v)?,
            None => self.book.range = BoundPair::UNSET,
        }
        Ok(value)
    }

    /// Unmarshal a struct; `preset` carries the max_counts of its trailing
    /// array when an enclosing struct already read them.
    fn unmarshal_struct(&mut self, kind: StructKind, defn_at: usize, preset: Option<Dims<u64>>) -> Result<Value> {
        let defn = self.iface.type_vec.struct_defn(defn_at)?;
        let count = self.iface.offsets.field_count(defn.offset_index)?;
        let scope = self.scopes.open(vec![None; count]);

        let preset = match preset {
            Some(counts) => Some(counts),
            None if kind != StructKind::Fixed => {
                let (dims, v1) = self.hoisted_array(&defn, defn_at)?;
                Some(self.get_conformance(dims, kind == StructKind::V1Conformant || v1)?)
            }
            None => None,
        };

        self.buf.align(usize::from(defn.align))?;
        let slots = self.unmarshal_fields(defn.offset_index, &defn.fields, count, scope, preset)?;
        self.verify_late(scope)?;
        Ok(Value::Struct(slots))
    }

    /// Dimension count and `[v1_array]` flag of the conformant array that
    /// ends a struct, found through any conformant structs that end it
    fn hoisted_array(&self, defn: &StructDefn, defn_at: usize) -> Result<(u8, bool)> {
        let conf_at = defn.conf_array.ok_or(NdrError::InvalidDescriptor {
            offset: defn_at,
            reason: "conformant struct without a conformant array",
        })?;
        let mut level = defn.clone();
        for _ in 0..self.config.max_nesting_depth {
            let tail = conformant_tail(&level.fields, conf_at).ok_or(NdrError::InvalidDescriptor {
                offset: level.offset,
                reason: "conformant array is not the last field",
            })?;
            let inner_at = match tail {
                Tail::Array { desc, .. } => {
                    let TypeDesc::Array { dims, .. } = desc.ty else {
                        return Err(NdrError::InvalidDescriptor {
                            offset: desc.offset,
                            reason: "expected an array descriptor",
                        });
                    };
                    return Ok((dims, desc.modifiers.is_v1()));
                }
                Tail::Struct { defn, .. } => defn,
            };
            level = self.iface.type_vec.struct_defn(inner_at)?;
        }
        Err(NdrError::NestingTooDeep {
            limit: self.config.max_nesting_depth,
            offset: defn_at,
        })
    }

    fn unmarshal_fields(
        &mut self,
        offset_index: u32,
        fields: &[Descriptor],
        count: usize,
        scope: ScopeId,
        mut preset: Option<Dims<u64>>,
    ) -> Result<Vec<Value>> {
        let site = Site {
            scope,
            embedded: true,
        };
        let last = fields.iter().filter(|f| f.is_field()).count();
        let mut slots = vec![Value::Void; count];
        let mut index = 0;
        for field in fields {
            if !field.is_field() {
                self.unmarshal_desc(field, site)?;
                continue;
            }
            let value = match (&field.ty, preset.is_some() && index + 1 == last) {
                (TypeDesc::Array { kind, dims, defn, .. }, true) if kind.is_conformant() => {
                    self.unmarshal_array(field, *kind, *dims, *defn, site, preset.take())?
                }
                (TypeDesc::Struct { kind, defn, .. }, true) if *kind != StructKind::Fixed => {
                    self.unmarshal_struct(*kind, *defn, preset.take())?
                }
                _ => self.unmarshal_desc(field, site)?,
            };
            if let Some(v) = value.as_i64() {
                self.scopes.set(scope, index, v);
            }
            let slot = self.iface.offsets.slot(offset_index, index)?;
            *slots.get_mut(slot).ok_or(NdrError::InvalidDescriptor {
                offset: offset_index as usize,
                reason: "offset vector slot beyond field count",
            })? = value;
            index += 1;
        }
        Ok(slots)
    }

    fn allocate_node(&mut self) -> Result<HeapRef> {
        let node = self.memory.allocate(Value::Void)?;
        self.allocated.push(node);
        Ok(node)
    }

    fn unmarshal_pointer(&mut self, kind: PtrKind, pointee: usize, site: Site) -> Result<Value> {
        if kind == PtrKind::Ref {
            if site.embedded {
                get_count(self.buf, &self.ctx)?;
            }
            let node = self.allocate_node()?;
            self.place_pointee(node, pointee, site)?;
            return Ok(Value::Ptr(Some(node)));
        }
        let id = get_count(self.buf, &self.ctx)?;
        if id == 0 {
            return Ok(Value::Ptr(None));
        }
        if let Some(node) = self.book.nodes.lookup_id(id) {
            trace!("node {} already received as {}", id, node);
            return Ok(Value::Ptr(Some(node)));
        }
        let node = self.allocate_node()?;
        self.book.nodes.register(id, node)?;
        self.place_pointee(node, pointee, site)?;
        Ok(Value::Ptr(Some(node)))
    }

    /// Read a pointee now, or defer it when its pointer is embedded
    fn place_pointee(&mut self, node: HeapRef, pointee: usize, site: Site) -> Result<()> {
        if site.embedded {
            trace!("deferring pointee {}", node);
            self.deferred.push(Deferred {
                node,
                pointee,
                scope: site.scope,
            });
            return Ok(());
        }
        self.fill_pointee(node, pointee, site.scope)
    }

    fn fill_pointee(&mut self, node: HeapRef, pointee: usize, scope: ScopeId) -> Result<()> {
        let desc = self.iface.type_vec.stream(pointee)?;
        let value = self.unmarshal_desc(
            &desc,
            Site {
                scope,
                embedded: false,
            },
        )?;
        self.memory.store(node, value)
    }

    /// Read every pending pointee, each followed by its own
    fn flush_deferred(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.deferred);
        let mut stack = vec![batch.into_iter()];
        while let Some(frame) = stack.last_mut() {
            let Some(item) = frame.next() else {
                stack.pop();
                continue;
            };
            self.fill_pointee(item.node, item.pointee, item.scope)?;
            let nested = std::mem::take(&mut self.deferred);
            if !nested.is_empty() {
                stack.push(nested.into_iter());
            }
        }
        Ok(())
    }

    fn unmarshal_deleted_nodes(&mut self) -> Result<Value> {
        let count = u64::from(get_count(self.buf, &self.ctx)?);
        if count > self.config.max_array_elements {
            return Err(NdrError::AllocationLimitExceeded {
                requested: count,
                limit: self.config.max_array_elements,
            });
        }
        let mut ids = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let id = get_count(self.buf, &self.ctx)?;
            if self.previous.lookup_id(id).is_none() {
                return Err(NdrError::UnknownNode(id));
            }
            self.deleted.push(id);
            ids.push(Value::ULong(id));
        }
        trace!("received {} deleted nodes", count);
        Ok(Value::Array(ids))
    }

    /// Host value for an element the wire did not carry
    pub(crate) fn zero_value(&self, desc: &Descriptor) -> Result<Value> {
        let tv = &self.iface.type_vec;
        Ok(match &desc.ty {
            TypeDesc::Scalar(kind) => kind.zero(),
            TypeDesc::Pointer { .. } | TypeDesc::Ignore => Value::Ptr(None),
            TypeDesc::Struct { defn, .. } => {
                let defn = tv.struct_defn(*defn)?;
                self.zero_struct(defn.offset_index, &defn.fields)?
            }
            TypeDesc::NestedStruct {
                offset_index, fields, ..
            } => self.zero_struct(*offset_index, fields)?,
            TypeDesc::Array { kind, defn, .. } if *kind == ArrayKind::Fixed || *kind == ArrayKind::Varying => {
                let defn = tv.array_defn(*defn, kind.is_varying())?;
                let mut total = 1u64;
                for pair in &defn.bounds {
                    total = total
                        .checked_mul(fixed_extent(pair)?)
                        .ok_or(NdrError::IntegerOverflow)?;
                }
                if total > self.config.max_array_elements {
                    return Err(NdrError::AllocationLimitExceeded {
                        requested: total,
                        limit: self.config.max_array_elements,
                    });
                }
                let zero = self.zero_value(&defn.element)?;
                Value::Array(vec![zero; total as usize])
            }
            TypeDesc::Array { .. } => Value::Array(Vec::new()),
            TypeDesc::EncUnion { .. } | TypeDesc::NeUnion { .. } => Value::Union {
                switch: 0,
                arm: Box::new(Value::Void),
            },
            TypeDesc::Context(_) => Value::Context(None),
            _ => Value::Void,
        })
    }

    fn zero_struct(&self, offset_index: u32, fields: &[Descriptor]) -> Result<Value> {
        let count = self.iface.offsets.field_count(offset_index)?;
        let mut slots = vec![Value::Void; count];
        for (i, field) in fields.iter().filter(|f| f.is_field()).enumerate() {
            let slot = self.iface.offsets.slot(offset_index, i)?;
            if let Some(s) = slots.get_mut(slot) {
                *s = self.zero_value(field)?;
            }
        }
        Ok(Value::Struct(slots))
    }
}

/// Element count of a dimension with constant bounds
fn fixed_extent(pair: &BoundPairRecord) -> Result<u64> {
    if pair.lower.kind != bound::FIXED || pair.upper.kind != bound::FIXED {
        return Err(NdrError::InvalidDescriptor {
            offset: 0,
            reason: "non-conformant array with correlated bounds",
        });
    }
    crate::correlation::extent_from_bounds(
        pair,
        i64::from(pair.lower.value as i32),
        i64::from(pair.upper.value as i32),
    )
}
