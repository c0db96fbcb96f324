//! NDR arrays
//!
//! Array kinds and their wire representation:
//!
//! - Fixed: elements only
//! - Conformant: max_count (u32 per dimension), elements
//! - Varying: offset, actual_count (u32 each per dimension), elements
//! - Conformant varying (open): max_counts, offset/actual_count pairs, elements
//!
//! `[v1_array]` and `[v1_string]` arrays carry 16-bit counts and no offset.
//! Multi-dimensional host arrays are flat and row-major; only the
//! transmitted sub-box travels on the wire.

use tracing::trace;

use crate::config::IDL_NORMAL_DIMS;
use crate::correlation::{
    extent_from_bounds, length_from_limits, resolve, should_check, LateCheck, Resolved, ScopeId,
};
use crate::decode::Unmarshaller;
use crate::encode::{Marshaller, Site};
use crate::opcode::{bound, limit};
use crate::primitives::{get_count, get_short_count, put_count, put_short_count, ScalarKind};
use crate::strings;
use crate::type_vec::{ArrayDefn, ArrayKind, BoundRecord, Descriptor, Modifiers, TypeDesc};
use crate::{NdrError, Result, Value};

/// Per-dimension storage that stays inline for the usual dimensionality
#[derive(Debug, Clone)]
pub enum Dims<T: Copy + Default> {
    Inline { len: usize, items: [T; IDL_NORMAL_DIMS] },
    Heap(Vec<T>),
}

impl<T: Copy + Default> Dims<T> {
    pub fn with_dims(n: usize) -> Self {
        if n <= IDL_NORMAL_DIMS {
            Dims::Inline {
                len: 0,
                items: [T::default(); IDL_NORMAL_DIMS],
            }
        } else {
            Dims::Heap(Vec::with_capacity(n))
        }
    }

    pub fn push(&mut self, item: T) {
        match self {
            Dims::Inline { len, items } if *len < IDL_NORMAL_DIMS => {
                items[*len] = item;
                *len += 1;
            }
            Dims::Inline { len, items } => {
                let mut spilled = items[..*len].to_vec();
                spilled.push(item);
                *self = Dims::Heap(spilled);
            }
            Dims::Heap(v) => v.push(item),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            Dims::Inline { len, items } => &items[..*len],
            Dims::Heap(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }
}

impl<T: Copy + Default> std::ops::Index<usize> for Dims<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

/// Resolved shape of one dimension
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimShape {
    pub lower: i64,
    /// Conformance: allocated element count
    pub extent: u64,
    /// Variance: first transmitted index and count
    pub first: u64,
    pub length: u64,
}

/// Resolved shape of a whole array
#[derive(Debug, Clone)]
pub struct ArrayShape {
    pub dims: Dims<DimShape>,
}

impl ArrayShape {
    fn extents(&self) -> impl Iterator<Item = u64> + '_ {
        self.dims.as_slice().iter().map(|d| d.extent)
    }

    /// Elements in the host array
    pub fn total(&self) -> Result<u64> {
        self.extents()
            .try_fold(1u64, |acc, e| acc.checked_mul(e))
            .ok_or(NdrError::IntegerOverflow)
    }

    /// Elements on the wire
    pub fn transmitted(&self) -> Result<u64> {
        self.dims
            .as_slice()
            .iter()
            .try_fold(1u64, |acc, d| acc.checked_mul(d.length))
            .ok_or(NdrError::IntegerOverflow)
    }

    /// Whether every element is transmitted
    pub fn is_full(&self) -> bool {
        self.dims
            .as_slice()
            .iter()
            .all(|d| d.first == 0 && d.length == d.extent)
    }

    /// Transmitted elements as one contiguous host range, when they are
    fn contiguous(&self) -> Option<(usize, usize)> {
        let dims = self.dims.as_slice();
        if self.is_full() {
            let total = usize::try_from(self.total().ok()?).ok()?;
            return Some((0, total));
        }
        match dims {
            [d] => Some((usize::try_from(d.first).ok()?, usize::try_from(d.length).ok()?)),
            _ => None,
        }
    }

    /// Row-major host indices of the transmitted elements, in wire order
    pub fn indices(&self) -> Indices<'_> {
        let dims = self.dims.as_slice();
        let empty = dims.iter().any(|d| d.length == 0);
        Indices {
            dims,
            counter: dims.iter().map(|d| d.first).collect(),
            done: empty,
        }
    }
}

/// Odometer over the transmitted sub-box of a multi-dimensional array
#[derive(Debug)]
pub struct Indices<'a> {
    dims: &'a [DimShape],
    counter: Vec<u64>,
    done: bool,
}

impl Iterator for Indices<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.done {
            return None;
        }
        let flat = self
            .dims
            .iter()
            .zip(&self.counter)
            .fold(0u64, |acc, (d, &i)| acc * d.extent + i);
        // Advance the last dimension fastest
        let mut d = self.dims.len();
        loop {
            if d == 0 {
                self.done = true;
                break;
            }
            d -= 1;
            let dim = &self.dims[d];
            self.counter[d] += 1;
            if self.counter[d] < dim.first + dim.length {
                break;
            }
            self.counter[d] = dim.first;
        }
        usize::try_from(flat).ok()
    }
}

fn to_u64(v: i64, lower: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| NdrError::InvalidBound { lower, upper: v })
}

fn check_dims(desc_dims: u8, defn: &ArrayDefn) -> Result<()> {
    if desc_dims != defn.dims {
        return Err(NdrError::DimensionalityMismatch {
            declared: desc_dims,
            recorded: defn.dims,
        });
    }
    Ok(())
}

fn check_fixed(kind: ArrayKind, defn: &ArrayDefn) -> Result<()> {
    if kind.is_conformant() {
        return Ok(());
    }
    let constant = defn
        .bounds
        .iter()
        .all(|p| p.lower.kind == bound::FIXED && p.upper.kind == bound::FIXED);
    if !constant {
        return Err(NdrError::InvalidDescriptor {
            offset: defn.offset,
            reason: "non-conformant array with correlated bounds",
        });
    }
    Ok(())
}

fn array_elems(value: &Value) -> Result<&[Value]> {
    match value {
        Value::Array(elems) => Ok(elems),
        other => Err(NdrError::type_mismatch("array", other)),
    }
}

/// Byte-sized scalar element eligible for block copy
fn byte_element(element: &Descriptor) -> Option<ScalarKind> {
    match element.ty {
        TypeDesc::Scalar(kind @ (ScalarKind::Byte | ScalarKind::USmall | ScalarKind::Char))
            if element.modifiers == Modifiers::default() =>
        {
            Some(kind)
        }
        _ => None,
    }
}

impl<'a, 't> Marshaller<'a, 't> {
    /// Value of a bound record on the marshalling side
    fn bound_value(&self, record: &BoundRecord, scope: ScopeId) -> Result<i64> {
        match resolve(record, &self.scopes, scope)? {
            Resolved::Value(v) => Ok(v),
            Resolved::FromString | Resolved::Late { .. } | Resolved::Unchecked => {
                Err(NdrError::CorrelationUnavailable(record.value))
            }
        }
    }

    /// Shape of the array described by `desc` holding `value`
    pub(crate) fn array_shape(
        &self,
        desc: &Descriptor,
        defn_at: usize,
        value: &Value,
        scope: ScopeId,
    ) -> Result<ArrayShape> {
        let TypeDesc::Array { kind, dims, .. } = desc.ty else {
            return Err(NdrError::InvalidDescriptor {
                offset: desc.offset,
                reason: "expected an array descriptor",
            });
        };
        let defn = self.iface.type_vec.array_defn(defn_at, kind.is_varying())?;
        check_dims(dims, &defn)?;
        self.shape_for(&defn, kind, &desc.modifiers, array_elems(value)?, scope)
    }

    fn shape_for(
        &self,
        defn: &ArrayDefn,
        kind: ArrayKind,
        modifiers: &Modifiers,
        elems: &[Value],
        scope: ScopeId,
    ) -> Result<ArrayShape> {
        check_fixed(kind, defn)?;
        let string_count = if modifiers.is_string() {
            strings::element_kind(defn)?;
            Some(strings::transmit_count(elems) as u64)
        } else {
            None
        };
        let from_string = || {
            string_count.ok_or(NdrError::InvalidDescriptor {
                offset: defn.offset,
                reason: "string bound on a non-string array",
            })
        };

        let mut dims = Dims::with_dims(defn.bounds.len());
        for (d, pair) in defn.bounds.iter().enumerate() {
            let lower = self.bound_value(&pair.lower, scope)?;
            let extent = if pair.upper.kind == bound::STRING {
                from_string()?
            } else {
                let upper = self.bound_value(&pair.upper, scope)?;
                extent_from_bounds(pair, lower, upper)?
            };
            let (first, length) = match defn.limits.get(d).filter(|_| kind.is_varying()) {
                None => (0, extent),
                Some(limits) => {
                    let first = match limits.lower.kind {
                        limit::STRING => 0,
                        _ => to_u64(self.bound_value(&limits.lower, scope)?, lower)?,
                    };
                    let length = match limits.upper.kind {
                        limit::STRING => from_string()?,
                        limit::UPPER_CONF => extent.checked_sub(first).ok_or(NdrError::ConformanceMismatch {
                            max_count: extent,
                            offset: first,
                            actual_count: 0,
                        })?,
                        _ => {
                            let upper = self.bound_value(&limits.upper, scope)?;
                            length_from_limits(limits, first as i64, upper, extent)?
                        }
                    };
                    (first, length)
                }
            };
            if first.checked_add(length).map_or(true, |end| end > extent) {
                return Err(NdrError::ConformanceMismatch {
                    max_count: extent,
                    offset: first,
                    actual_count: length,
                });
            }
            dims.push(DimShape {
                lower,
                extent,
                first,
                length,
            });
        }

        let shape = ArrayShape { dims };
        if string_count.is_none() {
            let total = usize::try_from(shape.total()?).map_err(|_| NdrError::IntegerOverflow)?;
            if elems.len() < total {
                return Err(NdrError::ArraySizeMismatch {
                    expected: total,
                    got: elems.len(),
                });
            }
        }
        Ok(shape)
    }

    /// Write the max_count of every dimension
    pub(crate) fn put_conformance(&mut self, shape: &ArrayShape, v1: bool) -> Result<()> {
        for dim in shape.dims.as_slice() {
            if v1 {
                let count = u16::try_from(dim.extent).map_err(|_| NdrError::IntegerOverflow)?;
                put_short_count(self.buf, &self.ctx, count)?;
            } else {
                let count = u32::try_from(dim.extent).map_err(|_| NdrError::IntegerOverflow)?;
                put_count(self.buf, &self.ctx, count)?;
            }
        }
        Ok(())
    }

    fn put_variance(&mut self, shape: &ArrayShape, v1: bool) -> Result<()> {
        for dim in shape.dims.as_slice() {
            if v1 {
                if dim.first != 0 {
                    return Err(NdrError::ConformanceMismatch {
                        max_count: dim.extent,
                        offset: dim.first,
                        actual_count: dim.length,
                    });
                }
                let length = u16::try_from(dim.length).map_err(|_| NdrError::IntegerOverflow)?;
                put_short_count(self.buf, &self.ctx, length)?;
            } else {
                let first = u32::try_from(dim.first).map_err(|_| NdrError::IntegerOverflow)?;
                let length = u32::try_from(dim.length).map_err(|_| NdrError::IntegerOverflow)?;
                put_count(self.buf, &self.ctx, first)?;
                put_count(self.buf, &self.ctx, length)?;
            }
        }
        Ok(())
    }

    /// Marshal an array; `preset` carries a shape whose conformance was
    /// already written ahead of the enclosing struct.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn marshal_array(
        &mut self,
        desc: &Descriptor,
        kind: ArrayKind,
        dims: u8,
        defn_at: usize,
        value: &Value,
        site: Site,
        preset: Option<ArrayShape>,
    ) -> Result<()> {
        let defn = self.iface.type_vec.array_defn(defn_at, kind.is_varying())?;
        check_dims(dims, &defn)?;
        let elems = array_elems(value)?;
        let v1 = desc.modifiers.is_v1();
        let shape = match preset {
            Some(shape) => shape,
            None => {
                let shape = self.shape_for(&defn, kind, &desc.modifiers, elems, site.scope)?;
                if kind.is_conformant() {
                    self.put_conformance(&shape, v1)?;
                }
                shape
            }
        };
        if kind.is_varying() {
            self.put_variance(&shape, v1)?;
        }
        trace!("marshal array at {}: {:?}", defn_at, shape.dims.as_slice());

        let element = &*defn.element;
        let inner = site.embedded();
        if desc.modifiers.is_string() {
            let kind = strings::element_kind(&defn)?;
            let text = strings::text_len(elems);
            if !self.put_byte_run(element, &elems[..text])? {
                for elem in &elems[..text] {
                    self.marshal_desc(element, elem, inner)?;
                }
            }
            return self.marshal_desc(element, &kind.zero(), inner);
        }
        if let Some((start, count)) = shape.contiguous() {
            let run = elems.get(start..start + count).ok_or(NdrError::ArraySizeMismatch {
                expected: start + count,
                got: elems.len(),
            })?;
            if self.put_byte_run(element, run)? {
                return Ok(());
            }
            for elem in run {
                self.marshal_desc(element, elem, inner)?;
            }
            return Ok(());
        }
        for flat in shape.indices() {
            let elem = elems.get(flat).ok_or(NdrError::ArraySizeMismatch {
                expected: flat + 1,
                got: elems.len(),
            })?;
            self.marshal_desc(element, elem, inner)?;
        }
        Ok(())
    }

    /// Block-copy a run of byte-sized scalars; false when the run does not
    /// qualify and must go element by element
    fn put_byte_run(&mut self, element: &Descriptor, run: &[Value]) -> Result<bool> {
        let Some(kind) = byte_element(element) else {
            return Ok(false);
        };
        let mut bytes = Vec::with_capacity(run.len());
        for elem in run {
            match (kind, elem) {
                (ScalarKind::Byte, Value::Byte(b))
                | (ScalarKind::USmall, Value::USmall(b))
                | (ScalarKind::Char, Value::Char(b)) => bytes.push(*b),
                _ => return Ok(false),
            }
        }
        if kind == ScalarKind::Char {
            self.ctx.check_char_rep()?;
        }
        self.buf.put_bytes(&bytes)?;
        Ok(true)
    }
}

impl<'a, 't> Unmarshaller<'a, 't> {
    /// Read the max_count of `dims` dimensions
    pub(crate) fn get_conformance(&mut self, dims: u8, v1: bool) -> Result<Dims<u64>> {
        let mut counts = Dims::with_dims(usize::from(dims));
        for _ in 0..dims {
            let count = if v1 {
                u64::from(get_short_count(self.buf, &self.ctx)?)
            } else {
                u64::from(get_count(self.buf, &self.ctx)?)
            };
            counts.push(count);
        }
        Ok(counts)
    }

    /// Check a wire-implied bound against its correlated field, deferring
    /// the check when the field has not been unmarshalled yet
    pub(crate) fn check_correlation(&mut self, record: &BoundRecord, wire: i64, scope: ScopeId) -> Result<()> {
        if !should_check(record) {
            return Ok(());
        }
        match resolve(record, &self.scopes, scope)? {
            Resolved::Value(expected) if expected != wire => Err(NdrError::CorrelationMismatch { expected, wire }),
            Resolved::Late { .. } => {
                self.late.push(LateCheck {
                    scope,
                    record: *record,
                    wire,
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Unmarshal an array; `preset` carries max_counts read ahead of the
    /// enclosing struct.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn unmarshal_array(
        &mut self,
        desc: &Descriptor,
        kind: ArrayKind,
        dims: u8,
        defn_at: usize,
        site: Site,
        preset: Option<Dims<u64>>,
    ) -> Result<Value> {
        let defn = self.iface.type_vec.array_defn(defn_at, kind.is_varying())?;
        check_dims(dims, &defn)?;
        check_fixed(kind, &defn)?;
        let v1 = desc.modifiers.is_v1();
        let is_string = desc.modifiers.is_string();
        if is_string {
            strings::element_kind(&defn)?;
        }
        let conformance = match (kind.is_conformant(), preset) {
            (false, _) => None,
            (true, Some(counts)) => Some(counts),
            (true, None) => Some(self.get_conformance(defn.dims, v1)?),
        };

        let mut shape = ArrayShape {
            dims: Dims::with_dims(defn.bounds.len()),
        };
        for (d, pair) in defn.bounds.iter().enumerate() {
            let lower = match resolve(&pair.lower, &self.scopes, site.scope)? {
                Resolved::Value(v) => v,
                _ => 0,
            };
            let extent = match &conformance {
                Some(counts) => {
                    let z = counts[d];
                    let wire_upper = match pair.upper.kind {
                        bound::SIZE_IS => z as i64,
                        _ => lower.saturating_add(z as i64 - 1),
                    };
                    self.check_correlation(&pair.upper, wire_upper, site.scope)?;
                    z
                }
                None => match resolve(&pair.upper, &self.scopes, site.scope)? {
                    Resolved::Value(upper) => extent_from_bounds(pair, lower, upper)?,
                    _ => {
                        return Err(NdrError::InvalidDescriptor {
                            offset: defn.offset,
                            reason: "fixed array without a constant upper bound",
                        })
                    }
                },
            };
            shape.dims.push(DimShape {
                lower,
                extent,
                first: 0,
                length: extent,
            });
        }

        let total = shape.total()?;
        if total > self.config.max_array_elements {
            return Err(NdrError::AllocationLimitExceeded {
                requested: total,
                limit: self.config.max_array_elements,
            });
        }

        if kind.is_varying() {
            let mut varied = Dims::with_dims(shape.dims.len());
            for (d, dim) in shape.dims.as_slice().iter().enumerate() {
                let (first, length) = if v1 {
                    (0, u64::from(get_short_count(self.buf, &self.ctx)?))
                } else {
                    let first = u64::from(get_count(self.buf, &self.ctx)?);
                    (first, u64::from(get_count(self.buf, &self.ctx)?))
                };
                if first + length > dim.extent {
                    return Err(NdrError::ConformanceMismatch {
                        max_count: dim.extent,
                        offset: first,
                        actual_count: length,
                    });
                }
                if let Some(limits) = defn.limits.get(d) {
                    if limits.lower.kind == limit::FIRST_IS {
                        self.check_correlation(&limits.lower, first as i64, site.scope)?;
                    }
                    match limits.upper.kind {
                        limit::LENGTH_IS => self.check_correlation(&limits.upper, length as i64, site.scope)?,
                        limit::LAST_IS => {
                            self.check_correlation(&limits.upper, (first + length) as i64 - 1, site.scope)?
                        }
                        _ => {}
                    }
                }
                varied.push(DimShape {
                    first,
                    length,
                    ..*dim
                });
            }
            shape.dims = varied;
        }
        trace!("unmarshal array at {}: {:?}", defn_at, shape.dims.as_slice());

        let element = &*defn.element;
        let inner = site.embedded();
        if is_string {
            let dim = shape.dims[0];
            if dim.first != 0 {
                return Err(NdrError::InvalidString(format!("string transmitted at offset {}", dim.first)));
            }
            let mut elems = self.unmarshal_run(element, dim.length, inner)?;
            strings::strip_terminator(&mut elems)?;
            return Ok(Value::Array(elems));
        }
        if shape.is_full() {
            return Ok(Value::Array(self.unmarshal_run(element, total, inner)?));
        }
        // Untransmitted elements cost no wire bytes, so cap how many are made up
        let filled = total.saturating_sub(shape.transmitted()?);
        if filled > self.config.max_zero_fill {
            return Err(NdrError::AllocationLimitExceeded {
                requested: filled,
                limit: self.config.max_zero_fill,
            });
        }
        let total = usize::try_from(total).map_err(|_| NdrError::IntegerOverflow)?;
        let zero = self.zero_value(element)?;
        let mut elems = vec![zero; total];
        for flat in shape.indices() {
            let elem = self.unmarshal_desc(element, inner)?;
            if let Some(slot) = elems.get_mut(flat) {
                *slot = elem;
            }
        }
        Ok(Value::Array(elems))
    }

    /// `count` consecutive elements, block-copied when they are bytes
    fn unmarshal_run(&mut self, element: &Descriptor, count: u64, site: Site) -> Result<Vec<Value>> {
        if count > self.config.max_array_elements {
            return Err(NdrError::AllocationLimitExceeded {
                requested: count,
                limit: self.config.max_array_elements,
            });
        }
        let count = usize::try_from(count).map_err(|_| NdrError::IntegerOverflow)?;
        if let Some(kind) = byte_element(element) {
            if kind == ScalarKind::Char {
                self.ctx.check_char_rep()?;
            }
            let bytes = self.buf.get_bytes(count)?;
            let wrap = match kind {
                ScalarKind::Byte => Value::Byte,
                ScalarKind::USmall => Value::USmall,
                _ => Value::Char,
            };
            return Ok(bytes.into_iter().map(wrap).collect());
        }
        let mut elems = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            elems.push(self.unmarshal_desc(element, site)?);
        }
        Ok(elems)
    }
}
