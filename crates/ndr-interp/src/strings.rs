//! NDR strings
//!
//! A string is a one-dimensional varying (or conformant varying) array of
//! characters whose transmitted length includes a zero terminator:
//!
//! - `[string] char *` : max_count, offset (0), actual_count, bytes
//! - `[string] wchar_t *` : the same with 16-bit elements
//! - `[v1_string] char[N]` : 16-bit actual_count, bytes
//!
//! Host values carry the text only; the terminator is added when
//! marshalling and removed when unmarshalling.

use crate::opcode::{bound, limit};
use crate::primitives::ScalarKind;
use crate::type_vec::{ArrayDefn, TypeDesc};
use crate::{NdrError, Result, Value};

fn is_terminator(value: &Value) -> bool {
    value.as_i64() == Some(0)
}

/// Element kind of a string array, checked against the declared char size
pub(crate) fn element_kind(defn: &ArrayDefn) -> Result<ScalarKind> {
    if defn.dims != 1 {
        return Err(NdrError::InvalidDescriptor {
            offset: defn.offset,
            reason: "string arrays have exactly one dimension",
        });
    }
    let kind = match defn.element.ty {
        TypeDesc::Scalar(kind) if kind.is_integral() => kind,
        _ => {
            return Err(NdrError::InvalidDescriptor {
                offset: defn.offset,
                reason: "string elements must be integral scalars",
            })
        }
    };
    let record = defn
        .limits
        .first()
        .map(|pair| pair.upper)
        .filter(|r| r.kind == limit::STRING)
        .or_else(|| defn.bounds.first().map(|pair| pair.upper).filter(|r| r.kind == bound::STRING));
    if let Some(record) = record {
        let char_size = usize::from(record.field_type);
        if char_size != 0 && char_size != kind.size() {
            return Err(NdrError::InvalidDescriptor {
                offset: defn.offset,
                reason: "string char size disagrees with element type",
            });
        }
    }
    Ok(kind)
}

/// Number of text elements before the first terminator
pub fn text_len(elems: &[Value]) -> usize {
    elems.iter().position(is_terminator).unwrap_or(elems.len())
}

/// Elements transmitted for `elems`: the text plus one terminator
pub fn transmit_count(elems: &[Value]) -> usize {
    text_len(elems) + 1
}

/// Remove the terminator from a received string
pub(crate) fn strip_terminator(elems: &mut Vec<Value>) -> Result<()> {
    match elems.last() {
        Some(last) if is_terminator(last) => {
            elems.pop();
            Ok(())
        }
        Some(_) => Err(NdrError::InvalidString("missing terminator".into())),
        None => Err(NdrError::InvalidString("zero-length string".into())),
    }
}
