//! Correlation and bounds engine
//!
//! Arrays and unions may be governed by a sibling field (`size_is`,
//! `length_is`, `switch_is`, ...). The fields of each struct instance and of
//! each parameter list form a scope; a bound record names a field of the
//! scope it was declared in.

use crate::opcode::{bound, cf, fc, limit};
use crate::type_vec::{BoundPairRecord, BoundRecord};
use crate::{NdrError, Result};

/// Value range pair; `(0, -1)` means unset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPair {
    pub lower: i64,
    pub upper: i64,
}

impl BoundPair {
    pub const UNSET: BoundPair = BoundPair { lower: 0, upper: -1 };

    pub fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    /// Check `value` and return to the unset state either way
    pub fn check_and_reset(&mut self, value: i64) -> Result<()> {
        let pair = std::mem::replace(self, Self::UNSET);
        if pair.is_unset() {
            return Ok(());
        }
        if value < pair.lower || value > pair.upper {
            return Err(NdrError::RangeViolation {
                value,
                lower: pair.lower,
                upper: pair.upper,
            });
        }
        Ok(())
    }
}

impl Default for BoundPair {
    fn default() -> Self {
        Self::UNSET
    }
}

/// Apply a field conversion operator to a correlated value
pub fn apply_fc(op: u8, value: i64) -> Result<i64> {
    let aligned = |n: i64| {
        value
            .checked_add(n - 1)
            .map(|v| v & !(n - 1))
            .ok_or(NdrError::IntegerOverflow)
    };
    let mul = |n: i64| value.checked_mul(n).ok_or(NdrError::IntegerOverflow);
    match op {
        fc::NONE | fc::FIXED => Ok(value),
        fc::DIV_2 => Ok(value / 2),
        fc::DIV_4 => Ok(value / 4),
        fc::DIV_8 => Ok(value / 8),
        fc::MUL_2 => mul(2),
        fc::MUL_4 => mul(4),
        fc::MUL_8 => mul(8),
        fc::ADD_1 => value.checked_add(1).ok_or(NdrError::IntegerOverflow),
        fc::SUB_1 => value.checked_sub(1).ok_or(NdrError::IntegerOverflow),
        fc::ALIGN_2 => aligned(2),
        fc::ALIGN_4 => aligned(4),
        fc::ALIGN_8 => aligned(8),
        other => Err(NdrError::UnsupportedFieldConversion(other)),
    }
}

/// Handle to one correlation scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);

/// Per-operation arena of correlation scopes
#[derive(Debug, Default)]
pub struct Scopes {
    scopes: Vec<Vec<Option<i64>>>,
}

impl Scopes {
    pub fn open(&mut self, values: Vec<Option<i64>>) -> ScopeId {
        self.scopes.push(values);
        ScopeId(self.scopes.len() - 1)
    }

    pub fn get(&self, scope: ScopeId, field: u32) -> Option<i64> {
        self.scopes
            .get(scope.0)
            .and_then(|s| s.get(field as usize))
            .copied()
            .flatten()
    }

    pub fn set(&mut self, scope: ScopeId, field: usize, value: i64) {
        if let Some(s) = self.scopes.get_mut(scope.0) {
            if field >= s.len() {
                s.resize(field + 1, None);
            }
            s[field] = Some(value);
        }
    }
}

/// Outcome of resolving one bound record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Known value (fixed, or correlated field available)
    Value(i64),
    /// Computed from string content, not from a field
    FromString,
    /// Correlated field not yet seen; check after the scope completes
    Late { field: u32 },
    /// Correlation not subject to checking
    Unchecked,
}

/// Resolve a record against its scope.
///
/// Fixed records yield their value. Correlated records apply the field
/// conversion to the scope value; an `EARLY` record whose field is missing
/// is a bounds fault.
pub fn resolve(record: &BoundRecord, scopes: &Scopes, scope: ScopeId) -> Result<Resolved> {
    // bound::STRING and limit::STRING share a code
    if record.kind == bound::STRING {
        return Ok(Resolved::FromString);
    }
    if record.kind == bound::FIXED {
        return Ok(Resolved::Value(i64::from(record.value as i32)));
    }
    if record.kind == limit::UPPER_CONF || record.has_flag(cf::IS_IID_IS) {
        return Ok(Resolved::Unchecked);
    }
    match scopes.get(scope, record.value) {
        Some(v) => Ok(Resolved::Value(apply_fc(record.fc, v)?)),
        None if record.has_flag(cf::EARLY) => Err(NdrError::CorrelationUnavailable(record.value)),
        None => Ok(Resolved::Late { field: record.value }),
    }
}

/// Whether a wire value should be checked against its correlated field
pub fn should_check(record: &BoundRecord) -> bool {
    !matches!(record.kind, bound::FIXED | bound::STRING | limit::UPPER_CONF)
        && !record.has_flag(cf::DONT_CHECK)
        && !record.has_flag(cf::IS_IID_IS)
}

/// A wire bound whose controlling field had not been seen yet
#[derive(Debug, Clone, Copy)]
pub struct LateCheck {
    pub scope: ScopeId,
    pub record: BoundRecord,
    pub wire: i64,
}

impl LateCheck {
    /// Verify the wire value once the scope is complete
    pub fn verify(&self, scopes: &Scopes) -> Result<()> {
        match scopes.get(self.scope, self.record.value) {
            Some(v) => {
                let expected = apply_fc(self.record.fc, v)?;
                if expected != self.wire {
                    return Err(NdrError::CorrelationMismatch {
                        expected,
                        wire: self.wire,
                    });
                }
                Ok(())
            }
            None => Err(NdrError::CorrelationUnavailable(self.record.value)),
        }
    }
}

/// Conformance (element count) of one dimension given resolved bounds
pub fn extent_from_bounds(pair: &BoundPairRecord, lower: i64, upper: i64) -> Result<u64> {
    if pair.upper.kind == bound::SIZE_IS {
        // size_is gives the count directly
        return u64::try_from(upper).map_err(|_| NdrError::InvalidBound { lower, upper });
    }
    let count = upper
        .checked_sub(lower)
        .and_then(|d| d.checked_add(1))
        .ok_or(NdrError::IntegerOverflow)?;
    if count < 0 {
        return Err(NdrError::InvalidBound { lower, upper });
    }
    Ok(count as u64)
}

/// Transmitted length of one dimension given its resolved limits
pub fn length_from_limits(pair: &BoundPairRecord, first: i64, upper: i64, extent: u64) -> Result<u64> {
    let length = match pair.upper.kind {
        limit::LENGTH_IS => upper,
        limit::UPPER_CONF => (extent as i64).checked_sub(first).ok_or(NdrError::IntegerOverflow)?,
        // LAST_IS and FIXED give the last transmitted index
        _ => upper
            .checked_sub(first)
            .and_then(|d| d.checked_add(1))
            .ok_or(NdrError::IntegerOverflow)?,
    };
    u64::try_from(length).map_err(|_| NdrError::InvalidBound {
        lower: first,
        upper,
    })
}
