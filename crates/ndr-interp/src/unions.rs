//! Discriminated unions
//!
//! Encapsulated and non-encapsulated unions share one wire form: the
//! discriminant, padding to the body alignment, then the selected arm.
//! A non-encapsulated union's discriminant must also agree with its
//! `switch_is` field.

use tracing::trace;

use crate::correlation::ScopeId;
use crate::decode::Unmarshaller;
use crate::encode::{Marshaller, Site};
use crate::opcode::{bound, fc};
use crate::primitives::{get_scalar, put_scalar};
use crate::type_vec::{ArmBody, BoundRecord};
use crate::{NdrError, Result, Value};

/// Correlation record tying a discriminant to its `switch_is` field
fn switch_record(field: u32) -> BoundRecord {
    BoundRecord {
        kind: bound::MAX_IS,
        flags: 0,
        field_type: 0,
        fc: fc::NONE,
        value: field,
    }
}

impl<'a, 't> Marshaller<'a, 't> {
    fn check_switch(&self, field: u32, switch: i64, scope: ScopeId) -> Result<()> {
        match self.scopes.get(scope, field) {
            Some(expected) if expected != switch => Err(NdrError::CorrelationMismatch { expected, wire: switch }),
            Some(_) => Ok(()),
            None => Err(NdrError::CorrelationUnavailable(field)),
        }
    }

    pub(crate) fn marshal_union(
        &mut self,
        defn_at: usize,
        switch_field: Option<u32>,
        value: &Value,
        site: Site,
    ) -> Result<()> {
        let defn = self.iface.type_vec.union_defn(defn_at)?;
        let (switch, arm) = match value {
            Value::Union { switch, arm } => (*switch, arm.as_ref()),
            other => return Err(NdrError::type_mismatch("union", other)),
        };
        if let Some(field) = switch_field {
            self.check_switch(field, switch, site.scope)?;
        }
        let discriminant = defn.switch_kind.from_i64(switch)?;
        put_scalar(self.buf, &self.ctx, defn.switch_kind, &discriminant)?;
        self.buf.align(usize::from(defn.body_align))?;

        match self.iface.type_vec.find_arm(&defn, switch)? {
            None if defn.optional => Ok(()),
            None => Err(NdrError::NoMatchingArm(switch)),
            Some(found) => match found.body {
                ArmBody::Stream(at) => {
                    trace!("union arm {} at {}", switch, at);
                    let desc = self.iface.type_vec.stream(at)?;
                    self.marshal_desc(&desc, arm, site.embedded())
                }
                ArmBody::Empty | ArmBody::DoesNotExist => Ok(()),
            },
        }
    }
}

impl<'a, 't> Unmarshaller<'a, 't> {
    pub(crate) fn unmarshal_union(&mut self, defn_at: usize, switch_field: Option<u32>, site: Site) -> Result<Value> {
        let defn = self.iface.type_vec.union_defn(defn_at)?;
        let switch = get_scalar(self.buf, &self.ctx, defn.switch_kind)?
            .as_i64()
            .ok_or(NdrError::InvalidDescriptor {
                offset: defn_at,
                reason: "union discriminant is not an integer",
            })?;
        if let Some(field) = switch_field {
            self.check_correlation(&switch_record(field), switch, site.scope)?;
        }
        self.buf.align(usize::from(defn.body_align))?;

        let arm = match self.iface.type_vec.find_arm(&defn, switch)? {
            None if defn.optional => Value::Void,
            None => return Err(NdrError::NoMatchingArm(switch)),
            Some(found) => match found.body {
                ArmBody::Stream(at) => {
                    trace!("union arm {} at {}", switch, at);
                    let desc = self.iface.type_vec.stream(at)?;
                    self.unmarshal_desc(&desc, site.embedded())?
                }
                ArmBody::Empty | ArmBody::DoesNotExist => Value::Void,
            },
        };
        Ok(Value::Union {
            switch,
            arm: Box::new(arm),
        })
    }
}
