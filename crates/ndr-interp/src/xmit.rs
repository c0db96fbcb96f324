//! `[transmit_as]` and `[represent_as]`
//!
//! The presented (local) type never appears on the wire. An application
//! routine converts it to the transmitted type, which the type vector
//! describes; the routine vector is indexed by the descriptor's routine
//! operand. Both attributes use the same four routines.

use std::sync::Arc;

use tracing::trace;

use crate::decode::Unmarshaller;
use crate::encode::{Marshaller, Site};
use crate::{NdrError, Result, Value};

/// Conversion routines for one presented type
pub trait TransmitAs: Send + Sync {
    /// Presented value to transmitted value
    fn to_xmit(&self, local: &Value) -> Result<Value>;

    /// Transmitted value to presented value
    fn from_xmit(&self, xmit: &Value) -> Result<Value>;

    /// Release resources held by a presented value after it was marshalled
    fn free_inst(&self, _local: &Value) {}

    /// Release a transmitted value once converted
    fn free_xmit(&self, _xmit: Value) {}
}

/// Routines of an interface, in routine-index order
pub type RoutineVector = Vec<Arc<dyn TransmitAs>>;

impl<'a, 't> Marshaller<'a, 't> {
    fn enter_xmit(&mut self) -> Result<()> {
        if self.book.xmit_level >= self.config.max_xmit_depth {
            return Err(NdrError::XmitDepthExceeded(self.config.max_xmit_depth));
        }
        self.book.xmit_level += 1;
        Ok(())
    }

    pub(crate) fn marshal_xmit(&mut self, index: u32, xmit_at: usize, value: &Value, site: Site) -> Result<()> {
        let iface = self.iface;
        let routine = iface.routine(index)?;
        let desc = iface.type_vec.stream(xmit_at)?;
        self.enter_xmit()?;
        trace!("transmit_as {} at level {}", index, self.book.xmit_level);
        let result = routine
            .to_xmit(value)
            .and_then(|wire| {
                let written = self.marshal_desc(&desc, &wire, site);
                routine.free_xmit(wire);
                written
            });
        self.book.xmit_level -= 1;
        result
    }
}

impl<'a, 't> Unmarshaller<'a, 't> {
    pub(crate) fn unmarshal_xmit(&mut self, index: u32, xmit_at: usize, site: Site) -> Result<Value> {
        let iface = self.iface;
        let routine = iface.routine(index)?;
        let desc = iface.type_vec.stream(xmit_at)?;
        if self.book.xmit_level >= self.config.max_xmit_depth {
            return Err(NdrError::XmitDepthExceeded(self.config.max_xmit_depth));
        }
        self.book.xmit_level += 1;
        let result = self.unmarshal_desc(&desc, site).and_then(|wire| {
            let local = routine.from_xmit(&wire);
            routine.free_xmit(wire);
            local
        });
        self.book.xmit_level -= 1;
        result
    }
}
