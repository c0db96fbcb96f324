//! Context handles
//!
//! A context handle travels as 20 bytes: a 32-bit attributes word and the
//! UUID the server minted for the context. The UUID's `data1`, `data2` and
//! `data3` fields follow the integer representation of the drep; `data4` is
//! raw bytes. The nil UUID denotes a null handle.
//!
//! Applications never see the UUID. They hold a `LocalHandle`, and a
//! `ContextRegistry` shared by every call on the same association maps
//! between the two.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::decode::Unmarshaller;
use crate::encode::Marshaller;
use crate::primitives::{get_count, put_count};
use crate::state::Side;
use crate::type_vec::ContextDir;
use crate::{NdrError, Result, Value};

/// Size of a context handle on the wire
pub const CONTEXT_HANDLE_SIZE: usize = 20;

/// Application-side name of a live context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalHandle(pub u64);

#[derive(Debug, Default)]
struct Registry {
    by_uuid: HashMap<Uuid, LocalHandle>,
    by_local: HashMap<LocalHandle, Uuid>,
    next: u64,
}

impl Registry {
    fn insert(&mut self, uuid: Uuid) -> LocalHandle {
        self.next += 1;
        let local = LocalHandle(self.next);
        self.by_uuid.insert(uuid, local);
        self.by_local.insert(local, uuid);
        local
    }
}

/// Thread-safe map between local handles and wire UUIDs
#[derive(Debug, Default)]
pub struct ContextRegistry {
    inner: Mutex<Registry>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server side: create a context under a fresh UUID
    pub fn create(&self) -> LocalHandle {
        let uuid = Uuid::new_v4();
        let local = self.inner.lock().insert(uuid);
        debug!("context {:?} created as {}", local, uuid);
        local
    }

    /// Client side: bind a UUID received from the server, reusing the
    /// existing binding when there is one
    pub fn adopt(&self, uuid: Uuid) -> LocalHandle {
        let mut inner = self.inner.lock();
        if let Some(&local) = inner.by_uuid.get(&uuid) {
            return local;
        }
        let local = inner.insert(uuid);
        debug!("context {} adopted as {:?}", uuid, local);
        local
    }

    pub fn token(&self, local: LocalHandle) -> Option<Uuid> {
        self.inner.lock().by_local.get(&local).copied()
    }

    pub fn resolve(&self, uuid: Uuid) -> Option<LocalHandle> {
        self.inner.lock().by_uuid.get(&uuid).copied()
    }

    /// Forget a context; false when it was not live
    pub fn destroy(&self, local: LocalHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_local.remove(&local) {
            Some(uuid) => {
                inner.by_uuid.remove(&uuid);
                debug!("context {:?} destroyed", local);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn context_value(value: &Value) -> Result<Option<LocalHandle>> {
    match value {
        Value::Context(handle) => Ok(*handle),
        other => Err(NdrError::type_mismatch("context handle", other)),
    }
}

impl<'a, 't> Marshaller<'a, 't> {
    pub(crate) fn marshal_context(&mut self, dir: ContextDir, value: &Value) -> Result<()> {
        let registry = self.contexts.ok_or(NdrError::MissingContextRegistry)?;
        let uuid = match context_value(value)? {
            None if dir == ContextDir::In => return Err(NdrError::ContextMismatch(Uuid::nil())),
            None => Uuid::nil(),
            Some(local) => registry
                .token(local)
                .ok_or(NdrError::ContextMismatch(Uuid::nil()))?,
        };
        trace!("marshal context {} ({:?})", uuid, dir);
        let (data1, data2, data3, data4) = uuid.as_fields();
        let ctx = self.ctx;
        put_count(self.buf, &ctx, 0)?;
        put_count(self.buf, &ctx, data1)?;
        self.buf.write_with(2, |b| ctx.put_u16(b, data2))?;
        self.buf.write_with(2, |b| ctx.put_u16(b, data3))?;
        self.buf.put_bytes(data4)
    }
}

impl<'a, 't> Unmarshaller<'a, 't> {
    /// Decode a context handle; `current` is the parameter's value before
    /// the call, needed to release a client handle the server closed.
    pub(crate) fn unmarshal_context(&mut self, dir: ContextDir, current: &Value) -> Result<Value> {
        let registry = self.contexts.ok_or(NdrError::MissingContextRegistry)?;
        let ctx = self.ctx;
        let _attributes = get_count(self.buf, &ctx)?;
        let data1 = get_count(self.buf, &ctx)?;
        let data2 = self.buf.read_with(2, |b| ctx.get_u16(b))?;
        let data3 = self.buf.read_with(2, |b| ctx.get_u16(b))?;
        let data4: [u8; 8] = self
            .buf
            .get_bytes(8)?
            .try_into()
            .map_err(|_| NdrError::BufferUnderflow { needed: 8, have: 0 })?;
        let uuid = Uuid::from_fields(data1, data2, data3, &data4);
        trace!("unmarshal context {} ({:?}, {:?})", uuid, dir, self.side);

        match self.side {
            Side::Server => {
                if uuid.is_nil() {
                    return match dir {
                        ContextDir::In => Err(NdrError::ContextMismatch(uuid)),
                        _ => Ok(Value::Context(None)),
                    };
                }
                let local = registry.resolve(uuid).ok_or(NdrError::ContextMismatch(uuid))?;
                Ok(Value::Context(Some(local)))
            }
            Side::Client => {
                let held = context_value(current).unwrap_or(None);
                if uuid.is_nil() {
                    // The server closed the context
                    if let Some(local) = held {
                        self.released_contexts.push(local);
                    }
                    return Ok(Value::Context(None));
                }
                let local = match registry.resolve(uuid) {
                    Some(local) => local,
                    None => {
                        let local = registry.adopt(uuid);
                        self.adopted_contexts.push(local);
                        local
                    }
                };
                Ok(Value::Context(Some(local)))
            }
        }
    }
}
