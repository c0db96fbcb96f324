//! RPC pipes
//!
//! A pipe parameter streams its elements in chunks instead of holding them
//! in memory. On the wire each chunk is an element count followed by the
//! elements; a zero count ends the stream:
//!
//! ```text
//! +------------------+
//! | count (u32)      |  Number of elements in this chunk
//! +------------------+
//! | element[0]       |
//! | ...              |
//! | element[count-1] |
//! +------------------+
//! | ... more chunks  |
//! +------------------+
//! | 0 (u32)          |  Terminator
//! +------------------+
//! ```
//!
//! The application supplies the elements through `PipeCallbacks`: `pull`
//! while marshalling, `push` while unmarshalling, and `alloc` to size each
//! chunk buffer. Pipe elements may not contain pointers or other pipes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::decode::Unmarshaller;
use crate::encode::{Marshaller, Site};
use crate::primitives::{get_count, put_count};
use crate::type_vec::{Descriptor, TypeDesc};
use crate::{NdrError, Result, Value};

/// Application side of a pipe
pub trait PipeCallbacks: Send {
    /// Next chunk to send, at most `max` elements; an empty chunk ends the pipe
    fn pull(&mut self, max: usize) -> Result<Vec<Value>>;

    /// Chunk received from the peer; the final call carries no elements
    fn push(&mut self, chunk: Vec<Value>) -> Result<()>;

    /// Capacity, in elements, of the next chunk buffer
    fn alloc(&mut self, requested: usize) -> usize {
        requested
    }
}

/// Direction a pipe was first used in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    Send,
    Receive,
}

struct PipeState {
    callbacks: Box<dyn PipeCallbacks>,
    direction: Option<PipeDirection>,
    finished: bool,
    transferred: u64,
}

impl PipeState {
    fn begin(&mut self, direction: PipeDirection) -> Result<()> {
        if self.finished {
            return Err(NdrError::PipeMisuse("pipe already completed"));
        }
        match self.direction {
            Some(d) if d != direction => Err(NdrError::PipeMisuse("pipe used in both directions")),
            _ => {
                self.direction = Some(direction);
                Ok(())
            }
        }
    }
}

/// Shared handle to a pipe; the host value of a pipe parameter
#[derive(Clone)]
pub struct PipeHandle(Arc<Mutex<PipeState>>);

impl PipeHandle {
    pub fn new(callbacks: impl PipeCallbacks + 'static) -> Self {
        Self(Arc::new(Mutex::new(PipeState {
            callbacks: Box::new(callbacks),
            direction: None,
            finished: false,
            transferred: 0,
        })))
    }

    /// Elements moved through the pipe so far
    pub fn elements_transferred(&self) -> u64 {
        self.0.lock().transferred
    }

    /// Whether the terminating empty chunk has been sent or received
    pub fn is_finished(&self) -> bool {
        self.0.lock().finished
    }

    pub fn direction(&self) -> Option<PipeDirection> {
        self.0.lock().direction
    }
}

impl fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("PipeHandle")
            .field("direction", &state.direction)
            .field("finished", &state.finished)
            .field("transferred", &state.transferred)
            .finish()
    }
}

impl PartialEq for PipeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

fn pipe_handle(value: &Value) -> Result<PipeHandle> {
    match value {
        Value::Pipe(handle) => Ok(handle.clone()),
        other => Err(NdrError::type_mismatch("pipe", other)),
    }
}

fn check_element(element: &Descriptor) -> Result<()> {
    if element.has_ptrs() || matches!(element.ty, TypeDesc::Pipe { .. }) {
        return Err(NdrError::InvalidDescriptor {
            offset: element.offset,
            reason: "pipe elements may not contain pointers or pipes",
        });
    }
    Ok(())
}

impl<'a, 't> Marshaller<'a, 't> {
    pub(crate) fn marshal_pipe(&mut self, element_at: usize, value: &Value, site: Site) -> Result<()> {
        if site.embedded {
            return Err(NdrError::PipeMisuse("pipe outside a parameter list"));
        }
        let handle = pipe_handle(value)?;
        let element = self.iface.type_vec.stream(element_at)?;
        check_element(&element)?;
        let mut state = handle.0.lock();
        state.begin(PipeDirection::Send)?;
        let min = self.config.min_pipe_chunk;
        let inner = site.embedded();
        loop {
            let capacity = state.callbacks.alloc(min).max(min);
            let chunk = state.callbacks.pull(capacity)?;
            if chunk.len() > capacity {
                return Err(NdrError::PipeMisuse("pull returned more elements than requested"));
            }
            let count = u32::try_from(chunk.len()).map_err(|_| NdrError::IntegerOverflow)?;
            put_count(self.buf, &self.ctx, count)?;
            for elem in &chunk {
                self.marshal_desc(&element, elem, inner)?;
            }
            state.transferred += u64::from(count);
            trace!("pipe: sent chunk of {}", count);
            if count == 0 {
                state.finished = true;
                debug!("pipe: send complete after {} elements", state.transferred);
                return Ok(());
            }
        }
    }
}

impl<'a, 't> Unmarshaller<'a, 't> {
    /// Receive a pipe into the handle currently held by the parameter
    pub(crate) fn unmarshal_pipe(&mut self, element_at: usize, current: &Value, site: Site) -> Result<Value> {
        let handle = pipe_handle(current)?;
        let element = self.iface.type_vec.stream(element_at)?;
        check_element(&element)?;
        let mut state = handle.0.lock();
        state.begin(PipeDirection::Receive)?;
        let inner = site.embedded();
        loop {
            let count = u64::from(get_count(self.buf, &self.ctx)?);
            if count == 0 {
                state.callbacks.push(Vec::new())?;
                state.finished = true;
                debug!("pipe: receive complete after {} elements", state.transferred);
                break;
            }
            if count > self.config.max_array_elements {
                return Err(NdrError::AllocationLimitExceeded {
                    requested: count,
                    limit: self.config.max_array_elements,
                });
            }
            trace!("pipe: receiving chunk of {}", count);
            let mut remaining = count as usize;
            while remaining > 0 {
                let capacity = state.callbacks.alloc(remaining).clamp(1, remaining);
                let mut chunk = Vec::with_capacity(capacity);
                for _ in 0..capacity {
                    chunk.push(self.unmarshal_desc(&element, inner)?);
                }
                state.callbacks.push(chunk)?;
                state.transferred += capacity as u64;
                remaining -= capacity;
            }
        }
        drop(state);
        Ok(Value::Pipe(handle))
    }
}
