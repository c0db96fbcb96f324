//! Interpreter state block and operation entry points

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::buffer::{ChunkSink, ChunkSource, ChunkedSource, MarshalBuffer, UnmarshalBuffer, VecSink};
use crate::config::InterpreterConfig;
use crate::context::NdrContext;
use crate::context_handle::ContextRegistry;
use crate::correlation::BoundPair;
use crate::decode::Unmarshaller;
use crate::drep::DataRepresentation;
use crate::encode::Marshaller;
use crate::error::FaultKind;
use crate::pointers::NodeTable;
use crate::type_vec::{OffsetVector, TypeVector};
use crate::xmit::{RoutineVector, TransmitAs};
use crate::{HeapRef, Memory, NdrError, Result, Value};

/// Everything compiled for one interface: type, offset and routine vectors.
///
/// Immutable once built; share it between threads with `Arc`.
#[derive(Clone)]
pub struct Interface {
    pub type_vec: TypeVector,
    pub offsets: OffsetVector,
    pub routines: RoutineVector,
}

impl Interface {
    pub fn new(type_vec: TypeVector, offsets: OffsetVector) -> Self {
        Self {
            type_vec,
            offsets,
            routines: Vec::new(),
        }
    }

    /// Append a `[transmit_as]`/`[represent_as]` routine; its index is the
    /// number of routines registered before it.
    pub fn with_routine(mut self, routine: Arc<dyn TransmitAs>) -> Self {
        self.routines.push(routine);
        self
    }

    pub(crate) fn routine(&self, index: u32) -> Result<&Arc<dyn TransmitAs>> {
        self.routines
            .get(index as usize)
            .ok_or(NdrError::MissingRoutine(index))
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("type_vec_len", &self.type_vec.len())
            .field("offsets", &self.offsets.0.len())
            .field("routines", &self.routines.len())
            .finish()
    }
}

/// Role of the caller in the RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Per-operation bookkeeping lent to the walkers
#[derive(Debug, Default)]
pub(crate) struct Bookkeeping {
    pub(crate) nodes: NodeTable,
    pub(crate) range: BoundPair,
    pub(crate) xmit_level: u32,
    /// Descriptors currently being walked, innermost last
    pub(crate) depth: u32,
}

impl Bookkeeping {
    fn reset(&mut self) {
        self.nodes.clear();
        self.range = BoundPair::UNSET;
        self.xmit_level = 0;
        self.depth = 0;
    }

    /// Enter the descriptor at `offset`; fails once the walk nests deeper
    /// than `limit`
    pub(crate) fn descend(&mut self, limit: u32, offset: usize) -> Result<()> {
        if self.depth >= limit {
            return Err(NdrError::NestingTooDeep { limit, offset });
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

/// Interpreter state block for one in-flight call.
///
/// Exclusively borrowed by the operation running on it; concurrent calls
/// each build their own over a shared `Interface`.
pub struct MachineState<'m> {
    interface: Arc<Interface>,
    drep: DataRepresentation,
    ctx: NdrContext,
    memory: &'m mut dyn Memory,
    side: Side,
    config: InterpreterConfig,
    contexts: Option<Arc<ContextRegistry>>,
    book: Bookkeeping,
    /// Node table of the operation before the current one; `DELETED_NODES`
    /// ids refer to it
    previous: NodeTable,
    deleted_nodes: Vec<u32>,
    status: Option<FaultKind>,
}

impl<'m> MachineState<'m> {
    pub fn new(interface: Arc<Interface>, memory: &'m mut dyn Memory) -> Self {
        let drep = DataRepresentation::ndr();
        Self {
            interface,
            drep,
            ctx: NdrContext::from_drep(drep),
            memory,
            side: Side::Client,
            config: InterpreterConfig::default(),
            contexts: None,
            book: Bookkeeping::default(),
            previous: NodeTable::new(),
            deleted_nodes: Vec::new(),
            status: None,
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Data representation of the wire data this state reads and writes
    pub fn with_drep(mut self, drep: DataRepresentation) -> Self {
        self.drep = drep;
        self.ctx = NdrContext::from_drep(drep);
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    pub fn with_contexts(mut self, contexts: Arc<ContextRegistry>) -> Self {
        self.contexts = Some(contexts);
        self
    }

    pub fn drep(&self) -> DataRepresentation {
        self.drep
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// First fault raised on this state block, if any
    pub fn status(&self) -> Option<FaultKind> {
        self.status
    }

    /// Read access to the memory the state block allocates from
    pub fn memory(&self) -> &dyn Memory {
        &*self.memory
    }

    /// Record that the application freed `node`, which arrived through a
    /// full pointer in the most recent operation. The node id is reported to
    /// the peer by the next `DELETED_NODES` descriptor marshalled.
    pub fn note_deleted(&mut self, node: HeapRef) -> bool {
        match self.book.nodes.lookup_ref(node) {
            Some(id) => {
                self.deleted_nodes.push(id);
                true
            }
            None => false,
        }
    }

    fn latch(&mut self, err: &NdrError) {
        let kind = err.kind();
        warn!("NDR fault ({:?}): {}", kind, err);
        if self.status.is_none() {
            self.status = Some(kind);
        }
    }

    fn begin_operation(&mut self) {
        self.previous = std::mem::take(&mut self.book.nodes);
        self.book.reset();
    }

    /// Marshal the parameter list at `params_at` into chunks handed to
    /// `sink`; returns the number of bytes produced.
    pub fn marshal(&mut self, params_at: usize, params: &[Value], sink: &mut dyn ChunkSink) -> Result<usize> {
        debug!("marshal: param list at {} ({} params, {:?})", params_at, params.len(), self.side);
        self.begin_operation();
        let mut buf = MarshalBuffer::new(sink, &self.config);
        let interface = Arc::clone(&self.interface);
        let result = {
            let mut walker = Marshaller {
                iface: &interface,
                ctx: self.ctx,
                config: &self.config,
                memory: &*self.memory,
                book: &mut self.book,
                contexts: self.contexts.as_deref(),
                deleted: &self.deleted_nodes,
                buf: &mut buf,
                scopes: Default::default(),
                deferred: Vec::new(),
            };
            walker.marshal_params(params_at, params)
        };
        let result = match result {
            Ok(()) => buf.finish(),
            Err(err) => {
                buf.abandon();
                Err(err)
            }
        };
        match result {
            Ok(len) => {
                self.deleted_nodes.clear();
                debug!("marshal: {} bytes, {} nodes", len, self.book.nodes.len());
                Ok(len)
            }
            Err(err) => {
                self.latch(&err);
                Err(err)
            }
        }
    }

    /// Unmarshal the parameter list at `params_at` from `source`.
    ///
    /// Parameters are written only when the whole list decoded; on a fault
    /// every allocation made by this call is freed and `params` is untouched.
    pub fn unmarshal(&mut self, params_at: usize, params: &mut [Value], source: &mut dyn ChunkSource) -> Result<()> {
        debug!("unmarshal: param list at {} ({:?})", params_at, self.side);
        self.begin_operation();
        let mut buf = UnmarshalBuffer::new(source);
        let interface = Arc::clone(&self.interface);
        let mut walker = Unmarshaller {
            iface: &interface,
            ctx: self.ctx,
            config: &self.config,
            side: self.side,
            memory: &mut *self.memory,
            book: &mut self.book,
            contexts: self.contexts.as_deref(),
            previous: &self.previous,
            buf: &mut buf,
            scopes: Default::default(),
            deferred: Vec::new(),
            late: Vec::new(),
            allocated: Vec::new(),
            deleted: Vec::new(),
            released_contexts: Vec::new(),
            adopted_contexts: Vec::new(),
        };
        let result = walker.run(params_at, params);
        match result {
            Ok(allocated) => {
                buf.finish();
                debug!("unmarshal: {} allocations, {} nodes", allocated, self.book.nodes.len());
                Ok(())
            }
            Err(err) => {
                buf.finish();
                self.latch(&err);
                Err(err)
            }
        }
    }

    /// Marshal into one contiguous buffer
    pub fn marshal_to_bytes(&mut self, params_at: usize, params: &[Value]) -> Result<Bytes> {
        let mut sink = VecSink::new();
        self.marshal(params_at, params, &mut sink)?;
        Ok(sink.into_bytes())
    }

    /// Unmarshal from one contiguous buffer
    pub fn unmarshal_from_bytes(&mut self, params_at: usize, params: &mut [Value], data: Bytes) -> Result<()> {
        let mut source = ChunkedSource::new(data);
        self.unmarshal(params_at, params, &mut source)
    }
}
