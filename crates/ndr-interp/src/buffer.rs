//! Alignment and buffer management
//!
//! Marshalled data is written into fixed-size chunks obtained from the
//! transport. A chunk that starts at stream phase `p` (stream offset mod 8)
//! holds `buffer_size - p` bytes, so every chunk ends on an 8-byte stream
//! boundary: aligning never needs a new chunk and no naturally aligned scalar
//! is ever split across chunks. Chunks accumulate in an I/O vector that is
//! handed to the transport when full.
//!
//! On the receive side, alignment is computed from the stream offset and a
//! scalar that straddles two received chunks is spliced into one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::config::InterpreterConfig;
use crate::context::NdrContext;
use crate::{NdrError, Result};

/// Transport side of marshalling
pub trait ChunkSink {
    /// Supply an empty buffer with at least `capacity` bytes of room.
    fn fresh_buffer(&mut self, capacity: usize) -> Result<BytesMut>;

    /// Take ownership of a full I/O vector of filled chunks.
    fn transmit(&mut self, iovec: Vec<Bytes>) -> Result<()>;

    /// Receive back chunks that will not be transmitted because the
    /// operation faulted.
    fn release(&mut self, _iovec: Vec<Bytes>) {}
}

/// Transport side of unmarshalling
pub trait ChunkSource {
    /// Next received chunk, `None` once the transport has nothing more.
    fn receive(&mut self) -> Result<Option<Bytes>>;

    /// Give back a chunk the interpreter has finished with.
    fn release(&mut self, _chunk: Bytes) {}
}

/// In-memory sink that collects every transmitted chunk
#[derive(Debug, Default)]
pub struct VecSink {
    chunks: Vec<Bytes>,
    transmits: usize,
    released: usize,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks in transmission order
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Number of I/O vectors handed over
    pub fn transmits(&self) -> usize {
        self.transmits
    }

    /// Number of chunks given back after a fault
    pub fn released(&self) -> usize {
        self.released
    }

    /// All transmitted bytes as one contiguous buffer
    pub fn into_bytes(self) -> Bytes {
        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in self.chunks {
            out.put(chunk);
        }
        out.freeze()
    }
}

impl ChunkSink for VecSink {
    fn fresh_buffer(&mut self, capacity: usize) -> Result<BytesMut> {
        Ok(BytesMut::with_capacity(capacity))
    }

    fn transmit(&mut self, iovec: Vec<Bytes>) -> Result<()> {
        self.transmits += 1;
        self.chunks.extend(iovec);
        Ok(())
    }

    fn release(&mut self, iovec: Vec<Bytes>) {
        self.released += iovec.len();
    }
}

/// Source that replays a byte string in fixed-size chunks
#[derive(Debug)]
pub struct ChunkedSource {
    data: Bytes,
    chunk_size: usize,
}

impl ChunkedSource {
    /// Deliver `data` as a single chunk
    pub fn new(data: Bytes) -> Self {
        let chunk_size = data.len().max(1);
        Self { data, chunk_size }
    }

    /// Deliver `data` in chunks of `chunk_size` bytes
    pub fn with_chunk_size(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ChunkSource for ChunkedSource {
    fn receive(&mut self) -> Result<Option<Bytes>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = self.chunk_size.min(self.data.len());
        Ok(Some(self.data.split_to(n)))
    }
}

/// Write cursor over transport-supplied chunks
pub struct MarshalBuffer<'t> {
    sink: &'t mut dyn ChunkSink,
    chunk: Option<BytesMut>,
    left_in_buff: usize,
    position: usize,
    iovec: Vec<Bytes>,
    buffer_size: usize,
    iovector_size: usize,
}

impl<'t> MarshalBuffer<'t> {
    pub fn new(sink: &'t mut dyn ChunkSink, config: &InterpreterConfig) -> Self {
        Self {
            sink,
            chunk: None,
            left_in_buff: 0,
            position: 0,
            iovec: Vec::new(),
            buffer_size: config.buffer_size,
            iovector_size: config.iovector_size,
        }
    }

    /// Bytes written so far in this operation
    pub fn position(&self) -> usize {
        self.position
    }

    fn attach_current(&mut self) -> Result<()> {
        if let Some(chunk) = self.chunk.take() {
            if !chunk.is_empty() {
                self.iovec.push(chunk.freeze());
            }
        }
        if self.iovec.len() >= self.iovector_size {
            let full = std::mem::take(&mut self.iovec);
            trace!("transmitting I/O vector of {} chunks", full.len());
            self.sink.transmit(full)?;
        }
        Ok(())
    }

    fn new_chunk(&mut self) -> Result<()> {
        self.attach_current()?;
        let phase = self.position % 8;
        let capacity = self.buffer_size - phase;
        let chunk = self.sink.fresh_buffer(capacity)?;
        if !chunk.is_empty() {
            return Err(NdrError::BufferExhausted("transport supplied a non-empty buffer".into()));
        }
        trace!("new marshalling chunk of {} bytes at stream offset {}", capacity, self.position);
        self.chunk = Some(chunk);
        self.left_in_buff = capacity;
        Ok(())
    }

    /// Guarantee `n` contiguous bytes in the current chunk
    fn ensure(&mut self, n: usize) -> Result<()> {
        if self.chunk.is_none() || self.left_in_buff < n {
            self.new_chunk()?;
            if self.left_in_buff < n {
                return Err(NdrError::BufferExhausted(format!(
                    "{} contiguous bytes requested, chunk holds {}",
                    n, self.left_in_buff
                )));
            }
        }
        Ok(())
    }

    fn current(&mut self) -> Result<&mut BytesMut> {
        self.chunk
            .as_mut()
            .ok_or_else(|| NdrError::BufferExhausted("no current chunk".into()))
    }

    /// Zero-fill up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = NdrContext::align_padding(self.position, alignment);
        if pad == 0 {
            return Ok(());
        }
        // Chunks end 8-aligned, so the pad always fits in the current one.
        self.ensure(pad)?;
        self.current()?.put_bytes(0, pad);
        self.left_in_buff -= pad;
        self.position += pad;
        Ok(())
    }

    /// Write exactly `n` bytes via `write` into the current chunk
    pub fn write_with<F>(&mut self, n: usize, write: F) -> Result<()>
    where
        F: FnOnce(&mut BytesMut),
    {
        self.ensure(n)?;
        let chunk = self.current()?;
        let before = chunk.len();
        write(&mut *chunk);
        debug_assert_eq!(chunk.len() - before, n);
        self.left_in_buff -= n;
        self.position += n;
        Ok(())
    }

    /// Write an unaligned byte run, splitting across chunks as needed
    pub fn put_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.chunk.is_none() || self.left_in_buff == 0 {
                self.new_chunk()?;
            }
            let n = bytes.len().min(self.left_in_buff);
            let (head, tail) = bytes.split_at(n);
            self.current()?.put_slice(head);
            self.left_in_buff -= n;
            self.position += n;
            bytes = tail;
        }
        Ok(())
    }

    /// Hand every remaining chunk to the transport
    pub fn finish(mut self) -> Result<usize> {
        if let Some(chunk) = self.chunk.take() {
            if !chunk.is_empty() {
                self.iovec.push(chunk.freeze());
            }
        }
        if !self.iovec.is_empty() {
            let rest = std::mem::take(&mut self.iovec);
            self.sink.transmit(rest)?;
        }
        Ok(self.position)
    }

    /// Return untransmitted chunks to the transport after a fault
    pub fn abandon(mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.iovec.push(chunk.freeze());
        }
        let pending = std::mem::take(&mut self.iovec);
        if !pending.is_empty() {
            self.sink.release(pending);
        }
    }
}

/// Read cursor over received chunks
pub struct UnmarshalBuffer<'t> {
    source: &'t mut dyn ChunkSource,
    current: Bytes,
    position: usize,
}

impl<'t> UnmarshalBuffer<'t> {
    pub fn new(source: &'t mut dyn ChunkSource) -> Self {
        Self {
            source,
            current: Bytes::new(),
            position: 0,
        }
    }

    /// Bytes consumed so far in this operation
    pub fn position(&self) -> usize {
        self.position
    }

    /// Make at least `n` bytes readable from the current chunk
    fn ensure(&mut self, n: usize) -> Result<()> {
        while self.current.remaining() < n {
            let next = match self.source.receive()? {
                Some(next) => next,
                None => {
                    return Err(NdrError::BufferUnderflow {
                        needed: n,
                        have: self.current.remaining(),
                    })
                }
            };
            trace!("received chunk of {} bytes at stream offset {}", next.len(), self.position);
            if self.current.is_empty() {
                let spent = std::mem::replace(&mut self.current, next);
                self.source.release(spent);
            } else {
                let mut spliced = BytesMut::with_capacity(self.current.len() + next.len());
                spliced.put(self.current.clone());
                spliced.put(next.clone());
                self.source.release(next);
                self.current = spliced.freeze();
            }
        }
        Ok(())
    }

    /// Skip padding up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = NdrContext::align_padding(self.position, alignment);
        if pad > 0 {
            self.ensure(pad)?;
            self.current.advance(pad);
            self.position += pad;
        }
        Ok(())
    }

    /// Read exactly `n` bytes via `read` from one contiguous region
    pub fn read_with<T, F>(&mut self, n: usize, read: F) -> Result<T>
    where
        F: FnOnce(&mut Bytes) -> T,
    {
        self.ensure(n)?;
        let before = self.current.remaining();
        let value = read(&mut self.current);
        debug_assert_eq!(before - self.current.remaining(), n);
        self.position += n;
        Ok(value)
    }

    /// Read an unaligned byte run that may span chunks
    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(64 * 1024));
        while out.len() < n {
            if self.current.is_empty() {
                self.ensure(1)?;
            }
            let take = (n - out.len()).min(self.current.remaining());
            out.extend_from_slice(&self.current[..take]);
            self.current.advance(take);
            self.position += take;
        }
        Ok(out)
    }

    /// Give the rest of the current chunk back to the transport
    pub fn finish(mut self) {
        let rest = std::mem::take(&mut self.current);
        self.source.release(rest);
    }
}
