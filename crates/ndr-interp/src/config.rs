//! Interpreter configuration

use crate::{NdrError, Result};

/// Size of a marshalling buffer chunk in bytes
pub const IDL_BUFF_SIZE: usize = 2048;

/// Number of chunks collected before they are handed to the transport
pub const IDL_IOVECTOR_SIZE: usize = 10;

/// Minimum number of elements a pipe chunk buffer is sized for
pub const IDL_MIN_PIPE_CHUNK_SIZE: usize = 8;

/// Arrays with more dimensions than this keep their bookkeeping on the heap
pub const IDL_NORMAL_DIMS: usize = 7;

/// Tunables for one interpreter state block
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Chunk size requested from the transport; a multiple of 8
    pub buffer_size: usize,
    /// Chunks per I/O vector before a transmit
    pub iovector_size: usize,
    /// Minimum pipe chunk capacity in elements
    pub min_pipe_chunk: usize,
    /// Largest element count accepted from the wire for one array
    pub max_array_elements: u64,
    /// Deepest allowed `[transmit_as]` nesting
    pub max_xmit_depth: u32,
    /// Deepest allowed descriptor nesting within one walk
    pub max_nesting_depth: u32,
    /// Most elements of a partially transmitted array that are filled with
    /// zero values instead of being read from the wire
    pub max_zero_fill: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            buffer_size: IDL_BUFF_SIZE,
            iovector_size: IDL_IOVECTOR_SIZE,
            min_pipe_chunk: IDL_MIN_PIPE_CHUNK_SIZE,
            max_array_elements: 16 * 1024 * 1024,
            max_xmit_depth: 16,
            max_nesting_depth: 64,
            max_zero_fill: 64 * 1024,
        }
    }
}

impl InterpreterConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_iovector_size(mut self, iovector_size: usize) -> Self {
        self.iovector_size = iovector_size;
        self
    }

    pub fn with_max_array_elements(mut self, max: u64) -> Self {
        self.max_array_elements = max;
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: u32) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_max_zero_fill(mut self, max: u64) -> Self {
        self.max_zero_fill = max;
        self
    }

    /// Reject settings that would break the chunk alignment invariant
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 8 || self.buffer_size % 8 != 0 {
            return Err(NdrError::InvalidConfig("buffer_size must be a non-zero multiple of 8"));
        }
        if self.iovector_size == 0 {
            return Err(NdrError::InvalidConfig("iovector_size must be at least 1"));
        }
        if self.max_nesting_depth == 0 {
            return Err(NdrError::InvalidConfig("max_nesting_depth must be at least 1"));
        }
        if self.min_pipe_chunk == 0 {
            return Err(NdrError::InvalidConfig("min_pipe_chunk must be at least 1"));
        }
        Ok(())
    }
}
