//! Type-vector driven NDR marshalling interpreter
//!
//! Instead of generated per-type stubs, an IDL compiler emits a compact byte
//! encoding of every type (the type vector) plus a host layout table (the
//! offset vector). This crate walks those vectors to convert parameter
//! values to and from the NDR wire format used by DCE RPC.
//!
//! # NDR Wire Format
//!
//! - Primitives align to their natural size (1, 2, 4, or 8 bytes), padding
//!   with zero bytes
//! - Integers follow the sender's data representation (drep)
//! - Conformant counts are hoisted ahead of the struct that holds them
//! - Embedded pointees are deferred until their containing top-level value
//!   is complete
//! - Strings are varying arrays whose length counts a zero terminator
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use ndr_interp::builder::{TypeSpec, TypeVecBuilder};
//! use ndr_interp::{Heap, MachineState, ScalarKind, Value};
//!
//! let mut b = TypeVecBuilder::new();
//! let op = b.param_list(&[(0, TypeSpec::Scalar(ScalarKind::Long))]).unwrap();
//! let iface = Arc::new(b.interface().unwrap());
//!
//! let mut heap = Heap::new();
//! let mut state = MachineState::new(Arc::clone(&iface), &mut heap);
//! let wire = state.marshal_to_bytes(op, &[Value::Long(7)]).unwrap();
//! assert_eq!(&wire[..], &[7, 0, 0, 0]);
//!
//! let mut out = vec![Value::Void];
//! state.unmarshal_from_bytes(op, &mut out, wire).unwrap();
//! assert_eq!(out[0], Value::Long(7));
//! ```

mod arrays;
mod buffer;
pub mod builder;
mod config;
mod context;
mod context_handle;
mod correlation;
mod decode;
mod drep;
mod encode;
mod error;
pub mod opcode;
mod pipes;
mod pointers;
mod primitives;
mod state;
mod strings;
pub mod type_vec;
mod unions;
mod value;
mod xmit;

pub use buffer::{ChunkSink, ChunkSource, ChunkedSource, VecSink};
pub use config::{InterpreterConfig, IDL_BUFF_SIZE, IDL_IOVECTOR_SIZE, IDL_MIN_PIPE_CHUNK_SIZE, IDL_NORMAL_DIMS};
pub use context::NdrContext;
pub use context_handle::{ContextRegistry, LocalHandle, CONTEXT_HANDLE_SIZE};
pub use drep::{CharRep, DataRepresentation, FloatRep, IntRep};
pub use error::{FaultKind, NdrError, Result};
pub use opcode::Opcode;
pub use pipes::{PipeCallbacks, PipeDirection, PipeHandle};
pub use pointers::REF_PLACEHOLDER;
pub use primitives::ScalarKind;
pub use state::{Interface, MachineState, Side};
pub use strings::{text_len, transmit_count};
pub use type_vec::{OffsetVector, TypeVector};
pub use value::{Heap, HeapRef, HeapStats, Memory, Value};
pub use xmit::{RoutineVector, TransmitAs};

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
