//! NDR interpreter fault types

use thiserror::Error;

use crate::drep::{CharRep, FloatRep};

/// Coarse fault classification carried up to the caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Malformed or truncated type vector
    Decode,
    /// Range or size/length correlation violation
    Bounds,
    /// Data shape does not match the type vector
    Structural,
    /// Allocator failure or transport out of buffers
    Resource,
    /// Unsupported data representation on the wire
    Representation,
    /// Interpreter or callback misuse
    Usage,
}

/// NDR interpreter errors
#[derive(Debug, Error)]
pub enum NdrError {
    /// Opcode byte outside the type vector opcode space
    #[error("unknown type vector opcode {opcode} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    /// Type vector ended inside a record
    #[error("type vector truncated: needed {needed} bytes at offset {offset}")]
    TruncatedTypeVector { offset: usize, needed: usize },

    /// Type vector built for an incompatible interpreter
    #[error("type vector version {major}.{minor} not supported")]
    VersionMismatch { major: u16, minor: u16 },

    /// Type vector requests legacy wire-format bug emulation
    #[error("bug-compatibility flags 0x{0:08x} not supported")]
    UnsupportedBugCompat(u32),

    /// Record contents make no sense at this position
    #[error("invalid descriptor at offset {offset}: {reason}")]
    InvalidDescriptor { offset: usize, reason: &'static str },

    /// Descriptors nest deeper than the configured limit, as a type vector
    /// whose struct contains itself does
    #[error("type nesting exceeds {limit} at type vector offset {offset}")]
    NestingTooDeep { limit: u32, offset: usize },

    /// Field conversion operator the interpreter cannot evaluate
    #[error("unsupported field conversion operator {0}")]
    UnsupportedFieldConversion(u8),

    /// Value outside a declared `[range(lo, hi)]`
    #[error("value {value} outside range [{lower}, {upper}]")]
    RangeViolation { value: i64, lower: i64, upper: i64 },

    /// Wire bound disagrees with the correlated field
    #[error("correlation mismatch: field gives {expected}, wire carries {wire}")]
    CorrelationMismatch { expected: i64, wire: i64 },

    /// Correlated field has not been seen yet
    #[error("correlated field {0} not available")]
    CorrelationUnavailable(u32),

    /// Bound pair describes an empty or negative extent incorrectly
    #[error("invalid bounds: lower={lower}, upper={upper}")]
    InvalidBound { lower: i64, upper: i64 },

    /// Varying part exceeds conformant part
    #[error("conformance mismatch: max_count={max_count}, offset={offset}, actual_count={actual_count}")]
    ConformanceMismatch {
        max_count: u64,
        offset: u64,
        actual_count: u64,
    },

    /// Union discriminant has no arm and no default
    #[error("no union arm for discriminant {0}")]
    NoMatchingArm(i64),

    /// Array dimensionality disagrees with its definition
    #[error("dimensionality mismatch: descriptor declares {declared}, definition records {recorded}")]
    DimensionalityMismatch { declared: u8, recorded: u8 },

    /// Host value has the wrong shape for its descriptor
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },

    /// Host array shorter than the transmitted extent
    #[error("array size mismatch: expected {expected} elements, got {got}")]
    ArraySizeMismatch { expected: usize, got: usize },

    /// `[ref]` pointer was null
    #[error("null [ref] pointer")]
    NullRefPointer,

    /// Back-reference to a node id never transmitted
    #[error("unknown node id {0}")]
    UnknownNode(u32),

    /// String missing its terminator or otherwise malformed
    #[error("invalid string: {0}")]
    InvalidString(String),

    /// Context handle token unknown to the registry
    #[error("context handle mismatch: {0}")]
    ContextMismatch(uuid::Uuid),

    /// Allocator refused a request
    #[error("allocation failed: {live} live nodes, limit {limit}")]
    AllocationFailed { live: usize, limit: usize },

    /// Transmitted element count exceeds the configured limit
    #[error("allocation limit exceeded: requested {requested} elements, limit is {limit}")]
    AllocationLimitExceeded { requested: u64, limit: u64 },

    /// Handle does not name a live allocation
    #[error("invalid heap reference {0}")]
    InvalidHeapRef(usize),

    /// Allocation freed twice
    #[error("double free of heap reference {0}")]
    DoubleFree(usize),

    /// Wire data ended before the operation did
    #[error("buffer underflow: needed {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    /// Transport could not supply a buffer
    #[error("buffer exhausted: {0}")]
    BufferExhausted(String),

    /// Non-IEEE floating point on the wire
    #[error("unsupported float representation {0:?}")]
    UnsupportedFloatRep(FloatRep),

    /// Non-ASCII characters on the wire
    #[error("unsupported character representation {0:?}")]
    UnsupportedCharRep(CharRep),

    /// Opcode belongs to a layer this interpreter does not host
    #[error("unsupported opcode {0}")]
    Unsupported(u8),

    /// Pipe used against its direction or after completion
    #[error("pipe misuse: {0}")]
    PipeMisuse(&'static str),

    /// No routine registered at this routine vector index
    #[error("missing transmit_as routine {0}")]
    MissingRoutine(u32),

    /// Routine supplied by the application failed
    #[error("transmit_as routine {index} failed: {reason}")]
    RoutineFailed { index: u32, reason: String },

    /// Context handle used without a registry
    #[error("context handle used without a context registry")]
    MissingContextRegistry,

    /// transmit_as nesting beyond the configured limit
    #[error("transmit_as nesting exceeds {0}")]
    XmitDepthExceeded(u32),

    /// Parameter index beyond the parameter vector
    #[error("parameter index {index} outside parameter vector of {len}")]
    ParamIndex { index: u32, len: usize },

    /// Configuration rejected at state creation
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Arithmetic on wire or host counts overflowed
    #[error("integer overflow")]
    IntegerOverflow,
}

impl NdrError {
    /// Classify this error into the fault taxonomy.
    pub fn kind(&self) -> FaultKind {
        use NdrError::*;
        match self {
            UnknownOpcode { .. }
            | TruncatedTypeVector { .. }
            | VersionMismatch { .. }
            | UnsupportedBugCompat(_)
            | InvalidDescriptor { .. }
            | NestingTooDeep { .. }
            | UnsupportedFieldConversion(_) => FaultKind::Decode,

            RangeViolation { .. }
            | CorrelationMismatch { .. }
            | CorrelationUnavailable(_)
            | InvalidBound { .. }
            | ConformanceMismatch { .. }
            | IntegerOverflow => FaultKind::Bounds,

            NoMatchingArm(_)
            | DimensionalityMismatch { .. }
            | TypeMismatch { .. }
            | ArraySizeMismatch { .. }
            | NullRefPointer
            | UnknownNode(_)
            | InvalidString(_)
            | ContextMismatch(_) => FaultKind::Structural,

            AllocationFailed { .. }
            | AllocationLimitExceeded { .. }
            | InvalidHeapRef(_)
            | DoubleFree(_)
            | BufferUnderflow { .. }
            | BufferExhausted(_) => FaultKind::Resource,

            UnsupportedFloatRep(_) | UnsupportedCharRep(_) => FaultKind::Representation,

            Unsupported(_)
            | PipeMisuse(_)
            | MissingRoutine(_)
            | RoutineFailed { .. }
            | MissingContextRegistry
            | XmitDepthExceeded(_)
            | ParamIndex { .. }
            | InvalidConfig(_) => FaultKind::Usage,
        }
    }

    pub(crate) fn type_mismatch(expected: &'static str, found: &crate::Value) -> Self {
        NdrError::TypeMismatch {
            expected,
            found: found.kind_name().to_string(),
        }
    }
}

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;
