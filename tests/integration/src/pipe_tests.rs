//! Pipe Tests - RPC pipe streaming scenarios
//!
//! These tests exercise pipe parameters:
//! - Chunked transfer with a zero-count terminator
//! - Receiver-sized chunk buffers
//! - Pipes mixed with ordinary parameters
//! - Misuse: reuse, direction changes, bad element types, embedding

mod common;

use std::sync::Arc;

use common::*;
use ndr_interp::builder::{StructSpec, TypeSpec, TypeVecBuilder};
use ndr_interp::{
    FaultKind, Heap, InterpreterConfig, MachineState, NdrError, PipeDirection, PipeHandle, ScalarKind, Side, Value,
    IDL_MIN_PIPE_CHUNK_SIZE,
};

fn long_pipe() -> TypeSpec {
    TypeSpec::Pipe(Box::new(TypeSpec::Scalar(ScalarKind::Long)))
}

fn longs(n: i32) -> Vec<Value> {
    (0..n).map(Value::Long).collect()
}

/// Test: twenty elements stream as 8 + 8 + 4 and a terminator
#[test]
fn test_pipe_stream() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, long_pipe())]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let source = VecPipe::sending(longs(20));
    let sender = PipeHandle::new(source.clone());
    let mut heap = Heap::new();
    let wire = MachineState::new(Arc::clone(&iface), &mut heap)
        .marshal_to_bytes(op, &[Value::Pipe(sender.clone())])
        .unwrap();

    assert_eq!(source.pull_sizes(), vec![8, 8, 4, 0]);
    assert_eq!(wire.len(), 4 * (1 + 8 + 1 + 8 + 1 + 4 + 1));
    let w = words(&wire);
    assert_eq!(w[0], 8);
    assert_eq!(w[9], 8);
    assert_eq!(w[18], 4);
    assert_eq!(w[23], 0);
    assert!(sender.is_finished());
    assert_eq!(sender.elements_transferred(), 20);
    assert_eq!(sender.direction(), Some(PipeDirection::Send));

    let sink = VecPipe::receiving();
    let receiver = PipeHandle::new(sink.clone());
    let mut out = vec![Value::Pipe(receiver.clone())];
    MachineState::new(iface, &mut heap)
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, wire)
        .unwrap();

    assert_eq!(sink.push_sizes(), vec![8, 8, 4, 0]);
    assert_eq!(sink.received(), longs(20));
    assert_eq!(out[0], Value::Pipe(receiver.clone()));
    assert!(receiver.is_finished());
    assert_eq!(receiver.elements_transferred(), 20);
    println!("Pipe stream: {} elements in {} chunks", 20, sink.push_sizes().len());
}

/// Test: sender chunks never shrink below the minimum; receivers split
/// wire chunks to the size they allocate
#[test]
fn test_chunk_sizing() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, long_pipe())]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    // Asking for 2 still gets the minimum chunk
    let source = VecPipe::sending(longs(10)).with_capacity(2);
    let mut heap = Heap::new();
    let wire = MachineState::new(Arc::clone(&iface), &mut heap)
        .marshal_to_bytes(op, &[Value::Pipe(PipeHandle::new(source.clone()))])
        .unwrap();
    assert_eq!(source.pull_sizes(), vec![IDL_MIN_PIPE_CHUNK_SIZE, 2, 0]);
    let w = words(&wire);
    assert_eq!((w[0], w[9], w[12]), (8, 2, 0));

    // A generous sender chunk
    let source = VecPipe::sending(longs(10)).with_capacity(32);
    let wide = MachineState::new(Arc::clone(&iface), &mut heap)
        .marshal_to_bytes(op, &[Value::Pipe(PipeHandle::new(source.clone()))])
        .unwrap();
    assert_eq!(source.pull_sizes(), vec![10, 0]);
    assert_eq!(words(&wide)[0], 10);

    let sink = VecPipe::receiving().with_capacity(3);
    let mut out = vec![Value::Pipe(PipeHandle::new(sink.clone()))];
    MachineState::new(iface, &mut heap)
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, wide)
        .unwrap();
    assert_eq!(sink.push_sizes(), vec![3, 3, 3, 1, 0]);
    assert_eq!(sink.received(), longs(10));
}

/// Test: an ordinary parameter on either side of a pipe
#[test]
fn test_pipe_between_parameters() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (0, TypeSpec::Scalar(ScalarKind::Short)),
            (1, TypeSpec::Pipe(Box::new(TypeSpec::Scalar(ScalarKind::Hyper)))),
            (2, TypeSpec::Scalar(ScalarKind::Long)),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let elements: Vec<Value> = (1..=3).map(Value::Hyper).collect();
    let source = VecPipe::sending(elements.clone());
    let mut heap = Heap::new();
    let wire = MachineState::new(Arc::clone(&iface), &mut heap)
        .marshal_to_bytes(
            op,
            &[Value::Short(-1), Value::Pipe(PipeHandle::new(source)), Value::Long(77)],
        )
        .unwrap();
    // short, pad, count, three hypers, terminator, long
    assert_eq!(wire.len(), 2 + 2 + 4 + 24 + 4 + 4);

    let sink = VecPipe::receiving();
    let mut out = vec![Value::Void, Value::Pipe(PipeHandle::new(sink.clone())), Value::Void];
    MachineState::new(iface, &mut heap)
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, wire)
        .unwrap();
    assert_eq!(out[0], Value::Short(-1));
    assert_eq!(out[2], Value::Long(77));
    assert_eq!(sink.received(), elements);
}

/// Test: a completed pipe cannot be used again
#[test]
fn test_finished_pipe_rejected() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, long_pipe())]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let handle = PipeHandle::new(VecPipe::sending(longs(3)));
    let mut heap = Heap::new();
    let mut state = MachineState::new(iface, &mut heap);
    state.marshal_to_bytes(op, &[Value::Pipe(handle.clone())]).unwrap();
    let err = state.marshal_to_bytes(op, &[Value::Pipe(handle)]).unwrap_err();
    assert!(matches!(err, NdrError::PipeMisuse(_)));
    assert_eq!(state.status(), Some(FaultKind::Usage));
}

/// Test: a pipe that started receiving cannot switch to sending
#[test]
fn test_direction_change_rejected() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, long_pipe())]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let handle = PipeHandle::new(VecPipe::receiving());
    let mut heap = Heap::new();
    let mut out = vec![Value::Pipe(handle.clone())];
    // One chunk of eight announced, one element present
    let truncated: Vec<u8> = vec![8, 0, 0, 0, 1, 0, 0, 0];
    let err = MachineState::new(Arc::clone(&iface), &mut heap)
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, truncated.into())
        .unwrap_err();
    assert!(matches!(err, NdrError::BufferUnderflow { .. }));
    assert_eq!(handle.direction(), Some(PipeDirection::Receive));
    assert!(!handle.is_finished());

    let err = MachineState::new(iface, &mut heap)
        .marshal_to_bytes(op, &[Value::Pipe(handle)])
        .unwrap_err();
    assert!(matches!(err, NdrError::PipeMisuse(_)));
}

/// Test: pipe element and placement restrictions
#[test]
fn test_pipe_restrictions() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let pointer_pipe = b
        .param_list(&[(0, TypeSpec::Pipe(Box::new(TypeSpec::unique(TypeSpec::Scalar(ScalarKind::Long)))))])
        .unwrap();
    let holder = b.add_struct(StructSpec::new(vec![TypeSpec::Scalar(ScalarKind::Long), long_pipe()]));
    let embedded = b.param_list(&[(0, TypeSpec::Struct(holder))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());
    let mut heap = Heap::new();

    let err = MachineState::new(Arc::clone(&iface), &mut heap)
        .marshal_to_bytes(pointer_pipe, &[Value::Pipe(PipeHandle::new(VecPipe::sending(Vec::new())))])
        .unwrap_err();
    assert!(matches!(err, NdrError::InvalidDescriptor { .. }));

    let value = Value::Struct(vec![
        Value::Long(1),
        Value::Pipe(PipeHandle::new(VecPipe::sending(longs(1)))),
    ]);
    let err = MachineState::new(iface, &mut heap)
        .marshal_to_bytes(embedded, &[value])
        .unwrap_err();
    assert!(matches!(err, NdrError::PipeMisuse(_)));
}

/// Test: oversized chunk counts are refused before any element is read
#[test]
fn test_chunk_count_limit() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, long_pipe())]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let sink = VecPipe::receiving();
    let mut out = vec![Value::Pipe(PipeHandle::new(sink.clone()))];
    let mut heap = Heap::new();
    let wire: Vec<u8> = vec![0xFF, 0xFF, 0, 0];
    let err = MachineState::new(iface, &mut heap)
        .with_config(InterpreterConfig::default().with_max_array_elements(1024))
        .unwrap()
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, wire.into())
        .unwrap_err();
    assert!(matches!(
        err,
        NdrError::AllocationLimitExceeded {
            requested: 65535,
            limit: 1024
        }
    ));
    assert!(sink.push_sizes().is_empty());
}
