//! Complex Types Tests - NDR encoding for aggregate data types
//!
//! These tests drive the interpreter with assembled type vectors and check
//! the exact wire layout of:
//! - Structures with mixed alignment, conformant and varying members
//! - Strings and wide strings
//! - Encapsulated and non-encapsulated unions
//! - Multi-dimensional arrays and nested structures
//! - Big-endian data representations and chunked transports
//! - `[transmit_as]` conversions and context handles

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use ndr_interp::builder::{ArraySpec, StructSpec, TypeSpec, TypeVecBuilder, UnionSpec};
use ndr_interp::type_vec::ContextDir;
use ndr_interp::{
    ChunkedSource, ContextRegistry, DataRepresentation, Heap, InterpreterConfig, Memory, MachineState, NdrError,
    ScalarKind, Side, TransmitAs, Value, VecSink, CONTEXT_HANDLE_SIZE,
};

fn scalar(kind: ScalarKind) -> TypeSpec {
    TypeSpec::Scalar(kind)
}

/// Test: fixed struct with members of every alignment
#[test]
fn test_mixed_alignment_struct() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let record = b.add_struct(StructSpec::new(vec![
        scalar(ScalarKind::Small),
        scalar(ScalarKind::Long),
        scalar(ScalarKind::Short),
        scalar(ScalarKind::Hyper),
    ]));
    let op = b.param_list(&[(0, TypeSpec::Struct(record))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Struct(vec![
        Value::Small(-1),
        Value::Long(0x0403_0201),
        Value::Short(0x0605),
        Value::Hyper(0x0807_0605_0403_0201),
    ]);
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();

    let mut expected = vec![0xFF, 0, 0, 0, 1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0];
    expected.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(&rt.wire[..], &expected[..]);
    assert_eq!(rt.params[0], value);
    println!("Mixed alignment struct: {} bytes", rt.wire.len());
}

/// Test: conformant struct hoists its array's size ahead of the body
#[test]
fn test_conformant_struct() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let counted = b.add_struct(StructSpec::new(vec![
        scalar(ScalarKind::Long),
        TypeSpec::Array(ArraySpec::conformant(0, scalar(ScalarKind::Short))),
    ]));
    let op = b.param_list(&[(0, TypeSpec::Struct(counted))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Struct(vec![
        Value::Long(3),
        Value::Array(vec![Value::Short(1), Value::Short(2), Value::Short(3)]),
    ]);
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[3, 0, 0, 0, 3, 0, 0, 0, 1, 0, 2, 0, 3, 0]);
    assert_eq!(rt.params[0], value);

    // An empty array still carries its conformance
    let empty = Value::Struct(vec![Value::Long(0), Value::Array(Vec::new())]);
    let rt = round_trip(&iface, op, &mut client, &[empty.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(rt.params[0], empty);
}

/// Test: conformance that disagrees with the size field is refused
#[test]
fn test_conformance_must_match_size_field() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let counted = b.add_struct(StructSpec::new(vec![
        scalar(ScalarKind::Long),
        TypeSpec::Array(ArraySpec::conformant(0, scalar(ScalarKind::Short))),
    ]));
    let op = b.param_list(&[(0, TypeSpec::Struct(counted))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    // max_count 5, n = 3
    let wire = vec![5, 0, 0, 0, 3, 0, 0, 0, 1, 0, 2, 0, 3, 0, 4, 0, 5, 0];
    let mut heap = Heap::new();
    let mut state = MachineState::new(iface, &mut heap).with_side(Side::Server);
    let mut out = vec![Value::Void];
    let err = state.unmarshal_from_bytes(op, &mut out, wire.into()).unwrap_err();
    assert!(matches!(err, NdrError::CorrelationMismatch { expected: 3, wire: 5 }), "{err}");
    assert_eq!(out[0], Value::Void);
}

/// Test: a struct ending in a conformant struct carries the inner array's
/// size ahead of the outermost body
#[test]
fn test_struct_ending_in_conformant_struct() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let inner = b.add_struct(StructSpec::new(vec![
        scalar(ScalarKind::Long),
        TypeSpec::Array(ArraySpec::conformant(0, scalar(ScalarKind::Short))),
    ]));
    let outer = b.add_struct(StructSpec::new(vec![scalar(ScalarKind::Short), TypeSpec::Struct(inner)]));
    let op = b.param_list(&[(0, TypeSpec::Struct(outer))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Struct(vec![
        Value::Short(7),
        Value::Struct(vec![
            Value::Long(2),
            Value::Array(vec![Value::Short(1), Value::Short(2)]),
        ]),
    ]);
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();
    // max_count, short and pad, n, elements
    assert_eq!(&rt.wire[..], &[2, 0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0, 1, 0, 2, 0]);
    assert_eq!(rt.params[0], value);

    // The hoisted count is still checked against the inner size field
    let wire = vec![5, 0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0, 1, 0, 2, 0, 3, 0, 4, 0, 5, 0];
    let mut heap = Heap::new();
    let mut out = vec![Value::Void];
    let err = MachineState::new(iface, &mut heap)
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, wire.into())
        .unwrap_err();
    assert!(matches!(err, NdrError::CorrelationMismatch { expected: 2, wire: 5 }), "{err}");
    assert_eq!(out[0], Value::Void);
}

/// Test: varying member transmits offset and length; untransmitted
/// elements come back zeroed
#[test]
fn test_varying_struct_member() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let partial = b.add_struct(StructSpec::new(vec![
        scalar(ScalarKind::Long),
        TypeSpec::Array(ArraySpec::varying(4, 0, scalar(ScalarKind::Long))),
    ]));
    let op = b.param_list(&[(0, TypeSpec::Struct(partial))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Struct(vec![
        Value::Long(2),
        Value::Array(vec![Value::Long(10), Value::Long(20), Value::Long(30), Value::Long(40)]),
    ]);
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value]).unwrap();
    assert_eq!(words(&rt.wire), vec![2, 0, 2, 10, 20]);
    assert_eq!(
        rt.params[0],
        Value::Struct(vec![
            Value::Long(2),
            Value::Array(vec![Value::Long(10), Value::Long(20), Value::Long(0), Value::Long(0)]),
        ])
    );
}

/// Test: narrow and wide strings carry their terminator on the wire only
#[test]
fn test_strings() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (0, TypeSpec::reference(TypeSpec::Array(ArraySpec::string(ScalarKind::Char)))),
            (1, TypeSpec::reference(TypeSpec::Array(ArraySpec::string(ScalarKind::UShort)))),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut client = Heap::new();
    let narrow = client.allocate(Value::string("hello")).unwrap();
    let wide = client.allocate(Value::wstring("hi")).unwrap();
    let rt = round_trip(&iface, op, &mut client, &[Value::Ptr(Some(narrow)), Value::Ptr(Some(wide))]).unwrap();

    let mut expected = vec![6, 0, 0, 0, 0, 0, 0, 0, 6, 0, 0, 0];
    expected.extend_from_slice(b"hello\0");
    expected.extend_from_slice(&[0, 0]);
    expected.extend_from_slice(&[3, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0]);
    expected.extend_from_slice(&[b'h', 0, b'i', 0, 0, 0]);
    assert_eq!(&rt.wire[..], &expected[..]);

    let texts: Vec<String> = rt
        .params
        .iter()
        .map(|p| match p {
            Value::Ptr(Some(node)) => rt.server_heap.load(*node).unwrap().to_text().unwrap(),
            other => panic!("expected pointer, got {:?}", other),
        })
        .collect();
    assert_eq!(texts, vec!["hello".to_string(), "hi".to_string()]);
}

/// Test: encapsulated union pads to its body alignment before the arm
#[test]
fn test_encapsulated_union() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let union = UnionSpec::encapsulated(ScalarKind::Short)
        .arm(1, scalar(ScalarKind::Long))
        .arm(2, scalar(ScalarKind::Double))
        .empty_default();
    let op = b.param_list(&[(0, TypeSpec::Union(union))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());
    let mut client = Heap::new();

    let long_arm = Value::Union {
        switch: 1,
        arm: Box::new(Value::Long(7)),
    };
    let rt = round_trip(&iface, op, &mut client, &[long_arm.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[1, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0]);
    assert_eq!(rt.params[0], long_arm);

    let double_arm = Value::Union {
        switch: 2,
        arm: Box::new(Value::Double(2.5)),
    };
    let rt = round_trip(&iface, op, &mut client, &[double_arm.clone()]).unwrap();
    assert_eq!(rt.wire.len(), 16);
    assert_eq!(rt.params[0], double_arm);

    let default_arm = Value::Union {
        switch: 5,
        arm: Box::new(Value::Void),
    };
    let rt = round_trip(&iface, op, &mut client, &[default_arm.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[5, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(rt.params[0], default_arm);
}

/// Test: an unlisted discriminant selects the default arm and its body
#[test]
fn test_union_default_arm_with_body() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let union = UnionSpec::encapsulated(ScalarKind::Long)
        .arm(1, scalar(ScalarKind::Short))
        .default_arm(scalar(ScalarKind::Long));
    let op = b.param_list(&[(0, TypeSpec::Union(union))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());
    let mut client = Heap::new();

    let listed = Value::Union {
        switch: 1,
        arm: Box::new(Value::Short(4)),
    };
    let rt = round_trip(&iface, op, &mut client, &[listed.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[1, 0, 0, 0, 4, 0]);
    assert_eq!(rt.params[0], listed);

    let unlisted = Value::Union {
        switch: 9,
        arm: Box::new(Value::Long(-3)),
    };
    let rt = round_trip(&iface, op, &mut client, &[unlisted.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[9, 0, 0, 0, 0xFD, 0xFF, 0xFF, 0xFF]);
    assert_eq!(rt.params[0], unlisted);
}

/// Test: non-encapsulated union switched by a sibling field
#[test]
fn test_non_encapsulated_union_in_struct() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let union = UnionSpec::non_encapsulated(ScalarKind::Short, 0)
        .arm(1, scalar(ScalarKind::Long))
        .arm(2, scalar(ScalarKind::Short));
    let tagged = b.add_struct(StructSpec::new(vec![scalar(ScalarKind::Short), TypeSpec::Union(union)]));
    let op = b.param_list(&[(0, TypeSpec::Struct(tagged))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());
    let mut client = Heap::new();

    let value = Value::Struct(vec![
        Value::Short(1),
        Value::Union {
            switch: 1,
            arm: Box::new(Value::Long(5)),
        },
    ]);
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[1, 0, 1, 0, 5, 0, 0, 0]);
    assert_eq!(rt.params[0], value);

    // Discriminant disagreeing with the switch field
    let wrong = Value::Struct(vec![
        Value::Short(2),
        Value::Union {
            switch: 1,
            arm: Box::new(Value::Long(5)),
        },
    ]);
    let err = round_trip(&iface, op, &mut client, &[wrong]).err().unwrap();
    assert!(matches!(err, NdrError::CorrelationMismatch { .. }), "{err}");
}

/// Test: two-dimensional fixed array flattened row-major
#[test]
fn test_two_dimensional_array() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let grid = ArraySpec::new(
        ndr_interp::type_vec::ArrayKind::Fixed,
        vec![
            ndr_interp::type_vec::BoundPairRecord::fixed_len(2),
            ndr_interp::type_vec::BoundPairRecord::fixed_len(3),
        ],
        Vec::new(),
        scalar(ScalarKind::Short),
    );
    let op = b.param_list(&[(0, TypeSpec::Array(grid))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Array((1..=6).map(Value::Short).collect());
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0]);
    assert_eq!(rt.params[0], value);
}

/// Test: nested struct aligned to its widest member
#[test]
fn test_nested_struct() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let inner = StructSpec::new(vec![scalar(ScalarKind::Byte), scalar(ScalarKind::Double)]);
    let outer = b.add_struct(StructSpec::new(vec![scalar(ScalarKind::Short), TypeSpec::Nested(inner)]));
    let op = b.param_list(&[(0, TypeSpec::Struct(outer))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Struct(vec![
        Value::Short(9),
        Value::Struct(vec![Value::Byte(1), Value::Double(1.0)]),
    ]);
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();
    // short, pad to 8, byte, pad to 16, double
    assert_eq!(rt.wire.len(), 24);
    assert_eq!(&rt.wire[..2], &[9, 0]);
    assert_eq!(rt.wire[8], 1);
    assert_eq!(&rt.wire[16..], &1.0f64.to_le_bytes());
    assert_eq!(rt.params[0], value);
}

/// Test: host struct layout differs from wire field order
#[test]
fn test_offset_vector_reorders_fields() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let swapped = b.add_struct(
        StructSpec::new(vec![scalar(ScalarKind::Long), scalar(ScalarKind::Short)]).with_host_slots(vec![1, 0]),
    );
    let op = b.param_list(&[(0, TypeSpec::Struct(swapped))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let value = Value::Struct(vec![Value::Short(2), Value::Long(1)]);
    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[value.clone()]).unwrap();
    assert_eq!(&rt.wire[..], &[1, 0, 0, 0, 2, 0]);
    assert_eq!(rt.params[0], value);
}

/// Test: big-endian vector and big-endian drep
#[test]
fn test_big_endian_round_trip() {
    init_logging();

    let build = |mut b: TypeVecBuilder| {
        let counted = b.add_struct(StructSpec::new(vec![
            scalar(ScalarKind::Long),
            TypeSpec::Array(ArraySpec::conformant(0, scalar(ScalarKind::Short))),
        ]));
        let op = b
            .param_list(&[(0, scalar(ScalarKind::Long)), (1, TypeSpec::Struct(counted))])
            .unwrap();
        (Arc::new(b.interface().unwrap()), op)
    };
    let (le_iface, le_op) = build(TypeVecBuilder::new());
    let (be_iface, be_op) = build(TypeVecBuilder::big_endian());

    let params = [
        Value::Long(0x0102_0304),
        Value::Struct(vec![Value::Long(2), Value::Array(vec![Value::Short(0x0A0B), Value::Short(0x0C0D)])]),
    ];

    // Both vectors describe the same wire form
    let mut heap = Heap::new();
    let from_le = MachineState::new(le_iface, &mut heap).marshal_to_bytes(le_op, &params).unwrap();
    let from_be = MachineState::new(Arc::clone(&be_iface), &mut heap)
        .marshal_to_bytes(be_op, &params)
        .unwrap();
    assert_eq!(from_le, from_be);

    let wire = MachineState::new(Arc::clone(&be_iface), &mut heap)
        .with_drep(DataRepresentation::big_endian())
        .marshal_to_bytes(be_op, &params)
        .unwrap();
    assert_eq!(&wire[..4], &[1, 2, 3, 4]);
    assert_eq!(&wire[4..16], &[0, 0, 0, 2, 0, 0, 0, 2, 0x0A, 0x0B, 0x0C, 0x0D]);

    let mut server = Heap::new();
    let mut out = vec![Value::Void, Value::Void];
    MachineState::new(be_iface, &mut server)
        .with_drep(DataRepresentation::big_endian())
        .with_side(Side::Server)
        .unmarshal_from_bytes(be_op, &mut out, wire)
        .unwrap();
    assert_eq!(out, params.to_vec());
}

/// Test: a range check applies to its own scalar only
#[test]
fn test_range_resets_after_scalar() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (
                0,
                TypeSpec::Range {
                    kind: ScalarKind::Long,
                    lower: 0,
                    upper: 10,
                },
            ),
            (1, scalar(ScalarKind::Long)),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[Value::Long(5), Value::Long(1000)]).unwrap();
    assert_eq!(rt.params, vec![Value::Long(5), Value::Long(1000)]);

    // Marshal does not check the range; the receiver does
    let err = round_trip(&iface, op, &mut client, &[Value::Long(11), Value::Long(0)])
        .err()
        .unwrap();
    assert!(matches!(
        err,
        NdrError::RangeViolation {
            value: 11,
            lower: 0,
            upper: 10
        }
    ));
}

/// Test: small chunks on both ends leave the byte stream unchanged
#[test]
fn test_chunk_boundaries() {
    init_logging();

    const COUNT: i32 = 100;

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (0, scalar(ScalarKind::Long)),
            (1, TypeSpec::Array(ArraySpec::conformant(0, scalar(ScalarKind::Long)))),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let params = [
        Value::Long(COUNT),
        Value::Array((0..COUNT).map(|i| Value::Long(i * 3)).collect()),
    ];
    let mut heap = Heap::new();
    let contiguous = MachineState::new(Arc::clone(&iface), &mut heap)
        .marshal_to_bytes(op, &params)
        .unwrap();
    assert_eq!(contiguous.len(), 8 + 4 * COUNT as usize);

    let config = InterpreterConfig::default().with_buffer_size(64).with_iovector_size(2);
    let mut sink = VecSink::new();
    let written = MachineState::new(Arc::clone(&iface), &mut heap)
        .with_config(config)
        .unwrap()
        .marshal(op, &params, &mut sink)
        .unwrap();
    assert_eq!(written, contiguous.len());
    assert!(sink.chunks().len() > 1);
    assert!(sink.chunks().iter().all(|c| c.len() <= 64));
    assert!(sink.transmits() > 1);
    assert_eq!(sink.released(), 0);
    println!(
        "Chunked marshal: {} chunks in {} transmits",
        sink.chunks().len(),
        sink.transmits()
    );
    let chunked = sink.into_bytes();
    assert_eq!(chunked, contiguous);

    let mut server = Heap::new();
    let mut out = vec![Value::Void, Value::Void];
    let mut source = ChunkedSource::with_chunk_size(chunked, 3);
    MachineState::new(iface, &mut server)
        .with_side(Side::Server)
        .unmarshal(op, &mut out, &mut source)
        .unwrap();
    assert_eq!(out, params.to_vec());
}

/// Presented as a double, transmitted as thousandths in a long
struct Millis {
    xmit_freed: AtomicUsize,
}

impl TransmitAs for Millis {
    fn to_xmit(&self, local: &Value) -> ndr_interp::Result<Value> {
        match local {
            Value::Double(d) => Ok(Value::Long((d * 1000.0).round() as i32)),
            other => Err(NdrError::RoutineFailed {
                index: 0,
                reason: format!("cannot transmit {}", other.kind_name()),
            }),
        }
    }

    fn from_xmit(&self, xmit: &Value) -> ndr_interp::Result<Value> {
        match xmit {
            Value::Long(l) => Ok(Value::Double(f64::from(*l) / 1000.0)),
            other => Err(NdrError::RoutineFailed {
                index: 0,
                reason: format!("cannot present {}", other.kind_name()),
            }),
        }
    }

    fn free_xmit(&self, _xmit: Value) {
        self.xmit_freed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test: transmit_as converts through the routine vector
#[test]
fn test_transmit_as_round_trip() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[(
            0,
            TypeSpec::TransmitAs {
                routine: 0,
                xmit: Box::new(scalar(ScalarKind::Long)),
            },
        )])
        .unwrap();
    let routine = Arc::new(Millis {
        xmit_freed: AtomicUsize::new(0),
    });
    let iface = Arc::new(b.interface().unwrap().with_routine(routine.clone()));

    let mut client = Heap::new();
    let rt = round_trip(&iface, op, &mut client, &[Value::Double(1.5)]).unwrap();
    assert_eq!(&rt.wire[..], &1500i32.to_le_bytes());
    assert_eq!(rt.params[0], Value::Double(1.5));
    assert_eq!(routine.xmit_freed.load(Ordering::SeqCst), 2);

    let err = round_trip(&iface, op, &mut client, &[Value::Long(1)]).err().unwrap();
    assert!(matches!(err, NdrError::RoutineFailed { index: 0, .. }));
}

/// Test: context handle created by the server, used, then closed
#[test]
fn test_context_handle_lifecycle() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let open = b.param_list(&[(0, TypeSpec::Context(ContextDir::Out))]).unwrap();
    let use_op = b.param_list(&[(0, TypeSpec::Context(ContextDir::In))]).unwrap();
    let close = b.param_list(&[(0, TypeSpec::Context(ContextDir::InOut))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let server_contexts = Arc::new(ContextRegistry::new());
    let client_contexts = Arc::new(ContextRegistry::new());
    let mut server_heap = Heap::new();
    let mut client_heap = Heap::new();

    // open: server mints the context and returns it
    let server_local = server_contexts.create();
    let token = server_contexts.token(server_local).unwrap();
    let wire = MachineState::new(Arc::clone(&iface), &mut server_heap)
        .with_side(Side::Server)
        .with_contexts(Arc::clone(&server_contexts))
        .marshal_to_bytes(open, &[Value::Context(Some(server_local))])
        .unwrap();
    assert_eq!(wire.len(), CONTEXT_HANDLE_SIZE);
    assert_eq!(&wire[..4], &[0, 0, 0, 0]);
    assert_eq!(&wire[4..8], &token.as_fields().0.to_le_bytes());

    let mut client_param = vec![Value::Context(None)];
    MachineState::new(Arc::clone(&iface), &mut client_heap)
        .with_contexts(Arc::clone(&client_contexts))
        .unmarshal_from_bytes(open, &mut client_param, wire)
        .unwrap();
    let Value::Context(Some(client_local)) = client_param[0] else {
        panic!("client did not receive a context: {:?}", client_param[0]);
    };
    assert_eq!(client_contexts.token(client_local), Some(token));

    // use: the client's handle resolves to the server's context
    let wire = MachineState::new(Arc::clone(&iface), &mut client_heap)
        .with_contexts(Arc::clone(&client_contexts))
        .marshal_to_bytes(use_op, &client_param)
        .unwrap();
    let mut server_param = vec![Value::Void];
    MachineState::new(Arc::clone(&iface), &mut server_heap)
        .with_side(Side::Server)
        .with_contexts(Arc::clone(&server_contexts))
        .unmarshal_from_bytes(use_op, &mut server_param, wire)
        .unwrap();
    assert_eq!(server_param[0], Value::Context(Some(server_local)));

    // close: the server returns a null handle and the client forgets it
    assert!(server_contexts.destroy(server_local));
    let wire = MachineState::new(Arc::clone(&iface), &mut server_heap)
        .with_side(Side::Server)
        .with_contexts(Arc::clone(&server_contexts))
        .marshal_to_bytes(close, &[Value::Context(None)])
        .unwrap();
    assert!(wire[4..].iter().all(|&b| b == 0));
    MachineState::new(Arc::clone(&iface), &mut client_heap)
        .with_contexts(Arc::clone(&client_contexts))
        .unmarshal_from_bytes(close, &mut client_param, wire.clone())
        .unwrap();
    assert_eq!(client_param[0], Value::Context(None));
    assert!(client_contexts.is_empty());
    assert!(server_contexts.is_empty());

    // A token the server never issued
    let stale = MachineState::new(Arc::clone(&iface), &mut client_heap)
        .with_contexts(Arc::clone(&client_contexts))
        .marshal_to_bytes(use_op, &[Value::Context(Some(client_contexts.adopt(token)))])
        .unwrap();
    let err = MachineState::new(iface, &mut server_heap)
        .with_side(Side::Server)
        .with_contexts(server_contexts)
        .unmarshal_from_bytes(use_op, &mut server_param, stale)
        .unwrap_err();
    assert!(matches!(err, NdrError::ContextMismatch(u) if u == token));
}
