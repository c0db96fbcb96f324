//! Fault Tests - malformed descriptors, malformed wire data, bad usage
//!
//! Each fault must surface as an `NdrError`, be latched as the state
//! block's first fault, and be classified into the right `FaultKind`.

mod common;

use std::sync::Arc;

use common::*;
use ndr_interp::builder::{ArraySpec, StructSpec, TypeSpec, TypeVecBuilder, UnionSpec};
use ndr_interp::opcode::IDL_BUG_1;
use ndr_interp::type_vec::{ContextDir, TypeDesc};
use ndr_interp::{
    DataRepresentation, FaultKind, FloatRep, Heap, Interface, InterpreterConfig, MachineState, NdrError, Opcode,
    ScalarKind, Side, TypeVector, Value, VecSink,
};

fn header_only() -> Vec<u8> {
    TypeVecBuilder::new().finish().unwrap().0
}

/// Test: type vector headers that must be refused
#[test]
fn test_header_rejections() {
    init_logging();

    let good = header_only();
    assert!(TypeVector::parse(good.clone()).is_ok());

    let mut version = good.clone();
    version[0] = 7;
    assert!(matches!(
        TypeVector::parse(version),
        Err(NdrError::VersionMismatch { major: 7, .. })
    ));

    let mut minor = good.clone();
    minor[2] = 11;
    assert!(matches!(
        TypeVector::parse(minor),
        Err(NdrError::VersionMismatch { minor: 11, .. })
    ));

    let mut int_rep = good.clone();
    int_rep[4] = 2;
    assert!(matches!(TypeVector::parse(int_rep), Err(NdrError::InvalidDescriptor { offset: 4, .. })));

    assert!(matches!(
        TypeVector::parse(good[..8].to_vec()),
        Err(NdrError::TruncatedTypeVector { .. })
    ));

    let err = TypeVecBuilder::new().with_bug_flags(IDL_BUG_1).build().unwrap_err();
    assert!(matches!(err, NdrError::UnsupportedBugCompat(flags) if flags == IDL_BUG_1));
    assert_eq!(err.kind(), FaultKind::Decode);
}

/// Test: an opcode byte outside the instruction set
#[test]
fn test_unknown_opcode() {
    init_logging();

    let (mut bytes, offsets) = TypeVecBuilder::new().finish().unwrap();
    let at = bytes.len();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&[17, Opcode::Eol.byte()]);
    let iface = Arc::new(Interface::new(TypeVector::parse(bytes).unwrap(), offsets));

    let mut heap = Heap::new();
    let mut state = MachineState::new(iface, &mut heap);
    let err = state.marshal_to_bytes(at, &[Value::Long(0)]).unwrap_err();
    assert!(matches!(err, NdrError::UnknownOpcode { opcode: 17, .. }), "{err}");
    assert_eq!(state.status(), Some(FaultKind::Decode));
}

/// Test: recognised but unimplemented descriptors
#[test]
fn test_unsupported_descriptor() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, TypeSpec::Opcode(Opcode::CsType))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut heap = Heap::new();
    let err = MachineState::new(iface, &mut heap)
        .marshal_to_bytes(op, &[Value::Void])
        .unwrap_err();
    assert!(matches!(err, NdrError::Unsupported(byte) if byte == Opcode::CsType.byte()));
    assert_eq!(err.kind(), FaultKind::Usage);
}

/// Test: a discriminant with no arm and no default
#[test]
fn test_union_without_matching_arm() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let union = UnionSpec::encapsulated(ScalarKind::Long).arm(1, TypeSpec::Scalar(ScalarKind::Short));
    let op = b.param_list(&[(0, TypeSpec::Union(union))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut heap = Heap::new();
    let value = Value::Union {
        switch: 3,
        arm: Box::new(Value::Short(1)),
    };
    let mut client = MachineState::new(Arc::clone(&iface), &mut heap);
    let mut sink = VecSink::new();
    let err = client.marshal(op, &[value], &mut sink).unwrap_err();
    assert!(matches!(err, NdrError::NoMatchingArm(3)));
    assert_eq!(client.status(), Some(FaultKind::Structural));
    assert!(sink.chunks().is_empty());

    let mut server = Heap::new();
    let mut out = vec![Value::Void];
    let err = MachineState::new(iface, &mut server)
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, vec![3, 0, 0, 0, 1, 0].into())
        .unwrap_err();
    assert!(matches!(err, NdrError::NoMatchingArm(3)));
}

/// Test: wire data that ends early
#[test]
fn test_truncated_wire_data() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (0, TypeSpec::Scalar(ScalarKind::Long)),
            (1, TypeSpec::Scalar(ScalarKind::Hyper)),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut heap = Heap::new();
    let mut out = vec![Value::Void, Value::Void];
    let mut state = MachineState::new(iface, &mut heap).with_side(Side::Server);
    let err = state
        .unmarshal_from_bytes(op, &mut out, vec![1, 0, 0, 0, 0, 0, 0, 0, 2, 0].into())
        .unwrap_err();
    assert!(matches!(err, NdrError::BufferUnderflow { needed: 8, have: 2 }), "{err}");
    assert_eq!(state.status(), Some(FaultKind::Resource));
    assert_eq!(out, vec![Value::Void, Value::Void]);
}

/// Test: array counts beyond the configured ceiling
#[test]
fn test_array_element_limit() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (0, TypeSpec::Scalar(ScalarKind::Long)),
            (1, TypeSpec::Array(ArraySpec::conformant(0, TypeSpec::Scalar(ScalarKind::Byte)))),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut heap = Heap::new();
    let mut out = vec![Value::Void, Value::Void];
    let wire: Vec<u8> = vec![0, 0, 0, 1, 0, 0, 0, 1];
    let err = MachineState::new(iface, &mut heap)
        .with_config(InterpreterConfig::default().with_max_array_elements(4096))
        .unwrap()
        .with_side(Side::Server)
        .unmarshal_from_bytes(op, &mut out, wire.into())
        .unwrap_err();
    assert!(matches!(err, NdrError::AllocationLimitExceeded { limit: 4096, .. }), "{err}");
    assert_eq!(err.kind(), FaultKind::Resource);
}

/// Test: a struct whose only member is itself nests until the depth limit
#[test]
fn test_self_containing_struct() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let leaf = b.add_struct(StructSpec::new(vec![TypeSpec::Scalar(ScalarKind::Long)]));
    let outer = b.add_struct(StructSpec::new(vec![TypeSpec::Struct(leaf)]));
    let op = b.param_list(&[(0, TypeSpec::Struct(outer))]).unwrap();
    let (mut bytes, offsets) = b.finish().unwrap();

    // Point the outer struct's member back at the outer struct
    let tv = TypeVector::parse(bytes.clone()).unwrap();
    let params = tv.param_list(op).unwrap();
    let TypeDesc::Struct { defn: outer_at, .. } = params[0].desc.ty else {
        panic!("expected a struct parameter");
    };
    let member = tv.struct_defn(outer_at).unwrap().fields[0].offset;
    let at = (member + 2 + 3) & !3;
    bytes[at..at + 4].copy_from_slice(&(outer_at as u32).to_le_bytes());
    let iface = Arc::new(Interface::new(TypeVector::parse(bytes).unwrap(), offsets));

    let mut value = Value::Long(1);
    for _ in 0..16 {
        value = Value::Struct(vec![value]);
    }
    let mut heap = Heap::new();
    let mut client = MachineState::new(Arc::clone(&iface), &mut heap)
        .with_config(InterpreterConfig::default().with_max_nesting_depth(8))
        .unwrap();
    let err = client.marshal_to_bytes(op, &[value]).unwrap_err();
    assert!(matches!(err, NdrError::NestingTooDeep { limit: 8, .. }), "{err}");
    assert_eq!(client.status(), Some(FaultKind::Decode));

    // Nothing on the wire is consumed, only the limit ends the walk
    let mut server = Heap::new();
    let mut out = vec![Value::Void];
    let mut state = MachineState::new(iface, &mut server).with_side(Side::Server);
    let err = state.unmarshal_from_bytes(op, &mut out, vec![0; 8].into()).unwrap_err();
    assert!(matches!(err, NdrError::NestingTooDeep { limit: 64, .. }), "{err}");
    assert_eq!(state.status(), Some(FaultKind::Decode));
    assert_eq!(out, vec![Value::Void]);
}

/// Test: a varying array sending few of many elements cannot force a large
/// zero fill
#[test]
fn test_partial_array_fill_limit() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b
        .param_list(&[
            (0, TypeSpec::Scalar(ScalarKind::Long)),
            (1, TypeSpec::Scalar(ScalarKind::Long)),
            (2, TypeSpec::Array(ArraySpec::open(0, 1, TypeSpec::Scalar(ScalarKind::Byte)))),
        ])
        .unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut wire = Vec::new();
    for word in [1000u32, 1, 1000, 0, 1] {
        wire.extend_from_slice(&word.to_le_bytes());
    }
    wire.push(0xAB);

    let mut heap = Heap::new();
    let mut out = vec![Value::Void, Value::Void, Value::Void];
    let mut state = MachineState::new(iface, &mut heap)
        .with_config(InterpreterConfig::default().with_max_zero_fill(16))
        .unwrap()
        .with_side(Side::Server);
    let err = state.unmarshal_from_bytes(op, &mut out, wire.into()).unwrap_err();
    assert!(
        matches!(err, NdrError::AllocationLimitExceeded { requested: 999, limit: 16 }),
        "{err}"
    );
    assert_eq!(state.status(), Some(FaultKind::Resource));
}

/// Test: configuration is validated when attached to a state block
#[test]
fn test_invalid_config() {
    init_logging();

    let iface = Arc::new(TypeVecBuilder::new().interface().unwrap());
    let mut heap = Heap::new();
    for config in [
        InterpreterConfig::default().with_buffer_size(12),
        InterpreterConfig::default().with_buffer_size(0),
        InterpreterConfig::default().with_iovector_size(0),
    ] {
        assert!(matches!(
            MachineState::new(Arc::clone(&iface), &mut heap).with_config(config),
            Err(NdrError::InvalidConfig(_))
        ));
    }
}

/// Test: context handles need a registry
#[test]
fn test_missing_context_registry() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(0, TypeSpec::Context(ContextDir::Out))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut heap = Heap::new();
    let err = MachineState::new(iface, &mut heap)
        .with_side(Side::Server)
        .marshal_to_bytes(op, &[Value::Context(None)])
        .unwrap_err();
    assert!(matches!(err, NdrError::MissingContextRegistry));
}

/// Test: non-IEEE floating point is refused when a float is met, not before
#[test]
fn test_unsupported_float_representation() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let ints = b.param_list(&[(0, TypeSpec::Scalar(ScalarKind::Long))]).unwrap();
    let floats = b.param_list(&[(0, TypeSpec::Scalar(ScalarKind::Double))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut drep = DataRepresentation::ndr();
    drep.float_rep = FloatRep::Vax;
    let mut heap = Heap::new();
    let mut state = MachineState::new(iface, &mut heap).with_drep(drep);

    assert!(state.marshal_to_bytes(ints, &[Value::Long(1)]).is_ok());
    assert_eq!(state.status(), None);

    let err = state.marshal_to_bytes(floats, &[Value::Double(1.0)]).unwrap_err();
    assert!(matches!(err, NdrError::UnsupportedFloatRep(FloatRep::Vax)));
    assert_eq!(state.status(), Some(FaultKind::Representation));

    // First fault wins
    let err = state.marshal_to_bytes(ints, &[Value::Void]).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Structural);
    assert_eq!(state.status(), Some(FaultKind::Representation));
}

/// Test: parameter list naming a parameter the caller did not pass
#[test]
fn test_parameter_index_out_of_range() {
    init_logging();

    let mut b = TypeVecBuilder::new();
    let op = b.param_list(&[(3, TypeSpec::Scalar(ScalarKind::Long))]).unwrap();
    let iface = Arc::new(b.interface().unwrap());

    let mut heap = Heap::new();
    let err = MachineState::new(iface, &mut heap)
        .marshal_to_bytes(op, &[Value::Long(1)])
        .unwrap_err();
    assert!(matches!(err, NdrError::ParamIndex { index: 3, len: 1 }));
}
