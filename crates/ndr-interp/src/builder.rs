//! Type vector assembler
//!
//! Compiles a tree of `TypeSpec`s into a type vector and its offset vector,
//! the way an IDL compiler back end would. Structs are named by `StructId`
//! so a struct can point at itself; their definitions are laid down at
//! `finish` and every reference to them is patched then.
//!
//! ```
//! use ndr_interp::builder::{ArraySpec, StructSpec, TypeSpec, TypeVecBuilder};
//! use ndr_interp::ScalarKind;
//!
//! let mut b = TypeVecBuilder::new();
//! let counted = b.add_struct(StructSpec::new(vec![
//!     TypeSpec::Scalar(ScalarKind::Long),
//!     TypeSpec::Array(ArraySpec::conformant(0, TypeSpec::Scalar(ScalarKind::Short))),
//! ]));
//! let op = b.param_list(&[(0, TypeSpec::unique(TypeSpec::Struct(counted)))]).unwrap();
//! let iface = b.interface().unwrap();
//! assert!(iface.type_vec.param_list(op).is_ok());
//! ```

use tracing::trace;

use crate::opcode::{
    bound, limit, prop, Opcode, FILLER, IDL_INTERP_ENCODE_MAJOR, IDL_INTERP_ENCODE_MINOR, NO_CONF_ARRAY,
    UNION_OPTIONAL,
};
use crate::primitives::ScalarKind;
use crate::state::Interface;
use crate::type_vec::{ArrayKind, BoundPairRecord, BoundRecord, ContextDir, OffsetVector, PtrKind, TypeVector};
use crate::{NdrError, Result};

/// Struct declared in a builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(usize);

/// Fields of a struct in wire order
#[derive(Debug, Clone)]
pub struct StructSpec {
    pub fields: Vec<TypeSpec>,
    /// Host slot of each field; identity when absent
    pub host_slots: Option<Vec<u32>>,
}

impl StructSpec {
    pub fn new(fields: Vec<TypeSpec>) -> Self {
        Self {
            fields,
            host_slots: None,
        }
    }

    pub fn with_host_slots(mut self, slots: Vec<u32>) -> Self {
        self.host_slots = Some(slots);
        self
    }

    fn field_count(&self) -> usize {
        self.fields.iter().filter(|f| !matches!(f, TypeSpec::Align(_))).count()
    }

    fn last_field(&self) -> Option<&TypeSpec> {
        self.fields.iter().rev().find(|f| !matches!(f, TypeSpec::Align(_)))
    }
}

/// Where a laid-down struct's conformant array definition lives
#[derive(Debug, Clone, Copy)]
enum ConfArray {
    At(usize),
    Via(StructId),
}

/// Array shape and element
#[derive(Debug, Clone)]
pub struct ArraySpec {
    pub kind: ArrayKind,
    pub bounds: Vec<BoundPairRecord>,
    /// One pair per dimension for varying and open arrays
    pub limits: Vec<BoundPairRecord>,
    pub element: Box<TypeSpec>,
    pub string: bool,
    pub v1: bool,
}

impl ArraySpec {
    pub fn new(kind: ArrayKind, bounds: Vec<BoundPairRecord>, limits: Vec<BoundPairRecord>, element: TypeSpec) -> Self {
        Self {
            kind,
            bounds,
            limits,
            element: Box::new(element),
            string: false,
            v1: false,
        }
    }

    /// `T a[n]`
    pub fn fixed(n: u32, element: TypeSpec) -> Self {
        Self::new(ArrayKind::Fixed, vec![BoundPairRecord::fixed_len(n)], Vec::new(), element)
    }

    /// `[size_is(field)] T a[]`
    pub fn conformant(size_field: u32, element: TypeSpec) -> Self {
        let bounds = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::correlated(bound::SIZE_IS, size_field));
        Self::new(ArrayKind::Conformant, vec![bounds], Vec::new(), element)
    }

    /// `[length_is(field)] T a[n]`
    pub fn varying(n: u32, length_field: u32, element: TypeSpec) -> Self {
        let limits = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::correlated(limit::LENGTH_IS, length_field));
        Self::new(ArrayKind::Varying, vec![BoundPairRecord::fixed_len(n)], vec![limits], element)
    }

    /// `[size_is(s), length_is(l)] T a[]`
    pub fn open(size_field: u32, length_field: u32, element: TypeSpec) -> Self {
        let bounds = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::correlated(bound::SIZE_IS, size_field));
        let limits = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::correlated(limit::LENGTH_IS, length_field));
        Self::new(ArrayKind::Open, vec![bounds], vec![limits], element)
    }

    /// `[string] char *` or `[string] wchar_t *`
    pub fn string(char_kind: ScalarKind) -> Self {
        let size = char_kind.size() as u8;
        let bounds = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::string(size));
        let limits = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::string(size));
        let mut spec = Self::new(ArrayKind::Open, vec![bounds], vec![limits], TypeSpec::Scalar(char_kind));
        spec.string = true;
        spec
    }

    /// `[v1_string] char s[n]`
    pub fn v1_string(n: u32, char_kind: ScalarKind) -> Self {
        let size = char_kind.size() as u8;
        let limits = BoundPairRecord::new(BoundRecord::fixed(0), BoundRecord::string(size));
        let mut spec = Self::new(
            ArrayKind::Varying,
            vec![BoundPairRecord::fixed_len(n)],
            vec![limits],
            TypeSpec::Scalar(char_kind),
        );
        spec.string = true;
        spec.v1 = true;
        spec
    }

    /// 16-bit counts, no offset
    pub fn v1(mut self) -> Self {
        self.v1 = true;
        self
    }
}

/// Arm taken when no case matches
#[derive(Debug, Clone)]
pub enum DefaultArm {
    Missing,
    Empty,
    Arm(Box<TypeSpec>),
}

#[derive(Debug, Clone)]
pub struct UnionSpec {
    pub switch: ScalarKind,
    /// `switch_is` field for a non-encapsulated union
    pub switch_field: Option<u32>,
    /// Case value and arm; `None` is an empty arm
    pub arms: Vec<(u32, Option<TypeSpec>)>,
    pub default: DefaultArm,
    pub optional: bool,
}

impl UnionSpec {
    pub fn encapsulated(switch: ScalarKind) -> Self {
        Self {
            switch,
            switch_field: None,
            arms: Vec::new(),
            default: DefaultArm::Missing,
            optional: false,
        }
    }

    pub fn non_encapsulated(switch: ScalarKind, switch_field: u32) -> Self {
        Self {
            switch_field: Some(switch_field),
            ..Self::encapsulated(switch)
        }
    }

    pub fn arm(mut self, case: u32, spec: TypeSpec) -> Self {
        self.arms.push((case, Some(spec)));
        self
    }

    pub fn empty_arm(mut self, case: u32) -> Self {
        self.arms.push((case, None));
        self
    }

    pub fn default_arm(mut self, spec: TypeSpec) -> Self {
        self.default = DefaultArm::Arm(Box::new(spec));
        self
    }

    pub fn empty_default(mut self) -> Self {
        self.default = DefaultArm::Empty;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Type expression compiled by `TypeVecBuilder`
#[derive(Debug, Clone)]
pub enum TypeSpec {
    Scalar(ScalarKind),
    /// `[range(lower, upper)]` scalar
    Range { kind: ScalarKind, lower: u32, upper: u32 },
    Struct(StructId),
    Nested(StructSpec),
    Array(ArraySpec),
    Union(UnionSpec),
    Pointer(PtrKind, Box<TypeSpec>),
    Ignore,
    TransmitAs { routine: u32, xmit: Box<TypeSpec> },
    RepresentAs { routine: u32, xmit: Box<TypeSpec> },
    FreeRep { routine: u32, inner: Box<TypeSpec> },
    Pipe(Box<TypeSpec>),
    Context(ContextDir),
    Align(u8),
    DeletedNodes,
    Void,
    /// Bare opcode with no operands
    Opcode(Opcode),
}

impl TypeSpec {
    pub fn reference(pointee: TypeSpec) -> Self {
        TypeSpec::Pointer(PtrKind::Ref, Box::new(pointee))
    }

    pub fn unique(pointee: TypeSpec) -> Self {
        TypeSpec::Pointer(PtrKind::Unique, Box::new(pointee))
    }

    pub fn full(pointee: TypeSpec) -> Self {
        TypeSpec::Pointer(PtrKind::Full, Box::new(pointee))
    }
}

impl BoundRecord {
    /// Constant bound
    pub fn fixed(value: i32) -> Self {
        Self {
            kind: bound::FIXED,
            flags: 0,
            field_type: 0,
            fc: crate::opcode::fc::NONE,
            value: value as u32,
        }
    }

    /// Bound taken from field `field` of the enclosing scope
    pub fn correlated(kind: u8, field: u32) -> Self {
        Self {
            kind,
            flags: 0,
            field_type: Opcode::Long.byte(),
            fc: crate::opcode::fc::NONE,
            value: field,
        }
    }

    /// Bound computed from string content
    pub fn string(char_size: u8) -> Self {
        Self {
            kind: bound::STRING,
            flags: 0,
            field_type: char_size,
            fc: crate::opcode::fc::NONE,
            value: 0,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_fc(mut self, fc: u8) -> Self {
        self.fc = fc;
        self
    }
}

impl BoundPairRecord {
    pub fn new(lower: BoundRecord, upper: BoundRecord) -> Self {
        Self { lower, upper }
    }

    /// `[0, n-1]`
    pub fn fixed_len(n: u32) -> Self {
        Self::new(BoundRecord::fixed(0), BoundRecord::fixed(n as i32 - 1))
    }
}

/// Bytes of one record under construction. Appended to the vector at a
/// 4-byte boundary, so long operands align relative to the record start.
struct Segment {
    little_endian: bool,
    bytes: Vec<u8>,
    patches: Vec<(usize, StructId)>,
}

impl Segment {
    fn new(little_endian: bool) -> Self {
        Self {
            little_endian,
            bytes: Vec::new(),
            patches: Vec::new(),
        }
    }

    fn op(&mut self, op: Opcode) {
        self.bytes.push(op.byte());
    }

    fn byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn pad(&mut self) {
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(FILLER);
        }
    }

    fn long(&mut self, v: u32) {
        self.pad();
        let raw = if self.little_endian { v.to_le_bytes() } else { v.to_be_bytes() };
        self.bytes.extend_from_slice(&raw);
    }

    fn set_long(&mut self, at: usize, v: u32) {
        let raw = if self.little_endian { v.to_le_bytes() } else { v.to_be_bytes() };
        self.bytes[at..at + 4].copy_from_slice(&raw);
    }

    fn struct_ref(&mut self, id: StructId) {
        self.pad();
        self.patches.push((self.bytes.len(), id));
        self.bytes.extend_from_slice(&[0; 4]);
    }

    fn bound(&mut self, record: &BoundRecord) {
        self.byte(record.kind | record.flags);
        self.byte(record.field_type);
        self.byte(record.fc);
        self.byte(FILLER);
        self.long(record.value);
    }
}

const MAX_NESTING: usize = 64;

fn scalar_props(kind: ScalarKind) -> u8 {
    match kind {
        ScalarKind::Char => prop::DEP_CHAR,
        ScalarKind::Float | ScalarKind::Double => prop::DEP_FLOAT,
        k if k.size() > 1 => prop::DEP_INT,
        _ => 0,
    }
}

/// Assembles a type vector and its offset vector
#[derive(Debug)]
pub struct TypeVecBuilder {
    little_endian: bool,
    bug_flags: u32,
    bytes: Vec<u8>,
    offsets: Vec<u32>,
    structs: Vec<Option<StructSpec>>,
    queued: Vec<bool>,
    emitted: Vec<Option<usize>>,
    pending: Vec<StructId>,
    patches: Vec<(usize, StructId)>,
    conf_arrays: Vec<Option<ConfArray>>,
    /// Conformant array operands of structs that end with a conformant struct
    conf_patches: Vec<(usize, StructId)>,
}

impl Default for TypeVecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeVecBuilder {
    /// Builder for a little-endian vector
    pub fn new() -> Self {
        Self::with_byte_order(true)
    }

    /// Builder for a big-endian vector
    pub fn big_endian() -> Self {
        Self::with_byte_order(false)
    }

    fn with_byte_order(little_endian: bool) -> Self {
        let mut header = Segment::new(little_endian);
        let (major, minor) = if little_endian {
            (IDL_INTERP_ENCODE_MAJOR.to_le_bytes(), IDL_INTERP_ENCODE_MINOR.to_le_bytes())
        } else {
            (IDL_INTERP_ENCODE_MAJOR.to_be_bytes(), IDL_INTERP_ENCODE_MINOR.to_be_bytes())
        };
        header.bytes.extend_from_slice(&major);
        header.bytes.extend_from_slice(&minor);
        header.byte(u8::from(little_endian));
        header.bytes.extend_from_slice(&[FILLER; 3]);
        header.long(0);
        Self {
            little_endian,
            bug_flags: 0,
            bytes: header.bytes,
            offsets: Vec::new(),
            structs: Vec::new(),
            queued: Vec::new(),
            emitted: Vec::new(),
            pending: Vec::new(),
            patches: Vec::new(),
            conf_arrays: Vec::new(),
            conf_patches: Vec::new(),
        }
    }

    /// Request legacy bug-compatible layouts in the header
    pub fn with_bug_flags(mut self, flags: u32) -> Self {
        self.bug_flags = flags;
        self
    }

    /// Reserve an id for a struct defined later, for self-referencing types
    pub fn declare_struct(&mut self) -> StructId {
        self.structs.push(None);
        self.queued.push(false);
        self.emitted.push(None);
        self.conf_arrays.push(None);
        StructId(self.structs.len() - 1)
    }

    pub fn define_struct(&mut self, id: StructId, spec: StructSpec) {
        self.structs[id.0] = Some(spec);
    }

    pub fn add_struct(&mut self, spec: StructSpec) -> StructId {
        let id = self.declare_struct();
        self.define_struct(id, spec);
        id
    }

    /// Append a parameter list of `(parameter index, type)` pairs and
    /// return its offset
    pub fn param_list(&mut self, params: &[(u32, TypeSpec)]) -> Result<usize> {
        let mut seg = Segment::new(self.little_endian);
        seg.long(params.len() as u32);
        for (index, spec) in params {
            seg.long(*index);
            self.write_desc(&mut seg, spec, 0)?;
            seg.op(Opcode::Eol);
        }
        Ok(self.emit(seg))
    }

    /// Append a standalone stream (one descriptor and `EOL`)
    pub fn stream(&mut self, spec: &TypeSpec) -> Result<usize> {
        self.emit_stream(spec, 0)
    }

    /// Lay down pending struct definitions, patch references and return the
    /// raw vector with its offset vector
    pub fn finish(mut self) -> Result<(Vec<u8>, OffsetVector)> {
        while let Some(id) = self.pending.pop() {
            let at = self.emit_struct(id)?;
            self.emitted[id.0] = Some(at);
        }
        for (pos, id) in std::mem::take(&mut self.patches) {
            let at = self.emitted[id.0].ok_or(self.error("struct referenced but never laid down"))?;
            self.set_long(pos, at as u32);
        }
        for (pos, id) in std::mem::take(&mut self.conf_patches) {
            let at = self.resolve_conf_array(id)?;
            self.set_long(pos, at as u32);
        }
        let flags = if self.little_endian {
            self.bug_flags.to_le_bytes()
        } else {
            self.bug_flags.to_be_bytes()
        };
        self.bytes[8..12].copy_from_slice(&flags);
        trace!("type vector assembled: {} bytes, {} offset entries", self.bytes.len(), self.offsets.len());
        Ok((self.bytes, OffsetVector::new(self.offsets)))
    }

    pub fn build(self) -> Result<(TypeVector, OffsetVector)> {
        let (bytes, offsets) = self.finish()?;
        Ok((TypeVector::parse(bytes)?, offsets))
    }

    pub fn interface(self) -> Result<Interface> {
        let (type_vec, offsets) = self.build()?;
        Ok(Interface::new(type_vec, offsets))
    }

    fn set_long(&mut self, pos: usize, v: u32) {
        let raw = if self.little_endian { v.to_le_bytes() } else { v.to_be_bytes() };
        self.bytes[pos..pos + 4].copy_from_slice(&raw);
    }

    /// Array definition a conformant struct ends with, through the chain of
    /// conformant structs that end it
    fn resolve_conf_array(&self, mut id: StructId) -> Result<usize> {
        for _ in 0..=self.structs.len() {
            match self.conf_arrays[id.0] {
                Some(ConfArray::At(at)) => return Ok(at),
                Some(ConfArray::Via(inner)) => id = inner,
                None => return Err(self.error("conformant struct without a conformant array")),
            }
        }
        Err(self.error("struct contains itself by value"))
    }

    /// Conformant array ending `spec`, directly or through trailing
    /// conformant structs
    fn trailing_array(&self, spec: &StructSpec) -> Result<Option<ArraySpec>> {
        let mut level = spec.clone();
        for _ in 0..MAX_NESTING {
            let inner = match level.last_field() {
                Some(TypeSpec::Array(a)) if a.kind.is_conformant() => return Ok(Some(a.clone())),
                Some(TypeSpec::Struct(id)) => *id,
                _ => return Ok(None),
            };
            level = self.struct_spec(inner)?;
        }
        Err(self.error("struct contains itself by value"))
    }

    fn error(&self, reason: &'static str) -> NdrError {
        NdrError::InvalidDescriptor {
            offset: self.bytes.len(),
            reason,
        }
    }

    fn emit(&mut self, seg: Segment) -> usize {
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(FILLER);
        }
        let at = self.bytes.len();
        self.bytes.extend_from_slice(&seg.bytes);
        self.patches.extend(seg.patches.into_iter().map(|(pos, id)| (at + pos, id)));
        at
    }

    fn struct_spec(&self, id: StructId) -> Result<StructSpec> {
        self.structs
            .get(id.0)
            .cloned()
            .flatten()
            .ok_or(self.error("struct used before it was defined"))
    }

    fn queue(&mut self, id: StructId) {
        if !self.queued[id.0] {
            self.queued[id.0] = true;
            self.pending.push(id);
        }
    }

    fn offset_entry(&mut self, spec: &StructSpec) -> Result<u32> {
        let count = spec.field_count();
        let slots: Vec<u32> = match &spec.host_slots {
            Some(slots) if slots.len() == count && slots.iter().all(|&s| (s as usize) < count) => slots.clone(),
            Some(_) => return Err(self.error("host slots do not cover the struct's fields")),
            None => (0..count as u32).collect(),
        };
        let index = self.offsets.len() as u32;
        self.offsets.push(count as u32);
        self.offsets.extend(slots);
        Ok(index)
    }

    fn align_of(&self, spec: &TypeSpec, depth: usize) -> Result<u8> {
        if depth > MAX_NESTING {
            return Err(self.error("struct contains itself by value"));
        }
        Ok(match spec {
            TypeSpec::Scalar(kind) | TypeSpec::Range { kind, .. } => kind.align() as u8,
            TypeSpec::Struct(id) => self.fields_align(&self.struct_spec(*id)?, depth + 1)?,
            TypeSpec::Nested(s) => self.fields_align(s, depth + 1)?,
            TypeSpec::Array(a) => {
                let element = self.align_of(&a.element, depth + 1)?;
                if a.kind.is_varying() {
                    element.max(if a.v1 { 2 } else { 4 })
                } else {
                    element
                }
            }
            TypeSpec::Union(u) => (u.switch.align() as u8).max(self.body_align(u, depth + 1)?),
            TypeSpec::TransmitAs { xmit, .. } | TypeSpec::RepresentAs { xmit, .. } => self.align_of(xmit, depth + 1)?,
            TypeSpec::FreeRep { inner, .. } => self.align_of(inner, depth + 1)?,
            TypeSpec::Pointer(..)
            | TypeSpec::Ignore
            | TypeSpec::Pipe(_)
            | TypeSpec::Context(_)
            | TypeSpec::DeletedNodes => 4,
            TypeSpec::Align(_) | TypeSpec::Void | TypeSpec::Opcode(_) => 1,
        })
    }

    fn fields_align(&self, spec: &StructSpec, depth: usize) -> Result<u8> {
        let mut align = 1;
        for field in &spec.fields {
            align = align.max(self.align_of(field, depth)?);
        }
        Ok(align)
    }

    fn body_align(&self, spec: &UnionSpec, depth: usize) -> Result<u8> {
        let mut align = 1;
        for arm in spec.arms.iter().filter_map(|(_, arm)| arm.as_ref()) {
            align = align.max(self.align_of(arm, depth)?);
        }
        if let DefaultArm::Arm(arm) = &spec.default {
            align = align.max(self.align_of(arm, depth)?);
        }
        Ok(align)
    }

    fn props_of(&self, spec: &TypeSpec, depth: usize) -> Result<u8> {
        if depth > MAX_NESTING {
            return Err(self.error("struct contains itself by value"));
        }
        let fields = |s: &StructSpec| -> Result<u8> {
            s.fields
                .iter()
                .try_fold(0, |acc, f| Ok(acc | self.props_of(f, depth + 1)?))
        };
        Ok(match spec {
            TypeSpec::Scalar(kind) | TypeSpec::Range { kind, .. } => scalar_props(*kind),
            TypeSpec::Struct(id) => fields(&self.struct_spec(*id)?)?,
            TypeSpec::Nested(s) => fields(s)?,
            TypeSpec::Array(a) => {
                let counts = if a.kind == ArrayKind::Fixed { 0 } else { prop::DEP_INT };
                self.props_of(&a.element, depth + 1)? | counts
            }
            TypeSpec::Union(u) => {
                let mut props = scalar_props(u.switch);
                for arm in u.arms.iter().filter_map(|(_, arm)| arm.as_ref()) {
                    props |= self.props_of(arm, depth + 1)?;
                }
                if let DefaultArm::Arm(arm) = &u.default {
                    props |= self.props_of(arm, depth + 1)?;
                }
                props
            }
            TypeSpec::Pointer(..) | TypeSpec::Ignore => prop::HAS_PTRS | prop::DEP_INT,
            TypeSpec::TransmitAs { xmit, .. } | TypeSpec::RepresentAs { xmit, .. } => self.props_of(xmit, depth + 1)?,
            TypeSpec::FreeRep { inner, .. } => self.props_of(inner, depth + 1)?,
            TypeSpec::Pipe(element) => self.props_of(element, depth + 1)? | prop::DEP_INT,
            TypeSpec::Context(_) | TypeSpec::DeletedNodes => prop::DEP_INT,
            TypeSpec::Align(_) | TypeSpec::Void | TypeSpec::Opcode(_) => 0,
        })
    }

    /// Write one descriptor; returns the array definition it references,
    /// if it is an array
    fn write_desc(&mut self, seg: &mut Segment, spec: &TypeSpec, depth: usize) -> Result<Option<usize>> {
        if depth > MAX_NESTING {
            return Err(self.error("type nests too deeply"));
        }
        match spec {
            TypeSpec::Scalar(kind) => seg.op(kind.opcode()),
            TypeSpec::Range { kind, lower, upper } => {
                seg.op(Opcode::Range);
                seg.long(*lower);
                seg.long(*upper);
                seg.op(kind.opcode());
            }
            TypeSpec::Struct(id) => {
                let s = self.struct_spec(*id)?;
                let op = match self.trailing_array(&s)? {
                    None => Opcode::FixedStruct,
                    Some(a) if a.v1 => Opcode::V1ConfStruct,
                    Some(_) => Opcode::ConfStruct,
                };
                seg.op(op);
                seg.byte(self.props_of(spec, depth)?);
                seg.struct_ref(*id);
                self.queue(*id);
            }
            TypeSpec::Nested(s) => {
                let align = self.align_of(spec, depth)?;
                let index = self.offset_entry(s)?;
                seg.op(Opcode::BeginNestedStruct);
                seg.byte(align);
                seg.long(index);
                for field in &s.fields {
                    self.write_desc(seg, field, depth + 1)?;
                }
                seg.op(Opcode::EndNestedStruct);
            }
            TypeSpec::Array(a) => {
                let props = self.props_of(spec, depth)?;
                let defn = self.emit_array(a, depth + 1)?;
                match (a.string, a.v1) {
                    (true, true) => seg.op(Opcode::V1String),
                    (true, false) => seg.op(Opcode::String),
                    (false, true) => seg.op(Opcode::V1Array),
                    (false, false) => {}
                }
                seg.op(match a.kind {
                    ArrayKind::Fixed => Opcode::FixedArray,
                    ArrayKind::Varying => Opcode::VaryingArray,
                    ArrayKind::Conformant => Opcode::ConfArray,
                    ArrayKind::Open => Opcode::OpenArray,
                });
                seg.byte(props);
                seg.byte(a.bounds.len() as u8);
                seg.long(defn as u32);
                return Ok(Some(defn));
            }
            TypeSpec::Union(u) => {
                let props = self.props_of(spec, depth)?;
                let defn = self.emit_union(u, depth + 1)?;
                match u.switch_field {
                    None => {
                        seg.op(Opcode::EncUnion);
                        seg.byte(props);
                    }
                    Some(field) => {
                        seg.op(Opcode::NeUnion);
                        seg.byte(props);
                        seg.long(field);
                    }
                }
                seg.long(defn as u32);
            }
            TypeSpec::Pointer(kind, pointee) => {
                let props = self.props_of(pointee, depth + 1)?;
                let at = self.emit_stream(pointee, depth + 1)?;
                seg.op(match kind {
                    PtrKind::Ref => Opcode::RefPtr,
                    PtrKind::Unique => Opcode::UniquePtr,
                    PtrKind::Full => Opcode::FullPtr,
                });
                seg.byte(props);
                seg.long(at as u32);
            }
            TypeSpec::TransmitAs { routine, xmit } | TypeSpec::RepresentAs { routine, xmit } => {
                let props = self.props_of(xmit, depth + 1)?;
                let at = self.emit_stream(xmit, depth + 1)?;
                seg.op(match spec {
                    TypeSpec::TransmitAs { .. } => Opcode::TransmitAs,
                    _ => Opcode::RepresentAs,
                });
                seg.byte(props);
                seg.long(*routine);
                seg.long(at as u32);
            }
            TypeSpec::FreeRep { routine, inner } => {
                seg.op(Opcode::FreeRep);
                seg.long(*routine);
                return self.write_desc(seg, inner, depth + 1);
            }
            TypeSpec::Pipe(element) => {
                let props = self.props_of(element, depth + 1)?;
                let at = self.emit_stream(element, depth + 1)?;
                seg.op(Opcode::Pipe);
                seg.byte(props);
                seg.long(at as u32);
            }
            TypeSpec::Ignore => seg.op(Opcode::Ignore),
            TypeSpec::Context(dir) => seg.op(match dir {
                ContextDir::In => Opcode::InContext,
                ContextDir::InOut => Opcode::InOutContext,
                ContextDir::Out => Opcode::OutContext,
            }),
            TypeSpec::Align(n) => seg.op(match n {
                2 => Opcode::NdrAlign2,
                4 => Opcode::NdrAlign4,
                8 => Opcode::NdrAlign8,
                _ => return Err(self.error("alignment marker must be 2, 4 or 8")),
            }),
            TypeSpec::DeletedNodes => seg.op(Opcode::DeletedNodes),
            TypeSpec::Void => seg.op(Opcode::Void),
            TypeSpec::Opcode(op) => seg.op(*op),
        }
        Ok(None)
    }

    fn emit_stream(&mut self, spec: &TypeSpec, depth: usize) -> Result<usize> {
        let mut seg = Segment::new(self.little_endian);
        self.write_desc(&mut seg, spec, depth)?;
        seg.op(Opcode::Eol);
        Ok(self.emit(seg))
    }

    fn emit_struct(&mut self, id: StructId) -> Result<usize> {
        let spec = self.struct_spec(id)?;
        let as_field = TypeSpec::Struct(id);
        let mut seg = Segment::new(self.little_endian);
        seg.byte(self.align_of(&as_field, 0)?);
        seg.byte(self.props_of(&as_field, 0)?);
        seg.byte(FILLER);
        seg.byte(FILLER);
        seg.long(self.offset_entry(&spec)?);
        seg.long(NO_CONF_ARRAY);
        let conf_at = seg.bytes.len() - 4;
        let conformant = self.trailing_array(&spec)?.is_some();
        let mut last_array = None;
        for field in &spec.fields {
            if let Some(defn) = self.write_desc(&mut seg, field, 1)? {
                last_array = Some(defn);
            }
        }
        let mut via = None;
        if conformant {
            match spec.last_field() {
                // Known once the inner struct is laid down
                Some(TypeSpec::Struct(inner)) => via = Some(*inner),
                _ => {
                    let defn = last_array.ok_or(self.error("conformant array missing"))?;
                    seg.set_long(conf_at, defn as u32);
                    self.conf_arrays[id.0] = Some(ConfArray::At(defn));
                }
            }
        }
        seg.op(Opcode::Eol);
        let at = self.emit(seg);
        if let Some(inner) = via {
            self.conf_arrays[id.0] = Some(ConfArray::Via(inner));
            self.conf_patches.push((at + conf_at, inner));
        }
        Ok(at)
    }

    fn emit_array(&mut self, spec: &ArraySpec, depth: usize) -> Result<usize> {
        let dims = spec.bounds.len();
        if dims == 0 || dims > usize::from(u8::MAX) {
            return Err(self.error("array needs between 1 and 255 dimensions"));
        }
        if spec.kind.is_varying() && spec.limits.len() != dims {
            return Err(self.error("varying array needs one limit pair per dimension"));
        }
        let mut seg = Segment::new(self.little_endian);
        seg.byte(dims as u8);
        seg.bytes.extend_from_slice(&[FILLER; 3]);
        for pair in &spec.bounds {
            seg.bound(&pair.lower);
            seg.bound(&pair.upper);
        }
        if spec.kind.is_varying() {
            for pair in &spec.limits {
                seg.bound(&pair.lower);
                seg.bound(&pair.upper);
            }
        }
        self.write_desc(&mut seg, &spec.element, depth)?;
        seg.op(Opcode::Eol);
        Ok(self.emit(seg))
    }

    fn emit_union(&mut self, spec: &UnionSpec, depth: usize) -> Result<usize> {
        if !spec.switch.is_integral() {
            return Err(self.error("union discriminant must be an integral scalar"));
        }
        let body_align = self.body_align(spec, depth)?;
        let mut arms = Vec::with_capacity(spec.arms.len() + 1);
        for (case, arm) in &spec.arms {
            arms.push((*case, self.arm_record(arm.as_ref(), Opcode::Void, depth)?));
        }
        let default = match &spec.default {
            DefaultArm::Missing => self.arm_record(None, Opcode::DoesNotExist, depth)?,
            DefaultArm::Empty => self.arm_record(None, Opcode::Void, depth)?,
            DefaultArm::Arm(arm) => self.arm_record(Some(arm), Opcode::Void, depth)?,
        };

        let mut seg = Segment::new(self.little_endian);
        seg.op(spec.switch.opcode());
        seg.byte(if spec.optional { UNION_OPTIONAL } else { 0 });
        seg.byte(body_align);
        seg.byte(FILLER);
        seg.long(spec.arms.len() as u32);
        for (case, (ty, props, at)) in arms.into_iter().chain(std::iter::once((0, default))) {
            seg.long(case);
            seg.byte(ty);
            seg.byte(props);
            seg.byte(FILLER);
            seg.byte(FILLER);
            seg.long(at);
            seg.long(0);
        }
        Ok(self.emit(seg))
    }

    /// Arm type byte, properties and stream offset of one arm
    fn arm_record(&mut self, arm: Option<&TypeSpec>, absent: Opcode, depth: usize) -> Result<(u8, u8, u32)> {
        match arm {
            None => Ok((absent.byte(), 0, 0)),
            Some(spec) => {
                let props = self.props_of(spec, depth)?;
                let at = self.emit_stream(spec, depth)?;
                Ok((self.bytes[at], props, at as u32))
            }
        }
    }
}
