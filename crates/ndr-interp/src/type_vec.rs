//! Type vector decoder
//!
//! A type vector is immutable bytecode shared by every operation on an
//! interface. The decoder turns the bytes at a given offset into typed
//! records (`Descriptor`, `StructDefn`, `ArrayDefn`, `UnionDefn`) without
//! ever modifying the vector. Long operands are read in the vector's own
//! integer representation, which is independent of the data's drep.

use std::sync::Arc;

use crate::context::NdrContext;
use crate::opcode::{
    self, cf, Opcode, IDL_DATA_LIMIT_PAIR_WIDTH, IDL_INTERP_ENCODE_MAJOR, IDL_INTERP_ENCODE_MINOR,
    IDL_UNION_ARM_DESC_WIDTH, NO_CONF_ARRAY, TVEC_BUG_FLAGS_OFFSET, TVEC_HEADER_SIZE,
    TVEC_INT_REP_OFFSET, UNION_OPTIONAL,
};
use crate::primitives::ScalarKind;
use crate::{NdrError, Result};

/// Validated, shareable type vector
#[derive(Debug, Clone)]
pub struct TypeVector {
    bytes: Arc<[u8]>,
    ctx: NdrContext,
    minor: u16,
    bug_flags: u32,
}

impl TypeVector {
    /// Validate the header and wrap the vector.
    ///
    /// Vectors that ask for any legacy bug-compatible wire layout are
    /// refused rather than silently marshalled in the corrected layout.
    pub fn parse(bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < TVEC_HEADER_SIZE {
            return Err(NdrError::TruncatedTypeVector {
                offset: 0,
                needed: TVEC_HEADER_SIZE,
            });
        }
        let little_endian = match bytes[TVEC_INT_REP_OFFSET] {
            0 => false,
            1 => true,
            _ => {
                return Err(NdrError::InvalidDescriptor {
                    offset: TVEC_INT_REP_OFFSET,
                    reason: "integer representation must be 0 or 1",
                })
            }
        };
        let ctx = NdrContext::with_byte_order(little_endian);
        let major = ctx.u16_from_bytes([bytes[0], bytes[1]]);
        let minor = ctx.u16_from_bytes([bytes[2], bytes[3]]);
        if major != IDL_INTERP_ENCODE_MAJOR || minor > IDL_INTERP_ENCODE_MINOR {
            return Err(NdrError::VersionMismatch { major, minor });
        }
        let o = TVEC_BUG_FLAGS_OFFSET;
        let bug_flags = ctx.u32_from_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        if bug_flags != 0 {
            return Err(NdrError::UnsupportedBugCompat(bug_flags));
        }
        Ok(Self {
            bytes,
            ctx,
            minor,
            bug_flags,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= TVEC_HEADER_SIZE
    }

    /// Integer representation of the vector itself
    pub fn is_little_endian(&self) -> bool {
        self.ctx.little_endian
    }

    pub fn minor_version(&self) -> u16 {
        self.minor
    }

    pub fn bug_flags(&self) -> u32 {
        self.bug_flags
    }

    pub fn cursor(&self, offset: usize) -> DefnCursor<'_> {
        DefnCursor {
            tv: self,
            pos: offset,
        }
    }

    /// One descriptor followed by `EOL`
    pub fn stream(&self, offset: usize) -> Result<Descriptor> {
        let mut cursor = self.cursor(offset);
        match cursor.read_descriptor()? {
            Some(desc) => {
                cursor.expect_eol()?;
                Ok(desc)
            }
            None => Err(NdrError::InvalidDescriptor {
                offset,
                reason: "empty type stream",
            }),
        }
    }

    pub fn param_list(&self, offset: usize) -> Result<Vec<Param>> {
        let mut cursor = self.cursor(offset);
        let count = cursor.read_long()?;
        let mut params = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            let index = cursor.read_long()?;
            let at = cursor.pos;
            let desc = cursor.read_descriptor()?.ok_or(NdrError::InvalidDescriptor {
                offset: at,
                reason: "parameter without a descriptor",
            })?;
            cursor.expect_eol()?;
            params.push(Param { index, desc });
        }
        Ok(params)
    }

    pub fn struct_defn(&self, offset: usize) -> Result<StructDefn> {
        let mut cursor = self.cursor(offset);
        let align = cursor.read_byte()?;
        let props = cursor.read_byte()?;
        cursor.skip(2)?;
        let offset_index = cursor.read_long()?;
        let conf = cursor.read_long()?;
        let fields = cursor.read_fields(None)?;
        Ok(StructDefn {
            offset,
            align: check_align(align, offset)?,
            props,
            offset_index,
            conf_array: (conf != NO_CONF_ARRAY).then_some(conf as usize),
            fields,
        })
    }

    pub fn array_defn(&self, offset: usize, varying: bool) -> Result<ArrayDefn> {
        let mut cursor = self.cursor(offset);
        let dims = cursor.read_byte()?;
        if dims == 0 {
            return Err(NdrError::InvalidDescriptor {
                offset,
                reason: "array with zero dimensions",
            });
        }
        cursor.skip(3)?;
        let mut bounds = Vec::with_capacity(dims as usize);
        for _ in 0..dims {
            bounds.push(cursor.read_pair()?);
        }
        let mut limits = Vec::new();
        if varying {
            for _ in 0..dims {
                limits.push(cursor.read_pair()?);
            }
        }
        let at = cursor.pos;
        let element = cursor.read_descriptor()?.ok_or(NdrError::InvalidDescriptor {
            offset: at,
            reason: "array without an element type",
        })?;
        cursor.expect_eol()?;
        Ok(ArrayDefn {
            offset,
            dims,
            bounds,
            limits,
            element: Box::new(element),
        })
    }

    pub fn union_defn(&self, offset: usize) -> Result<UnionDefn> {
        let mut cursor = self.cursor(offset);
        let switch_op = cursor.read_opcode()?;
        let switch_kind = ScalarKind::from_opcode(switch_op)
            .filter(|k| k.is_integral())
            .ok_or(NdrError::InvalidDescriptor {
                offset,
                reason: "union discriminant is not an integral scalar",
            })?;
        let flags = cursor.read_byte()?;
        let body_align = cursor.read_byte()?;
        cursor.skip(1)?;
        let count = cursor.read_long()?;
        let arms_at = cursor.pos;
        let needed = (count as usize)
            .checked_add(1)
            .and_then(|n| n.checked_mul(IDL_UNION_ARM_DESC_WIDTH))
            .ok_or(NdrError::IntegerOverflow)?;
        if arms_at + needed > self.bytes.len() {
            return Err(NdrError::TruncatedTypeVector {
                offset: arms_at,
                needed,
            });
        }
        Ok(UnionDefn {
            offset,
            switch_kind,
            optional: flags & UNION_OPTIONAL != 0,
            body_align: check_align(body_align, offset)?,
            arm_count: count,
            arms_at,
        })
    }

    /// Linear scan of the arm records for `switch`, falling back to the
    /// default record.
    pub fn find_arm(&self, defn: &UnionDefn, switch: i64) -> Result<Option<Arm>> {
        for i in 0..defn.arm_count as usize {
            let arm = self.arm_record(defn, defn.arms_at + i * IDL_UNION_ARM_DESC_WIDTH)?;
            if defn.switch_kind.normalize(arm.switch) == switch {
                return Ok(Some(arm));
            }
        }
        let default_at = defn.arms_at + defn.arm_count as usize * IDL_UNION_ARM_DESC_WIDTH;
        let default = self.arm_record(defn, default_at)?;
        if default.body == ArmBody::DoesNotExist {
            return Ok(None);
        }
        Ok(Some(default))
    }

    fn arm_record(&self, _defn: &UnionDefn, at: usize) -> Result<Arm> {
        let mut cursor = self.cursor(at);
        let switch = cursor.read_long()?;
        let arm_op = cursor.read_opcode()?;
        let props = cursor.read_byte()?;
        cursor.skip(2)?;
        let stream = cursor.read_long()?;
        let _reserved = cursor.read_long()?;
        let body = match arm_op {
            Opcode::Void => ArmBody::Empty,
            Opcode::DoesNotExist => ArmBody::DoesNotExist,
            _ => ArmBody::Stream(stream as usize),
        };
        Ok(Arm {
            switch,
            props,
            body,
        })
    }
}

fn check_align(align: u8, offset: usize) -> Result<u8> {
    match align {
        1 | 2 | 4 | 8 => Ok(align),
        _ => Err(NdrError::InvalidDescriptor {
            offset,
            reason: "alignment must be 1, 2, 4 or 8",
        }),
    }
}

/// Read position inside a type vector
#[derive(Debug, Clone)]
pub struct DefnCursor<'a> {
    tv: &'a TypeVector,
    pos: usize,
}

impl<'a> DefnCursor<'a> {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let b = *self
            .tv
            .bytes
            .get(self.pos)
            .ok_or(NdrError::TruncatedTypeVector {
                offset: self.pos,
                needed: 1,
            })?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.tv.bytes.len() {
            return Err(NdrError::TruncatedTypeVector {
                offset: self.pos,
                needed: n,
            });
        }
        self.pos += n;
        Ok(())
    }

    /// Aligned 32-bit operand in the vector's own byte order
    pub fn read_long(&mut self) -> Result<u32> {
        self.pos += NdrContext::align_padding(self.pos, 4);
        let bytes = self
            .tv
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or(NdrError::TruncatedTypeVector {
                offset: self.pos,
                needed: 4,
            })?;
        let value = self.tv.ctx.u32_from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.pos += 4;
        Ok(value)
    }

    pub fn read_opcode(&mut self) -> Result<Opcode> {
        let offset = self.pos;
        let b = self.read_byte()?;
        Opcode::from_byte(b).ok_or(NdrError::UnknownOpcode { opcode: b, offset })
    }

    fn expect_eol(&mut self) -> Result<()> {
        let offset = self.pos;
        match self.read_opcode()? {
            Opcode::Eol => Ok(()),
            _ => Err(NdrError::InvalidDescriptor {
                offset,
                reason: "expected end of list",
            }),
        }
    }

    fn read_bound(&mut self) -> Result<BoundRecord> {
        let kind = self.read_byte()?;
        let field_type = self.read_byte()?;
        let fc = self.read_byte()?;
        self.skip(1)?;
        let value = self.read_long()?;
        Ok(BoundRecord {
            kind: kind & cf::KIND_MASK,
            flags: kind & !cf::KIND_MASK,
            field_type,
            fc,
            value,
        })
    }

    fn read_pair(&mut self) -> Result<BoundPairRecord> {
        let start = self.pos;
        let lower = self.read_bound()?;
        let upper = self.read_bound()?;
        debug_assert_eq!(self.pos - start, IDL_DATA_LIMIT_PAIR_WIDTH);
        Ok(BoundPairRecord { lower, upper })
    }

    /// Field descriptors up to `EOL` (or `END_NESTED_STRUCT` when `nested`)
    fn read_fields(&mut self, nested: Option<usize>) -> Result<Vec<Descriptor>> {
        let mut fields = Vec::new();
        loop {
            let at = self.pos;
            let b = *self.tv.bytes.get(at).ok_or(NdrError::TruncatedTypeVector {
                offset: at,
                needed: 1,
            })?;
            if b == Opcode::EndNestedStruct.byte() {
                if nested.is_none() {
                    return Err(NdrError::InvalidDescriptor {
                        offset: at,
                        reason: "unbalanced end of nested struct",
                    });
                }
                self.pos += 1;
                return Ok(fields);
            }
            match self.read_descriptor()? {
                Some(desc) => fields.push(desc),
                None if nested.is_some() => {
                    return Err(NdrError::InvalidDescriptor {
                        offset: at,
                        reason: "nested struct not closed",
                    })
                }
                None => return Ok(fields),
            }
        }
    }

    /// Next descriptor with its prefix modifiers; `None` at `EOL`
    pub fn read_descriptor(&mut self) -> Result<Option<Descriptor>> {
        let offset = self.pos;
        let mut modifiers = Modifiers::default();
        loop {
            let op_at = self.pos;
            let op = self.read_opcode()?;
            let ty = match op {
                Opcode::Eol => {
                    if modifiers != Modifiers::default() {
                        return Err(NdrError::InvalidDescriptor {
                            offset: op_at,
                            reason: "modifier without a descriptor",
                        });
                    }
                    return Ok(None);
                }
                Opcode::String => {
                    modifiers.string = true;
                    continue;
                }
                Opcode::V1Array => {
                    modifiers.v1_array = true;
                    continue;
                }
                Opcode::V1String => {
                    modifiers.v1_string = true;
                    continue;
                }
                Opcode::PassedByRef => {
                    modifiers.passed_by_ref = true;
                    continue;
                }
                Opcode::Allocate => {
                    modifiers.allocate = true;
                    continue;
                }
                Opcode::AllocateRef => {
                    modifiers.allocate_ref = true;
                    continue;
                }
                Opcode::Range => {
                    let lower = self.read_long()?;
                    let upper = self.read_long()?;
                    modifiers.range = Some((lower, upper));
                    continue;
                }
                Opcode::FreeRep => {
                    modifiers.free_rep = Some(self.read_long()?);
                    continue;
                }
                Opcode::FixedStruct | Opcode::ConfStruct | Opcode::V1ConfStruct => {
                    let props = self.read_byte()?;
                    let defn = self.read_long()? as usize;
                    let kind = match op {
                        Opcode::FixedStruct => StructKind::Fixed,
                        Opcode::ConfStruct => StructKind::Conformant,
                        _ => StructKind::V1Conformant,
                    };
                    TypeDesc::Struct { kind, props, defn }
                }
                Opcode::BeginNestedStruct => {
                    let align = check_align(self.read_byte()?, op_at)?;
                    let offset_index = self.read_long()?;
                    let fields = self.read_fields(Some(op_at))?;
                    TypeDesc::NestedStruct {
                        align,
                        offset_index,
                        fields,
                    }
                }
                Opcode::FixedArray | Opcode::VaryingArray | Opcode::ConfArray | Opcode::OpenArray => {
                    let props = self.read_byte()?;
                    let dims = self.read_byte()?;
                    let defn = self.read_long()? as usize;
                    let kind = match op {
                        Opcode::FixedArray => ArrayKind::Fixed,
                        Opcode::VaryingArray => ArrayKind::Varying,
                        Opcode::ConfArray => ArrayKind::Conformant,
                        _ => ArrayKind::Open,
                    };
                    TypeDesc::Array {
                        kind,
                        props,
                        dims,
                        defn,
                    }
                }
                Opcode::EncUnion => {
                    let props = self.read_byte()?;
                    let defn = self.read_long()? as usize;
                    TypeDesc::EncUnion { props, defn }
                }
                Opcode::NeUnion => {
                    let props = self.read_byte()?;
                    let switch_field = self.read_long()?;
                    let defn = self.read_long()? as usize;
                    TypeDesc::NeUnion {
                        props,
                        switch_field,
                        defn,
                    }
                }
                Opcode::FullPtr | Opcode::UniquePtr | Opcode::RefPtr => {
                    let props = self.read_byte()?;
                    let pointee = self.read_long()? as usize;
                    let kind = match op {
                        Opcode::FullPtr => PtrKind::Full,
                        Opcode::UniquePtr => PtrKind::Unique,
                        _ => PtrKind::Ref,
                    };
                    TypeDesc::Pointer {
                        kind,
                        props,
                        pointee,
                    }
                }
                Opcode::Ignore => TypeDesc::Ignore,
                Opcode::TransmitAs | Opcode::RepresentAs => {
                    let props = self.read_byte()?;
                    let routine = self.read_long()?;
                    let xmit = self.read_long()? as usize;
                    TypeDesc::Xmit {
                        represent: op == Opcode::RepresentAs,
                        props,
                        routine,
                        xmit,
                    }
                }
                Opcode::Pipe => {
                    let props = self.read_byte()?;
                    let element = self.read_long()? as usize;
                    TypeDesc::Pipe { props, element }
                }
                Opcode::InContext => TypeDesc::Context(ContextDir::In),
                Opcode::InOutContext => TypeDesc::Context(ContextDir::InOut),
                Opcode::OutContext => TypeDesc::Context(ContextDir::Out),
                Opcode::NdrAlign2 => TypeDesc::Align(2),
                Opcode::NdrAlign4 => TypeDesc::Align(4),
                Opcode::NdrAlign8 => TypeDesc::Align(8),
                Opcode::DeletedNodes => TypeDesc::DeletedNodes,
                Opcode::Void => TypeDesc::Void,
                Opcode::DoesNotExist | Opcode::EndNestedStruct => {
                    return Err(NdrError::InvalidDescriptor {
                        offset: op_at,
                        reason: "marker where a descriptor was expected",
                    })
                }
                Opcode::Null
                | Opcode::CsType
                | Opcode::CsShadow
                | Opcode::CsArray
                | Opcode::CsAttribute
                | Opcode::CsRlseShadow
                | Opcode::Interface
                | Opcode::DynInterface
                | Opcode::OrpcInterface => TypeDesc::Unsupported(op),
                scalar => match ScalarKind::from_opcode(scalar) {
                    Some(kind) => TypeDesc::Scalar(kind),
                    None => {
                        return Err(NdrError::UnknownOpcode {
                            opcode: scalar.byte(),
                            offset: op_at,
                        })
                    }
                },
            };
            return Ok(Some(Descriptor {
                offset,
                modifiers,
                ty,
            }));
        }
    }
}

/// Prefix modifiers collected ahead of a descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub string: bool,
    pub v1_array: bool,
    pub v1_string: bool,
    pub passed_by_ref: bool,
    pub allocate: bool,
    pub allocate_ref: bool,
    /// Raw `[range]` operands; widened per the scalar they apply to
    pub range: Option<(u32, u32)>,
    pub free_rep: Option<u32>,
}

impl Modifiers {
    pub fn is_string(&self) -> bool {
        self.string || self.v1_string
    }

    /// Counts travel as 16-bit values without an offset
    pub fn is_v1(&self) -> bool {
        self.v1_array || self.v1_string
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructKind {
    Fixed,
    Conformant,
    V1Conformant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    Fixed,
    Varying,
    Conformant,
    Open,
}

impl ArrayKind {
    pub fn is_conformant(self) -> bool {
        matches!(self, ArrayKind::Conformant | ArrayKind::Open)
    }

    pub fn is_varying(self) -> bool {
        matches!(self, ArrayKind::Varying | ArrayKind::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrKind {
    Ref,
    Unique,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextDir {
    In,
    InOut,
    Out,
}

/// Decoded type descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    Scalar(ScalarKind),
    Struct {
        kind: StructKind,
        props: u8,
        defn: usize,
    },
    NestedStruct {
        align: u8,
        offset_index: u32,
        fields: Vec<Descriptor>,
    },
    Array {
        kind: ArrayKind,
        props: u8,
        dims: u8,
        defn: usize,
    },
    EncUnion {
        props: u8,
        defn: usize,
    },
    NeUnion {
        props: u8,
        switch_field: u32,
        defn: usize,
    },
    Pointer {
        kind: PtrKind,
        props: u8,
        pointee: usize,
    },
    Ignore,
    Xmit {
        represent: bool,
        props: u8,
        routine: u32,
        xmit: usize,
    },
    Pipe {
        props: u8,
        element: usize,
    },
    Context(ContextDir),
    Align(u8),
    DeletedNodes,
    Void,
    Unsupported(Opcode),
}

/// A descriptor and the modifiers that prefix it
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Offset of the first modifier or opcode byte
    pub offset: usize,
    pub modifiers: Modifiers,
    pub ty: TypeDesc,
}

impl Descriptor {
    /// Whether this descriptor occupies a field slot in its struct
    pub fn is_field(&self) -> bool {
        !matches!(self.ty, TypeDesc::Align(_))
    }

    pub fn has_ptrs(&self) -> bool {
        match self.ty {
            TypeDesc::Pointer { .. } | TypeDesc::Ignore => true,
            TypeDesc::Struct { props, .. }
            | TypeDesc::Array { props, .. }
            | TypeDesc::EncUnion { props, .. }
            | TypeDesc::NeUnion { props, .. }
            | TypeDesc::Xmit { props, .. } => props & opcode::prop::HAS_PTRS != 0,
            TypeDesc::NestedStruct { ref fields, .. } => fields.iter().any(Descriptor::has_ptrs),
            _ => false,
        }
    }
}

/// One parameter of an operation's parameter list
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub index: u32,
    pub desc: Descriptor,
}

/// Struct definition record
#[derive(Debug, Clone, PartialEq)]
pub struct StructDefn {
    pub offset: usize,
    pub align: u8,
    pub props: u8,
    pub offset_index: u32,
    /// Definition of the trailing conformant array, if any
    pub conf_array: Option<usize>,
    pub fields: Vec<Descriptor>,
}

/// One bound or data-limit record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundRecord {
    pub kind: u8,
    /// Correlation flags (`cf::*`)
    pub flags: u8,
    /// Scalar opcode of the correlated field, or char size for strings
    pub field_type: u8,
    pub fc: u8,
    /// Fixed bound, or index of the correlated field
    pub value: u32,
}

impl BoundRecord {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPairRecord {
    pub lower: BoundRecord,
    pub upper: BoundRecord,
}

/// Array definition record
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDefn {
    pub offset: usize,
    pub dims: u8,
    pub bounds: Vec<BoundPairRecord>,
    /// Empty unless the array is varying or open
    pub limits: Vec<BoundPairRecord>,
    pub element: Box<Descriptor>,
}

/// Union definition record; arms are scanned lazily
#[derive(Debug, Clone, PartialEq)]
pub struct UnionDefn {
    pub offset: usize,
    pub switch_kind: ScalarKind,
    pub optional: bool,
    pub body_align: u8,
    pub arm_count: u32,
    arms_at: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmBody {
    Empty,
    DoesNotExist,
    Stream(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm {
    pub switch: u32,
    pub props: u8,
    pub body: ArmBody,
}

/// Host layout table: at a struct's index, the field count followed by the
/// host slot of each wire field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetVector(pub Vec<u32>);

impl OffsetVector {
    pub fn new(entries: Vec<u32>) -> Self {
        Self(entries)
    }

    /// Number of host slots of the struct at `index`
    pub fn field_count(&self, index: u32) -> Result<usize> {
        self.0
            .get(index as usize)
            .map(|&n| n as usize)
            .ok_or(NdrError::InvalidDescriptor {
                offset: index as usize,
                reason: "offset vector index out of range",
            })
    }

    /// Host slot holding logical field `field` of the struct at `index`
    pub fn slot(&self, index: u32, field: usize) -> Result<usize> {
        let count = self.field_count(index)?;
        if field >= count {
            return Err(NdrError::InvalidDescriptor {
                offset: index as usize,
                reason: "struct has more fields than its offset vector entry",
            });
        }
        let slot = self
            .0
            .get(index as usize + 1 + field)
            .map(|&s| s as usize)
            .ok_or(NdrError::InvalidDescriptor {
                offset: index as usize,
                reason: "offset vector truncated",
            })?;
        if slot >= count {
            return Err(NdrError::InvalidDescriptor {
                offset: index as usize,
                reason: "host slot outside struct",
            });
        }
        Ok(slot)
    }
}
