//! Type vector opcode byte values and operand constants.
//!
//! Numbering follows the DCE IDL interpreter so vectors produced by existing
//! compilers keep their meaning.

/// One-byte type vector opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Null = 0,
    Boolean = 1,
    Byte = 2,
    Char = 3,
    Double = 4,
    Enum = 5,
    Float = 6,
    Small = 7,
    Short = 8,
    Long = 9,
    Hyper = 10,
    USmall = 11,
    UShort = 12,
    ULong = 13,
    UHyper = 14,
    FixedStruct = 15,
    ConfStruct = 16,
    BeginNestedStruct = 18,
    EndNestedStruct = 19,
    FixedArray = 20,
    VaryingArray = 21,
    ConfArray = 22,
    OpenArray = 23,
    EncUnion = 24,
    NeUnion = 25,
    DoesNotExist = 26,
    Void = 27,
    PassedByRef = 28,
    FullPtr = 29,
    UniquePtr = 30,
    RefPtr = 31,
    Ignore = 32,
    String = 33,
    TransmitAs = 34,
    RepresentAs = 35,
    Allocate = 36,
    AllocateRef = 37,
    NdrAlign2 = 38,
    NdrAlign4 = 39,
    NdrAlign8 = 40,
    Pipe = 41,
    InContext = 42,
    InOutContext = 43,
    OutContext = 44,
    V1Enum = 45,
    V1Array = 46,
    V1String = 47,
    V1ConfStruct = 48,
    FreeRep = 49,
    ErrorStatus = 50,
    DeletedNodes = 51,
    CsType = 52,
    CsShadow = 53,
    CsArray = 54,
    CsAttribute = 55,
    CsRlseShadow = 56,
    Interface = 57,
    DynInterface = 58,
    OrpcInterface = 59,
    Range = 60,
    Eol = 254,
}

impl Opcode {
    /// Returns the opcode byte value.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Parses an opcode from its byte value.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        use Opcode::*;
        Some(match b {
            0 => Null,
            1 => Boolean,
            2 => Byte,
            3 => Char,
            4 => Double,
            5 => Enum,
            6 => Float,
            7 => Small,
            8 => Short,
            9 => Long,
            10 => Hyper,
            11 => USmall,
            12 => UShort,
            13 => ULong,
            14 => UHyper,
            15 => FixedStruct,
            16 => ConfStruct,
            18 => BeginNestedStruct,
            19 => EndNestedStruct,
            20 => FixedArray,
            21 => VaryingArray,
            22 => ConfArray,
            23 => OpenArray,
            24 => EncUnion,
            25 => NeUnion,
            26 => DoesNotExist,
            27 => Void,
            28 => PassedByRef,
            29 => FullPtr,
            30 => UniquePtr,
            31 => RefPtr,
            32 => Ignore,
            33 => String,
            34 => TransmitAs,
            35 => RepresentAs,
            36 => Allocate,
            37 => AllocateRef,
            38 => NdrAlign2,
            39 => NdrAlign4,
            40 => NdrAlign8,
            41 => Pipe,
            42 => InContext,
            43 => InOutContext,
            44 => OutContext,
            45 => V1Enum,
            46 => V1Array,
            47 => V1String,
            48 => V1ConfStruct,
            49 => FreeRep,
            50 => ErrorStatus,
            51 => DeletedNodes,
            52 => CsType,
            53 => CsShadow,
            54 => CsArray,
            55 => CsAttribute,
            56 => CsRlseShadow,
            57 => Interface,
            58 => DynInterface,
            59 => OrpcInterface,
            60 => Range,
            254 => Eol,
            _ => return None,
        })
    }
}

/// Filler byte used for padding inside the type vector
pub const FILLER: u8 = 255;

/// Interpreter version this crate executes
pub const IDL_INTERP_ENCODE_MAJOR: u16 = 8;
pub const IDL_INTERP_ENCODE_MINOR: u16 = 10;

/// Type vector header layout
pub const TVEC_INT_REP_OFFSET: usize = 4;
pub const TVEC_BUG_FLAGS_OFFSET: usize = 8;
pub const TVEC_HEADER_SIZE: usize = 12;

/// Legacy bug-compatibility masks
pub const IDL_BUG_1: u32 = 0x0000_0002;
pub const IDL_BUG_2: u32 = 0x0000_0004;
pub const IDL_BUG_4: u32 = 0x0000_0010;

/// Properties byte
pub mod prop {
    pub const DEP_CHAR: u8 = 0x01;
    pub const DEP_INT: u8 = 0x02;
    pub const DEP_FLOAT: u8 = 0x04;
    pub const DEP_ALL: u8 = 0x07;
    pub const HAS_PTRS: u8 = 0x08;
    pub const MAYBE_WIRE_ALIGNED: u8 = 0x10;
    pub const HAS_LATE_CORRELATIONS: u8 = 0x20;
}

/// Correlation flags, OR-ed into bound and limit kind bytes
pub mod cf {
    pub const EARLY: u8 = 0x10;
    pub const SPLIT: u8 = 0x20;
    pub const IS_IID_IS: u8 = 0x40;
    pub const DONT_CHECK: u8 = 0x80;
    pub const KIND_MASK: u8 = 0x0F;
}

/// Conformance (bound) kinds
pub mod bound {
    pub const FIXED: u8 = 0;
    pub const MIN_IS: u8 = 1;
    pub const MAX_IS: u8 = 2;
    pub const SIZE_IS: u8 = 3;
    pub const STRING: u8 = 4;
}

/// Variance (data limit) kinds
pub mod limit {
    pub const FIXED: u8 = 0;
    pub const FIRST_IS: u8 = 1;
    pub const LAST_IS: u8 = 2;
    pub const LENGTH_IS: u8 = 3;
    pub const STRING: u8 = 4;
    pub const UPPER_CONF: u8 = 5;
}

/// Field conversion operators applied to a correlated value
pub mod fc {
    pub const NONE: u8 = 0;
    pub const DIV_2: u8 = 1;
    pub const MUL_2: u8 = 2;
    pub const ADD_1: u8 = 3;
    pub const SUB_1: u8 = 4;
    pub const ALIGN_2: u8 = 5;
    pub const ALIGN_4: u8 = 6;
    pub const ALIGN_8: u8 = 7;
    pub const CALLBACK: u8 = 8;
    pub const DIV_4: u8 = 9;
    pub const MUL_4: u8 = 10;
    pub const DIV_8: u8 = 11;
    pub const MUL_8: u8 = 12;
    pub const FIXED: u8 = 13;
}

/// Width of one bound pair or data limit pair record
pub const IDL_DATA_LIMIT_PAIR_WIDTH: usize = 16;

/// Width of one union arm record
pub const IDL_UNION_ARM_DESC_WIDTH: usize = 16;

/// "No conformant array" marker in a struct definition
pub const NO_CONF_ARRAY: u32 = u32::MAX;

/// Union definition flag: no arm is not a fault
pub const UNION_OPTIONAL: u8 = 0x01;
