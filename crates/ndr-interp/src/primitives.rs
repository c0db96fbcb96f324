//! NDR primitive codec
//!
//! NDR scalar kinds and their encodings:
//!
//! | IDL type       | `Value`       | Size | Alignment |
//! |----------------|---------------|------|-----------|
//! | boolean        | `Boolean`     | 1    | 1         |
//! | byte           | `Byte`        | 1    | 1         |
//! | char           | `Char`        | 1    | 1         |
//! | small          | `Small`       | 1    | 1         |
//! | unsigned small | `USmall`      | 1    | 1         |
//! | short          | `Short`       | 2    | 2         |
//! | unsigned short | `UShort`      | 2    | 2         |
//! | enum           | `Enum`        | 2    | 2         |
//! | long           | `Long`        | 4    | 4         |
//! | unsigned long  | `ULong`       | 4    | 4         |
//! | v1_enum        | `Enum`        | 4    | 4         |
//! | error_status_t | `ErrorStatus` | 4    | 4         |
//! | float          | `Float`       | 4    | 4         |
//! | hyper          | `Hyper`       | 8    | 8         |
//! | unsigned hyper | `UHyper`      | 8    | 8         |
//! | double         | `Double`      | 8    | 8         |

use crate::buffer::{MarshalBuffer, UnmarshalBuffer};
use crate::context::NdrContext;
use crate::opcode::Opcode;
use crate::{NdrError, Result, Value};

/// Largest value an NDR (16-bit) enum may carry
pub const ENUM_MAX: i32 = 0x7FFF;

/// Scalar kinds the codec understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Boolean,
    Byte,
    Char,
    Small,
    USmall,
    Short,
    UShort,
    Enum,
    Long,
    ULong,
    V1Enum,
    ErrorStatus,
    Float,
    Hyper,
    UHyper,
    Double,
}

impl ScalarKind {
    /// Scalar kind named by a type vector opcode
    pub fn from_opcode(op: Opcode) -> Option<Self> {
        Some(match op {
            Opcode::Boolean => ScalarKind::Boolean,
            Opcode::Byte => ScalarKind::Byte,
            Opcode::Char => ScalarKind::Char,
            Opcode::Small => ScalarKind::Small,
            Opcode::USmall => ScalarKind::USmall,
            Opcode::Short => ScalarKind::Short,
            Opcode::UShort => ScalarKind::UShort,
            Opcode::Enum => ScalarKind::Enum,
            Opcode::Long => ScalarKind::Long,
            Opcode::ULong => ScalarKind::ULong,
            Opcode::V1Enum => ScalarKind::V1Enum,
            Opcode::ErrorStatus => ScalarKind::ErrorStatus,
            Opcode::Float => ScalarKind::Float,
            Opcode::Hyper => ScalarKind::Hyper,
            Opcode::UHyper => ScalarKind::UHyper,
            Opcode::Double => ScalarKind::Double,
            _ => return None,
        })
    }

    pub fn opcode(self) -> Opcode {
        match self {
            ScalarKind::Boolean => Opcode::Boolean,
            ScalarKind::Byte => Opcode::Byte,
            ScalarKind::Char => Opcode::Char,
            ScalarKind::Small => Opcode::Small,
            ScalarKind::USmall => Opcode::USmall,
            ScalarKind::Short => Opcode::Short,
            ScalarKind::UShort => Opcode::UShort,
            ScalarKind::Enum => Opcode::Enum,
            ScalarKind::Long => Opcode::Long,
            ScalarKind::ULong => Opcode::ULong,
            ScalarKind::V1Enum => Opcode::V1Enum,
            ScalarKind::ErrorStatus => Opcode::ErrorStatus,
            ScalarKind::Float => Opcode::Float,
            ScalarKind::Hyper => Opcode::Hyper,
            ScalarKind::UHyper => Opcode::UHyper,
            ScalarKind::Double => Opcode::Double,
        }
    }

    /// Wire size in bytes
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Boolean
            | ScalarKind::Byte
            | ScalarKind::Char
            | ScalarKind::Small
            | ScalarKind::USmall => 1,
            ScalarKind::Short | ScalarKind::UShort | ScalarKind::Enum => 2,
            ScalarKind::Long
            | ScalarKind::ULong
            | ScalarKind::V1Enum
            | ScalarKind::ErrorStatus
            | ScalarKind::Float => 4,
            ScalarKind::Hyper | ScalarKind::UHyper | ScalarKind::Double => 8,
        }
    }

    /// NDR alignment; always the wire size
    pub fn align(self) -> usize {
        self.size()
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::Small
                | ScalarKind::Short
                | ScalarKind::Long
                | ScalarKind::Hyper
                | ScalarKind::Enum
                | ScalarKind::V1Enum
        )
    }

    /// Whether this kind can carry a discriminant or correlation value
    pub fn is_integral(self) -> bool {
        !matches!(self, ScalarKind::Float | ScalarKind::Double)
    }

    /// Reinterpret a 32-bit type vector operand at this kind's width and
    /// signedness.
    pub fn normalize(self, raw: u32) -> i64 {
        match self {
            ScalarKind::Small => i64::from(raw as u8 as i8),
            ScalarKind::Short | ScalarKind::Enum => i64::from(raw as u16 as i16),
            ScalarKind::Long | ScalarKind::V1Enum => i64::from(raw as i32),
            ScalarKind::Boolean | ScalarKind::Byte | ScalarKind::Char | ScalarKind::USmall => {
                i64::from(raw as u8)
            }
            ScalarKind::UShort => i64::from(raw as u16),
            _ => i64::from(raw),
        }
    }

    /// Host value for an integer of this kind
    pub fn from_i64(self, v: i64) -> Result<Value> {
        let overflow = |_| NdrError::IntegerOverflow;
        Ok(match self {
            ScalarKind::Boolean => Value::Boolean(v != 0),
            ScalarKind::Byte => Value::Byte(u8::try_from(v).map_err(overflow)?),
            ScalarKind::Char => Value::Char(u8::try_from(v).map_err(overflow)?),
            ScalarKind::Small => Value::Small(i8::try_from(v).map_err(overflow)?),
            ScalarKind::USmall => Value::USmall(u8::try_from(v).map_err(overflow)?),
            ScalarKind::Short => Value::Short(i16::try_from(v).map_err(overflow)?),
            ScalarKind::UShort => Value::UShort(u16::try_from(v).map_err(overflow)?),
            ScalarKind::Enum | ScalarKind::V1Enum => Value::Enum(i32::try_from(v).map_err(overflow)?),
            ScalarKind::Long => Value::Long(i32::try_from(v).map_err(overflow)?),
            ScalarKind::ULong => Value::ULong(u32::try_from(v).map_err(overflow)?),
            ScalarKind::ErrorStatus => Value::ErrorStatus(u32::try_from(v).map_err(overflow)?),
            ScalarKind::Hyper => Value::Hyper(v),
            ScalarKind::UHyper => Value::UHyper(v as u64),
            ScalarKind::Float => Value::Float(v as f32),
            ScalarKind::Double => Value::Double(v as f64),
        })
    }

    /// Zero value of this kind
    pub fn zero(self) -> Value {
        match self {
            ScalarKind::Boolean => Value::Boolean(false),
            ScalarKind::Byte => Value::Byte(0),
            ScalarKind::Char => Value::Char(0),
            ScalarKind::Small => Value::Small(0),
            ScalarKind::USmall => Value::USmall(0),
            ScalarKind::Short => Value::Short(0),
            ScalarKind::UShort => Value::UShort(0),
            ScalarKind::Enum | ScalarKind::V1Enum => Value::Enum(0),
            ScalarKind::Long => Value::Long(0),
            ScalarKind::ULong => Value::ULong(0),
            ScalarKind::ErrorStatus => Value::ErrorStatus(0),
            ScalarKind::Float => Value::Float(0.0),
            ScalarKind::Hyper => Value::Hyper(0),
            ScalarKind::UHyper => Value::UHyper(0),
            ScalarKind::Double => Value::Double(0.0),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ScalarKind::Boolean => "boolean",
            ScalarKind::Byte => "byte",
            ScalarKind::Char => "char",
            ScalarKind::Small => "small",
            ScalarKind::USmall => "unsigned small",
            ScalarKind::Short => "short",
            ScalarKind::UShort => "unsigned short",
            ScalarKind::Enum => "enum",
            ScalarKind::Long => "long",
            ScalarKind::ULong => "unsigned long",
            ScalarKind::V1Enum => "v1_enum",
            ScalarKind::ErrorStatus => "error_status_t",
            ScalarKind::Float => "float",
            ScalarKind::Hyper => "hyper",
            ScalarKind::UHyper => "unsigned hyper",
            ScalarKind::Double => "double",
        }
    }
}

/// Marshal one scalar at its natural alignment
pub fn put_scalar(
    buf: &mut MarshalBuffer<'_>,
    ctx: &NdrContext,
    kind: ScalarKind,
    value: &Value,
) -> Result<()> {
    let mismatch = || NdrError::type_mismatch(kind.name(), value);
    buf.align(kind.align())?;
    match (kind, value) {
        (ScalarKind::Boolean, Value::Boolean(v)) => {
            let v = u8::from(*v);
            buf.write_with(1, |b| ctx.put_u8(b, v))
        }
        (ScalarKind::Byte, Value::Byte(v)) | (ScalarKind::USmall, Value::USmall(v)) => {
            buf.write_with(1, |b| ctx.put_u8(b, *v))
        }
        (ScalarKind::Char, Value::Char(v)) => {
            ctx.check_char_rep()?;
            buf.write_with(1, |b| ctx.put_u8(b, *v))
        }
        (ScalarKind::Small, Value::Small(v)) => buf.write_with(1, |b| ctx.put_u8(b, *v as u8)),
        (ScalarKind::Short, Value::Short(v)) => buf.write_with(2, |b| ctx.put_i16(b, *v)),
        (ScalarKind::UShort, Value::UShort(v)) => buf.write_with(2, |b| ctx.put_u16(b, *v)),
        (ScalarKind::Enum, Value::Enum(v)) => {
            if !(0..=ENUM_MAX).contains(v) {
                return Err(NdrError::RangeViolation {
                    value: i64::from(*v),
                    lower: 0,
                    upper: i64::from(ENUM_MAX),
                });
            }
            let v = *v as u16;
            buf.write_with(2, |b| ctx.put_u16(b, v))
        }
        (ScalarKind::Long, Value::Long(v)) | (ScalarKind::V1Enum, Value::Enum(v)) => {
            buf.write_with(4, |b| ctx.put_i32(b, *v))
        }
        (ScalarKind::ULong, Value::ULong(v)) | (ScalarKind::ErrorStatus, Value::ErrorStatus(v)) => {
            buf.write_with(4, |b| ctx.put_u32(b, *v))
        }
        (ScalarKind::Float, Value::Float(v)) => {
            ctx.check_float_rep()?;
            buf.write_with(4, |b| ctx.put_f32(b, *v))
        }
        (ScalarKind::Hyper, Value::Hyper(v)) => buf.write_with(8, |b| ctx.put_i64(b, *v)),
        (ScalarKind::UHyper, Value::UHyper(v)) => buf.write_with(8, |b| ctx.put_u64(b, *v)),
        (ScalarKind::Double, Value::Double(v)) => {
            ctx.check_float_rep()?;
            buf.write_with(8, |b| ctx.put_f64(b, *v))
        }
        _ => Err(mismatch()),
    }
}

/// Unmarshal one scalar at its natural alignment
pub fn get_scalar(buf: &mut UnmarshalBuffer<'_>, ctx: &NdrContext, kind: ScalarKind) -> Result<Value> {
    buf.align(kind.align())?;
    match kind {
        ScalarKind::Boolean => buf.read_with(1, |b| Value::Boolean(ctx.get_u8(b) != 0)),
        ScalarKind::Byte => buf.read_with(1, |b| Value::Byte(ctx.get_u8(b))),
        ScalarKind::Char => {
            ctx.check_char_rep()?;
            buf.read_with(1, |b| Value::Char(ctx.get_u8(b)))
        }
        ScalarKind::Small => buf.read_with(1, |b| Value::Small(ctx.get_u8(b) as i8)),
        ScalarKind::USmall => buf.read_with(1, |b| Value::USmall(ctx.get_u8(b))),
        ScalarKind::Short => buf.read_with(2, |b| Value::Short(ctx.get_i16(b))),
        ScalarKind::UShort => buf.read_with(2, |b| Value::UShort(ctx.get_u16(b))),
        ScalarKind::Enum => {
            let raw = buf.read_with(2, |b| ctx.get_u16(b))?;
            if i32::from(raw) > ENUM_MAX {
                return Err(NdrError::RangeViolation {
                    value: i64::from(raw),
                    lower: 0,
                    upper: i64::from(ENUM_MAX),
                });
            }
            Ok(Value::Enum(i32::from(raw)))
        }
        ScalarKind::Long => buf.read_with(4, |b| Value::Long(ctx.get_i32(b))),
        ScalarKind::ULong => buf.read_with(4, |b| Value::ULong(ctx.get_u32(b))),
        ScalarKind::V1Enum => buf.read_with(4, |b| Value::Enum(ctx.get_i32(b))),
        ScalarKind::ErrorStatus => buf.read_with(4, |b| Value::ErrorStatus(ctx.get_u32(b))),
        ScalarKind::Float => {
            ctx.check_float_rep()?;
            buf.read_with(4, |b| Value::Float(ctx.get_f32(b)))
        }
        ScalarKind::Hyper => buf.read_with(8, |b| Value::Hyper(ctx.get_i64(b))),
        ScalarKind::UHyper => buf.read_with(8, |b| Value::UHyper(ctx.get_u64(b))),
        ScalarKind::Double => {
            ctx.check_float_rep()?;
            buf.read_with(8, |b| Value::Double(ctx.get_f64(b)))
        }
    }
}

/// Marshal an aligned unsigned long outside any descriptor (counts, ids)
pub fn put_count(buf: &mut MarshalBuffer<'_>, ctx: &NdrContext, value: u32) -> Result<()> {
    buf.align(4)?;
    buf.write_with(4, |b| ctx.put_u32(b, value))
}

pub fn get_count(buf: &mut UnmarshalBuffer<'_>, ctx: &NdrContext) -> Result<u32> {
    buf.align(4)?;
    buf.read_with(4, |b| ctx.get_u32(b))
}

/// Marshal an aligned unsigned short count (`[v1_array]`)
pub fn put_short_count(buf: &mut MarshalBuffer<'_>, ctx: &NdrContext, value: u16) -> Result<()> {
    buf.align(2)?;
    buf.write_with(2, |b| ctx.put_u16(b, value))
}

pub fn get_short_count(buf: &mut UnmarshalBuffer<'_>, ctx: &NdrContext) -> Result<u16> {
    buf.align(2)?;
    buf.read_with(2, |b| ctx.get_u16(b))
}
