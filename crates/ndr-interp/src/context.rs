//! Byte-order context
//!
//! An `NdrContext` is derived once per operation from the drep and used by the
//! primitive codec for every multi-byte scalar. The type vector decoder keeps a
//! second context for the vector's own integer representation.

use bytes::{Buf, BufMut};

use crate::drep::{CharRep, DataRepresentation, FloatRep, IntRep};
use crate::{NdrError, Result};

/// Byte order and representation checks for one stream of NDR data
#[derive(Debug, Clone, Copy)]
pub struct NdrContext {
    /// Whether multi-byte integers are little-endian
    pub little_endian: bool,
    drep: DataRepresentation,
}

macro_rules! ctx_scalar {
    ($($put:ident, $get:ident, $ty:ty, $put_le:ident, $put_be:ident, $get_le:ident, $get_be:ident;)*) => {
        $(
            #[inline]
            pub fn $put<B: BufMut>(&self, buf: &mut B, value: $ty) {
                if self.little_endian {
                    buf.$put_le(value);
                } else {
                    buf.$put_be(value);
                }
            }

            #[inline]
            pub fn $get<B: Buf>(&self, buf: &mut B) -> $ty {
                if self.little_endian {
                    buf.$get_le()
                } else {
                    buf.$get_be()
                }
            }
        )*
    };
}

impl NdrContext {
    /// Little-endian IEEE ASCII, the usual NDR representation
    pub fn new() -> Self {
        Self::from_drep(DataRepresentation::ndr())
    }

    /// Context for data described by `drep`
    pub fn from_drep(drep: DataRepresentation) -> Self {
        Self {
            little_endian: drep.int_rep == IntRep::LittleEndian,
            drep,
        }
    }

    /// Context with only a byte order; used for the type vector itself
    pub fn with_byte_order(little_endian: bool) -> Self {
        let mut drep = DataRepresentation::ndr();
        if !little_endian {
            drep.int_rep = IntRep::BigEndian;
        }
        Self::from_drep(drep)
    }

    pub fn drep(&self) -> DataRepresentation {
        self.drep
    }

    /// Padding needed to bring `position` to a multiple of `alignment`
    #[inline]
    pub fn align_padding(position: usize, alignment: usize) -> usize {
        if alignment <= 1 {
            return 0;
        }
        (alignment - position % alignment) % alignment
    }

    /// Fault unless floats on the wire are IEEE
    pub fn check_float_rep(&self) -> Result<()> {
        match self.drep.float_rep {
            FloatRep::Ieee => Ok(()),
            other => Err(NdrError::UnsupportedFloatRep(other)),
        }
    }

    /// Fault unless characters on the wire are ASCII
    pub fn check_char_rep(&self) -> Result<()> {
        match self.drep.char_rep {
            CharRep::Ascii => Ok(()),
            other => Err(NdrError::UnsupportedCharRep(other)),
        }
    }

    /// Decode a 32-bit value from four bytes in this context's order
    #[inline]
    pub fn u32_from_bytes(&self, bytes: [u8; 4]) -> u32 {
        if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        }
    }

    #[inline]
    pub fn u16_from_bytes(&self, bytes: [u8; 2]) -> u16 {
        if self.little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        }
    }

    #[inline]
    pub fn put_u8<B: BufMut>(&self, buf: &mut B, value: u8) {
        buf.put_u8(value);
    }

    #[inline]
    pub fn get_u8<B: Buf>(&self, buf: &mut B) -> u8 {
        buf.get_u8()
    }

    ctx_scalar! {
        put_u16, get_u16, u16, put_u16_le, put_u16, get_u16_le, get_u16;
        put_i16, get_i16, i16, put_i16_le, put_i16, get_i16_le, get_i16;
        put_u32, get_u32, u32, put_u32_le, put_u32, get_u32_le, get_u32;
        put_i32, get_i32, i32, put_i32_le, put_i32, get_i32_le, get_i32;
        put_u64, get_u64, u64, put_u64_le, put_u64, get_u64_le, get_u64;
        put_i64, get_i64, i64, put_i64_le, put_i64, get_i64_le, get_i64;
        put_f32, get_f32, f32, put_f32_le, put_f32, get_f32_le, get_f32;
        put_f64, get_f64, f64, put_f64_le, put_f64, get_f64_le, get_f64;
    }
}

impl Default for NdrContext {
    fn default() -> Self {
        Self::new()
    }
}
