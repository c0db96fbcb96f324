//! Data representation (drep) descriptor
//!
//! The drep travels in every DCE RPC PDU header and tells the receiver how
//! integers, characters and floating point values were laid out by the sender.

/// Integer representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntRep {
    BigEndian = 0,
    LittleEndian = 1,
}

/// Character representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharRep {
    Ascii = 0,
    Ebcdic = 1,
}

/// Floating point representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRep {
    Ieee = 0,
    Vax = 1,
    Cray = 2,
    Ibm = 3,
}

/// NDR data representation of the current operation's wire data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    pub int_rep: IntRep,
    pub char_rep: CharRep,
    pub float_rep: FloatRep,
}

impl DataRepresentation {
    /// Little-endian, ASCII, IEEE
    pub fn ndr() -> Self {
        Self {
            int_rep: IntRep::LittleEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    /// Big-endian, ASCII, IEEE
    pub fn big_endian() -> Self {
        Self {
            int_rep: IntRep::BigEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    /// Representation of this host
    pub fn local() -> Self {
        if cfg!(target_endian = "little") {
            Self::ndr()
        } else {
            Self::big_endian()
        }
    }

    /// Encode to the 4-byte header form.
    ///
    /// Byte 0 holds the character rep in the low nibble and the integer rep in
    /// the high nibble; byte 1 is the float rep; bytes 2-3 are reserved.
    pub fn encode(&self) -> [u8; 4] {
        let byte0 = (self.char_rep as u8) | ((self.int_rep as u8) << 4);
        let byte1 = self.float_rep as u8;
        [byte0, byte1, 0, 0]
    }

    /// Decode from the 4-byte header form
    pub fn decode(data: [u8; 4]) -> Self {
        let int_rep = if (data[0] & 0xF0) == 0 {
            IntRep::BigEndian
        } else {
            IntRep::LittleEndian
        };
        let char_rep = if (data[0] & 0x0F) == 0 {
            CharRep::Ascii
        } else {
            CharRep::Ebcdic
        };
        let float_rep = match data[1] {
            0 => FloatRep::Ieee,
            1 => FloatRep::Vax,
            2 => FloatRep::Cray,
            _ => FloatRep::Ibm,
        };
        Self {
            int_rep,
            char_rep,
            float_rep,
        }
    }

    /// Returns true if using little-endian byte order
    pub fn is_little_endian(&self) -> bool {
        self.int_rep == IntRep::LittleEndian
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::ndr()
    }
}
