//! Bounds checked big-endian field reads over a payload slice.

use crate::{Error, Result};

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}
pub(crate) use read_bit;

/// Builds a code table enum. Unknown codes keep their raw value and render
/// as `0x..`.
macro_rules! code_table {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $code:literal => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum $name {
            $($variant,)+
            Unknown(u8),
        }

        impl From<u8> for $name {
            fn from(code: u8) -> Self {
                match code {
                    $($code => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }
        }

        impl $name {
            pub fn code(&self) -> u8 {
                match self {
                    $($name::$variant => $code,)+
                    $name::Unknown(code) => *code,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($name::$variant => f.write_str($text),)+
                    $name::Unknown(code) => write!(f, "0x{code:02x}"),
                }
            }
        }
    };
}
pub(crate) use code_table;

/// Raw 16-bit value the devices use for "not set".
pub const UNSET_WORD: u16 = 0xFFFF;

/// Offsets are relative to the first payload byte, after the command byte.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fields<'a> {
    data: &'a [u8],
}

impl<'a> Fields<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.data
            .get(offset..offset + len)
            .ok_or(Error::PayloadTooShort {
                required: offset + len,
                received: self.data.len(),
            })
    }

    pub fn require(&self, len: usize) -> Result<()> {
        self.slice(0, len).map(|_| ())
    }

    pub fn byte(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn opt_byte(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    pub fn bit(&self, offset: usize, position: u8) -> Result<bool> {
        Ok(read_bit!(self.byte(offset)?, position))
    }

    /// Unsigned word with [`UNSET_WORD`] read as zero.
    pub fn word(&self, offset: usize) -> Result<u16> {
        self.raw_word(offset).map(|w| if w == UNSET_WORD { 0 } else { w })
    }

    pub fn raw_word(&self, offset: usize) -> Result<u16> {
        let bytes = self.slice(offset, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn signed_word(&self, offset: usize) -> Result<i16> {
        self.raw_word(offset).map(|w| w as i16)
    }

    pub fn dword(&self, offset: usize) -> Result<u32> {
        let bytes = self.slice(offset, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Temperature byte with the usual 40 degree offset removed.
    pub fn temperature(&self, offset: usize) -> Result<i16> {
        self.byte(offset).map(|b| b as i16 - 40)
    }
}

/// Rounds to `digits` decimals.
pub(crate) fn round_to(value: f32, digits: i32) -> f32 {
    let factor = 10f32.powi(digits);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounds_checked() {
        let fields = Fields::new(&[0x12, 0x34, 0xFF, 0xFF, 0x80]);
        assert_eq!(fields.word(0).unwrap(), 0x1234);
        assert_eq!(fields.word(2).unwrap(), 0);
        assert_eq!(fields.raw_word(2).unwrap(), 0xFFFF);
        assert_eq!(fields.signed_word(3).unwrap(), -128);
        assert!(fields.bit(4, 7).unwrap());
        assert!(matches!(
            fields.dword(2),
            Err(Error::PayloadTooShort {
                required: 6,
                received: 5
            })
        ));
        assert_eq!(fields.opt_byte(5), None);
    }
}
