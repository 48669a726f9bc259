//! BMS identifier tokens.
//!
//! A token is 13 hex digits: five for the batch, four for the packed
//! production date and four for the serial of the day. The date packs as
//! `year_offset << 9 | month << 5 | day`, years counting from
//! [`IDENTIFIER_EPOCH_YEAR`].

use crate::{Error, Result};
use std::{fmt, str::FromStr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const IDENTIFIER_EPOCH_YEAR: i32 = 2022;
pub const TOKEN_LEN: usize = 13;

pub const MAX_BATCH: u32 = 99_999;
pub const MAX_SERIAL: u16 = 9_999;
pub const MAX_YEAR_OFFSET: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IdentifierDate {
    pub year_offset: u8,
    pub month: u8,
    pub day: u8,
}

impl IdentifierDate {
    pub fn new(year_offset: u8, month: u8, day: u8) -> Result<Self> {
        let date = Self {
            year_offset,
            month,
            day,
        };
        date.validate()?;
        Ok(date)
    }

    fn validate(&self) -> Result<()> {
        if self.year_offset > MAX_YEAR_OFFSET {
            return Err(Error::out_of_range("year offset", self.year_offset));
        }
        if !(1..=12).contains(&self.month) {
            return Err(Error::out_of_range("month", self.month));
        }
        if !(1..=31).contains(&self.day) {
            return Err(Error::out_of_range("day", self.day));
        }
        Ok(())
    }

    pub fn year(&self) -> i32 {
        IDENTIFIER_EPOCH_YEAR + self.year_offset as i32
    }

    fn pack(&self) -> u16 {
        (self.year_offset as u16) << 9 | (self.month as u16) << 5 | self.day as u16
    }

    fn unpack(packed: u16) -> Self {
        Self {
            year_offset: (packed >> 9 & 0x1F) as u8,
            month: (packed >> 5 & 0x0F) as u8,
            day: (packed & 0x1F) as u8,
        }
    }
}

impl TryFrom<chrono::NaiveDate> for IdentifierDate {
    type Error = Error;

    fn try_from(date: chrono::NaiveDate) -> Result<Self> {
        use chrono::Datelike;
        let offset = date.year() - IDENTIFIER_EPOCH_YEAR;
        let year_offset =
            u8::try_from(offset).map_err(|_| Error::out_of_range("year offset", offset))?;
        Self::new(year_offset, date.month() as u8, date.day() as u8)
    }
}

impl fmt::Display for IdentifierDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month, self.day)
    }
}

/// Batch, production date and serial of the day of one BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BmsIdentifier {
    pub batch: u32,
    pub date: IdentifierDate,
    pub serial: u16,
}

impl BmsIdentifier {
    pub fn new(batch: u32, date: IdentifierDate, serial: u16) -> Result<Self> {
        let identifier = Self {
            batch,
            date,
            serial,
        };
        identifier.validate()?;
        Ok(identifier)
    }

    fn validate(&self) -> Result<()> {
        if self.batch > MAX_BATCH {
            return Err(Error::out_of_range("batch", self.batch));
        }
        if self.serial > MAX_SERIAL {
            return Err(Error::out_of_range("serial", self.serial));
        }
        self.date.validate()
    }

    /// Renders the 13 digit token, lowercase.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        Ok(format!(
            "{:05x}{:04x}{:04x}",
            self.batch,
            self.date.pack(),
            self.serial
        ))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            log::warn!("Invalid identifier {token:?}: {reason}");
            Error::InvalidToken(token.to_string())
        };
        if token.len() != TOKEN_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("expected 13 hex digits"));
        }
        let field = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&token[range], 16).map_err(|_| invalid("not hex"))
        };
        let batch = field(0..5)?;
        let packed = field(5..9)?;
        let serial = field(9..13)?;
        if packed >> 14 != 0 {
            return Err(invalid("date wider than 14 bits"));
        }
        let identifier = Self {
            batch,
            date: IdentifierDate::unpack(packed as u16),
            serial: serial as u16,
        };
        identifier.validate().map_err(|_| invalid("field out of range"))?;
        Ok(identifier)
    }
}

impl FromStr for BmsIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s.trim())
    }
}

impl fmt::Display for BmsIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:05x}{:04x}{:04x}",
            self.batch,
            self.date.pack(),
            self.serial
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_example() {
        let date = IdentifierDate::try_from(chrono::NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .unwrap();
        assert_eq!(date, IdentifierDate::new(2, 3, 15).unwrap());
        let identifier = BmsIdentifier::new(123, date, 7).unwrap();
        // 2 << 9 | 3 << 5 | 15 = 0x046F
        assert_eq!(identifier.encode().unwrap(), "0007b046f0007");
        assert_eq!(BmsIdentifier::decode("0007b046f0007").unwrap(), identifier);
        assert_eq!(identifier.to_string().parse::<BmsIdentifier>().unwrap(), identifier);
        assert_eq!(identifier.date.to_string(), "2024-03-15");
    }

    #[test]
    fn decode_is_case_insensitive() {
        let identifier = BmsIdentifier::decode("0007B046F0007").unwrap();
        assert_eq!(identifier.batch, 123);
    }

    #[test]
    fn out_of_range_inputs_are_rejected() {
        let date = IdentifierDate::new(0, 1, 1).unwrap();
        assert!(matches!(
            BmsIdentifier::new(999_999, date, 0),
            Err(Error::OutOfRange { field: "batch", .. })
        ));
        assert!(BmsIdentifier::new(0, date, 10_000).is_err());
        assert!(IdentifierDate::new(32, 1, 1).is_err());
        assert!(IdentifierDate::new(0, 13, 1).is_err());
        assert!(IdentifierDate::new(0, 1, 0).is_err());
        assert!(IdentifierDate::try_from(chrono::NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for token in ["", "0007b046f000", "0007b046f00070", "0007b046f000g", "0007b04600007", "fffff046f0007"] {
            assert!(
                matches!(BmsIdentifier::decode(token), Err(Error::InvalidToken(_))),
                "{token}"
            );
        }
    }

    #[test]
    fn extreme_values_round_trip() {
        for (batch, year_offset, month, day, serial) in
            [(0, 0, 1, 1, 0), (99_999, 31, 12, 31, 9_999), (54_321, 17, 6, 30, 1)]
        {
            let identifier =
                BmsIdentifier::new(batch, IdentifierDate::new(year_offset, month, day).unwrap(), serial)
                    .unwrap();
            let token = identifier.encode().unwrap();
            assert_eq!(token.len(), TOKEN_LEN);
            assert_eq!(BmsIdentifier::decode(&token).unwrap(), identifier);
        }
    }
}
