use std::time::Duration;

/// Structural check of an SP packet that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid start byte 0x{0:02X}")]
    StartByte(u8),
    #[error("invalid product id 0x{0:02X}")]
    ProductId(u8),
    #[error("invalid address 0x{0:02X}")]
    Address(u8),
    #[error("declared length {declared} does not match packet size {actual}")]
    Length { declared: u8, actual: usize },
    #[error("invalid terminator 0x{0:02X}")]
    Terminator(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No matching response within {waited:?}")]
    Timeout { waited: Duration },
    #[error("Checksum mismatch - calculated=0x{calculated:02X} received=0x{received:02X}")]
    ChecksumMismatch { calculated: u8, received: u8 },
    #[error("Malformed packet: {0}")]
    MalformedPacket(Malformed),
    #[error("Payload too short - required={required} received={received}")]
    PayloadTooShort { required: usize, received: usize },
    #[error("Value of '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("Invalid identifier token '{0}'")]
    InvalidToken(String),
    #[error("Adapter error: {0}")]
    Adapter(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl From<Malformed> for Error {
    fn from(malformed: Malformed) -> Self {
        Error::MalformedPacket(malformed)
    }
}

impl Error {
    pub(crate) fn out_of_range(field: &'static str, value: impl Into<i64>) -> Self {
        Error::OutOfRange {
            field,
            value: value.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
