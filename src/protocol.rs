//! SP packet codec and the fixed command catalog.
//!
//! Wire layout: `EA D1 <addr> <len> FF <cmd> <data...> <xor> F5` where `len`
//! counts the bytes following it and the checksum is the XOR of everything
//! from `len` up to the byte before the checksum.

use crate::error::Malformed;
use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const START_BYTE: u8 = 0xEA;
pub const PRODUCT_ID: u8 = 0xD1;
pub const FRAME_TYPE: u8 = 0xFF;
pub const TERMINATOR: u8 = 0xF5;

/// Smallest valid packet: header, length, frame type, command, checksum, terminator.
pub const MIN_PACKET_LEN: usize = 8;
/// Largest data block that still fits the one byte length field.
pub const MAX_DATA_LEN: usize = u8::MAX as usize - 4;

/// Firmware version request understood by the bootloader.
pub const BOOT_FIRMWARE_REQUEST: [u8; 7] = [0xEB, 0x01, 0x01, 0x03, 0x90, 0x93, 0xF5];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Address {
    Pack = 0x01,
    Broadcast = 0xFF,
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Address::Pack),
            0xFF => Ok(Address::Broadcast),
            other => Err(Malformed::Address(other).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    BmsModel = 0x01,
    VoltageStatus = 0x02,
    CurrentStatus = 0x03,
    PowerStatus = 0x04,
    ProtectionParameters = 0x07,
    Log = 0x08,
    LogStatistics = 0x09,
    PackParameters = 0x0B,
    AlarmParameters = 0x0D,
    CellVoltages = 0x0F,
    WriteSerial = 0x10,
    Serial = 0x11,
    WriteModelAndDate = 0x12,
    Shutdown = 0x13,
    CustomParameters = 0x28,
    ModelField = 0x30,
    CapacityParameters = 0x6E,
    SystemParameters = 0x70,
}

impl Command {
    /// Address the command is sent to.
    pub fn address(&self) -> Address {
        match self {
            Command::Log
            | Command::WriteSerial
            | Command::WriteModelAndDate
            | Command::Shutdown => Address::Broadcast,
            _ => Address::Pack,
        }
    }

    /// Request packet for commands without a data block.
    pub fn request(self) -> Vec<u8> {
        encode(self.address(), self as u8, &[])
    }
}

pub(crate) fn calc_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |checksum, b| checksum ^ b)
}

fn encode(address: Address, command: u8, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(data.len() + MIN_PACKET_LEN);
    packet.extend_from_slice(&[START_BYTE, PRODUCT_ID, address as u8]);
    packet.push((data.len() + 4) as u8);
    packet.push(FRAME_TYPE);
    packet.push(command);
    packet.extend_from_slice(data);
    packet.push(calc_checksum(&packet[3..]));
    packet.push(TERMINATOR);
    packet
}

/// Builds a complete packet around `data`.
pub fn build(address: Address, command: u8, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_DATA_LEN {
        return Err(Error::out_of_range("packet data length", data.len() as i64));
    }
    Ok(encode(address, command, data))
}

fn validate_len(bytes: &[u8]) -> Result<()> {
    if bytes.len() < MIN_PACKET_LEN {
        log::warn!(
            "Invalid packet size - required={} received={}",
            MIN_PACKET_LEN,
            bytes.len()
        );
        return Err(Malformed::TooShort(bytes.len()).into());
    }
    let declared = bytes[3];
    if declared as usize + 4 != bytes.len() {
        log::warn!(
            "Invalid packet length - declared={} received={} buffer={:02X?}",
            declared,
            bytes.len(),
            bytes
        );
        return Err(Malformed::Length {
            declared,
            actual: bytes.len(),
        }
        .into());
    }
    Ok(())
}

fn validate_checksum(bytes: &[u8]) -> Result<()> {
    let position = bytes.len() - 2;
    let calculated = calc_checksum(&bytes[3..position]);
    let received = bytes[position];
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} buffer={:02X?}",
            calculated,
            received,
            bytes
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

/// A validated SP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpPacket {
    pub address: Address,
    pub frame_type: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl SpPacket {
    /// Checks every envelope field of an exactly sized packet.
    pub fn validate(bytes: &[u8]) -> Result<Self> {
        validate_len(bytes)?;
        if bytes[0] != START_BYTE {
            return Err(Malformed::StartByte(bytes[0]).into());
        }
        if bytes[1] != PRODUCT_ID {
            return Err(Malformed::ProductId(bytes[1]).into());
        }
        let address = Address::try_from(bytes[2])?;
        validate_checksum(bytes)?;
        let terminator = bytes[bytes.len() - 1];
        if terminator != TERMINATOR {
            return Err(Malformed::Terminator(terminator).into());
        }
        Ok(Self {
            address,
            frame_type: bytes[4],
            command: bytes[5],
            payload: bytes[6..bytes.len() - 2].to_vec(),
        })
    }

    /// Validates a packet that may be followed by frame padding, the declared
    /// length decides where the packet ends.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes.get(3) {
            Some(&declared) if declared as usize + 4 <= bytes.len() => {
                Self::validate(&bytes[..declared as usize + 4])
            }
            _ => Self::validate(bytes),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_DATA_LEN {
            return Err(Error::out_of_range("packet data length", self.payload.len() as i64));
        }
        let mut packet = encode(self.address, self.command, &self.payload);
        packet[4] = self.frame_type;
        let position = packet.len() - 2;
        packet[position] = calc_checksum(&packet[3..position]);
        Ok(packet)
    }
}

pub fn raw_cell_voltages_request() -> Vec<u8> {
    encode(Address::Pack, Command::CellVoltages as u8, &[0x00])
}

pub fn shutdown_request() -> Vec<u8> {
    encode(Address::Broadcast, Command::Shutdown as u8, &[0x31])
}

/// Request writing the battery serial number (1 to 999999).
pub fn write_serial_request(serial: u32) -> Result<Vec<u8>> {
    if !(1..=999_999).contains(&serial) {
        return Err(Error::out_of_range("serial number", serial));
    }
    let digits = format!("{serial:06}");
    let mut data = vec![digits.len() as u8];
    data.extend_from_slice(digits.as_bytes());
    build(Address::Broadcast, Command::WriteSerial as u8, &data)
}

pub const MAX_MODEL_LEN: usize = 26;
pub const PRODUCTION_YEAR_BASE: i32 = 2015;
const LAST_PRODUCTION_YEAR: i32 = 2040;

/// Request writing model name and production date.
pub fn write_model_request(model: &str, date: chrono::NaiveDate) -> Result<Vec<u8>> {
    use chrono::Datelike;
    if !model.is_ascii() || model.len() > MAX_MODEL_LEN {
        return Err(Error::out_of_range("model length", model.len() as i64));
    }
    if !(PRODUCTION_YEAR_BASE..=LAST_PRODUCTION_YEAR).contains(&date.year()) {
        return Err(Error::out_of_range("production year", date.year()));
    }
    let mut data = vec![model.len() as u8];
    data.extend_from_slice(model.as_bytes());
    data.push((date.year() - PRODUCTION_YEAR_BASE) as u8);
    data.push(date.month0() as u8);
    data.push(date.day0() as u8);
    build(Address::Broadcast, Command::WriteModelAndDate as u8, &data)
}
