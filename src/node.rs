//! Addressed node protocol: single frame requests on [`NODE_REQUEST_ID`]
//! and their replies.
//!
//! [`NODE_REQUEST_ID`]: crate::framer::NODE_REQUEST_ID

use crate::fields::{code_table, read_bit, Fields};
use crate::protocol::calc_checksum;
use crate::transport::{Bitrate, FRAME_CAPACITY};
use crate::{Error, Result};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub type NodeFrame = [u8; FRAME_CAPACITY];

/// Lowest id a node can have, lower ids belong to the master.
pub const MIN_NODE_ID: u8 = 2;
pub const CUSTOM_PARAMETERS: std::ops::RangeInclusive<u8> = 1..=30;

const STATUS: u8 = 0x01;
const LOG: u8 = 0x04;
const BITRATE: u8 = 0xBC;
const CUSTOM_PARAMETER: u8 = 0xBD;
const SOC_RECALIBRATION: u8 = 0xCC;
const FIRMWARE_UPGRADE: u8 = 0xF5;
const CHECKSUM_POSITION: usize = 5;

const READ_BYTE: [u8; 2] = [0x04, 0x10];
const READ_WORD: [u8; 2] = [0x04, 0x20];
const WRITE_BYTE: [u8; 2] = [0x04, 0x40];
const WRITE_WORD: [u8; 2] = [0x04, 0x80];

fn check_node(node: u8) -> Result<()> {
    if node < MIN_NODE_ID {
        return Err(Error::out_of_range("node id", node));
    }
    Ok(())
}

fn check_parameter(index: u8) -> Result<()> {
    if !CUSTOM_PARAMETERS.contains(&index) {
        return Err(Error::out_of_range("custom parameter index", index));
    }
    Ok(())
}

/// Inserts the XOR of the seven given bytes at position 5.
pub fn with_checksum(body: [u8; 7]) -> NodeFrame {
    let mut frame = [0; FRAME_CAPACITY];
    frame[..CHECKSUM_POSITION].copy_from_slice(&body[..CHECKSUM_POSITION]);
    frame[CHECKSUM_POSITION] = calc_checksum(&body);
    frame[CHECKSUM_POSITION + 1..].copy_from_slice(&body[CHECKSUM_POSITION..]);
    frame
}

pub fn status_request(node: u8) -> Result<NodeFrame> {
    check_node(node)?;
    Ok([STATUS, node, 0, 0, 0, 0, 0, 0x01])
}

pub fn log_request(node: u8) -> Result<NodeFrame> {
    check_node(node)?;
    Ok([LOG, node, 0, 0, 0, 0, 0x01, 0x01])
}

pub fn read_custom_byte_request(node: u8, index: u8) -> Result<NodeFrame> {
    check_node(node)?;
    check_parameter(index)?;
    let [a, b] = READ_BYTE;
    Ok([CUSTOM_PARAMETER, node, 0, index, 0, 0, a, b])
}

pub fn write_custom_byte_request(node: u8, index: u8, value: u8) -> Result<NodeFrame> {
    check_node(node)?;
    check_parameter(index)?;
    let [a, b] = WRITE_BYTE;
    Ok(with_checksum([CUSTOM_PARAMETER, node, 0, index, value, a, b]))
}

pub fn read_custom_word_request(node: u8, index: u8) -> Result<NodeFrame> {
    check_node(node)?;
    check_parameter(index)?;
    let [a, b] = READ_WORD;
    Ok([CUSTOM_PARAMETER, node, 0, index, 0, 0, a, b])
}

pub fn write_custom_word_request(node: u8, index: u8, value: u16) -> Result<NodeFrame> {
    check_node(node)?;
    check_parameter(index)?;
    let [high, low] = value.to_be_bytes();
    let [a, b] = WRITE_WORD;
    Ok(with_checksum([CUSTOM_PARAMETER, node, high, index, low, a, b]))
}

/// Value of a custom byte reply.
pub fn custom_byte_value(reply: &[u8]) -> Result<u8> {
    Fields::new(reply).byte(7)
}

/// Value of a custom word reply, high byte at 5 and low byte at 7.
pub fn custom_word_value(reply: &[u8]) -> Result<u16> {
    let fields = Fields::new(reply);
    Ok(u16::from_be_bytes([fields.byte(5)?, fields.byte(7)?]))
}

pub fn soc_recalibration_request(node: u8) -> Result<NodeFrame> {
    check_node(node)?;
    Ok(with_checksum([SOC_RECALIBRATION, node, 0, 0, 0, 0x01, 0x04]))
}

pub fn firmware_upgrade_request(node: u8, enable: bool) -> Result<NodeFrame> {
    check_node(node)?;
    let mode = if enable { [0x40, 0x01] } else { [0x20, 0x10] };
    Ok(with_checksum([FIRMWARE_UPGRADE, node, 0, 0, 0, mode[0], mode[1]]))
}

/// Broadcast switching every node to `bitrate`.
pub fn bitrate_request(bitrate: Bitrate) -> NodeFrame {
    let code = match bitrate {
        Bitrate::K125 => 0x10,
        Bitrate::K250 => 0x20,
        Bitrate::K500 => 0x30,
        Bitrate::M1 => 0x40,
    };
    let mut frame = [BITRATE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, code, 0];
    frame[7] = calc_checksum(&frame[..7]);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum NodeStatusFlag {
    Discharge,
    Charge,
    OverVoltage,
    UnderVoltage,
    ChargeOverCurrent,
    DischargeOverCurrent,
    DischargeOverTemperature,
    DischargeUnderTemperature,
    ShortCircuit,
    ChargeOverTemperature,
    ChargeUnderTemperature,
}

const NODE_STATUS_BITS: [(u16, NodeStatusFlag); 11] = [
    (0x0001, NodeStatusFlag::Discharge),
    (0x0002, NodeStatusFlag::Charge),
    (0x0004, NodeStatusFlag::OverVoltage),
    (0x0008, NodeStatusFlag::UnderVoltage),
    (0x0010, NodeStatusFlag::ChargeOverCurrent),
    (0x0020, NodeStatusFlag::DischargeOverCurrent),
    (0x0040, NodeStatusFlag::DischargeOverTemperature),
    (0x0080, NodeStatusFlag::DischargeUnderTemperature),
    (0x0200, NodeStatusFlag::ShortCircuit),
    (0x0400, NodeStatusFlag::ChargeOverTemperature),
    (0x0800, NodeStatusFlag::ChargeUnderTemperature),
];

impl NodeStatusFlag {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            NodeStatusFlag::Discharge => "Discharge",
            NodeStatusFlag::Charge => "Charge",
            NodeStatusFlag::OverVoltage => "OV",
            NodeStatusFlag::UnderVoltage => "UV",
            NodeStatusFlag::ChargeOverCurrent => "COC",
            NodeStatusFlag::DischargeOverCurrent => "DOC",
            NodeStatusFlag::DischargeOverTemperature => "DOT",
            NodeStatusFlag::DischargeUnderTemperature => "DUT",
            NodeStatusFlag::ShortCircuit => "SC",
            NodeStatusFlag::ChargeOverTemperature => "COT",
            NodeStatusFlag::ChargeUnderTemperature => "CUT",
        }
    }

    /// Flags set in the status word, empty when the node is idle.
    pub fn decode(word: u16) -> Vec<NodeStatusFlag> {
        NODE_STATUS_BITS
            .iter()
            .filter(|(mask, _)| word & mask != 0)
            .map(|(_, flag)| *flag)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum NodeAlarm {
    Unbalanced,
    OverVoltage,
    UnderVoltage,
    ChargeCurrentHigh,
    DischargeCurrentHigh,
    OverTemperature,
    UnderTemperature,
    ChargeOverTemperature,
}

impl NodeAlarm {
    const ALL: [NodeAlarm; 8] = [
        NodeAlarm::Unbalanced,
        NodeAlarm::OverVoltage,
        NodeAlarm::UnderVoltage,
        NodeAlarm::ChargeCurrentHigh,
        NodeAlarm::DischargeCurrentHigh,
        NodeAlarm::OverTemperature,
        NodeAlarm::UnderTemperature,
        NodeAlarm::ChargeOverTemperature,
    ];

    /// Bit `n` of the alarm byte maps to the `n`th alarm.
    pub fn decode(byte: u8) -> Vec<NodeAlarm> {
        Self::ALL
            .iter()
            .enumerate()
            .filter(|(bit, _)| read_bit!(byte, *bit))
            .map(|(_, alarm)| *alarm)
            .collect()
    }
}

code_table! {
    /// Permanent protection (CP8) reason.
    pub enum Cp8Protection {
        Off = 0 => "CP8 OFF",
        On = 1 => "CP8 ON",
        OvCycle = 2 => "OV Cycle",
        OvLifetime = 3 => "OV Lifetime",
        UvCycle = 4 => "UV Cycle",
        UvLifetime = 5 => "UV Lifetime",
        CellDifference = 6 => "300mV Cell Diff",
        CellLow = 7 => "<2.65V/2.35V",
        CellHigh = 8 => ">4.35V/3.8V",
        ScCycle = 9 => "SC Cycle",
        ScLifetime = 10 => "SC Lifetime",
        DocCycle = 11 => "DOC Cycle",
        DocLifetime = 12 => "DOC Lifetime",
        CocCycle = 13 => "COC Cycle",
        CocLifetime = 14 => "COC Lifetime",
        DotCycle = 15 => "DOT Cycle",
        DotLifetime = 16 => "DOT Lifetime",
        DutCycle = 17 => "DUT Cycle",
        DutLifetime = 18 => "DUT Lifetime",
        CotCycle = 19 => "COT Cycle",
        CotLifetime = 20 => "COT Lifetime",
        CutCycle = 21 => "CUT Cycle",
        CutLifetime = 22 => "CUT Lifetime",
    }
}

const CP8_CASCADED_OFFSET: u8 = 100;

/// CP8 byte; values from 100 up report a protection cascaded from another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cp8State {
    pub protection: Cp8Protection,
    pub cascaded: bool,
}

impl From<u8> for Cp8State {
    fn from(byte: u8) -> Self {
        if byte < CP8_CASCADED_OFFSET {
            return Self {
                protection: Cp8Protection::from(byte),
                cascaded: false,
            };
        }
        match Cp8Protection::from(byte - CP8_CASCADED_OFFSET) {
            Cp8Protection::Unknown(_) => Self {
                protection: Cp8Protection::Unknown(byte),
                cascaded: false,
            },
            protection => Self {
                protection,
                cascaded: true,
            },
        }
    }
}

impl fmt::Display for Cp8State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cascaded {
            write!(f, "Cascaded CP8: {}", self.protection)
        } else {
            write!(f, "{}", self.protection)
        }
    }
}

const SERIAL_LENGTH: usize = 80;
const SERIAL_BYTES: usize = 5;
const CELL_VOLTAGES: usize = 24;
const CP8: usize = 72;
/// Cell words end where the CP8 state begins.
const MAX_CELLS: usize = (CP8 - CELL_VOLTAGES) / 2;
const ALARMS: usize = 75;
const HEATING_ACTIVE: usize = 78;
const HEATING_ENABLED: usize = 79;

/// Status of one node, as reassembled from the declared layout.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeStatus {
    pub serial: String,
    pub firmware_version: f32,
    pub pack_voltage: f32,
    pub charge_current: f32,
    pub discharge_current: f32,
    pub soc: u8,
    /// Hours, only reported while charging.
    pub charge_time_left: Option<f32>,
    pub remaining_capacity: u16,
    pub full_capacity: u16,
    pub soh: u8,
    pub cycles: u16,
    pub status_flags: Vec<NodeStatusFlag>,
    pub cell_temperatures: [i8; 2],
    pub mos_temperature: i8,
    pub ambient_temperature: i8,
    /// mV, in cell order.
    pub cell_voltages: Vec<u16>,
    pub cp8: Cp8State,
    pub alarms: Vec<NodeAlarm>,
    pub heating_enabled: bool,
    pub heating_active: bool,
}

/// Serial as the hex rendering of bytes 81..86, cut to the length in byte 80.
pub fn decode_node_serial(data: &[u8]) -> Result<String> {
    let fields = Fields::new(data);
    let len = fields.byte(SERIAL_LENGTH)? as usize;
    let mut serial = fields
        .slice(SERIAL_LENGTH + 1, SERIAL_BYTES)?
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    serial.truncate(len);
    Ok(serial)
}

impl NodeStatus {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let f = Fields::new(data);
        f.require(SERIAL_LENGTH + 1 + SERIAL_BYTES)?;
        let tenths = |offset| -> Result<f32> { Ok(f.raw_word(offset)? as f32 / 10.0) };
        let charge_current = tenths(2)?;

        let mut cell_voltages = Vec::new();
        for cell in 0..MAX_CELLS {
            match f.raw_word(CELL_VOLTAGES + 2 * cell) {
                Ok(mv) if mv > 0 => cell_voltages.push(mv),
                _ => break,
            }
        }

        Ok(Self {
            serial: decode_node_serial(data)?,
            firmware_version: f.byte(11)? as f32 / 10.0,
            pack_voltage: tenths(0)?,
            charge_current,
            discharge_current: tenths(4)?,
            soc: f.byte(6)?,
            charge_time_left: (charge_current > 0.0)
                .then(|| f.byte(7).map(|b| b as f32 / 10.0))
                .transpose()?,
            remaining_capacity: f.raw_word(8)?,
            full_capacity: f.raw_word(12)?,
            soh: f.byte(10)?,
            cycles: f.raw_word(14)?,
            status_flags: NodeStatusFlag::decode(f.raw_word(16)?),
            cell_temperatures: [f.byte(18)? as i8, f.byte(19)? as i8],
            mos_temperature: f.byte(22)? as i8,
            ambient_temperature: f.byte(23)? as i8,
            cell_voltages,
            cp8: Cp8State::from(f.byte(CP8)?),
            alarms: NodeAlarm::decode(f.byte(ALARMS)?),
            heating_enabled: f.byte(HEATING_ENABLED)? == 1,
            heating_active: f.byte(HEATING_ACTIVE)? == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames() {
        assert_eq!(status_request(2).unwrap(), [0x01, 2, 0, 0, 0, 0, 0, 0x01]);
        assert_eq!(log_request(7).unwrap(), [0x04, 7, 0, 0, 0, 0, 1, 1]);
        assert!(status_request(1).is_err());
        assert_eq!(
            read_custom_byte_request(3, 5).unwrap(),
            [0xBD, 3, 0, 5, 0, 0, 0x04, 0x10]
        );
        assert!(read_custom_byte_request(3, 31).is_err());
        assert!(read_custom_word_request(3, 0).is_err());
    }

    #[test]
    fn checksum_is_inserted_at_position_five() {
        let frame = write_custom_byte_request(2, 1, 0x10).unwrap();
        assert_eq!(frame, [0xBD, 2, 0, 1, 0x10, 0xBD ^ 2 ^ 1 ^ 0x10 ^ 0x04 ^ 0x40, 0x04, 0x40]);
        let frame = write_custom_word_request(2, 1, 0x1234).unwrap();
        assert_eq!(&frame[..5], &[0xBD, 2, 0x12, 1, 0x34]);
        assert_eq!(frame[5], 0xBD ^ 2 ^ 0x12 ^ 1 ^ 0x34 ^ 0x04 ^ 0x80);
        assert_eq!(
            firmware_upgrade_request(2, true).unwrap(),
            with_checksum([0xF5, 2, 0, 0, 0, 0x40, 0x01])
        );
        assert_eq!(soc_recalibration_request(4).unwrap()[6..], [0x01, 0x04]);
    }

    #[test]
    fn bitrate_frames() {
        assert_eq!(
            bitrate_request(Bitrate::K125),
            [0xBC, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x10, 0x53]
        );
        assert_eq!(bitrate_request(Bitrate::K250)[7], 0x63);
        assert_eq!(bitrate_request(Bitrate::K500)[7], 0x73);
        assert_eq!(bitrate_request(Bitrate::M1)[7], 0x03);
    }

    #[test]
    fn custom_values() {
        let reply = [0xBD, 2, 0, 1, 0, 0x12, 0x04, 0x34];
        assert_eq!(custom_byte_value(&reply).unwrap(), 0x34);
        assert_eq!(custom_word_value(&reply).unwrap(), 0x1234);
    }

    #[test]
    fn flags_and_alarms_are_bitmasks() {
        assert!(NodeStatusFlag::decode(0).is_empty());
        assert_eq!(
            NodeStatusFlag::decode(0x0201),
            vec![NodeStatusFlag::Discharge, NodeStatusFlag::ShortCircuit]
        );
        assert_eq!(
            NodeAlarm::decode(0x81),
            vec![NodeAlarm::Unbalanced, NodeAlarm::ChargeOverTemperature]
        );
    }

    #[test]
    fn cp8_cascade_offset() {
        assert_eq!(Cp8State::from(3).to_string(), "OV Lifetime");
        let cascaded = Cp8State::from(106);
        assert!(cascaded.cascaded);
        assert_eq!(cascaded.protection, Cp8Protection::CellDifference);
        assert_eq!(cascaded.to_string(), "Cascaded CP8: 300mV Cell Diff");
        assert_eq!(Cp8State::from(50).to_string(), "0x32");
        assert_eq!(Cp8State::from(150).protection, Cp8Protection::Unknown(150));
    }

    fn status_data() -> Vec<u8> {
        let mut data = vec![0u8; 86];
        data[0..2].copy_from_slice(&[0x02, 0x14]); // 53.2 V
        data[2..4].copy_from_slice(&[0x00, 0x32]); // 5.0 A charge
        data[6] = 75;
        data[7] = 25;
        data[8..10].copy_from_slice(&[0x00, 0x64]);
        data[10] = 99;
        data[11] = 12;
        data[12..14].copy_from_slice(&[0x00, 0xC8]);
        data[14..16].copy_from_slice(&[0x00, 0x2A]);
        data[16..18].copy_from_slice(&[0x00, 0x02]);
        data[18] = 22;
        data[19] = 0xFE; // -2 C
        data[22] = 30;
        data[23] = 21;
        data[24..30].copy_from_slice(&[0x0C, 0xE4, 0x0C, 0xE5, 0x0C, 0xE6]);
        data[72] = 101;
        data[75] = 0x02;
        data[78] = 1;
        data[79] = 1;
        data[80] = 6;
        data[81..86].copy_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x90]);
        data
    }

    #[test]
    fn status_layout() {
        let status = NodeStatus::decode(&status_data()).unwrap();
        assert_eq!(status.serial, "123456");
        assert_eq!(status.pack_voltage, 53.2);
        assert_eq!(status.charge_current, 5.0);
        assert_eq!(status.charge_time_left, Some(2.5));
        assert_eq!(status.firmware_version, 1.2);
        assert_eq!(status.cycles, 42);
        assert_eq!(status.status_flags, vec![NodeStatusFlag::Charge]);
        assert_eq!(status.cell_temperatures, [22, -2]);
        assert_eq!(status.cell_voltages, vec![3300, 3301, 3302]);
        assert_eq!(status.cp8.to_string(), "Cascaded CP8: CP8 ON");
        assert_eq!(status.alarms, vec![NodeAlarm::OverVoltage]);
        assert!(status.heating_enabled && status.heating_active);
        assert!(NodeStatus::decode(&status_data()[..85]).is_err());
    }

    #[test]
    fn cell_voltages_stop_at_first_zero_word() {
        let mut data = status_data();
        data[30..32].copy_from_slice(&[0x00, 0x00]);
        data[32..34].copy_from_slice(&[0x0C, 0xE7]);
        assert_eq!(NodeStatus::decode(&data).unwrap().cell_voltages, vec![3300, 3301, 3302]);
    }

    #[test]
    fn full_cell_block_ends_before_cp8() {
        let mut data = status_data();
        for cell in 0..24 {
            data[24 + 2 * cell..26 + 2 * cell].copy_from_slice(&(3300 + cell as u16).to_be_bytes());
        }
        let status = NodeStatus::decode(&data).unwrap();
        assert_eq!(status.cell_voltages.len(), 24);
        assert_eq!(status.cell_voltages.last(), Some(&3323));
        assert_eq!(status.cp8.to_string(), "Cascaded CP8: CP8 ON");
    }

    #[test]
    fn idle_node_has_no_charge_time() {
        let mut data = status_data();
        data[2..4].copy_from_slice(&[0, 0]);
        assert_eq!(NodeStatus::decode(&data).unwrap().charge_time_left, None);
    }
}
