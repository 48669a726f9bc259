//! Realtime status replies: voltage (0x02), current (0x03) and power (0x04).

use crate::fields::{read_bit, round_to, Fields, UNSET_WORD};
use crate::protocol::Command;
use crate::Result;
use std::{collections::BTreeMap, fmt};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Cells covered by the balancing mask.
pub const BALANCING_CELLS: u8 = 24;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VoltageStatus {
    pub pack_cells: u8,
    pub temperature_probes: u8,
    pub system_cells: u8,
    /// Cell number (starting at 1) to volts.
    pub cell_voltages: BTreeMap<u8, f32>,
    /// Spread between the highest and lowest cell, four decimals.
    pub cell_voltage_diff: f32,
}

impl VoltageStatus {
    pub fn request() -> Vec<u8> {
        Command::VoltageStatus.request()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let fields = Fields::new(payload);
        let pack_cells = fields.byte(0)?;
        let cell_voltages = decode_cell_words(&fields, pack_cells)?
            .into_iter()
            .map(|(cell, mv)| (cell, mv as f32 / 1000.0))
            .collect::<BTreeMap<_, _>>();
        let max = cell_voltages.values().copied().reduce(f32::max);
        let min = cell_voltages.values().copied().reduce(f32::min);
        let cell_voltage_diff = match (max, min) {
            (Some(max), Some(min)) => round_to(max - min, 4),
            _ => 0.0,
        };
        Ok(Self {
            pack_cells,
            temperature_probes: fields.byte(1)?,
            system_cells: fields.byte(2)?,
            cell_voltages,
            cell_voltage_diff,
        })
    }
}

/// Cell words in mV starting at offset 3, keyed by cell number.
pub(crate) fn decode_cell_words(fields: &Fields, cells: u8) -> Result<BTreeMap<u8, u16>> {
    (0..cells)
        .map(|i| Ok((i + 1, fields.word(3 + 2 * i as usize)?)))
        .collect()
}

/// Protection and alarm states reported by the current status.
///
/// Temperature protections are reported by the device as a domain bit
/// (charge, discharge, MOS) combined with a qualifier bit (high, under); only
/// the combined flags are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum StatusFlag {
    Discharging,
    Charging,
    CellOverVoltage,
    PackOverVoltage,
    OverChargeProtection,
    CellUnderVoltage,
    PackUnderVoltage,
    ShortCircuit,
    DischargeOverCurrent,
    ChargeOverCurrent,
    AmbientOverTemperature,
    AmbientUnderTemperature,
    ChargeOverTemperature,
    ChargeUnderTemperature,
    DischargeOverTemperature,
    DischargeUnderTemperature,
    MosOverTemperature,
    MosUnderTemperature,
}

// (byte, bit, flag) for the bits that map one to one
const DIRECT_FLAGS: [(usize, u8, StatusFlag); 12] = [
    (0, 0, StatusFlag::Discharging),
    (0, 1, StatusFlag::Charging),
    (3, 0, StatusFlag::CellOverVoltage),
    (3, 1, StatusFlag::PackOverVoltage),
    (3, 4, StatusFlag::OverChargeProtection),
    (4, 0, StatusFlag::CellUnderVoltage),
    (4, 1, StatusFlag::PackUnderVoltage),
    (6, 0, StatusFlag::ShortCircuit),
    (6, 1, StatusFlag::DischargeOverCurrent),
    (6, 2, StatusFlag::ChargeOverCurrent),
    (6, 4, StatusFlag::AmbientOverTemperature),
    (6, 5, StatusFlag::AmbientUnderTemperature),
];

const TEMPERATURE_BYTE: usize = 5;
const CHARGE_TEMPERATURE_BIT: u8 = 0;
const DISCHARGE_TEMPERATURE_BIT: u8 = 1;
const MOS_TEMPERATURE_BIT: u8 = 2;
const HIGH_TEMPERATURE_BIT: u8 = 4;
const UNDER_TEMPERATURE_BIT: u8 = 5;

impl StatusFlag {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            StatusFlag::Discharging => "DSG",
            StatusFlag::Charging => "CHG",
            StatusFlag::CellOverVoltage => "Cell OV",
            StatusFlag::PackOverVoltage => "Pack OV",
            StatusFlag::OverChargeProtection => "OCP",
            StatusFlag::CellUnderVoltage => "Cell UV",
            StatusFlag::PackUnderVoltage => "Pack UV",
            StatusFlag::ShortCircuit => "SC",
            StatusFlag::DischargeOverCurrent => "DOC",
            StatusFlag::ChargeOverCurrent => "COC",
            StatusFlag::AmbientOverTemperature => "AOT",
            StatusFlag::AmbientUnderTemperature => "AUT",
            StatusFlag::ChargeOverTemperature => "COT",
            StatusFlag::ChargeUnderTemperature => "CUT",
            StatusFlag::DischargeOverTemperature => "DOT",
            StatusFlag::DischargeUnderTemperature => "DUT",
            StatusFlag::MosOverTemperature => "MOT",
            StatusFlag::MosUnderTemperature => "MUT",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusFlag::Discharging => "discharging",
            StatusFlag::Charging => "charging",
            StatusFlag::CellOverVoltage => "cell-over-voltage",
            StatusFlag::PackOverVoltage => "pack-over-voltage",
            StatusFlag::OverChargeProtection => "over-charge-protection",
            StatusFlag::CellUnderVoltage => "cell-under-voltage",
            StatusFlag::PackUnderVoltage => "pack-under-voltage",
            StatusFlag::ShortCircuit => "short-circuit",
            StatusFlag::DischargeOverCurrent => "discharge-over-current",
            StatusFlag::ChargeOverCurrent => "charge-over-current",
            StatusFlag::AmbientOverTemperature => "ambient-over-temperature",
            StatusFlag::AmbientUnderTemperature => "ambient-under-temperature",
            StatusFlag::ChargeOverTemperature => "charge-over-temperature",
            StatusFlag::ChargeUnderTemperature => "charge-under-temperature",
            StatusFlag::DischargeOverTemperature => "discharge-over-temperature",
            StatusFlag::DischargeUnderTemperature => "discharge-under-temperature",
            StatusFlag::MosOverTemperature => "mos-over-temperature",
            StatusFlag::MosUnderTemperature => "mos-under-temperature",
        }
    }

    /// Decodes status bytes 0 and 3 to 6.
    pub fn decode(status: &[u8]) -> Result<Vec<StatusFlag>> {
        let fields = Fields::new(status);
        let mut flags = Vec::new();
        for (byte, bit, flag) in DIRECT_FLAGS {
            if fields.bit(byte, bit)? {
                flags.push(flag);
            }
        }

        let temperature = fields.byte(TEMPERATURE_BYTE)?;
        let high = read_bit!(temperature, HIGH_TEMPERATURE_BIT);
        let under = read_bit!(temperature, UNDER_TEMPERATURE_BIT);
        let domains = [
            (
                CHARGE_TEMPERATURE_BIT,
                StatusFlag::ChargeOverTemperature,
                StatusFlag::ChargeUnderTemperature,
            ),
            (
                DISCHARGE_TEMPERATURE_BIT,
                StatusFlag::DischargeOverTemperature,
                StatusFlag::DischargeUnderTemperature,
            ),
            (
                MOS_TEMPERATURE_BIT,
                StatusFlag::MosOverTemperature,
                StatusFlag::MosUnderTemperature,
            ),
        ];
        for (bit, over_flag, under_flag) in domains {
            if !read_bit!(temperature, bit) {
                continue;
            }
            if high {
                flags.push(over_flag);
            }
            if under {
                flags.push(under_flag);
            }
        }
        Ok(flags)
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Firmware version as reported by the application or the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Firmware {
    Release(u8),
    /// Version byte 0, internal testing firmware.
    Testing,
    /// Version byte 255, the pack is in its bootloader.
    Boot,
}

impl From<u8> for Firmware {
    fn from(version: u8) -> Self {
        match version {
            0 => Firmware::Testing,
            0xFF => Firmware::Boot,
            v => Firmware::Release(v),
        }
    }
}

impl Firmware {
    /// Numeric version, testing firmware counts as 300.
    pub fn number(&self) -> u16 {
        match self {
            Firmware::Release(v) => *v as u16,
            Firmware::Testing => 300,
            Firmware::Boot => 0xFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Failures {
    pub temperature_sensor: bool,
    pub cell_voltage: bool,
    pub discharge_mosfet: bool,
    pub charge_mosfet: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurrentStatus {
    pub mos_probe_present: bool,
    pub ambient_probe_present: bool,
    pub status_flags: Vec<StatusFlag>,
    /// Amps, negative while discharging.
    pub current: f32,
    pub temperature_probes: u8,
    /// Probe number (starting at 1) to degrees Celsius.
    pub cell_temperatures: BTreeMap<u8, i16>,
    pub mos_temperature: Option<i16>,
    pub ambient_temperature: Option<i16>,
    /// Ohm, scales the current threshold tables.
    pub shunt_resistor: Option<f32>,
    /// Balancing state of cells 1 to 24.
    pub balancing: Option<[bool; BALANCING_CELLS as usize]>,
    pub firmware: Option<Firmware>,
    pub discharge_mosfet_on: Option<bool>,
    pub charge_mosfet_on: Option<bool>,
    pub failures: Option<Failures>,
}

impl CurrentStatus {
    pub fn request() -> Vec<u8> {
        Command::CurrentStatus.request()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let fields = Fields::new(payload);
        let status_flags = StatusFlag::decode(payload)?;
        let mos_probe_present = fields.bit(0, 4)?;
        let ambient_probe_present = fields.bit(0, 5)?;

        let magnitude = fields.word(1)? as f32 / 100.0;
        let current = if status_flags.contains(&StatusFlag::Discharging) {
            -magnitude
        } else {
            magnitude
        };

        let temperature_probes = fields.byte(7)?;
        let cell_probes = temperature_probes
            .saturating_sub(mos_probe_present as u8)
            .saturating_sub(ambient_probe_present as u8);
        let mut offset = 8;
        let mut cell_temperatures = BTreeMap::new();
        for probe in 1..=cell_probes {
            cell_temperatures.insert(probe, fields.temperature(offset)?);
            offset += 1;
        }
        let mut optional_probe = |present: bool| {
            if !present {
                return None;
            }
            let value = fields.opt_byte(offset).map(|b| b as i16 - 40);
            offset += 1;
            value
        };
        let mos_temperature = optional_probe(mos_probe_present);
        let ambient_temperature = optional_probe(ambient_probe_present);

        // Optional tail: shunt, balancing mask, firmware, mosfet and failure bytes.
        let shunt_resistor = fields.word(offset).ok().map(|w| w as f32 / 100.0);
        let balancing = fields.slice(offset + 2, 3).ok().map(|mask| {
            let mask = u32::from_be_bytes([0, mask[0], mask[1], mask[2]]);
            let mut cells = [false; BALANCING_CELLS as usize];
            for (cell, balancing) in cells.iter_mut().enumerate() {
                *balancing = read_bit!(mask, cell);
            }
            cells
        });
        let firmware = fields.opt_byte(offset + 5).map(Firmware::from);
        let mosfet = fields.opt_byte(offset + 6);
        let failures = fields.opt_byte(offset + 7).map(|b| Failures {
            temperature_sensor: read_bit!(b, 0),
            cell_voltage: read_bit!(b, 1),
            discharge_mosfet: read_bit!(b, 2),
            charge_mosfet: read_bit!(b, 3),
        });

        Ok(Self {
            mos_probe_present,
            ambient_probe_present,
            status_flags,
            current,
            temperature_probes,
            cell_temperatures,
            mos_temperature,
            ambient_temperature,
            shunt_resistor,
            balancing,
            firmware,
            discharge_mosfet_on: mosfet.map(|b| read_bit!(b, 1)),
            charge_mosfet_on: mosfet.map(|b| read_bit!(b, 2)),
            failures,
        })
    }

    pub fn has_flag(&self, flag: StatusFlag) -> bool {
        self.status_flags.contains(&flag)
    }
}

/// Analog front end family of the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrontEnd {
    #[default]
    Ti,
    Sw,
    Unknown(u8),
}

impl From<u8> for FrontEnd {
    /// Maps the high nibble of the solution byte.
    fn from(nibble: u8) -> Self {
        match nibble {
            0x3 => FrontEnd::Sw,
            0x4 => FrontEnd::Ti,
            other => FrontEnd::Unknown(other),
        }
    }
}

impl fmt::Display for FrontEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontEnd::Ti => f.write_str("TI"),
            FrontEnd::Sw => f.write_str("SW"),
            FrontEnd::Unknown(nibble) => write!(f, "0x{nibble:x}"),
        }
    }
}

const EXTENDED_TAIL_MARKER: u8 = 0x0D;
const EXTENDED_0X04_FRAME: u8 = 0x0E;

/// Minutes reported as -1 when the device does not know.
fn minutes(fields: &Fields, offset: usize) -> Result<i32> {
    let raw = fields.raw_word(offset)?;
    Ok(if raw == UNSET_WORD { -1 } else { raw as i32 })
}

/// 32-bit capacity split by a flag byte after the high word: `hh hl .. lh ll`.
/// A capacity of exactly 65535 mAh means "not set" and reads as 0.
fn split_capacity(fields: &Fields, offset: usize) -> Result<u32> {
    let high = fields.raw_word(offset)? as u32;
    let low = fields.raw_word(offset + 3)? as u32;
    let capacity = high << 16 | low;
    Ok(if capacity == u32::from(UNSET_WORD) { 0 } else { capacity })
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PowerStatus {
    pub soc: u8,
    pub cycles: u16,
    /// mAh
    pub design_capacity: u32,
    pub full_capacity: u32,
    pub remaining_capacity: u32,
    /// -1 when unknown.
    pub remaining_discharge_minutes: i32,
    pub remaining_charge_minutes: i32,
    pub hours_since_last_charge: u16,
    pub max_hours_between_charge: u16,
    pub total_voltage: f32,
    pub cell_max_voltage: f32,
    pub cell_min_voltage: f32,
    pub hardware_version: Option<u8>,
    pub solution_byte: Option<u8>,
    pub front_end: FrontEnd,
    pub extended_0x04_frame: bool,
}

impl PowerStatus {
    pub fn request() -> Vec<u8> {
        Command::PowerStatus.request()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let fields = Fields::new(payload);
        let mut status = Self {
            soc: fields.byte(1)?,
            cycles: fields.word(3)?,
            design_capacity: split_capacity(&fields, 6)?,
            full_capacity: split_capacity(&fields, 12)?,
            remaining_capacity: split_capacity(&fields, 18)?,
            remaining_discharge_minutes: minutes(&fields, 24)?,
            remaining_charge_minutes: minutes(&fields, 27)?,
            hours_since_last_charge: fields.word(30)?,
            max_hours_between_charge: fields.word(32)?,
            total_voltage: fields.word(41)? as f32 / 100.0,
            cell_max_voltage: fields.word(43)? as f32 / 1000.0,
            cell_min_voltage: fields.word(45)? as f32 / 1000.0,
            hardware_version: None,
            solution_byte: None,
            front_end: FrontEnd::default(),
            extended_0x04_frame: false,
        };
        if fields.len() > 49 && fields.byte(47)? == EXTENDED_TAIL_MARKER {
            let solution = fields.byte(49)?;
            status.hardware_version = Some(fields.byte(48)?);
            status.solution_byte = Some(solution);
            status.front_end = FrontEnd::from(solution >> 4);
            status.extended_0x04_frame = solution & 0x0F == EXTENDED_0X04_FRAME;
        }
        Ok(status)
    }
}

/// All three realtime replies of one pack.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RealtimeStatus {
    pub voltage: VoltageStatus,
    pub current: CurrentStatus,
    pub power: PowerStatus,
}
