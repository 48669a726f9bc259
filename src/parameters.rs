//! Configuration parameter frames (0x07, 0x0B, 0x0D, 0x70, 0x6E) and the
//! custom parameter block (0x28).
//!
//! Every frame decodes into a [`ParameterSet`] split into six groups. Fields
//! of kind [`ParameterKind::Multi`] are indices into a [`DropdownTables`]
//! table that depends on the front end and the shunt resistor.

use crate::fields::{read_bit, round_to, Fields};
use crate::protocol::Command;
use crate::status::{CurrentStatus, FrontEnd, PowerStatus};
use crate::Result;
use std::{collections::BTreeMap, fmt};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of slots in the custom parameter block.
pub const CUSTOM_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParameterGroup {
    #[cfg_attr(feature = "serde", serde(rename = "parameter_group_1"))]
    Protection,
    #[cfg_attr(feature = "serde", serde(rename = "parameter_group_2"))]
    PackProtection,
    #[cfg_attr(feature = "serde", serde(rename = "parameter_group_3"))]
    Alarm,
    #[cfg_attr(feature = "serde", serde(rename = "parameter_group_4"))]
    System,
    #[cfg_attr(feature = "serde", serde(rename = "parameter_group_5"))]
    Calibration,
    #[cfg_attr(feature = "serde", serde(rename = "parameter_group_6"))]
    Custom,
}

impl ParameterGroup {
    pub fn number(&self) -> u8 {
        *self as u8 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Unit {
    Ampere,
    Volt,
    Millivolt,
    Second,
    Millisecond,
    Microsecond,
    Minute,
    Celsius,
    Percent,
    Count,
    Flag,
    None,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unit::Ampere => "A",
            Unit::Volt => "V",
            Unit::Millivolt => "mV",
            Unit::Second => "S",
            Unit::Millisecond => "ms",
            Unit::Microsecond => "us",
            Unit::Minute => "min",
            Unit::Celsius => "C",
            Unit::Percent => "%",
            Unit::Count => "n",
            Unit::Flag => "bool",
            Unit::None => "",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParameterKind {
    /// Value computed directly from the raw bytes.
    Single,
    /// Value looked up in a dropdown table.
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(untagged))]
pub enum ParameterValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    /// Table entry the front end does not support.
    NotAvailable,
    /// Table index outside of the known table.
    Unmapped(u8),
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f32> for ParameterValue {
    fn from(value: f32) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::NotAvailable => f.write_str("NA"),
            ParameterValue::Unmapped(index) => write!(f, "0x{index:02x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Parameter {
    pub value: ParameterValue,
    pub unit: Unit,
    pub kind: ParameterKind,
}

impl Parameter {
    pub fn single(value: impl Into<ParameterValue>, unit: Unit) -> Self {
        Self {
            value: value.into(),
            unit,
            kind: ParameterKind::Single,
        }
    }

    pub fn multi(value: ParameterValue, unit: Unit) -> Self {
        Self {
            value,
            unit,
            kind: ParameterKind::Multi,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ParameterSet {
    groups: BTreeMap<ParameterGroup, BTreeMap<String, Parameter>>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: ParameterGroup, name: &str, parameter: Parameter) {
        self.groups
            .entry(group)
            .or_default()
            .insert(name.to_string(), parameter);
    }

    pub fn get(&self, group: ParameterGroup, name: &str) -> Option<&Parameter> {
        self.groups.get(&group)?.get(name)
    }

    /// First parameter called `name` in any group.
    pub fn find(&self, name: &str) -> Option<(ParameterGroup, &Parameter)> {
        self.groups
            .iter()
            .find_map(|(group, parameters)| parameters.get(name).map(|p| (*group, p)))
    }

    pub fn group(&self, group: ParameterGroup) -> impl Iterator<Item = (&str, &Parameter)> {
        self.groups
            .get(&group)
            .into_iter()
            .flat_map(|parameters| parameters.iter().map(|(name, p)| (name.as_str(), p)))
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key-wise union, parameters of `other` replace parameters with the same name.
    pub fn merge(&mut self, other: ParameterSet) {
        for (group, parameters) in other.groups {
            self.groups.entry(group).or_default().extend(parameters);
        }
    }

    /// Decodes every frame present in `raw`, later frames win on name clashes.
    pub fn decode(raw: &RawParameters, current: &CurrentStatus, power: &PowerStatus) -> Result<Self> {
        let tables = DropdownTables::new(power.front_end, current.shunt_resistor.unwrap_or(0.0));
        let mut set = ParameterSet::new();
        for frame in ParameterFrame::ALL {
            let Some(data) = raw.frames.get(&frame) else {
                log::warn!("Parameter frame 0x{:02X} missing", frame.command() as u8);
                continue;
            };
            let decoded = match frame {
                ParameterFrame::Protection => decode_protection(data, &tables)?,
                ParameterFrame::Pack => decode_pack(data)?,
                ParameterFrame::Alarm => decode_alarm(data)?,
                ParameterFrame::System => decode_system(data, power.front_end, &tables)?,
                ParameterFrame::Capacity => decode_capacity(data)?,
            };
            set.merge(decoded);
        }
        if let Some(custom) = &raw.custom {
            set.merge(decode_custom(custom)?);
        }
        Ok(set)
    }
}

/// Configuration frames in decode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParameterFrame {
    Protection,
    Pack,
    Alarm,
    System,
    Capacity,
}

impl ParameterFrame {
    pub const ALL: [ParameterFrame; 5] = [
        ParameterFrame::Protection,
        ParameterFrame::Pack,
        ParameterFrame::Alarm,
        ParameterFrame::System,
        ParameterFrame::Capacity,
    ];

    pub fn command(&self) -> Command {
        match self {
            ParameterFrame::Protection => Command::ProtectionParameters,
            ParameterFrame::Pack => Command::PackParameters,
            ParameterFrame::Alarm => Command::AlarmParameters,
            ParameterFrame::System => Command::SystemParameters,
            ParameterFrame::Capacity => Command::CapacityParameters,
        }
    }

    pub fn request(&self) -> Vec<u8> {
        self.command().request()
    }
}

/// Undecoded payloads of the parameter frames.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawParameters {
    pub frames: BTreeMap<ParameterFrame, Vec<u8>>,
    pub custom: Option<Vec<u8>>,
}

const SW_OCD2: [u16; 16] = [
    30, 40, 50, 60, 70, 80, 90, 100, 120, 140, 160, 180, 200, 300, 400, 500,
];
const SW_DELAY: [u16; 16] = [
    10, 20, 40, 60, 80, 100, 200, 400, 600, 800, 1000, 2000, 4000, 8000, 10000, 20000,
];
const SW_SC: [u16; 16] = [
    50, 80, 110, 140, 170, 200, 230, 260, 290, 320, 350, 400, 500, 600, 800, 1000,
];
const SW_SC_DELAY_STEP: u16 = 64;
const SW_OCC2: [u16; 16] = [
    20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120, 130, 140, 160, 180, 200,
];
const TI_OCD2_DELAY: [u16; 8] = [8, 20, 40, 80, 160, 320, 640, 1280];
const TI_SC_DELAY: [u16; 4] = [70, 100, 200, 400];
const TI_STEPS: u16 = 8;

/// Lookup tables for the multi value parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DropdownTables {
    pub ocd2: Vec<ParameterValue>,
    pub ocd2_delay: Vec<ParameterValue>,
    pub sc: Vec<ParameterValue>,
    pub sc_delay: Vec<ParameterValue>,
    pub occ2: Vec<ParameterValue>,
    pub occ2_delay: Vec<ParameterValue>,
}

fn ints(values: impl IntoIterator<Item = u16>) -> Vec<ParameterValue> {
    values
        .into_iter()
        .map(|v| ParameterValue::Int(v as i32))
        .collect()
}

fn scaled(values: impl IntoIterator<Item = u16>, scale: impl Fn(f32) -> f32) -> Vec<ParameterValue> {
    values
        .into_iter()
        .map(|v| ParameterValue::Int(scale(v as f32).round_ties_even() as i32))
        .collect()
}

impl DropdownTables {
    /// Tables for `front_end`; current tables are scaled by `shunt_resistor`
    /// unless it is zero. Unknown front ends use the TI tables.
    pub fn new(front_end: FrontEnd, shunt_resistor: f32) -> Self {
        let unscaled = shunt_resistor == 0.0;
        match front_end {
            FrontEnd::Sw => {
                let current = |table: [u16; 16]| {
                    if unscaled {
                        ints(table)
                    } else {
                        scaled(table, |v| v / shunt_resistor)
                    }
                };
                Self {
                    ocd2: current(SW_OCD2),
                    ocd2_delay: ints(SW_DELAY),
                    sc: current(SW_SC),
                    sc_delay: ints((0..16).map(|i| i * SW_SC_DELAY_STEP)),
                    occ2: current(SW_OCC2),
                    occ2_delay: ints(SW_DELAY),
                }
            }
            FrontEnd::Ti | FrontEnd::Unknown(_) => {
                let (ocd2, sc) = if unscaled {
                    (ints(0..TI_STEPS), ints(0..TI_STEPS))
                } else {
                    (
                        scaled(0..TI_STEPS, |i| (i * 5.5 + 17.0) / shunt_resistor + 0.5),
                        scaled(0..TI_STEPS, |i| (i * 22.0 + 44.0) / shunt_resistor + 0.5),
                    )
                };
                Self {
                    ocd2,
                    ocd2_delay: ints(TI_OCD2_DELAY),
                    sc,
                    sc_delay: ints(TI_SC_DELAY),
                    occ2: vec![ParameterValue::NotAvailable],
                    occ2_delay: vec![ParameterValue::NotAvailable],
                }
            }
        }
    }
}

fn lookup(table: &[ParameterValue], index: u8) -> ParameterValue {
    table
        .get(index as usize)
        .copied()
        .unwrap_or(ParameterValue::Unmapped(index))
}

/// Byte plus a constant, the common integer encoding.
fn offset(fields: &Fields, index: usize, add: i32) -> Result<i32> {
    Ok(fields.byte(index)? as i32 + add)
}

/// Byte times a step plus a base, rounded to two decimals.
fn linear(fields: &Fields, index: usize, scale: f32, base: f32) -> Result<f32> {
    Ok(round_to(fields.byte(index)? as f32 * scale + base, 2))
}

/// Frame 0x07: cell level protection thresholds and delays.
pub fn decode_protection(data: &[u8], tables: &DropdownTables) -> Result<ParameterSet> {
    use ParameterGroup::Protection as G;
    use Unit::*;
    let f = Fields::new(data);
    f.require(27)?;
    let mut set = ParameterSet::new();
    set.insert(
        ParameterGroup::System,
        "shutdown_current",
        Parameter::single(round_to(f.byte(0)? as f32 * 0.1, 1), Ampere),
    );
    set.insert(G, "occ1_threshold", Parameter::single(offset(&f, 1, 1)?, Ampere));
    set.insert(G, "ov_threshold", Parameter::single(linear(&f, 2, 0.01, 2.0)?, Volt));
    set.insert(G, "ov_delay", Parameter::single(offset(&f, 3, 1)? * 100, Millisecond));
    set.insert(G, "uv_threshold", Parameter::single(linear(&f, 4, 0.05, 0.7)?, Volt));
    set.insert(G, "uv_delay", Parameter::single(offset(&f, 5, 1)? * 100, Millisecond));
    set.insert(G, "ov_recovery", Parameter::single(linear(&f, 6, 0.01, 0.0)?, Volt));
    set.insert(G, "uv_recovery", Parameter::single(linear(&f, 7, 0.01, 0.0)?, Volt));
    set.insert(G, "ocd2_threshold", Parameter::multi(lookup(&tables.ocd2, f.byte(8)?), Ampere));
    set.insert(
        G,
        "ocd2_delay",
        Parameter::multi(lookup(&tables.ocd2_delay, f.byte(9)?), Millisecond),
    );
    for (name, index, add) in [
        ("dot_threshold", 10, 30),
        ("dot_recovery", 11, 30),
        ("dut_threshold", 12, -40),
        ("dut_recovery", 13, -40),
        ("cot_threshold", 14, 30),
        ("cot_recovery", 15, 30),
        ("cut_threshold", 16, -40),
        ("cut_recovery", 17, -40),
    ] {
        set.insert(G, name, Parameter::single(offset(&f, index, add)?, Celsius));
    }
    set.insert(G, "balv_threshold", Parameter::single(linear(&f, 18, 0.05, 2.0)?, Volt));
    set.insert(G, "balv_delta", Parameter::single(offset(&f, 19, 2)?, Millivolt));
    set.insert(G, "ocd1_threshold", Parameter::single(offset(&f, 20, 1)?, Ampere));
    set.insert(G, "ocd1_delay", Parameter::single(offset(&f, 21, 1)?, Second));
    set.insert(G, "occ1_delay", Parameter::single(offset(&f, 22, 1)?, Second));
    set.insert(G, "sc_threshold", Parameter::multi(lookup(&tables.sc, f.byte(23)?), Ampere));
    set.insert(
        G,
        "sc_delay",
        Parameter::multi(lookup(&tables.sc_delay, f.byte(24)?), Microsecond),
    );
    set.insert(G, "ov_recovery_delay", Parameter::single(offset(&f, 25, 1)?, Second));
    set.insert(G, "uv_recovery_delay", Parameter::single(offset(&f, 26, 1)?, Second));
    Ok(set)
}

/// Frame 0x0B: pack level voltage protection and recovery behaviour.
pub fn decode_pack(data: &[u8]) -> Result<ParameterSet> {
    use ParameterGroup::PackProtection as G;
    use Unit::*;
    let f = Fields::new(data);
    f.require(20)?;
    let mut set = ParameterSet::new();
    set.insert(
        G,
        "unknown_value_byte_0_in_0b_frame",
        Parameter::single(offset(&f, 0, 1)?, None),
    );
    let functions = f.byte(1)?;
    for (bit, name) in [
        (0, "total_voltage_protect"),
        (1, "occ_recovery_by_discharge"),
        (2, "ocd_sc_auto_recovery"),
        (3, "ocd_sc_recovery_by_charge"),
        (4, "static_balance"),
    ] {
        set.insert(G, name, Parameter::single(read_bit!(functions, bit), Flag));
    }
    for (name, index) in [
        ("tov_threshold", 2),
        ("tov_recovery", 4),
        ("tuv_threshold", 6),
        ("tuv_recovery", 8),
    ] {
        let volts = round_to(f.word(index)? as f32 * 0.01, 2);
        set.insert(G, name, Parameter::single(volts, Volt));
    }
    // raw + 100, not (raw + 1) * 100
    set.insert(G, "tov_delay", Parameter::single(offset(&f, 10, 100)?, Millisecond));
    set.insert(G, "tuv_delay", Parameter::single(offset(&f, 11, 100)?, Millisecond));
    set.insert(G, "occ_auto_recovery_dly", Parameter::single(offset(&f, 12, 1)?, Minute));
    set.insert(G, "occ_auto_recovery_lock", Parameter::single(offset(&f, 13, 0)?, Count));
    set.insert(G, "ocd_sc_auto_recovery_dly", Parameter::single(offset(&f, 14, 1)?, Minute));
    set.insert(G, "ocd_sc_auto_recovery_lock", Parameter::single(offset(&f, 15, 0)?, Count));
    set.insert(G, "static_balance_time", Parameter::single(offset(&f, 16, 1)?, Minute));
    set.insert(
        G,
        "unknown_value_byte_17_in_0b_frame",
        Parameter::single(offset(&f, 17, 1)?, None),
    );
    set.insert(G, "tov_recovery_dly", Parameter::single(offset(&f, 18, 1)?, Second));
    set.insert(G, "tuv_recovery_dly", Parameter::single(offset(&f, 19, 1)?, Second));
    Ok(set)
}

/// Frame 0x0D: alarm enables and thresholds. The heat/fan settings at the end
/// are optional.
pub fn decode_alarm(data: &[u8]) -> Result<ParameterSet> {
    use ParameterGroup::Alarm as G;
    use Unit::*;
    let f = Fields::new(data);
    f.require(22)?;
    let mut set = ParameterSet::new();
    let enables = f.byte(0)?;
    for (bit, name) in [
        (0, "voltage_alarm"),
        (1, "current_alarm"),
        (2, "cell_temp_alarm"),
        (3, "mos_temp_alarm"),
        (4, "unbalance_alarm"),
        (5, "ambient_temp_alarm"),
        (6, "soc_alarm"),
    ] {
        set.insert(G, name, Parameter::single(read_bit!(enables, bit), Flag));
    }
    set.insert(
        ParameterGroup::System,
        "heat_fan_enabled",
        Parameter::single(read_bit!(enables, 7), Flag),
    );
    set.insert(
        G,
        "pack_voltage_high_alarm",
        Parameter::single(round_to(f.word(1)? as f32 / 100.0, 2), Volt),
    );
    set.insert(
        G,
        "pack_voltage_low_alarm",
        Parameter::single(round_to(f.word(3)? as f32 / 100.0, 2), Volt),
    );
    set.insert(G, "cell_voltage_high_alarm", Parameter::single(linear(&f, 5, 0.05, 2.0)?, Volt));
    set.insert(G, "cell_voltage_low_alarm", Parameter::single(linear(&f, 6, 0.1, 0.7)?, Volt));
    set.insert(G, "current_alarm_chg_threshold", Parameter::single(offset(&f, 7, 1)?, Ampere));
    set.insert(G, "current_alarm_dsg_threshold", Parameter::single(offset(&f, 8, 1)?, Ampere));
    for (name, index, add) in [
        ("cell_temp_alarm_ot_charge", 9, 30),
        ("cell_temp_alarm_ut_charge", 10, -40),
        ("cell_temp_alarm_ot_discharge", 11, 30),
        ("cell_temp_alarm_ut_discharge", 12, -40),
        ("mos_temp_alarm_ot", 13, -40),
        ("mos_temp_alarm_ot_recovery", 14, -40),
    ] {
        set.insert(G, name, Parameter::single(offset(&f, index, add)?, Celsius));
    }
    set.insert(
        G,
        "unbalanced_alarm_vol_difference",
        Parameter::single(round_to(f.word(15)? as f32 * 0.001, 3), Volt),
    );
    set.insert(
        G,
        "unbalanced_alarm_recovery_difference",
        Parameter::single(round_to(f.word(17)? as f32 * 0.001, 3), Volt),
    );
    set.insert(G, "ambient_temp_alarm_ot", Parameter::single(offset(&f, 19, 30)?, Celsius));
    set.insert(G, "ambient_temp_alarm_ut", Parameter::single(offset(&f, 20, -40)?, Celsius));
    set.insert(G, "soc_alarm_soc_low_threshold", Parameter::single(offset(&f, 21, 0)?, Percent));
    if let (Some(on), Some(off)) = (f.opt_byte(22), f.opt_byte(23)) {
        set.insert(
            ParameterGroup::System,
            "heat_fan_on",
            Parameter::single(on as i32 - 40, Celsius),
        );
        set.insert(
            ParameterGroup::System,
            "heat_fan_off",
            Parameter::single(off as i32 - 40, Celsius),
        );
    }
    Ok(set)
}

/// Frame 0x70: shutdown, MOS and ambient protections plus the second charge
/// over current stage.
pub fn decode_system(data: &[u8], front_end: FrontEnd, tables: &DropdownTables) -> Result<ParameterSet> {
    use ParameterGroup::System as G;
    use Unit::*;
    let f = Fields::new(data);
    f.require(14)?;
    let mut set = ParameterSet::new();
    set.insert(G, "shut_down_voltage", Parameter::single(linear(&f, 0, 0.05, 2.0)?, Volt));
    set.insert(G, "shut_down_delay", Parameter::single(f.word(1)? as i32, Minute));
    set.insert(G, "mos_otp", Parameter::single(offset(&f, 3, 1)?, Celsius));
    set.insert(G, "mos_otp_recovery", Parameter::single(offset(&f, 4, 1)?, Celsius));
    set.insert(G, "mos_ot_delay", Parameter::single(offset(&f, 5, 1)?, Second));
    set.insert(G, "self_dsg_rate", Parameter::single(offset(&f, 6, 0)?, Percent));
    set.insert(G, "cycle_cap", Parameter::single(offset(&f, 7, 0)?, Percent));
    set.insert(
        G,
        "soc_0_voltage",
        Parameter::single(round_to(f.word(8)? as f32 * 0.001, 2), Volt),
    );
    for (name, index, add) in [
        ("ambient_otp", 10, 30),
        ("ambient_otp_recovery", 11, 30),
        ("ambient_utp", 12, -40),
        ("ambient_utp_recovery", 13, -40),
    ] {
        set.insert(G, name, Parameter::single(offset(&f, index, add)?, Celsius));
    }
    let (threshold, delay) = match front_end {
        FrontEnd::Sw => {
            let packed = f.byte(14)?;
            (packed >> 4, packed & 0x0F)
        }
        FrontEnd::Ti | FrontEnd::Unknown(_) => (0, 0),
    };
    set.insert(
        ParameterGroup::Protection,
        "occ2_threshold",
        Parameter::multi(lookup(&tables.occ2, threshold), Ampere),
    );
    set.insert(
        ParameterGroup::Protection,
        "occ2_delay",
        Parameter::multi(lookup(&tables.occ2_delay, delay), Millisecond),
    );
    Ok(set)
}

/// Frame 0x6E: full charge detection and capacity correction.
pub fn decode_capacity(data: &[u8]) -> Result<ParameterSet> {
    use ParameterGroup::Calibration as G;
    use Unit::*;
    let f = Fields::new(data);
    f.require(11)?;
    let mut set = ParameterSet::new();
    set.insert(
        G,
        "pack_full_charge_voltage",
        Parameter::single(round_to(f.word(0)? as f32 * 0.01, 2), Volt),
    );
    set.insert(
        G,
        "pack_full_charge_current",
        Parameter::single(round_to(f.word(2)? as f32 * 0.01, 2), Ampere),
    );
    set.insert(
        G,
        "soc_correction_full_capacity_att",
        Parameter::single(round_to(f.word(4)? as f32 * 0.001, 3), Percent),
    );
    set.insert(
        G,
        "temp_higher_att_factor_DEPRECATED",
        Parameter::single(f.word(6)? as i32, Percent),
    );
    set.insert(
        G,
        "temp_lower_att_factor_DEPRECATED",
        Parameter::single(f.word(8)? as i32, Percent),
    );
    set.insert(G, "full_charge_dly", Parameter::single(linear(&f, 10, 0.01, 0.0)?, Second));
    Ok(set)
}

/// Signed values of the custom parameter block (reply to 0x28), in units of 0.01.
pub fn custom_values(payload: &[u8]) -> Vec<f32> {
    let f = Fields::new(payload);
    (0..payload.len() / 2)
        .filter_map(|slot| f.word(slot * 2).ok())
        .map(|word| word as i16 as f32 / 100.0)
        .collect()
}

/// Custom parameter block. Incomplete blocks decode to an empty set.
pub fn decode_custom(payload: &[u8]) -> Result<ParameterSet> {
    let values = custom_values(payload);
    let mut set = ParameterSet::new();
    if values.len() < CUSTOM_SLOTS {
        log::debug!("Custom parameter block with {} values ignored", values.len());
        return Ok(set);
    }
    for (slot, value) in values.into_iter().take(CUSTOM_SLOTS).enumerate() {
        set.insert(
            ParameterGroup::Custom,
            &format!("custom_parameter_{}", slot + 1),
            Parameter::single(value, Unit::None),
        );
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(set: &ParameterSet, group: ParameterGroup, name: &str) -> ParameterValue {
        set.get(group, name).unwrap().value
    }

    fn assert_float(actual: ParameterValue, expected: f32) {
        match actual {
            ParameterValue::Float(v) => assert!((v - expected).abs() < 1e-4, "{v} != {expected}"),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn zero_shunt_keeps_base_tables() {
        let tables = DropdownTables::new(FrontEnd::Sw, 0.0);
        assert_eq!(tables.ocd2[0], ParameterValue::Int(30));
        assert_eq!(tables.sc_delay[15], ParameterValue::Int(960));
        let tables = DropdownTables::new(FrontEnd::Ti, 0.0);
        assert_eq!(tables.sc[7], ParameterValue::Int(7));
        assert_eq!(tables.occ2, vec![ParameterValue::NotAvailable]);
    }

    #[test]
    fn shunt_scales_current_tables() {
        let tables = DropdownTables::new(FrontEnd::Sw, 2.0);
        assert_eq!(tables.ocd2[0], ParameterValue::Int(15));
        assert_eq!(tables.sc[15], ParameterValue::Int(500));
        assert_eq!(tables.occ2[1], ParameterValue::Int(15));
        assert_eq!(tables.ocd2_delay[15], ParameterValue::Int(20000));

        let tables = DropdownTables::new(FrontEnd::Ti, 1.0);
        // (1 * 22 + 44) / 1 + 0.5 = 66.5, rounds to even
        assert_eq!(tables.sc[1], ParameterValue::Int(66));
        // (2 * 5.5 + 17) / 1 + 0.5 = 28.5
        assert_eq!(tables.ocd2[2], ParameterValue::Int(28));
        assert_eq!(tables.sc_delay, ints([70, 100, 200, 400]));
    }

    fn protection_frame() -> Vec<u8> {
        let mut data = vec![0; 27];
        data[0] = 50; // 5.0 A
        data[2] = 165; // 3.65 V
        data[3] = 9; // 1000 ms
        data[4] = 40; // 2.7 V
        data[8] = 3;
        data[10] = 30; // 60 C
        data[12] = 30; // -10 C
        data[23] = 20; // outside the table
        data
    }

    #[test]
    fn protection_frame_fields() {
        let tables = DropdownTables::new(FrontEnd::Sw, 0.0);
        let set = decode_protection(&protection_frame(), &tables).unwrap();
        use ParameterGroup::*;
        assert_float(value(&set, System, "shutdown_current"), 5.0);
        assert_float(value(&set, Protection, "ov_threshold"), 3.65);
        assert_eq!(value(&set, Protection, "ov_delay"), ParameterValue::Int(1000));
        assert_float(value(&set, Protection, "uv_threshold"), 2.7);
        assert_eq!(value(&set, Protection, "dot_threshold"), ParameterValue::Int(60));
        assert_eq!(value(&set, Protection, "dut_threshold"), ParameterValue::Int(-10));
        let ocd2 = set.get(Protection, "ocd2_threshold").unwrap();
        assert_eq!(ocd2.kind, ParameterKind::Multi);
        assert_eq!(ocd2.value, ParameterValue::Int(60));
        assert_eq!(value(&set, Protection, "sc_threshold"), ParameterValue::Unmapped(20));
        assert_eq!(value(&set, Protection, "sc_threshold").to_string(), "0x14");
        assert!(decode_protection(&protection_frame()[..26], &tables).is_err());
    }

    #[test]
    fn pack_frame_keeps_literal_delay_formula() {
        let mut data = vec![0; 20];
        data[1] = 0b0001_0101;
        data[2..4].copy_from_slice(&[0x15, 0x7C]); // 55.00 V
        data[10] = 5;
        let set = decode_pack(&data).unwrap();
        use ParameterGroup::PackProtection;
        assert_eq!(value(&set, PackProtection, "tov_delay"), ParameterValue::Int(105));
        assert_eq!(value(&set, PackProtection, "total_voltage_protect"), ParameterValue::Bool(true));
        assert_eq!(value(&set, PackProtection, "occ_recovery_by_discharge"), ParameterValue::Bool(false));
        assert_eq!(value(&set, PackProtection, "static_balance"), ParameterValue::Bool(true));
        assert_float(value(&set, PackProtection, "tov_threshold"), 55.0);
    }

    #[test]
    fn alarm_frame_optional_heat_fan() {
        let mut data = vec![0; 22];
        data[0] = 0x81;
        let set = decode_alarm(&data).unwrap();
        assert_eq!(value(&set, ParameterGroup::System, "heat_fan_enabled"), ParameterValue::Bool(true));
        assert_eq!(value(&set, ParameterGroup::Alarm, "voltage_alarm"), ParameterValue::Bool(true));
        assert!(set.get(ParameterGroup::System, "heat_fan_on").is_none());

        data.extend_from_slice(&[45, 50]);
        let set = decode_alarm(&data).unwrap();
        assert_eq!(value(&set, ParameterGroup::System, "heat_fan_on"), ParameterValue::Int(5));
        assert_eq!(value(&set, ParameterGroup::System, "heat_fan_off"), ParameterValue::Int(10));
    }

    #[test]
    fn system_frame_occ2_depends_on_front_end() {
        let mut data = vec![0; 15];
        data[14] = 0x23;
        let ti = decode_system(&data[..14], FrontEnd::Ti, &DropdownTables::new(FrontEnd::Ti, 0.0)).unwrap();
        assert_eq!(value(&ti, ParameterGroup::Protection, "occ2_threshold"), ParameterValue::NotAvailable);

        let sw = decode_system(&data, FrontEnd::Sw, &DropdownTables::new(FrontEnd::Sw, 0.0)).unwrap();
        assert_eq!(value(&sw, ParameterGroup::Protection, "occ2_threshold"), ParameterValue::Int(40));
        assert_eq!(value(&sw, ParameterGroup::Protection, "occ2_delay"), ParameterValue::Int(60));
        assert_eq!(value(&sw, ParameterGroup::System, "ambient_utp"), ParameterValue::Int(-40));
    }

    #[test]
    fn custom_block_needs_eight_values() {
        let mut payload = Vec::new();
        for word in [100u16, 0xFF38, 0xFFFF, 0, 1, 2, 3, 4] {
            payload.extend_from_slice(&word.to_be_bytes());
        }
        let set = decode_custom(&payload).unwrap();
        assert_eq!(set.len(), 8);
        assert_float(value(&set, ParameterGroup::Custom, "custom_parameter_1"), 1.0);
        assert_float(value(&set, ParameterGroup::Custom, "custom_parameter_2"), -2.0);
        assert_float(value(&set, ParameterGroup::Custom, "custom_parameter_3"), 0.0);
        assert!(decode_custom(&payload[..14]).unwrap().is_empty());
    }

    #[test]
    fn merge_last_write_wins() {
        let mut first = ParameterSet::new();
        first.insert(ParameterGroup::System, "a", Parameter::single(1, Unit::None));
        first.insert(ParameterGroup::System, "b", Parameter::single(2, Unit::None));
        let mut second = ParameterSet::new();
        second.insert(ParameterGroup::System, "a", Parameter::single(3, Unit::None));
        first.merge(second);
        assert_eq!(value(&first, ParameterGroup::System, "a"), ParameterValue::Int(3));
        assert_eq!(value(&first, ParameterGroup::System, "b"), ParameterValue::Int(2));
        assert_eq!(first.find("b").unwrap().0, ParameterGroup::System);
    }
}
