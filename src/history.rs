//! Event log records and lifetime statistics.

use crate::fields::{code_table, Fields};
use crate::framer::LOG_RECORD_LEN;
use crate::{Error, Result};
use chrono::NaiveDateTime;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

code_table! {
    /// Voltage protection state.
    pub enum VoltageState {
        Normal = 0x00 => "Normal",
        PackUvRecovery = 0x01 => "Pack UV Recovery",
        CellUvRecovery = 0x02 => "Cell UV Recovery",
        PackOvRecovery = 0x04 => "Pack OV Recovery",
        CellOvRecovery = 0x08 => "Cell OV Recovery",
        PackUv = 0x10 => "Pack UV",
        CellUv = 0x20 => "Cell UV",
        PackOv = 0x40 => "Pack OV",
        CellOv = 0x80 => "Cell OV",
        CellOvUvFailure = 0xA0 => "Cell OV/Cell UV (Failure)",
    }
}

code_table! {
    /// Current protection state.
    pub enum CurrentState {
        Normal = 0x00 => "Normal",
        ScRecovery = 0x04 => "SC Recovery",
        DocRecovery = 0x08 => "DOC Recovery",
        CocRecovery = 0x10 => "COC Recovery",
        Sc = 0x20 => "SC",
        Doc = 0x40 => "DOC",
        Coc = 0x80 => "COC",
    }
}

code_table! {
    /// Temperature protection state.
    pub enum TemperatureState {
        Normal = 0x00 => "Normal",
        DotRecovery = 0x10 => "DOT Recovery",
        CotRecovery = 0x20 => "COT Recovery",
        Dot = 0x40 => "DOT",
        Cot = 0x80 => "COT",
    }
}

code_table! {
    pub enum ChargeState {
        Standby = 0x20 => "Standby",
        Discharging = 0x40 => "DSG",
        Charging = 0x80 => "CHG",
    }
}

code_table! {
    /// Event that caused a log record to be written.
    pub enum LogEvent {
        ManualRestart = 0x01 => "Manual Restart",
        ManualShutdown = 0x02 => "Manual Shutdown",
        UvShutdown = 0x03 => "UV Shutdown",
        PowerUp = 0x04 => "Power Up",
        Reserved = 0x05 => "Reserved",
        FullCapacityUpdate = 0x06 => "Full Cap. Update",
        CycleCountUpdate = 0x07 => "Cycle Count Update",
        DischargeFetOff = 0x08 => "D-Fet Off",
        ChargeFetOff = 0x09 => "C-Fet Off",
        DischargeFetOn = 0x0A => "D-Fet On",
        ChargeFetOn = 0x0B => "C-Fet On",
        WriteConfiguration = 0x0C => "Write Configuration Parameters",
        ChargeCurrentCalibration = 0x0D => "Charging Current Calibration",
        DischargeCurrentCalibration = 0x0E => "Discharge Current Calibration",
        VoltageCalibration = 0x0F => "Voltage Calibration",
        CellOverVoltageAlarm = 0x16 => "Cell Over voltage Alarm",
        PackOverVoltageAlarm = 0x17 => "Tov Alarm",
        OverDischargeAlarm = 0x18 => "Battery Over-Discharge Alarm",
        PackUnderVoltageAlarm = 0x19 => "Tuv Alarm",
        ChargeOverCurrentAlarm = 0x1A => "Charging Over current Alarm",
        DischargeOverCurrentAlarm = 0x1B => "Discharge Over current Alarm",
        ChargeOverTemperatureAlarm = 0x1C => "Charging Over temperature Alarm",
        DischargeOverTemperatureAlarm = 0x1D => "Discharge Over-Temperature Alarm",
        ChargeMosFailure = 0x1E => "Charging Mos Failure",
        DischargeMosFailure = 0x1F => "Discharge Mos Failure",
        VoltageAcquisitionFailure = 0x20 => "Voltage Acquisition Failure",
        TemperatureAcquisitionFailure = 0x21 => "Temperature Acquisition Failure",
        CurrentAcquisitionFailure = 0x22 => "Current Acquisition Failure",
        ChargingStarts = 0x23 => "Charging Starts",
        ChargingStopped = 0x24 => "Charging Stopped",
        FullChargeProtection = 0x25 => "Full Charge Protection",
        FullChargeRecovery = 0x26 => "Full Charge Recovery",
        DischargeStarts = 0x27 => "Discharge Starts",
        DischargeStops = 0x28 => "Discharge Stops",
        AutomaticPowerOff = 0x29 => "Automatic Power Off",
        AfeInternalError = 0x2A => "AFE Internal Error",
        SocCorrectedToZero = 0x2B => "Soc Corrected To 0%",
        OpenCircuitFullFccUpdate = 0x2C => "Open Circuit - Full Of FCC Updates",
        ChargeFullFccUpdate = 0x2D => "Charges - Full Of FCC Updates",
        OpenCircuitChargeStopFccUpdate = 0x2E => "Open Circuit-Charge Stop Fcc Update",
        ChargeFullOfFccUpdate = 0x2F => "Charge - Full Of Fcc Updates",
        AntiSparkShortCircuit = 0x30 => "Anti-Sparking Switch Short Circuit Protection",
        PreDischargeShortCircuit = 0x31 => "Pre-Discharge Short Circuit Protection",
        HeatingStart = 0x32 => "Heating Start",
        HeatingStop = 0x33 => "Heating Stop",
        DelayedCurrentDetection = 0x34 => "15S Delayed Current Detection",
        LowVoltageBrick = 0x35 => "Low Voltage Brick",
        LowVoltageBrickRecovery = 0x36 => "Low Voltage Brick Recovery",
        CellDiffBrick = 0x37 => "Cell Voltage Diff. Brick",
        CellDiffBrickRecovery = 0x38 => "Cell Voltage Diff. Brick Recovery",
        Cp8ExtendedProtection = 0x39 => "Cp8 Extended Protection Initialized",
        CellImbalanceAlarm = 0x5A => "Cell Imbalance Alarm",
        CellImbalanceAlarmRecovery = 0x5B => "Cell Imbalance Alarm Recovery",
        DesignCapacityCalibration = 0x5C => "Pc Design Capacity Calibration",
        RemainingCapacityCalibration = 0x5D => "Pc Remaining Capacity Calibration",
        FullSocCorrection = 0x5E => "Full Soc Correction",
        ScheduledRecording = 0x5F => "Scheduled Recording",
        MosHighTemperatureProtection = 0x60 => "Mos High Temperature Protection",
        MosHighTemperatureRecovery = 0x61 => "Mos High Temperature Recovery",
        Charging = 0x62 => "Charging",
        Discharging = 0x63 => "Discharging",
        EnterBootloader = 0x64 => "Program Update Enters Bootloader",
        OverVoltageAlarmRecovery = 0x65 => "Battery Over Voltage Alarm Recovery",
        UnderVoltageAlarmRecovery = 0x66 => "Battery Under Voltage Alarm Recovery",
        PackOverVoltageAlarmRecovery = 0x67 => "Total Pressure Over voltage Alarm Recovery",
        PackOverDischargeAlarmRecovery = 0x68 => "Total Pressure Over-Discharge Alarm Recovery",
        ChargeTemperatureAlarmRecovery = 0x69 => "Charging Temperature Alarm Recovery",
        DischargeTemperatureAlarmRecovery = 0x6A => "Discharge Temperature Alarm Recovery",
        ShortCircuitRecoveryLock = 0x6B => "Short Circuit Automatic Recovery Lock",
        OverCurrentRecoveryLock = 0x6C => "Over current Automatic Recovery Lock",
        CellVoltageFailureProtection = 0x6D => "Cell Voltage Failure Protection",
        CellDifferenceFailureRecovery = 0x6E => "Cell Voltage Difference Failure Recovery",
        ChargingProhibited = 0x6F => "Charging Is Prohibited",
        ChargingProhibitedRecovery = 0x70 => "Prohibit Charging Recovery",
        ChargeOverCurrentAlarmRecovery = 0x71 => "Charging Over current Alarm Recovery",
        DischargeOverCurrentAlarmRecovery = 0x72 => "Discharge Over current Alarm Recovery",
        MosHighTemperatureAlarm = 0x73 => "Mos High Temperature Alarm",
        MosHighTemperatureAlarmRecovery = 0x74 => "Mos High Temperature Alarm Recovery",
        AmbientHighTemperatureAlarm = 0x75 => "Environmental High Temperature Alarm",
        AmbientHighTemperatureAlarmRecovery = 0x76 => "Environment High Temperature Alarm Recovery",
        AmbientLowTemperatureAlarm = 0x77 => "Environmental Low Temperature Alarm",
        AmbientLowTemperatureAlarmRecovery = 0x78 => "Environmental Low Temperature Alarm Recovery",
        CapacityLowAlarm = 0x79 => "Capacity Low Alarm",
        CapacityLowAlarmRecovery = 0x7A => "Capacity Low Alarm Recovery",
        AmbientHighTemperatureProtection = 0x7B => "Environmental High Temperature Protection",
        AmbientHighTemperatureProtectionRecovery = 0x7C => "Environmental High Temperature Protection Recovery",
        AmbientLowTemperatureProtection = 0x7D => "Environmental Low Temperature Protection",
        AmbientLowTemperatureProtectionRecovery = 0x7E => "Environmental Low Temperature Protection Recovery",
        ChargeCurrentLimitOn = 0x7F => "Charging Current Limit Is On",
        ChargeCurrentLimitOff = 0x80 => "Charging Current Limit Off",
    }
}

/// Record timestamp. The device stores every component as two BCD digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LogTimestamp {
    At(NaiveDateTime),
    Corrupted,
}

fn bcd(byte: u8) -> Option<u32> {
    let (high, low) = (byte >> 4, byte & 0x0F);
    (high < 10 && low < 10).then(|| (high * 10 + low) as u32)
}

impl LogTimestamp {
    /// Decodes `yy mm dd hh mi ss`, years count from 2000.
    pub fn decode(bytes: &[u8]) -> Self {
        let parts = bytes.iter().map(|b| bcd(*b)).collect::<Option<Vec<_>>>();
        let date_time = match parts.as_deref() {
            Some(&[year, month, day, hour, minute, second]) => {
                chrono::NaiveDate::from_ymd_opt(2000 + year as i32, month, day)
                    .and_then(|date| date.and_hms_opt(hour, minute, second))
            }
            _ => None,
        };
        date_time.map_or(LogTimestamp::Corrupted, LogTimestamp::At)
    }
}

impl fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTimestamp::At(at) => write!(f, "{}", at.format("%Y-%m-%d %H:%M:%S")),
            LogTimestamp::Corrupted => f.write_str("corrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LogRecord {
    /// Position in the dump, starting at 1. The device counter wraps after 255.
    pub index: usize,
    pub timestamp: LogTimestamp,
    pub pack_voltage: f32,
    pub cell_min_voltage: f32,
    pub cell_max_voltage: f32,
    pub current: f32,
    pub min_temperature: i16,
    pub max_temperature: i16,
    pub soc: u8,
    /// mAh
    pub remaining_capacity: u32,
    pub cycles: u16,
    pub voltage_state: VoltageState,
    pub current_state: CurrentState,
    pub temperature_state: TemperatureState,
    pub charge_state: ChargeState,
    pub event: LogEvent,
    pub soh: u8,
    pub mos_temperature: i16,
    pub min_temperature_cell: u8,
    pub max_temperature_cell: u8,
}

impl LogRecord {
    /// Decodes one 33 byte record; `position` is the zero based position in the dump.
    pub fn decode(position: usize, record: &[u8]) -> Result<Self> {
        if record.len() != LOG_RECORD_LEN {
            log::warn!("Log record has {} bytes instead of {LOG_RECORD_LEN}", record.len());
            return Err(Error::PayloadTooShort {
                required: LOG_RECORD_LEN,
                received: record.len(),
            });
        }
        let f = Fields::new(record);
        Ok(Self {
            index: position + 1,
            timestamp: LogTimestamp::decode(f.slice(1, 6)?),
            pack_voltage: f.raw_word(7)? as f32 / 100.0,
            cell_min_voltage: f.raw_word(9)? as f32 / 1000.0,
            cell_max_voltage: f.raw_word(11)? as f32 / 1000.0,
            current: f.signed_word(13)? as f32 / 100.0,
            min_temperature: f.temperature(15)?,
            max_temperature: f.temperature(16)?,
            soc: f.byte(17)?,
            remaining_capacity: f.dword(18)?,
            cycles: f.raw_word(22)?,
            voltage_state: f.byte(24)?.into(),
            current_state: f.byte(25)?.into(),
            temperature_state: f.byte(26)?.into(),
            charge_state: f.byte(27)?.into(),
            event: f.byte(28)?.into(),
            soh: f.byte(29)?,
            mos_temperature: f.temperature(30)?,
            min_temperature_cell: f.byte(31)?,
            max_temperature_cell: f.byte(32)?,
        })
    }

    /// Decodes a whole dump, numbering the records in order. Records that do
    /// not decode are logged and skipped without leaving a gap in the numbering.
    pub fn decode_all<'a>(records: impl IntoIterator<Item = &'a [u8]>) -> Vec<Self> {
        let mut decoded = Vec::new();
        for record in records {
            match Self::decode(decoded.len(), record) {
                Ok(record) => decoded.push(record),
                Err(err) => log::warn!("Skipping log record: {err}"),
            }
        }
        decoded
    }
}

const STATISTICS_RESERVED: usize = 4;
const STATISTICS_COUNTERS: usize = 20;
const APP_UPDATES_UNSET: u8 = 0xFF;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LogStatistics {
    pub cot_count: u16,
    pub cut_count: u16,
    pub dot_count: u16,
    pub dut_count: u16,
    pub fet_ot_count: u16,
    pub software_ov_count: u16,
    pub software_uv_count: u16,
    pub pack_ov_count: u16,
    pub pack_uv_count: u16,
    pub chg_full_count: u16,
    pub hardware_ov_count: u16,
    pub hard_uv: u16,
    pub soft_coc: u16,
    pub soft_doc: u16,
    pub hard_oc: u16,
    pub hardware_sc: u16,
    pub uv_shutdown: u16,
    pub auto_shutdown_count: u16,
    pub button_shutdown_count: u16,
    pub reset_count: u16,
    pub accumulated_discharge_minutes: u32,
    pub accumulated_charge_minutes: u32,
    pub app_updates_count: u8,
}

impl LogStatistics {
    /// Decodes the two statistics packets of a log dump. The first byte of
    /// each payload is a sequence byte and is dropped.
    pub fn from_frames(first: &[u8], second: &[u8]) -> Result<Self> {
        let mut joined = first.get(1..).unwrap_or_default().to_vec();
        joined.extend_from_slice(second.get(1..).unwrap_or_default());
        Self::decode(&joined)
    }

    /// Decodes an already joined statistics block.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let f = Fields::new(data);
        let mut counters = [0u16; STATISTICS_COUNTERS];
        for (i, counter) in counters.iter_mut().enumerate() {
            *counter = f.raw_word(STATISTICS_RESERVED + 2 * i)?;
        }
        let tail = STATISTICS_RESERVED + 2 * STATISTICS_COUNTERS;
        let app_updates = f.byte(tail + 8)?;
        let [cot_count, cut_count, dot_count, dut_count, fet_ot_count, software_ov_count, software_uv_count, pack_ov_count, pack_uv_count, chg_full_count, hardware_ov_count, hard_uv, soft_coc, soft_doc, hard_oc, hardware_sc, uv_shutdown, auto_shutdown_count, button_shutdown_count, reset_count] =
            counters;
        Ok(Self {
            cot_count,
            cut_count,
            dot_count,
            dut_count,
            fet_ot_count,
            software_ov_count,
            software_uv_count,
            pack_ov_count,
            pack_uv_count,
            chg_full_count,
            hardware_ov_count,
            hard_uv,
            soft_coc,
            soft_doc,
            hard_oc,
            hardware_sc,
            uv_shutdown,
            auto_shutdown_count,
            button_shutdown_count,
            reset_count,
            accumulated_discharge_minutes: f.dword(tail)?,
            accumulated_charge_minutes: f.dword(tail + 4)?,
            app_updates_count: if app_updates == APP_UPDATES_UNSET {
                0
            } else {
                app_updates
            },
        })
    }
}

/// Everything a log dump returned.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LogDump {
    pub statistics: Option<LogStatistics>,
    pub records: Vec<LogRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Vec<u8> {
        let mut record = vec![0u8; LOG_RECORD_LEN];
        record[0] = 0x07;
        record[1..7].copy_from_slice(&[0x23, 0x11, 0x05, 0x14, 0x30, 0x59]);
        record[7..9].copy_from_slice(&[0x14, 0xB4]); // 53.00 V
        record[9..11].copy_from_slice(&[0x0C, 0xE4]); // 3.300 V
        record[11..13].copy_from_slice(&[0x0D, 0x05]); // 3.333 V
        record[13..15].copy_from_slice(&[0xFC, 0x18]); // -10.00 A
        record[15] = 60;
        record[16] = 65;
        record[17] = 80;
        record[18..22].copy_from_slice(&[0x00, 0x01, 0x86, 0xA0]);
        record[22..24].copy_from_slice(&[0x00, 0x10]);
        record[24] = 0x80;
        record[25] = 0x03;
        record[26] = 0x00;
        record[27] = 0x40;
        record[28] = 0x2B;
        record[29] = 98;
        record[30] = 70;
        record[31] = 2;
        record[32] = 4;
        record
    }

    #[test]
    fn record_decodes_every_field() {
        let record = LogRecord::decode(0, &sample_record()).unwrap();
        assert_eq!(record.index, 1);
        assert_eq!(record.timestamp.to_string(), "2023-11-05 14:30:59");
        assert_eq!(record.pack_voltage, 53.0);
        assert_eq!(record.cell_min_voltage, 3.3);
        assert_eq!(record.cell_max_voltage, 3.333);
        assert_eq!(record.current, -10.0);
        assert_eq!((record.min_temperature, record.max_temperature), (20, 25));
        assert_eq!(record.remaining_capacity, 100_000);
        assert_eq!(record.cycles, 16);
        assert_eq!(record.voltage_state, VoltageState::CellOv);
        assert_eq!(record.current_state.to_string(), "0x03");
        assert_eq!(record.temperature_state, TemperatureState::Normal);
        assert_eq!(record.charge_state.to_string(), "DSG");
        assert_eq!(record.event.to_string(), "Soc Corrected To 0%");
        assert_eq!(record.mos_temperature, 30);
        assert_eq!((record.min_temperature_cell, record.max_temperature_cell), (2, 4));
    }

    #[test]
    fn timestamp_rejects_impossible_dates_and_non_decimal_digits() {
        assert_eq!(
            LogTimestamp::decode(&[0x23, 0x02, 0x30, 0x00, 0x00, 0x00]),
            LogTimestamp::Corrupted
        );
        assert_eq!(
            LogTimestamp::decode(&[0x23, 0x0A, 0x01, 0x00, 0x00, 0x00]),
            LogTimestamp::Corrupted
        );
        assert_eq!(LogTimestamp::Corrupted.to_string(), "corrupted");
    }

    #[test]
    fn records_are_numbered_in_dump_order() {
        let raw = sample_record();
        let records = LogRecord::decode_all([raw.as_slice(), raw.as_slice()]);
        assert_eq!(records[1].index, 2);
        assert!(LogRecord::decode(0, &raw[..32]).is_err());
    }

    #[test]
    fn short_record_is_skipped_and_numbering_continues() {
        let raw = sample_record();
        let records = LogRecord::decode_all([raw.as_slice(), &raw[..32], raw.as_slice()]);
        assert_eq!(records.len(), 2);
        let indices: Vec<usize> = records.iter().map(|record| record.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn unmapped_record_codes_keep_raw_value() {
        let mut raw = sample_record();
        raw[24] = 0xFF;
        raw[27] = 0x11;
        raw[28] = 0xEE;
        let record = LogRecord::decode(0, &raw).unwrap();
        assert_eq!(record.voltage_state, VoltageState::Unknown(0xFF));
        assert_eq!(record.voltage_state.to_string(), "0xff");
        assert_eq!(record.charge_state.to_string(), "0x11");
        assert_eq!(record.event, LogEvent::Unknown(0xEE));
        assert_eq!(record.event.to_string(), "0xee");
        assert_eq!(record.soh, 98);
    }

    #[test]
    fn unknown_event_codes_render_as_hex() {
        assert_eq!(LogEvent::from(0x50).to_string(), "0x50");
        assert_eq!(LogEvent::from(0x80), LogEvent::ChargeCurrentLimitOff);
        assert_eq!(LogEvent::from(0x80).code(), 0x80);
        assert_eq!(LogEvent::from(0x01).to_string(), "Manual Restart");
    }

    #[test]
    fn statistics_from_two_frames() {
        let mut joined = vec![0u8; 53];
        joined[4..6].copy_from_slice(&[0x00, 0x03]); // cot
        joined[42..44].copy_from_slice(&[0x01, 0x00]); // reset
        joined[44..48].copy_from_slice(&[0x00, 0x01, 0x00, 0x00]);
        joined[48..52].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        joined[52] = 0xFF;

        let mut first = vec![0x01];
        first.extend_from_slice(&joined[..27]);
        let mut second = vec![0x02];
        second.extend_from_slice(&joined[27..]);

        let statistics = LogStatistics::from_frames(&first, &second).unwrap();
        assert_eq!(statistics, LogStatistics::decode(&joined).unwrap());
        assert_eq!(statistics.cot_count, 3);
        assert_eq!(statistics.reset_count, 256);
        assert_eq!(statistics.accumulated_discharge_minutes, 65_536);
        assert_eq!(statistics.accumulated_charge_minutes, 256);
        assert_eq!(statistics.app_updates_count, 0);

        joined[52] = 4;
        assert_eq!(LogStatistics::decode(&joined).unwrap().app_updates_count, 4);
        assert!(LogStatistics::decode(&joined[..52]).is_err());
    }
}
