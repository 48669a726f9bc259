//! Cell voltage calibration.
//!
//! The pack reports raw ADC cell voltages on command 0x0F. A calibration
//! coefficient per cell is `raw_mV / volts`, one decimal, and is written back
//! multiplied by ten.

use crate::fields::{round_to, Fields};
use crate::protocol::{build, Address, Command};
use crate::status::decode_cell_words;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const RAW_CELL_COUNT: usize = 2;
const CALIBRATION_WRITE: u8 = 0x02;

/// Raw cell readings in mV, in cell order.
pub fn decode_raw_cells(payload: &[u8]) -> Result<Vec<u16>> {
    let fields = Fields::new(payload);
    let cells = fields.byte(RAW_CELL_COUNT)?;
    Ok(decode_cell_words(&fields, cells)?.into_values().collect())
}

pub fn coefficient(raw_mv: u16, volts: f32) -> Result<f32> {
    if volts.is_nan() || volts <= 0.0 {
        return Err(Error::out_of_range("calibration voltage (mV)", (volts * 1000.0) as i64));
    }
    Ok(round_to(raw_mv as f32 / volts, 1))
}

/// Coefficients for every cell. Cells without a target keep the voltage the
/// pack currently reports; `targets` are keyed by cell number starting at 1.
pub fn plan(raw: &[u16], reported: &[f32], targets: &BTreeMap<u8, f32>) -> Result<Vec<f32>> {
    if raw.len() != reported.len() {
        log::warn!(
            "{} raw cells but {} reported cell voltages",
            raw.len(),
            reported.len()
        );
        return Err(Error::out_of_range("raw cell count", raw.len() as i64));
    }
    if let Some(cell) = targets
        .keys()
        .find(|cell| **cell == 0 || **cell as usize > raw.len())
    {
        return Err(Error::out_of_range("cell number", *cell));
    }
    raw.iter()
        .zip(reported)
        .enumerate()
        .map(|(i, (raw_mv, volts))| {
            let target = targets
                .get(&(i as u8 + 1))
                .map(|v| round_to(*v, 3))
                .unwrap_or(*volts);
            coefficient(*raw_mv, target)
        })
        .collect()
}

/// Packet writing all coefficients: `02 n (cell hi lo)*`.
pub fn calibration_request(coefficients: &[f32]) -> Result<Vec<u8>> {
    let cells = u8::try_from(coefficients.len())
        .map_err(|_| Error::out_of_range("cell count", coefficients.len() as i64))?;
    let mut data = vec![CALIBRATION_WRITE, cells];
    for (i, coefficient) in coefficients.iter().enumerate() {
        let scaled = (coefficient * 10.0).round();
        if !(0.0..=u16::MAX as f32).contains(&scaled) {
            return Err(Error::out_of_range("calibration coefficient", scaled as i64));
        }
        data.push(i as u8 + 1);
        data.extend_from_slice(&(scaled as u16).to_be_bytes());
    }
    build(Address::Pack, Command::CellVoltages as u8, &data)
}

/// Cell voltages before a calibration, written to a text file.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBackup {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub cell_voltages: Vec<f32>,
}

impl CalibrationBackup {
    /// Writes `backup_cell_voltages_<timestamp>.txt` into `directory`, which
    /// is created if needed.
    pub fn write_to(&self, directory: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(directory)?;
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%6f");
        let path = directory.join(format!("backup_cell_voltages_{stamp}.txt"));
        let millivolts = self
            .cell_voltages
            .iter()
            .map(|v| ((v * 1000.0).round() as u32).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "Model: {}", self.model.as_deref().unwrap_or("Unknown"))?;
        writeln!(file, "Serial: {}", self.serial.as_deref().unwrap_or("Unknown"))?;
        writeln!(file, "Existing cell voltages: [{millivolts}]")?;
        log::info!("Cell voltage backup written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SpPacket;

    #[test]
    fn raw_cells_use_the_cell_count_at_byte_two() {
        let payload = [0x10, 0x00, 0x02, 0x0C, 0xE4, 0x0C, 0xF0, 0x00];
        assert_eq!(decode_raw_cells(&payload).unwrap(), vec![3300, 3312]);
    }

    #[test]
    fn coefficients() {
        assert_eq!(coefficient(3300, 3.3).unwrap(), 1000.0);
        assert_eq!(coefficient(3312, 3.3).unwrap(), 1003.6);
        assert!(coefficient(3300, 0.0).is_err());
    }

    #[test]
    fn plan_overrides_targets_only() {
        let targets = BTreeMap::from([(2, 3.312)]);
        let plan = plan(&[3300, 3312], &[3.3, 3.3], &targets).unwrap();
        assert_eq!(plan, vec![1000.0, 1000.0]);
        assert!(super::plan(&[3300], &[3.3, 3.3], &BTreeMap::new()).is_err());
        assert!(super::plan(&[3300], &[3.3], &BTreeMap::from([(2, 3.3)])).is_err());
    }

    #[test]
    fn request_layout() {
        let packet = calibration_request(&[1000.0, 1003.6]).unwrap();
        let parsed = SpPacket::validate(&packet).unwrap();
        assert_eq!(parsed.command, 0x0F);
        assert_eq!(
            parsed.payload,
            vec![0x02, 2, 1, 0x27, 0x10, 2, 0x27, 0x34]
        );
    }

    #[test]
    fn backup_file() {
        let directory = tempfile::tempdir().unwrap();
        let backup = CalibrationBackup {
            model: Some("ADL24".to_string()),
            serial: None,
            cell_voltages: vec![3.3, 3.312],
        };
        let path = backup.write_to(&directory.path().join("backup")).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Model: ADL24\n"));
        assert!(text.contains("Serial: Unknown\n"));
        assert!(text.contains("[3300, 3312]"));
    }
}
