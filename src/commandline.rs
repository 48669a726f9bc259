use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use spbms_lib::transport::Bitrate;
use std::{path::PathBuf, time::Duration};

const DEFAULT_BACKUP_DIR: &str = "backup_cell_voltage_data";

/// Parses `<cell>=<volts>`, e.g. `3=3.312`.
fn parse_cell_target(s: &str) -> Result<(u8, f32), String> {
    let (cell, volts) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <cell>=<volts>, got '{s}'"))?;
    let cell = cell
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("invalid cell number '{cell}': {e}"))?;
    let volts = volts
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("invalid voltage '{volts}': {e}"))?;
    Ok((cell, volts))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show voltage, current and power status of the pack
    Status,
    /// Show cell count and cell voltages
    Voltage,
    /// Show current, protection flags, temperatures and balancing
    Current,
    /// Show state of charge, capacities and remaining times
    Power,
    /// Show all configuration parameters
    Parameters {
        /// Print the undecoded parameter frames instead
        #[clap(long, action)]
        raw: bool,
    },
    /// Read log statistics and log records of the pack
    Log,
    /// Show BMS model, serial number, model field and production date
    Info,
    /// Show the firmware version
    Firmware {
        /// Ask the bootloader instead of the application
        #[clap(long, action)]
        boot: bool,
    },
    /// Show the status of one node on a multi node bus
    NodeStatus {
        /// Node id (decimal or 0x prefixed hex)
        #[clap(value_parser = maybe_hex::<u8>)]
        node: u8,
    },
    /// Read the log of one node
    NodeLog {
        #[clap(value_parser = maybe_hex::<u8>)]
        node: u8,
    },
    /// Find the nodes answering on the bus and their serial numbers
    Scan {
        #[clap(long, value_parser = maybe_hex::<u8>, default_value = "2")]
        first: u8,
        #[clap(long, value_parser = maybe_hex::<u8>, default_value = "0xFF")]
        last: u8,
    },
    /// Read a custom parameter of a node
    ReadCustom {
        #[clap(value_parser = maybe_hex::<u8>)]
        node: u8,
        /// Parameter index, 1 to 30
        index: u8,
        /// Read a 16 bit value instead of a byte
        #[clap(long, action)]
        word: bool,
    },
    /// Write a custom parameter of a node
    WriteCustom {
        #[clap(value_parser = maybe_hex::<u8>)]
        node: u8,
        /// Parameter index, 1 to 30
        index: u8,
        #[clap(value_parser = maybe_hex::<u16>)]
        value: u16,
        /// Write a 16 bit value instead of a byte
        #[clap(long, action)]
        word: bool,
    },
    /// Switch every node and the adapter to another bitrate
    SetBitrate {
        /// 125k, 250k, 500k or 1M
        bitrate: Bitrate,
    },
    /// Recalibrate the state of charge of a node
    RecalibrateSoc {
        #[clap(value_parser = maybe_hex::<u8>)]
        node: u8,
    },
    /// Enable or disable firmware upgrades of a node
    FirmwareUpgrade {
        #[clap(value_parser = maybe_hex::<u8>)]
        node: u8,
        /// Enable upgrades. If this flag is not present, they will be disabled.
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Write the battery serial number (Use with caution!)
    WriteSerial {
        /// Serial number, 1 to 999999
        serial: u32,
    },
    /// Write the model and production date (Use with caution!)
    WriteModel {
        /// Model name, at most 26 characters
        model: String,
        /// Production date (e.g., 2024-03-15)
        date: NaiveDate,
    },
    /// Calibrate cell voltages against reference measurements (Use with caution!)
    Calibrate {
        /// Measured cell voltages as <cell>=<volts> (e.g., 3=3.312)
        #[clap(required = true, value_parser = parse_cell_target)]
        cells: Vec<(u8, f32)>,
        /// Directory receiving the backup of the current cell voltages
        #[clap(long, default_value = DEFAULT_BACKUP_DIR)]
        backup_dir: PathBuf,
    },
    /// Shut the pack down
    Shutdown,
    /// Encode a BMS identifier token
    EncodeId {
        /// Batch number, 0 to 99999
        batch: u32,
        /// Production date (e.g., 2024-03-15)
        date: NaiveDate,
        /// Serial number of the day, 0 to 9999
        serial: u16,
    },
    /// Decode a 13 digit BMS identifier token
    DecodeId { token: String },
}

impl CliCommands {
    /// Commands that do not touch the bus.
    pub fn is_offline(&self) -> bool {
        matches!(self, CliCommands::EncodeId { .. } | CliCommands::DecodeId { .. })
    }
}

const fn about_text() -> &'static str {
    "SP battery management system command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// YAML file with connection defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial device of the CAN adapter (e.g., /dev/ttyACM0 on Linux, COM3 on Windows)
    #[arg(short, long)]
    pub device: Option<String>,

    /// CAN bitrate: 125k, 250k, 500k or 1M
    #[arg(short, long)]
    pub bitrate: Option<Bitrate>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for one reply (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    /// Delay between two requests (e.g., "10ms", "50ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub delay: Option<Duration>,

    /// Delay after every transmitted CAN frame (e.g., "5ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub frame_delay: Option<Duration>,

    /// Empty polls tolerated while waiting for a reply
    #[arg(long)]
    pub retries: Option<u32>,

    /// Print results as JSON
    #[arg(long, action)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn node_ids_accept_hex() {
        let args = CliArgs::parse_from(["spbms", "node-status", "0x0A"]);
        assert_eq!(args.command, CliCommands::NodeStatus { node: 10 });
    }

    #[test]
    fn calibration_targets() {
        assert_eq!(parse_cell_target("3=3.312"), Ok((3, 3.312)));
        assert!(parse_cell_target("3:3.312").is_err());
        let args = CliArgs::parse_from(["spbms", "--bitrate", "500k", "calibrate", "1=3.3", "2=3.31"]);
        assert_eq!(args.bitrate, Some(Bitrate::K500));
        match args.command {
            CliCommands::Calibrate { cells, backup_dir } => {
                assert_eq!(cells, vec![(1, 3.3), (2, 3.31)]);
                assert_eq!(backup_dir, PathBuf::from(DEFAULT_BACKUP_DIR));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
