use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use serde::Serialize;
use spbms_lib::{
    client::SpBms,
    identifier::{BmsIdentifier, IdentifierDate},
    slcan::SlcanBus,
    transport::Bus,
};
use std::{collections::BTreeMap, fmt::Debug, ops::Deref, panic};

mod commandline;
mod config;

use commandline::{CliArgs, CliCommands};
use config::{Connection, ConnectionConfig};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

/// Prints `value` as pretty JSON or in debug notation.
fn print_value<T: Serialize + Debug>(json: bool, label: &str, value: &T) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(value)
            .with_context(|| format!("Cannot serialize {label}"))?;
        println!("{text}");
    } else {
        println!("{label}: {value:#?}");
    }
    Ok(())
}

macro_rules! print_result {
    ($json:expr, $label:expr, $call:expr) => {
        print_value(
            $json,
            $label,
            &$call.with_context(|| format!("Cannot get {}", $label))?,
        )?
    };
}

fn run_offline(command: &CliCommands, json: bool) -> Result<()> {
    match command {
        CliCommands::EncodeId {
            batch,
            date,
            serial,
        } => {
            let date = IdentifierDate::try_from(*date)
                .with_context(|| format!("Cannot encode production date {date}"))?;
            let token = BmsIdentifier::new(*batch, date, *serial)
                .and_then(|identifier| identifier.encode())
                .with_context(|| "Cannot encode identifier")?;
            print_value(json, "Identifier", &token)
        }
        CliCommands::DecodeId { token } => {
            let identifier: BmsIdentifier = token
                .parse()
                .with_context(|| format!("Cannot decode identifier '{token}'"))?;
            if !json {
                println!("Production date: {}", identifier.date);
            }
            print_value(json, "Identifier", &identifier)
        }
        other => anyhow::bail!("{other:?} needs a CAN adapter"),
    }
}

fn run<B: Bus>(bms: &mut SpBms<B>, command: CliCommands, json: bool) -> Result<()> {
    match command {
        CliCommands::Status => print_result!(json, "realtime status", bms.get_realtime_status()),
        CliCommands::Voltage => print_result!(json, "voltage status", bms.get_voltage_status()),
        CliCommands::Current => print_result!(json, "current status", bms.get_current_status()),
        CliCommands::Power => print_result!(json, "power status", bms.get_power_status()),
        CliCommands::Parameters { raw: true } => {
            print_result!(json, "raw parameters", bms.get_raw_parameters())
        }
        CliCommands::Parameters { raw: false } => {
            print_result!(json, "parameters", bms.get_parameters())
        }
        CliCommands::Log => print_result!(json, "log", bms.get_log()),
        CliCommands::Info => print_result!(json, "device info", bms.get_device_info()),
        CliCommands::Firmware { boot } => {
            print_result!(json, "firmware version", bms.get_firmware_version(boot))
        }
        CliCommands::NodeStatus { node } => {
            print_result!(json, "node status", bms.get_node_status(node))
        }
        CliCommands::NodeLog { node } => print_result!(json, "node log", bms.get_node_log(node)),
        CliCommands::Scan { first, last } => {
            print_result!(json, "nodes", bms.scan(first..=last))
        }
        CliCommands::ReadCustom { node, index, word } => {
            let value = if word {
                bms.read_custom_word(node, index)
            } else {
                bms.read_custom_byte(node, index).map(u16::from)
            };
            print_result!(json, "custom parameter", value)
        }
        CliCommands::WriteCustom {
            node,
            index,
            value,
            word,
        } => {
            let written = if word {
                bms.write_custom_word(node, index, value)
            } else {
                let byte = u8::try_from(value)
                    .with_context(|| format!("Value {value} does not fit into a byte"))?;
                bms.write_custom_byte(node, index, byte).map(u16::from)
            };
            print_result!(json, "custom parameter", written)
        }
        CliCommands::SetBitrate { bitrate } => bms
            .change_bitrate(bitrate)
            .with_context(|| format!("Cannot switch bus to {bitrate}"))?,
        CliCommands::RecalibrateSoc { node } => bms
            .recalibrate_soc(node)
            .with_context(|| format!("Cannot recalibrate SOC of node {node}"))?,
        CliCommands::FirmwareUpgrade { node, enable } => bms
            .set_firmware_upgrade(node, enable)
            .with_context(|| format!("Cannot change firmware upgrade setting of node {node}"))?,
        CliCommands::WriteSerial { serial } => bms
            .write_serial_number(serial)
            .with_context(|| "Cannot write serial number")?,
        CliCommands::WriteModel { model, date } => bms
            .write_model_and_date(&model, date)
            .with_context(|| "Cannot write model and production date")?,
        CliCommands::Calibrate { cells, backup_dir } => {
            let targets: BTreeMap<u8, f32> = cells.into_iter().collect();
            let (backup, coefficients) = bms
                .calibrate_cells(&targets, &backup_dir)
                .with_context(|| "Cannot calibrate cell voltages")?;
            info!("Previous cell voltages saved to {}", backup.display());
            print_value(json, "calibration coefficients", &coefficients)?
        }
        CliCommands::Shutdown => bms.shutdown().with_context(|| "Cannot shut down")?,
        offline @ (CliCommands::EncodeId { .. } | CliCommands::DecodeId { .. }) => {
            run_offline(&offline, json)?
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    if args.command.is_offline() {
        return run_offline(&args.command, args.json);
    }

    let config = ConnectionConfig::resolve(args.config.as_deref())?;
    let connection = Connection::new(&args, config);
    debug!("Connecting with {connection:?}");

    let bus = SlcanBus::open(&connection.device, connection.bitrate)
        .with_context(|| format!("Cannot open CAN adapter '{}'", connection.device))?;
    let mut bms = SpBms::with_timing(bus, connection.timing);

    run(&mut bms, args.command, args.json)
}
