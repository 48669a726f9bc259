//! Blocking client pairing requests with their replies.
//!
//! Every exchange is a transaction: the receive queue is flushed before the
//! request goes out and again once the transaction ends, whatever its outcome.
//! Only one transaction is in flight at a time, the reassembly state of both
//! framings is global to the bus.

use crate::calibration::{self, CalibrationBackup};
use crate::device::{decode_bms_model, decode_serial, DeviceInfo, ModelField};
use crate::framer::{
    collect, node_request, AddressedFramer, AddressedLayout, Budget, SentinelFramer,
    NODE_RESPONSE_ID,
};
use crate::history::{LogDump, LogRecord, LogStatistics};
use crate::identifier::BmsIdentifier;
use crate::node::{self, NodeFrame, NodeStatus};
use crate::parameters::{ParameterFrame, ParameterSet, RawParameters};
use crate::protocol::{self, Command, SpPacket, BOOT_FIRMWARE_REQUEST};
use crate::status::{CurrentStatus, Firmware, PowerStatus, RealtimeStatus, VoltageStatus};
use crate::transport::{Bitrate, Bus};
use crate::error::Malformed;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut, RangeInclusive};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Leading bytes a reply shares with its request: start byte, product id and address.
const MATCHED_HEADER: usize = 3;
const SHUTDOWN_REPEATS: usize = 10;
const BOOT_FIRMWARE_BYTE: usize = 5;
/// Current status offset of the firmware byte, before the temperature probes.
const FIRMWARE_OFFSET: usize = 13;
/// Replies to the serial request of packs without a model field command.
const LEGACY_MODEL_PACKETS: usize = 2;
const BITRATE_SETTLE: Duration = Duration::from_millis(100);

/// Timing of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Timing {
    /// Deadline for one reply.
    pub timeout: Duration,
    /// Empty polls tolerated while waiting for one reply.
    pub retries: u32,
    /// Pause after every transmitted frame.
    pub frame_delay: Duration,
    /// Minimum pause between the end of one transaction and the next request.
    pub delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            retries: 50,
            frame_delay: Duration::from_millis(5),
            delay: Duration::from_millis(10),
        }
    }
}

impl Timing {
    pub fn budget(&self) -> Budget {
        Budget::new(self.timeout, self.retries)
    }
}

/// Exclusive use of the bus for one request and its replies.
struct Transaction<'a, B: Bus> {
    bus: &'a mut B,
}

impl<'a, B: Bus> Transaction<'a, B> {
    fn begin(bus: &'a mut B) -> Result<Self> {
        bus.flush()?;
        Ok(Self { bus })
    }
}

impl<B: Bus> Drop for Transaction<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.bus.flush() {
            log::warn!("Cannot flush bus after transaction: {err}");
        }
    }
}

impl<B: Bus> Deref for Transaction<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.bus
    }
}

impl<B: Bus> DerefMut for Transaction<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bus
    }
}

/// A pack (sentinel framing) and the nodes (addressed framing) reachable on one bus.
#[derive(Debug)]
pub struct SpBms<B: Bus> {
    bus: B,
    timing: Timing,
    last_execution: Instant,
}

impl<B: Bus> SpBms<B> {
    pub fn new(bus: B) -> Self {
        Self::with_timing(bus, Timing::default())
    }

    pub fn with_timing(bus: B, timing: Timing) -> Self {
        Self {
            bus,
            timing,
            last_execution: Instant::now()
                .checked_sub(timing.delay)
                .unwrap_or_else(Instant::now),
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timing.timeout = timeout;
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.timing.retries = retries;
    }

    pub fn set_frame_delay(&mut self, frame_delay: Duration) {
        self.timing.frame_delay = frame_delay;
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.timing.delay = delay;
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    fn await_delay(&self) {
        let elapsed = Instant::now().duration_since(self.last_execution);
        if let Some(remaining) = self.timing.delay.checked_sub(elapsed) {
            std::thread::sleep(remaining);
        }
    }

    /// Runs `exchange` inside a flushed transaction.
    fn transaction<T>(&mut self, exchange: impl FnOnce(&mut B, Timing) -> Result<T>) -> Result<T> {
        self.await_delay();
        let timing = self.timing;
        let result = {
            let mut transaction = Transaction::begin(&mut self.bus)?;
            exchange(&mut *transaction, timing)
        };
        self.last_execution = Instant::now();
        result
    }

    /// Sends `request` and waits for `expected` replies whose first three bytes
    /// match the request. Unrelated packets are dropped.
    pub fn query(&mut self, request: &[u8], expected: usize) -> Result<Vec<SpPacket>> {
        let header = request
            .get(..MATCHED_HEADER)
            .ok_or(Malformed::TooShort(request.len()))?
            .to_vec();
        self.transaction(|bus, timing| {
            let framer = SentinelFramer::new(timing.frame_delay);
            framer.send(bus, request)?;
            let started = Instant::now();
            let deadline = started + timing.timeout * expected.max(1) as u32;
            let mut packets = Vec::with_capacity(expected);
            while packets.len() < expected {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout {
                        waited: started.elapsed(),
                    });
                }
                let bytes = framer.receive(bus, Budget::new(remaining, timing.retries))?;
                if bytes.get(..MATCHED_HEADER) != Some(header.as_slice()) {
                    log::warn!("Dropping unrelated packet {bytes:02X?}");
                    continue;
                }
                let packet = SpPacket::parse(&bytes)?;
                log::trace!("Reply to 0x{:02X}: {:02X?}", packet.command, packet.payload);
                packets.push(packet);
            }
            log::debug!("Received {} packet(s) for {request:02X?}", packets.len());
            Ok(packets)
        })
    }

    /// Payload of the single reply to `request`.
    fn query_payload(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut packets = self.query(request, 1)?;
        packets
            .pop()
            .map(|packet| packet.payload)
            .ok_or(Error::Timeout {
                waited: self.timing.timeout,
            })
    }

    /// Sends `request` without waiting for any reply.
    fn send_only(&mut self, request: &[u8]) -> Result<()> {
        self.transaction(|bus, timing| SentinelFramer::new(timing.frame_delay).send(bus, request))
    }

    pub fn get_voltage_status(&mut self) -> Result<VoltageStatus> {
        VoltageStatus::decode(&self.query_payload(&VoltageStatus::request())?)
    }

    pub fn get_current_status(&mut self) -> Result<CurrentStatus> {
        CurrentStatus::decode(&self.query_payload(&CurrentStatus::request())?)
    }

    pub fn get_power_status(&mut self) -> Result<PowerStatus> {
        PowerStatus::decode(&self.query_payload(&PowerStatus::request())?)
    }

    pub fn get_realtime_status(&mut self) -> Result<RealtimeStatus> {
        Ok(RealtimeStatus {
            voltage: self.get_voltage_status()?,
            current: self.get_current_status()?,
            power: self.get_power_status()?,
        })
    }

    /// Battery serial, `None` when none is programmed.
    pub fn get_serial(&mut self) -> Result<Option<String>> {
        decode_serial(&self.query_payload(&Command::Serial.request())?)
    }

    pub fn get_bms_model(&mut self) -> Result<String> {
        decode_bms_model(&self.query_payload(&Command::BmsModel.request())?)
    }

    /// Model field. Older packs do not know command 0x30 and send the field as
    /// the second reply to the serial request instead.
    pub fn get_model_field(&mut self) -> Result<ModelField> {
        match self.query_payload(&Command::ModelField.request()) {
            Ok(payload) => ModelField::decode(&payload),
            Err(Error::Timeout { .. }) => {
                log::debug!("No model field reply, trying the serial request");
                let packets = self.query(&Command::Serial.request(), LEGACY_MODEL_PACKETS)?;
                let legacy = packets.last().ok_or(Error::Timeout {
                    waited: self.timing.timeout,
                })?;
                ModelField::decode(&legacy.payload)
            }
            Err(err) => Err(err),
        }
    }

    /// BMS identifier stored in the model field, `None` if the field has none.
    pub fn get_bms_identifier(&mut self) -> Result<Option<BmsIdentifier>> {
        self.get_model_field()?.identifier().transpose()
    }

    /// Collects everything the pack tells about itself. Missing pieces are
    /// logged and left empty.
    pub fn get_device_info(&mut self) -> Result<DeviceInfo> {
        let bms_model = self
            .get_bms_model()
            .inspect_err(|err| log::warn!("Cannot read BMS model: {err}"))
            .ok();
        let serial = self.get_serial()?;
        let field = self
            .get_model_field()
            .inspect_err(|err| log::warn!("Cannot read model field: {err}"))
            .ok();
        Ok(DeviceInfo {
            bms_model,
            serial,
            model: field.as_ref().map(|field| field.model().to_string()),
            identifier: field
                .as_ref()
                .and_then(ModelField::identifier_text)
                .map(str::to_string),
            production_date: field.and_then(|field| field.production_date),
        })
    }

    /// Firmware version. In boot mode the bootloader answers its own request
    /// outside the SP packet envelope.
    pub fn get_firmware_version(&mut self, boot: bool) -> Result<Firmware> {
        if boot {
            let reply = self.transaction(|bus, timing| {
                let framer = SentinelFramer::new(timing.frame_delay);
                framer.send(bus, &BOOT_FIRMWARE_REQUEST)?;
                framer.receive(bus, timing.budget())
            })?;
            let version = reply
                .get(BOOT_FIRMWARE_BYTE)
                .copied()
                .ok_or(Error::PayloadTooShort {
                    required: BOOT_FIRMWARE_BYTE + 1,
                    received: reply.len(),
                })?;
            return Ok(Firmware::from(version));
        }
        let payload = self.query_payload(&CurrentStatus::request())?;
        let current = CurrentStatus::decode(&payload)?;
        current.firmware.ok_or(Error::PayloadTooShort {
            required: FIRMWARE_OFFSET + current.temperature_probes as usize + 1,
            received: payload.len(),
        })
    }

    /// Payloads of every parameter frame and of the custom parameter block.
    pub fn get_raw_parameters(&mut self) -> Result<RawParameters> {
        let mut raw = RawParameters::default();
        for frame in ParameterFrame::ALL {
            let payload = self
                .query_payload(&frame.request())
                .inspect_err(|err| {
                    log::warn!("Cannot read parameter frame 0x{:02X}: {err}", frame.command() as u8)
                })?;
            raw.frames.insert(frame, payload);
        }
        raw.custom = match self.query_payload(&Command::CustomParameters.request()) {
            Ok(payload) => Some(payload),
            Err(Error::Timeout { .. }) => {
                log::warn!("No custom parameter reply");
                None
            }
            Err(err) => return Err(err),
        };
        Ok(raw)
    }

    /// All parameters, scaled with the front end and shunt of this pack.
    pub fn get_parameters(&mut self) -> Result<ParameterSet> {
        let current = self.get_current_status()?;
        let power = self.get_power_status()?;
        let raw = self.get_raw_parameters()?;
        ParameterSet::decode(&raw, &current, &power)
    }

    /// Reads the log. The pack streams statistics and records until it falls
    /// silent; a dump without any packet is a timeout.
    pub fn get_log(&mut self) -> Result<LogDump> {
        let request = Command::Log.request();
        let payloads = self.transaction(|bus, timing| {
            let framer = SentinelFramer::new(timing.frame_delay);
            framer.send(bus, &request)?;
            let mut packets = Vec::new();
            loop {
                match framer.receive(bus, timing.budget()) {
                    Ok(bytes) => match SpPacket::parse(&bytes) {
                        Ok(packet) => packets.push(packet),
                        Err(err) => log::warn!("Dropping log packet: {err}"),
                    },
                    Err(Error::Timeout { waited }) if packets.is_empty() => {
                        return Err(Error::Timeout { waited });
                    }
                    Err(Error::Timeout { .. }) => break,
                    Err(err) => return Err(err),
                }
            }
            Ok(packets)
        })?;

        let statistics: Vec<&[u8]> = payloads
            .iter()
            .filter(|packet| packet.command == Command::LogStatistics as u8)
            .map(|packet| packet.payload.as_slice())
            .collect();
        let records = payloads
            .iter()
            .filter(|packet| packet.command == Command::Log as u8)
            .map(|packet| packet.payload.as_slice());
        let statistics = match statistics.as_slice() {
            [first, second, ..] => Some(LogStatistics::from_frames(first, second)?),
            [] => None,
            [_] => {
                log::warn!("Incomplete log statistics");
                None
            }
        };
        let records = LogRecord::decode_all(records);
        log::debug!("Read {} log records", records.len());
        Ok(LogDump {
            statistics,
            records,
        })
    }

    pub fn write_serial_number(&mut self, serial: u32) -> Result<()> {
        self.send_only(&protocol::write_serial_request(serial)?)
    }

    pub fn write_model_and_date(&mut self, model: &str, date: chrono::NaiveDate) -> Result<()> {
        self.send_only(&protocol::write_model_request(model, date)?)
    }

    /// Broadcasts the shutdown request a number of times, no reply is expected.
    pub fn shutdown(&mut self) -> Result<()> {
        let request = protocol::shutdown_request();
        for _ in 0..SHUTDOWN_REPEATS {
            self.send_only(&request)?;
        }
        Ok(())
    }

    /// Raw cell readings in mV, in cell order.
    pub fn get_raw_cell_voltages(&mut self) -> Result<Vec<u16>> {
        calibration::decode_raw_cells(&self.query_payload(&protocol::raw_cell_voltages_request())?)
    }

    /// Calibrates the cells in `targets` (cell number to volts), the other cells
    /// keep their current reading. A backup of the current readings is written
    /// into `backup_dir` first. Returns the backup path and the coefficients sent.
    pub fn calibrate_cells(
        &mut self,
        targets: &BTreeMap<u8, f32>,
        backup_dir: &Path,
    ) -> Result<(PathBuf, Vec<f32>)> {
        let model = self
            .get_model_field()
            .map(|field| field.model().to_string())
            .inspect_err(|err| log::warn!("Cannot read model for backup: {err}"))
            .ok();
        let serial = self
            .get_serial()
            .inspect_err(|err| log::warn!("Cannot read serial for backup: {err}"))
            .ok()
            .flatten();
        let reported: Vec<f32> = self.get_voltage_status()?.cell_voltages.into_values().collect();
        if reported.len() < 2 {
            return Err(Error::out_of_range("cell count", reported.len() as i64));
        }
        let backup = CalibrationBackup {
            model,
            serial,
            cell_voltages: reported.clone(),
        }
        .write_to(backup_dir)?;

        let raw = self.get_raw_cell_voltages()?;
        let coefficients = calibration::plan(&raw, &reported, targets)?;
        log::info!("Writing calibration coefficients {coefficients:?}");
        self.send_only(&calibration::calibration_request(&coefficients)?)?;
        Ok((backup, coefficients))
    }

    /// Reassembles the addressed reply to `request` from `node`.
    fn node_transfer(&mut self, node: u8, request: NodeFrame, layout: AddressedLayout) -> Result<Vec<u8>> {
        let frame = node_request(request)?;
        self.transaction(|bus, timing| {
            log::trace!("tx {frame:?}");
            bus.send(&frame)?;
            AddressedFramer::new(node, layout).receive(bus, timing.budget())
        })
    }

    /// Sends a single node frame and waits for the next single frame reply.
    fn node_exchange(&mut self, request: NodeFrame) -> Result<Vec<u8>> {
        let frame = node_request(request)?;
        self.transaction(|bus, timing| {
            log::trace!("tx {frame:?}");
            bus.send(&frame)?;
            collect(bus, timing.budget(), |reply| {
                (reply.id() == NODE_RESPONSE_ID).then(|| reply.data().to_vec())
            })
        })
    }

    fn node_send(&mut self, request: NodeFrame) -> Result<()> {
        let frame = node_request(request)?;
        self.transaction(|bus, _| {
            log::trace!("tx {frame:?}");
            bus.send(&frame)
        })
    }

    pub fn get_node_status(&mut self, node: u8) -> Result<NodeStatus> {
        let data = self.node_transfer(node, node::status_request(node)?, AddressedLayout::Declared)?;
        NodeStatus::decode(&data)
    }

    pub fn get_node_serial(&mut self, node: u8) -> Result<String> {
        let data = self.node_transfer(node, node::status_request(node)?, AddressedLayout::Declared)?;
        node::decode_node_serial(&data)
    }

    /// Log records of one node, until the node falls silent.
    pub fn get_node_log(&mut self, node: u8) -> Result<Vec<LogRecord>> {
        let frame = node_request(node::log_request(node)?)?;
        let records = self.transaction(|bus, timing| {
            log::trace!("tx {frame:?}");
            bus.send(&frame)?;
            let framer = AddressedFramer::new(node, AddressedLayout::LogRecord);
            let mut records = Vec::new();
            loop {
                match framer.receive(bus, timing.budget()) {
                    Ok(record) => records.push(record),
                    Err(Error::Timeout { waited }) if records.is_empty() => {
                        return Err(Error::Timeout { waited });
                    }
                    Err(Error::Timeout { .. }) => break,
                    Err(err) => return Err(err),
                }
            }
            Ok(records)
        })?;
        Ok(LogRecord::decode_all(records.iter().map(Vec::as_slice)))
    }

    /// Node ids in `nodes` that answer a status request, with their serials.
    pub fn scan(&mut self, nodes: RangeInclusive<u8>) -> Result<BTreeMap<u8, String>> {
        let mut found = BTreeMap::new();
        for node in nodes.filter(|node| *node >= node::MIN_NODE_ID) {
            match self.get_node_serial(node) {
                Ok(serial) => {
                    log::info!("Node {node} has serial {serial}");
                    found.insert(node, serial);
                }
                Err(Error::Timeout { .. }) => log::debug!("No reply from node {node}"),
                Err(err) => log::warn!("Ignoring node {node}: {err}"),
            }
        }
        Ok(found)
    }

    pub fn read_custom_byte(&mut self, node: u8, index: u8) -> Result<u8> {
        node::custom_byte_value(&self.node_exchange(node::read_custom_byte_request(node, index)?)?)
    }

    /// Writes a custom byte and returns the value the node reports back.
    pub fn write_custom_byte(&mut self, node: u8, index: u8, value: u8) -> Result<u8> {
        node::custom_byte_value(&self.node_exchange(node::write_custom_byte_request(
            node, index, value,
        )?)?)
    }

    pub fn read_custom_word(&mut self, node: u8, index: u8) -> Result<u16> {
        node::custom_word_value(&self.node_exchange(node::read_custom_word_request(node, index)?)?)
    }

    pub fn write_custom_word(&mut self, node: u8, index: u8, value: u16) -> Result<u16> {
        node::custom_word_value(&self.node_exchange(node::write_custom_word_request(
            node, index, value,
        )?)?)
    }

    pub fn recalibrate_soc(&mut self, node: u8) -> Result<()> {
        self.node_send(node::soc_recalibration_request(node)?)
    }

    /// Enables or disables firmware upgrades, the node acknowledges with one frame.
    pub fn set_firmware_upgrade(&mut self, node: u8, enable: bool) -> Result<()> {
        self.node_exchange(node::firmware_upgrade_request(node, enable)?)
            .map(|_| ())
    }

    /// Switches every node and then the local adapter to `bitrate`.
    pub fn change_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
        self.node_send(node::bitrate_request(bitrate))?;
        std::thread::sleep(BITRATE_SETTLE);
        log::info!("Switching bus to {bitrate}");
        self.bus.set_bitrate(bitrate)?;
        self.bus.flush()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.bus.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{NODE_REQUEST_ID, SENTINEL_DATA_ID, SENTINEL_START_ID};
    use crate::protocol::{build, Address};
    use crate::transport::mock::MockBus;
    use crate::transport::BusFrame;

    fn fast() -> Timing {
        Timing {
            timeout: Duration::from_millis(200),
            retries: 5,
            frame_delay: Duration::ZERO,
            delay: Duration::ZERO,
        }
    }

    fn reply(command: u8, payload: &[u8]) -> Vec<u8> {
        build(Address::Pack, command, payload).unwrap()
    }

    #[test]
    fn voltage_status_end_to_end() {
        let bus = MockBus::sp_device(|request| {
            assert_eq!(request, &[0xEA, 0xD1, 0x01, 0x04, 0xFF, 0x02, 0xF9, 0xF5]);
            vec![reply(0x02, &[0x02, 0x00, 0x00, 0x0F, 0xA0, 0x0F, 0xA5])]
        });
        let mut bms = SpBms::with_timing(bus, fast());
        let status = bms.get_voltage_status().unwrap();
        assert_eq!(status.cell_voltages, BTreeMap::from([(1, 4.0), (2, 4.005)]));
        assert_eq!(status.cell_voltage_diff, 0.005);
        assert_eq!(
            bms.bus().sent_data(SENTINEL_DATA_ID),
            vec![vec![0xEA, 0xD1, 0x01, 0x04, 0xFF, 0x02, 0xF9, 0xF5]]
        );
    }

    #[test]
    fn silent_bus_times_out_within_budget() {
        let mut bms = SpBms::with_timing(MockBus::silent(), fast());
        let started = Instant::now();
        let result = bms.get_power_status();
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(bms.bus().polls, 5);
    }

    #[test]
    fn bus_is_flushed_before_and_after_each_transaction() {
        let bus = MockBus::sp_device(|_| vec![reply(0x02, &[0x01, 0x00, 0x00, 0x0C, 0xE4])]);
        let mut bms = SpBms::with_timing(bus, fast());
        bms.get_voltage_status().unwrap();
        assert_eq!(bms.bus().flushes, 2);
        let mut silent = SpBms::with_timing(MockBus::silent(), fast());
        assert!(silent.get_serial().is_err());
        assert_eq!(silent.bus().flushes, 2);
    }

    #[test]
    fn unrelated_packets_are_skipped() {
        let bus = MockBus::sp_device(|_| {
            vec![
                build(Address::Broadcast, 0x08, &[0; 33]).unwrap(),
                reply(0x11, &[0x06, b'0', b'0', b'1', b'2', b'3', b'4']),
            ]
        });
        let mut bms = SpBms::with_timing(bus, fast());
        assert_eq!(bms.get_serial().unwrap(), Some("001234".to_string()));
    }

    #[test]
    fn corrupted_reply_is_surfaced() {
        let bus = MockBus::sp_device(|_| {
            let mut packet = reply(0x02, &[0x01, 0x00, 0x00, 0x0C, 0xE4]);
            packet[6] ^= 0xFF;
            vec![packet]
        });
        let mut bms = SpBms::with_timing(bus, fast());
        assert!(matches!(
            bms.get_voltage_status(),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn model_field_falls_back_to_second_serial_reply() {
        let bus = MockBus::sp_device(|request| match request[5] {
            0x30 => vec![],
            0x11 => vec![
                reply(0x11, &[0x06, b'0', b'0', b'0', b'0', b'4', b'2']),
                reply(0x11, &[0x05, b'A', b'D', b'L', b'2', b'4', 8, 2, 14]),
            ],
            _ => vec![],
        });
        let mut bms = SpBms::with_timing(bus, fast());
        let field = bms.get_model_field().unwrap();
        assert_eq!(field.model(), "ADL24");
        assert_eq!(
            field.production_date,
            chrono::NaiveDate::from_ymd_opt(2023, 3, 15)
        );
    }

    #[test]
    fn log_dump_splits_statistics_and_records() {
        let bus = MockBus::sp_device(|_| {
            let mut statistics = vec![0u8; 30];
            statistics[5..7].copy_from_slice(&[0x00, 0x03]);
            let mut packets = vec![
                build(Address::Pack, 0x09, &statistics).unwrap(),
                build(Address::Pack, 0x09, &[0u8; 30]).unwrap(),
            ];
            for _ in 0..3 {
                packets.push(build(Address::Pack, 0x08, &[0u8; 33]).unwrap());
            }
            packets
        });
        let mut bms = SpBms::with_timing(bus, fast());
        let dump = bms.get_log().unwrap();
        assert_eq!(dump.statistics.unwrap().cot_count, 3);
        let indices: Vec<usize> = dump.records.iter().map(|record| record.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn short_log_record_does_not_discard_the_dump() {
        let bus = MockBus::sp_device(|_| {
            vec![
                build(Address::Pack, 0x09, &[0u8; 30]).unwrap(),
                build(Address::Pack, 0x09, &[0u8; 30]).unwrap(),
                build(Address::Pack, 0x08, &[0u8; 33]).unwrap(),
                build(Address::Pack, 0x08, &[0u8; 32]).unwrap(),
                build(Address::Pack, 0x08, &[0u8; 33]).unwrap(),
            ]
        });
        let mut bms = SpBms::with_timing(bus, fast());
        let dump = bms.get_log().unwrap();
        assert!(dump.statistics.is_some());
        let indices: Vec<usize> = dump.records.iter().map(|record| record.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn empty_log_is_a_timeout() {
        let mut bms = SpBms::with_timing(MockBus::silent(), fast());
        assert!(matches!(bms.get_log(), Err(Error::Timeout { .. })));
    }

    #[test]
    fn shutdown_is_repeated() {
        let mut bms = SpBms::with_timing(MockBus::silent(), fast());
        bms.shutdown().unwrap();
        assert_eq!(bms.bus().sent_data(SENTINEL_START_ID).len(), SHUTDOWN_REPEATS);
        let packets = bms.bus().sent_data(SENTINEL_DATA_ID);
        assert_eq!(packets[0], [0xEA, 0xD1, 0xFF, 0x05, 0xFF, 0x13, 0x31, 0xD8]);
    }

    #[test]
    fn custom_byte_round_trip() {
        let bus = MockBus::with_responder(|frame, inbox| {
            if frame.id() == NODE_REQUEST_ID {
                let data = frame.data();
                let value = if data[7] == 0x40 { data[4] } else { 0x21 };
                inbox.push_back(
                    BusFrame::new(NODE_RESPONSE_ID, &[data[1], 0, 0, data[3], 0, 0, 0, value])
                        .unwrap(),
                );
            }
        });
        let mut bms = SpBms::with_timing(bus, fast());
        assert_eq!(bms.read_custom_byte(2, 4).unwrap(), 0x21);
        assert_eq!(bms.write_custom_byte(2, 4, 0x33).unwrap(), 0x33);
        assert!(bms.read_custom_byte(2, 31).is_err());
    }

    #[test]
    fn node_status_and_scan() {
        let mut status = vec![0u8; 86];
        status[0..2].copy_from_slice(&[0x02, 0x10]);
        status[80] = 6;
        status[81..86].copy_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9A]);
        let bus = MockBus::with_responder(move |frame, inbox| {
            let data = frame.data();
            if frame.id() == NODE_REQUEST_ID && data[0] == 0x01 && data[1] == 3 {
                let framer = AddressedFramer::new(3, AddressedLayout::Declared);
                inbox.extend(framer.frames(&status).unwrap());
            }
        });
        let mut bms = SpBms::with_timing(bus, fast());
        let found = bms.scan(2..=4).unwrap();
        assert_eq!(found, BTreeMap::from([(3, "123456".to_string())]));
        let status = bms.get_node_status(3).unwrap();
        assert_eq!(status.pack_voltage, 52.8);
    }

    #[test]
    fn node_log_collects_records_until_silence() {
        let bus = MockBus::with_responder(|frame, inbox| {
            if frame.id() == NODE_REQUEST_ID && frame.data()[0] == 0x04 {
                let framer = AddressedFramer::new(2, AddressedLayout::LogRecord);
                for _ in 0..2 {
                    inbox.extend(framer.frames(&[0u8; 33]).unwrap());
                }
            }
        });
        let mut bms = SpBms::with_timing(bus, fast());
        assert_eq!(bms.get_node_log(2).unwrap().len(), 2);
    }

    #[test]
    fn bitrate_change_switches_adapter() {
        let mut bms = SpBms::with_timing(MockBus::silent(), fast());
        bms.change_bitrate(Bitrate::K500).unwrap();
        assert_eq!(bms.bus().bitrate, Bitrate::K500);
        assert_eq!(
            bms.bus().sent_data(NODE_REQUEST_ID),
            vec![vec![0xBC, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x30, 0x73]]
        );
    }

    #[test]
    fn calibration_writes_backup_then_coefficients() {
        let bus = MockBus::sp_device(|request| match (request[5], request.get(6)) {
            (0x02, _) => vec![reply(0x02, &[0x02, 0x00, 0x00, 0x0C, 0xE4, 0x0C, 0xE4])],
            (0x0F, Some(0x00)) => vec![reply(0x0F, &[0x10, 0x00, 0x02, 0x0C, 0xE4, 0x0C, 0xF0])],
            (0x11, _) => vec![reply(0x11, &[0x00])],
            _ => vec![],
        });
        let directory = tempfile::tempdir().unwrap();
        let mut bms = SpBms::with_timing(bus, fast());
        let targets = BTreeMap::from([(2, 3.312)]);
        let (backup, coefficients) = bms.calibrate_cells(&targets, directory.path()).unwrap();
        assert!(backup.exists());
        assert_eq!(coefficients, vec![1000.0, 1000.0]);
        let header = [0xEA, 0xD1, 0x01, 0x0C, 0xFF, 0x0F, 0x02, 0x02];
        assert!(bms
            .bus()
            .sent_data(SENTINEL_DATA_ID)
            .iter()
            .any(|frame| frame[..] == header));
    }
}
