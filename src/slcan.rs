//! [`Bus`] on top of a serial line CAN adapter speaking the LAWICEL (SLCAN)
//! ASCII protocol.

use crate::transport::{Bitrate, Bus, BusFrame, FRAME_CAPACITY};
use crate::{Error, Result};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

const LINE_END: u8 = b'\r';
const BELL: u8 = 0x07;
const BAUD_RATE: u32 = 115_200;
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

fn bitrate_code(bitrate: Bitrate) -> char {
    match bitrate {
        Bitrate::K125 => '4',
        Bitrate::K250 => '5',
        Bitrate::K500 => '6',
        Bitrate::M1 => '8',
    }
}

/// Line transmitting `frame`: `t<id:3><len:1><data>\r`.
pub fn format_frame(frame: &BusFrame) -> String {
    let mut line = format!("t{:03X}{:X}", frame.id(), frame.data().len());
    for byte in frame.data() {
        line.push_str(&format!("{byte:02X}"));
    }
    line.push(LINE_END as char);
    line
}

fn hex(text: &[u8]) -> Result<u32> {
    std::str::from_utf8(text)
        .ok()
        .and_then(|text| u32::from_str_radix(text, 16).ok())
        .ok_or_else(|| Error::Adapter(format!("Invalid hex {:?}", String::from_utf8_lossy(text))))
}

/// Parses one received line without its terminator. Only standard data
/// frames are returned, acknowledgements and other frame kinds give `None`.
pub fn parse_line(line: &[u8]) -> Result<Option<BusFrame>> {
    match line.first() {
        Some(b't') => {
            let header = line
                .get(1..5)
                .ok_or_else(|| Error::Adapter(format!("Truncated frame {line:02X?}")))?;
            let id = hex(&header[..3])? as u16;
            let len = hex(&header[3..])? as usize;
            if len > FRAME_CAPACITY {
                return Err(Error::Adapter(format!("Frame length {len} too large")));
            }
            let text = line
                .get(5..5 + 2 * len)
                .ok_or_else(|| Error::Adapter(format!("Truncated frame {line:02X?}")))?;
            let data = text
                .chunks(2)
                .map(|pair| hex(pair).map(|b| b as u8))
                .collect::<Result<Vec<u8>>>()?;
            BusFrame::new(id, &data).map(Some)
        }
        Some(b'T' | b'r' | b'R') => {
            log::trace!("Ignoring adapter line {:?}", String::from_utf8_lossy(line));
            Ok(None)
        }
        _ => Ok(None),
    }
}

pub struct SlcanBus {
    port: Box<dyn serialport::SerialPort>,
    path: String,
    bitrate: Bitrate,
    pending: Vec<u8>,
}

impl std::fmt::Debug for SlcanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlcanBus")
            .field("path", &self.path)
            .field("bitrate", &self.bitrate)
            .finish()
    }
}

impl SlcanBus {
    /// Opens the adapter at `path` and joins the bus at `bitrate`.
    pub fn open(path: &str, bitrate: Bitrate) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(COMMAND_TIMEOUT)
            .open()?;
        let mut bus = Self {
            port,
            path: path.to_string(),
            bitrate,
            pending: Vec::new(),
        };
        bus.set_bitrate(bitrate)?;
        log::debug!("Opened {bus:?}");
        Ok(bus)
    }

    /// Sends a configuration command and waits for its acknowledgement.
    fn command(&mut self, command: &str) -> Result<()> {
        log::trace!("slcan command {command:?}");
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(&[LINE_END])?;
        self.port.set_timeout(COMMAND_TIMEOUT)?;
        let deadline = Instant::now() + COMMAND_TIMEOUT;
        let mut byte = [0u8; 1];
        while Instant::now() < deadline {
            match self.port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) if byte[0] == LINE_END => return Ok(()),
                Ok(_) if byte[0] == BELL => {
                    return Err(Error::Adapter(format!("Adapter rejected '{command}'")))
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Adapter(format!("No acknowledgement for '{command}'")))
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self
            .pending
            .iter()
            .position(|b| *b == LINE_END || *b == BELL)?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        if line.pop() == Some(BELL) {
            log::warn!("Adapter reported an error");
        }
        Some(line)
    }
}

impl Bus for SlcanBus {
    fn send(&mut self, frame: &BusFrame) -> Result<()> {
        self.port.write_all(format_frame(frame).as_bytes())?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(line) = self.next_line() {
                if let Some(frame) = parse_line(&line)? {
                    return Ok(Some(frame));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.port.set_timeout(deadline - now)?;
            let mut buffer = [0u8; 64];
            match self.port.read(&mut buffer) {
                Ok(0) => return Ok(None),
                Ok(read) => self.pending.extend_from_slice(&buffer[..read]),
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.pending.clear();
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
        // Adapters reject closing a channel that is not open.
        if let Err(err) = self.command("C") {
            log::debug!("Closing channel: {err}");
        }
        self.command(&format!("S{}", bitrate_code(bitrate)))?;
        self.command("O")?;
        self.bitrate = bitrate;
        self.flush()
    }

    fn reset(&mut self) -> Result<()> {
        self.set_bitrate(self.bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_formatted_as_hex_lines() {
        let frame = BusFrame::new(0x00E, &[0x01, 0x02, 0, 0, 0, 0, 0, 0xAB]).unwrap();
        assert_eq!(format_frame(&frame), "t00E801020000000000AB\r");
        let empty = BusFrame::new(0x7FF, &[]).unwrap();
        assert_eq!(format_frame(&empty), "t7FF0\r");
    }

    #[test]
    fn received_lines_are_parsed() {
        let frame = parse_line(b"t00D3AABBCC").unwrap().unwrap();
        assert_eq!(frame.id(), 0x00D);
        assert_eq!(frame.data(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(parse_line(b"z").unwrap(), None);
        assert_eq!(parse_line(b"").unwrap(), None);
        assert_eq!(parse_line(b"T0000000D1AA").unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(parse_line(b"t00D3AABB"), Err(Error::Adapter(_))));
        assert!(matches!(parse_line(b"t0G11AA"), Err(Error::Adapter(_))));
        assert!(matches!(parse_line(b"t00D9"), Err(Error::Adapter(_))));
    }

    #[test]
    fn bitrate_codes() {
        let codes: Vec<char> = Bitrate::ALL.into_iter().map(bitrate_code).collect();
        assert_eq!(codes, vec!['4', '5', '6', '8']);
    }
}
