//! Bus frames and the transport boundary used by the framer and the client.
//!
//! The engine only ever talks to a [`Bus`]. Adapter specific setup (opening
//! ports, selecting channels, driver quirks) belongs to the implementor.

use crate::{Error, Result};
use std::{fmt, str::FromStr, time::Duration};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Highest standard (11-bit) identifier.
pub const MAX_STANDARD_ID: u16 = 0x7FF;
/// Payload capacity of a single classic CAN frame.
pub const FRAME_CAPACITY: usize = 8;

/// A single classic CAN frame with an 11-bit identifier and up to 8 data bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BusFrame {
    id: u16,
    len: usize,
    data: [u8; FRAME_CAPACITY],
}

impl BusFrame {
    pub fn new(id: u16, data: &[u8]) -> Result<Self> {
        if id > MAX_STANDARD_ID {
            return Err(Error::out_of_range("frame id", id));
        }
        if data.len() > FRAME_CAPACITY {
            return Err(Error::out_of_range("frame length", data.len() as i64));
        }
        let mut buffer = [0; FRAME_CAPACITY];
        buffer[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            len: data.len(),
            data: buffer,
        })
    }

    /// Frame carrying eight zero bytes, used as start and end markers.
    pub fn zeroed(id: u16) -> Result<Self> {
        Self::new(id, &[0; FRAME_CAPACITY])
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Byte at `index`, zero when the frame is shorter.
    pub fn byte(&self, index: usize) -> u8 {
        self.data().get(index).copied().unwrap_or(0)
    }
}

impl fmt::Debug for BusFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#{:02X?}", self.id, self.data())
    }
}

/// Nominal bus bitrates supported by the devices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "u32", into = "u32")
)]
pub enum Bitrate {
    K125,
    #[default]
    K250,
    K500,
    M1,
}

impl Bitrate {
    pub const ALL: [Bitrate; 4] = [Bitrate::K125, Bitrate::K250, Bitrate::K500, Bitrate::M1];

    pub fn kbps(&self) -> u32 {
        match self {
            Bitrate::K125 => 125,
            Bitrate::K250 => 250,
            Bitrate::K500 => 500,
            Bitrate::M1 => 1000,
        }
    }
}

impl TryFrom<u32> for Bitrate {
    type Error = Error;

    /// Converts a rate given in kbit/s.
    fn try_from(kbps: u32) -> Result<Self> {
        Bitrate::ALL
            .into_iter()
            .find(|bitrate| bitrate.kbps() == kbps)
            .ok_or_else(|| Error::out_of_range("bitrate", kbps))
    }
}

impl From<Bitrate> for u32 {
    fn from(bitrate: Bitrate) -> u32 {
        bitrate.kbps()
    }
}

impl FromStr for Bitrate {
    type Err = Error;

    /// Accepts `125k`, `250k`, `500k`, `1M` as well as plain kbit/s numbers.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let kbps = match normalized.as_str() {
            "1m" | "1000k" => 1000,
            other => other
                .trim_end_matches('k')
                .parse::<u32>()
                .map_err(|_| Error::Adapter(format!("Unknown bitrate '{s}'")))?,
        };
        Bitrate::try_from(kbps)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitrate::M1 => write!(f, "1M"),
            other => write!(f, "{}k", other.kbps()),
        }
    }
}

/// Frame level access to a CAN adapter.
///
/// Implementations are not expected to be shared between threads. One
/// transaction owns the bus at a time.
pub trait Bus {
    fn send(&mut self, frame: &BusFrame) -> Result<()>;

    /// Waits up to `timeout` for the next frame, `None` when nothing arrived.
    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>>;

    /// Drops every frame already queued on the receive side.
    fn flush(&mut self) -> Result<()>;

    fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn send(&mut self, frame: &BusFrame) -> Result<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>> {
        (**self).receive(timeout)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
        (**self).set_bitrate(bitrate)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn send(&mut self, frame: &BusFrame) -> Result<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>> {
        (**self).receive(timeout)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
        (**self).set_bitrate(bitrate)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    type Responder = Box<dyn FnMut(&BusFrame, &mut VecDeque<BusFrame>)>;

    /// Scripted bus: records everything sent and lets a responder queue replies.
    pub(crate) struct MockBus {
        pub sent: Vec<BusFrame>,
        pub inbox: VecDeque<BusFrame>,
        pub flushes: usize,
        pub polls: usize,
        pub bitrate: Bitrate,
        responder: Responder,
    }

    impl MockBus {
        pub fn silent() -> Self {
            Self::with_responder(|_, _| {})
        }

        pub fn with_responder(
            responder: impl FnMut(&BusFrame, &mut VecDeque<BusFrame>) + 'static,
        ) -> Self {
            Self {
                sent: Vec::new(),
                inbox: VecDeque::new(),
                flushes: 0,
                polls: 0,
                bitrate: Bitrate::default(),
                responder: Box::new(responder),
            }
        }

        /// Answers every complete sentinel framed request with the packets
        /// returned by `reply`.
        pub fn sp_device(mut reply: impl FnMut(&[u8]) -> Vec<Vec<u8>> + 'static) -> Self {
            use crate::framer::{SentinelFramer, SENTINEL_DATA_ID, SENTINEL_END_ID, SENTINEL_START_ID};
            let mut request = Vec::new();
            Self::with_responder(move |frame, inbox| match frame.id() {
                SENTINEL_START_ID => request.clear(),
                SENTINEL_DATA_ID => request.extend_from_slice(frame.data()),
                SENTINEL_END_ID => {
                    if request.len() > 3 {
                        let declared = request[3] as usize + 4;
                        request.truncate(declared);
                    }
                    for packet in reply(&request) {
                        inbox.extend(SentinelFramer::frames(&packet).unwrap());
                    }
                }
                _ => {}
            })
        }

        pub fn sent_data(&self, id: u16) -> Vec<Vec<u8>> {
            self.sent
                .iter()
                .filter(|frame| frame.id() == id)
                .map(|frame| frame.data().to_vec())
                .collect()
        }
    }

    impl Bus for MockBus {
        fn send(&mut self, frame: &BusFrame) -> Result<()> {
            self.sent.push(*frame);
            (self.responder)(frame, &mut self.inbox);
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<BusFrame>> {
            self.polls += 1;
            Ok(self.inbox.pop_front())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            self.inbox.clear();
            Ok(())
        }

        fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
            self.bitrate = bitrate;
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.inbox.clear();
            Ok(())
        }
    }
}
