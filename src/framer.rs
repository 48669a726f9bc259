//! Splitting packets into bus frames and joining them back together.
//!
//! Two layouts are used on the bus:
//!
//! * **Sentinel** framing wraps a packet between a zero frame on
//!   [`SENTINEL_START_ID`] and a zero frame on [`SENTINEL_END_ID`], the packet
//!   itself travels in zero padded 8 byte chunks on [`SENTINEL_DATA_ID`].
//! * **Addressed** framing is used on multi node buses. Every response frame
//!   starts with the node id and ends with a position marker, see
//!   [`AddressedLayout`].

use crate::transport::{Bus, BusFrame, FRAME_CAPACITY};
use crate::{Error, Result};
use std::time::{Duration, Instant};

pub const SENTINEL_START_ID: u16 = 0x001;
pub const SENTINEL_DATA_ID: u16 = 0x002;
pub const SENTINEL_END_ID: u16 = 0x003;

/// Identifier of requests sent to addressed nodes.
pub const NODE_REQUEST_ID: u16 = 0x00E;
/// Identifier of replies sent by addressed nodes.
pub const NODE_RESPONSE_ID: u16 = 0x00D;

/// Size of one log record carried by the addressed log layout.
pub const LOG_RECORD_LEN: usize = 33;
const LOG_RECORD_FRAMES: u8 = 7;
const LOG_RECORD_TERMINAL: u8 = LOG_RECORD_FRAMES - 1;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Limits for one reassembly: an overall deadline and a number of empty polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub timeout: Duration,
    pub polls: u32,
}

impl Budget {
    pub fn new(timeout: Duration, polls: u32) -> Self {
        Self { timeout, polls }
    }
}

/// Feeds received frames into `accept` until it yields a value or the budget is spent.
pub(crate) fn collect<B, T>(
    bus: &mut B,
    budget: Budget,
    mut accept: impl FnMut(&BusFrame) -> Option<T>,
) -> Result<T>
where
    B: Bus + ?Sized,
{
    let started = Instant::now();
    let deadline = started + budget.timeout;
    let mut empty_polls = 0;
    loop {
        let now = Instant::now();
        if now >= deadline || empty_polls >= budget.polls {
            log::trace!("Reassembly gave up after {empty_polls} empty polls");
            return Err(Error::Timeout {
                waited: now.duration_since(started),
            });
        }
        match bus.receive((deadline - now).min(POLL_INTERVAL))? {
            Some(frame) => {
                log::trace!("rx {frame:?}");
                if let Some(done) = accept(&frame) {
                    return Ok(done);
                }
            }
            None => empty_polls += 1,
        }
    }
}

fn send_all<B: Bus + ?Sized>(bus: &mut B, frames: &[BusFrame], delay: Duration) -> Result<()> {
    for frame in frames {
        log::trace!("tx {frame:?}");
        bus.send(frame)?;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum SentinelState {
    #[default]
    Idle,
    Started,
    Receiving,
}

/// Rebuilds one sentinel framed packet. The result still carries the zero
/// padding of the last data frame.
#[derive(Debug, Default)]
pub struct SentinelReassembler {
    state: SentinelState,
    buffer: Vec<u8>,
}

impl SentinelReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &BusFrame) -> Option<Vec<u8>> {
        match (frame.id(), self.state) {
            (SENTINEL_START_ID, _) => {
                self.buffer.clear();
                self.state = SentinelState::Started;
            }
            (SENTINEL_DATA_ID, SentinelState::Started | SentinelState::Receiving) => {
                self.buffer.extend_from_slice(frame.data());
                self.state = SentinelState::Receiving;
            }
            (SENTINEL_DATA_ID, SentinelState::Idle) => {
                log::trace!("Dropping data frame without start frame");
            }
            (SENTINEL_END_ID, SentinelState::Receiving) => {
                self.state = SentinelState::Idle;
                return Some(std::mem::take(&mut self.buffer));
            }
            (SENTINEL_END_ID, _) => {
                log::trace!("Dropping end frame without data");
                self.buffer.clear();
                self.state = SentinelState::Idle;
            }
            _ => {}
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SentinelFramer {
    frame_delay: Duration,
}

impl SentinelFramer {
    pub fn new(frame_delay: Duration) -> Self {
        Self { frame_delay }
    }

    pub fn frames(bytes: &[u8]) -> Result<Vec<BusFrame>> {
        let mut frames = Vec::with_capacity(bytes.len() / FRAME_CAPACITY + 3);
        frames.push(BusFrame::zeroed(SENTINEL_START_ID)?);
        for chunk in bytes.chunks(FRAME_CAPACITY) {
            let mut data = [0; FRAME_CAPACITY];
            data[..chunk.len()].copy_from_slice(chunk);
            frames.push(BusFrame::new(SENTINEL_DATA_ID, &data)?);
        }
        frames.push(BusFrame::zeroed(SENTINEL_END_ID)?);
        Ok(frames)
    }

    pub fn send<B: Bus + ?Sized>(&self, bus: &mut B, bytes: &[u8]) -> Result<()> {
        log::debug!("Sending packet {bytes:02X?}");
        send_all(bus, &Self::frames(bytes)?, self.frame_delay)
    }

    pub fn receive<B: Bus + ?Sized>(&self, bus: &mut B, budget: Budget) -> Result<Vec<u8>> {
        let mut reassembler = SentinelReassembler::new();
        collect(bus, budget, |frame| reassembler.push(frame))
    }
}

/// Position marker conventions of addressed replies. The marker is the last
/// byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressedLayout {
    /// Header frame `node 00 01 total .. .. .. 00` declares the frame count.
    /// Marker 1 carries bytes 2..7, later markers bytes 1..7. The transfer
    /// completes with marker `total - 1`.
    Declared,
    /// Fixed seven frame log record. The header carries the first record byte
    /// at position 5, marker 1 five bytes, markers 2 to 5 six bytes each and
    /// the terminal marker 6 three bytes.
    LogRecord,
}

/// Rebuilds one addressed transfer for a single node.
#[derive(Debug)]
pub struct AddressedReassembler {
    node: u8,
    layout: AddressedLayout,
    expected: Option<u8>,
    next_marker: u8,
    buffer: Vec<u8>,
}

impl AddressedReassembler {
    pub fn new(node: u8, layout: AddressedLayout) -> Self {
        Self {
            node,
            layout,
            expected: None,
            next_marker: 1,
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: &BusFrame) -> Option<Vec<u8>> {
        let data = frame.data();
        if frame.id() != NODE_RESPONSE_ID || data.len() != FRAME_CAPACITY || data[0] != self.node {
            return None;
        }
        let marker = data[7];
        if marker == 0 {
            return self.start(data);
        }
        let total = self.expected?;
        if marker >= total {
            log::trace!("Dropping frame with marker {marker} of {total}");
            return None;
        }
        // A gap or a repeat loses the transfer until the next header.
        if marker != self.next_marker {
            log::warn!(
                "Node {}: marker {marker} where {} was due, dropping transfer",
                self.node,
                self.next_marker
            );
            self.expected = None;
            self.buffer.clear();
            return None;
        }
        self.next_marker += 1;
        let chunk = match (self.layout, marker) {
            (_, 1) => &data[2..7],
            (AddressedLayout::LogRecord, LOG_RECORD_TERMINAL) => &data[1..4],
            _ => &data[1..7],
        };
        self.buffer.extend_from_slice(chunk);
        if marker == total - 1 {
            self.expected = None;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    fn start(&mut self, header: &[u8]) -> Option<Vec<u8>> {
        self.buffer.clear();
        self.next_marker = 1;
        match self.layout {
            AddressedLayout::Declared => {
                if header[1] != 0 || header[2] != 1 {
                    return None;
                }
                if header[3] <= 1 {
                    self.expected = None;
                    return Some(Vec::new());
                }
                self.expected = Some(header[3]);
            }
            AddressedLayout::LogRecord => {
                self.buffer.push(header[5]);
                self.expected = Some(LOG_RECORD_FRAMES);
            }
        }
        None
    }
}

/// Builds a single request frame for addressed nodes.
pub fn node_request(data: [u8; FRAME_CAPACITY]) -> Result<BusFrame> {
    BusFrame::new(NODE_REQUEST_ID, &data)
}

#[derive(Debug, Clone, Copy)]
pub struct AddressedFramer {
    node: u8,
    layout: AddressedLayout,
}

impl AddressedFramer {
    pub fn new(node: u8, layout: AddressedLayout) -> Self {
        Self { node, layout }
    }

    /// Frames `payload` the way a node transmits it.
    pub fn frames(&self, payload: &[u8]) -> Result<Vec<BusFrame>> {
        let node = self.node;
        let frame = |marker: u8, offset: usize, chunk: &[u8]| {
            let mut data = [0; FRAME_CAPACITY];
            data[0] = node;
            data[offset..offset + chunk.len()].copy_from_slice(chunk);
            data[7] = marker;
            BusFrame::new(NODE_RESPONSE_ID, &data)
        };
        match self.layout {
            AddressedLayout::Declared => {
                let (first, rest) = payload.split_at(payload.len().min(5));
                let mut chunks = Vec::new();
                if !first.is_empty() {
                    chunks.push(first);
                }
                chunks.extend(rest.chunks(6));
                let total = u8::try_from(chunks.len() + 1)
                    .map_err(|_| Error::out_of_range("payload length", payload.len() as i64))?;
                let mut frames = vec![BusFrame::new(NODE_RESPONSE_ID, &[node, 0, 1, total, 0, 0, 0, 0])?];
                for (index, chunk) in chunks.into_iter().enumerate() {
                    let marker = index as u8 + 1;
                    frames.push(frame(marker, if marker == 1 { 2 } else { 1 }, chunk)?);
                }
                Ok(frames)
            }
            AddressedLayout::LogRecord => {
                if payload.len() != LOG_RECORD_LEN {
                    return Err(Error::out_of_range("log record length", payload.len() as i64));
                }
                let mut frames = vec![BusFrame::new(
                    NODE_RESPONSE_ID,
                    &[node, 0, 1, LOG_RECORD_FRAMES, 0, payload[0], 0, 0],
                )?];
                frames.push(frame(1, 2, &payload[1..6])?);
                for (index, chunk) in payload[6..30].chunks(6).enumerate() {
                    frames.push(frame(index as u8 + 2, 1, chunk)?);
                }
                frames.push(frame(LOG_RECORD_TERMINAL, 1, &payload[30..])?);
                Ok(frames)
            }
        }
    }

    pub fn receive<B: Bus + ?Sized>(&self, bus: &mut B, budget: Budget) -> Result<Vec<u8>> {
        let mut reassembler = AddressedReassembler::new(self.node, self.layout);
        collect(bus, budget, |frame| reassembler.push(frame))
    }
}
