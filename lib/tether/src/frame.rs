//! Frame manipulation for the link layer: byte stuffing, CRC protection
//! and dialect detection over the raw byte transport.
//!
//! On the wire a frame is `SYN/ETB DLE STX <control|seq> [<seq-ext>]
//! <stuffed payload> DLE ETX <crc-hi> <crc-lo>`. The CRC is CCITT-16 over
//! the logical (pre-stuffing) header and payload bytes. DLE bytes inside
//! the frame are doubled; the Era dialect additionally stuffs ETX, DC1 and
//! DC3, remapping them to EOT, SPC and PNG.

use crate::error::{LinkError, LinkResult};
use crate::stats::Stats;
use crc::{Crc, CRC_16_XMODEM};
use filament::logging::{self, trace, Logger};
use std::fmt;
use std::mem;

pub(crate) const STX: u8 = 0x02;
pub(crate) const ETX: u8 = 0x03;
pub(crate) const EOT: u8 = 0x04;
pub(crate) const DLE: u8 = 0x10;
pub(crate) const DC1: u8 = 0x11;
pub(crate) const DC3: u8 = 0x13;
pub(crate) const SYN: u8 = 0x16;
pub(crate) const ETB: u8 = 0x17;
pub(crate) const SPC: u8 = 0x20;
pub(crate) const PNG: u8 = 0x21;

/// Largest payload accepted from the remote device.
pub const MAX_DATA_RX: usize = 2048;
/// Largest payload transmitted in a single frame.
pub const MAX_DATA_TX: usize = 300;

static FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// The two wire variants, distinguished by the frame start byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dialect {
    Sibo,
    Era,
}

impl Dialect {
    /// Byte opening a frame in this dialect.
    #[inline]
    pub fn start_byte(self) -> u8 {
        match self {
            Dialect::Sibo => SYN,
            Dialect::Era => ETB,
        }
    }

    /// Modulus of the data sequence space.
    #[inline]
    pub fn seq_space(self) -> u16 {
        match self {
            Dialect::Sibo => 8,
            Dialect::Era => 2048,
        }
    }

    /// Must this byte be stuffed when transmitted.
    #[inline]
    fn stuffed(self, value: u8) -> bool {
        value == DLE || (self == Dialect::Era && (value == ETX || value == DC1 || value == DC3))
    }
}

/// A logical frame: four control bits, a sequence number and a payload.
#[derive(Clone)]
pub struct FrameData {
    pub cont: u8,
    pub seq: u16,
    size: usize,
    data: [u8; MAX_DATA_RX],
}

impl FrameData {
    pub fn new(cont: u8, seq: u16) -> FrameData {
        FrameData {
            cont,
            seq,
            size: 0,
            data: [0; MAX_DATA_RX],
        }
    }

    pub fn with_payload(cont: u8, seq: u16, payload: &[u8]) -> LinkResult<FrameData> {
        let mut frame = FrameData::new(cont, seq);
        frame.set_payload(payload)?;
        Ok(frame)
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> LinkResult<()> {
        if payload.len() > MAX_DATA_RX {
            return Err(LinkError::BadParms);
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.size = payload.len();
        Ok(())
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    fn clear(&mut self) {
        self.cont = 0;
        self.seq = 0;
        self.size = 0;
    }

    #[inline]
    fn push(&mut self, value: u8) {
        self.data[self.size] = value;
        self.size += 1;
    }
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FrameData")
            .field("cont", &self.cont)
            .field("seq", &self.seq)
            .field("payload", &self.payload())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TxState {
    Idle,
    Start,
    StartDle,
    StartStx,
    Data,
    DataStuff,
    EndEtx,
    CrcHigh,
    CrcLow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RxState {
    Idle,
    Hunt,
    StartDle,
    StartStx,
    Data,
    DataStuff,
    CrcHigh,
    CrcLow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Cursor {
    ControlSeq,
    SeqExt,
    Payload,
}

/// Transmit and receive state machines for the frame layer.
pub struct FrameCodec {
    active: bool,
    dialect: Dialect,
    preamble: Vec<u8>,

    tx_state: TxState,
    tx_data: FrameData,
    tx_cursor: Cursor,
    tx_pos: usize,
    tx_preamble_pos: usize,
    tx_stuff: u8,
    tx_digest: crc::Digest<'static, u16>,
    tx_crc: u16,

    rx_state: RxState,
    rx_data: FrameData,
    rx_cursor: Cursor,
    rx_digest: crc::Digest<'static, u16>,
    rx_crc: u16,

    log: Logger,
}

impl FrameCodec {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> FrameCodec {
        FrameCodec {
            active: false,
            dialect: Dialect::Sibo,
            preamble: Vec::new(),
            tx_state: TxState::Idle,
            tx_data: FrameData::new(0, 0),
            tx_cursor: Cursor::ControlSeq,
            tx_pos: 0,
            tx_preamble_pos: 0,
            tx_stuff: 0,
            tx_digest: FRAME_CRC.digest(),
            tx_crc: 0,
            rx_state: RxState::Hunt,
            rx_data: FrameData::new(0, 0),
            rx_cursor: Cursor::ControlSeq,
            rx_digest: FRAME_CRC.digest(),
            rx_crc: 0,
            log: logging::component(log, "frame"),
        }
    }

    /// Start the frame handler, resetting both directions.
    pub fn start(&mut self) {
        self.reset(true);
        self.active = true;
    }

    /// End the frame handler.
    pub fn end(&mut self) {
        self.active = false;
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[inline]
    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    /// Install a modem-escape preamble transmitted ahead of every frame
    /// start byte.
    pub fn set_preamble(&mut self, preamble: &[u8]) {
        self.preamble = preamble.to_vec();
    }

    /// Reset the transmitter, and with `full` also the receiver and the
    /// dialect latch.
    pub fn reset(&mut self, full: bool) {
        self.tx_state = TxState::Idle;
        self.tx_preamble_pos = 0;
        if full {
            self.rx_state = RxState::Hunt;
            self.dialect = Dialect::Sibo;
        }
    }

    /// Abort any frame in transmission and queue this one instead.
    pub fn send(&mut self, frame: &FrameData) -> LinkResult<()> {
        if !self.active {
            return Err(LinkError::NoConnect);
        }
        trace!(self.log, "frame queued";
               "context" => "send",
               "cont" => frame.cont,
               "seq" => frame.seq,
               "size" => frame.len());
        self.tx_data = frame.clone();
        self.tx_preamble_pos = 0;
        self.tx_state = TxState::Start;
        Ok(())
    }

    #[inline]
    pub fn tx_idle(&self) -> bool {
        self.tx_state == TxState::Idle
    }

    #[inline]
    pub fn tx_pending(&self) -> bool {
        self.tx_state != TxState::Idle
    }

    #[inline]
    pub fn rx_complete(&self) -> bool {
        self.rx_state == RxState::Idle
    }

    /// Take the completed received frame and rearm the receiver.
    pub fn take_rx(&mut self) -> FrameData {
        let frame = self.rx_data.clone();
        self.rx_state = RxState::Hunt;
        frame
    }

    /// Produce the next character to transmit.
    pub(crate) fn tx_byte(&mut self, stats: &mut Stats) -> u8 {
        match self.tx_state {
            TxState::Idle => 0,
            TxState::Start => {
                if self.tx_preamble_pos < self.preamble.len() {
                    let value = self.preamble[self.tx_preamble_pos];
                    self.tx_preamble_pos += 1;
                    value
                } else {
                    self.tx_state = TxState::StartDle;
                    self.dialect.start_byte()
                }
            }
            TxState::StartDle => {
                self.tx_state = TxState::StartStx;
                DLE
            }
            TxState::StartStx => {
                self.tx_digest = FRAME_CRC.digest();
                self.tx_cursor = Cursor::ControlSeq;
                self.tx_pos = 0;
                self.tx_state = TxState::Data;
                STX
            }
            TxState::Data => match self.next_logical() {
                Some(value) => {
                    self.tx_digest.update(&[value]);
                    if self.dialect.stuffed(value) {
                        self.tx_stuff = value;
                        self.tx_state = TxState::DataStuff;
                        DLE
                    } else {
                        value
                    }
                }
                None => {
                    self.tx_state = TxState::EndEtx;
                    DLE
                }
            },
            TxState::DataStuff => {
                self.tx_state = TxState::Data;
                match self.tx_stuff {
                    ETX => EOT,
                    DC1 => SPC,
                    DC3 => PNG,
                    other => other,
                }
            }
            TxState::EndEtx => {
                let digest = mem::replace(&mut self.tx_digest, FRAME_CRC.digest());
                self.tx_crc = digest.finalize();
                self.tx_state = TxState::CrcHigh;
                ETX
            }
            TxState::CrcHigh => {
                self.tx_state = TxState::CrcLow;
                (self.tx_crc >> 8) as u8
            }
            TxState::CrcLow => {
                self.tx_state = TxState::Idle;
                stats.tx_frame();
                (self.tx_crc & 0xFF) as u8
            }
        }
    }

    /// The next logical (pre-stuffing) byte of the outgoing frame, or None
    /// at the end of the payload.
    fn next_logical(&mut self) -> Option<u8> {
        match self.tx_cursor {
            Cursor::ControlSeq => {
                let mut value = (self.tx_data.cont << 4) | (self.tx_data.seq & 0x07) as u8;
                if self.tx_data.seq < 8 {
                    self.tx_cursor = Cursor::Payload;
                } else {
                    value |= 0x08;
                    self.tx_cursor = Cursor::SeqExt;
                }
                Some(value)
            }
            Cursor::SeqExt => {
                self.tx_cursor = Cursor::Payload;
                Some(((self.tx_data.seq & 0x7F8) >> 3) as u8)
            }
            Cursor::Payload => {
                if self.tx_pos < self.tx_data.len() {
                    let value = self.tx_data.payload()[self.tx_pos];
                    self.tx_pos += 1;
                    Some(value)
                } else {
                    None
                }
            }
        }
    }

    /// Update the receiver state machine with one received character.
    pub(crate) fn rx_byte(&mut self, value: u8, stats: &mut Stats) {
        match self.rx_state {
            RxState::Idle => {
                // A received frame is waiting to be processed
            }
            RxState::Hunt => match value {
                SYN => {
                    self.dialect = Dialect::Sibo;
                    self.rx_state = RxState::StartDle;
                }
                ETB => {
                    self.dialect = Dialect::Era;
                    self.rx_state = RxState::StartDle;
                }
                _ => {}
            },
            RxState::StartDle => match value {
                DLE => self.rx_state = RxState::StartStx,
                SYN => self.dialect = Dialect::Sibo,
                ETB => self.dialect = Dialect::Era,
                _ => {
                    self.rx_state = RxState::Hunt;
                    stats.rx_bad_frame();
                }
            },
            RxState::StartStx => {
                self.rx_digest = FRAME_CRC.digest();
                self.rx_data.clear();
                self.rx_cursor = Cursor::ControlSeq;
                if value == STX {
                    self.rx_state = RxState::Data;
                } else {
                    stats.rx_bad_frame();
                    match value {
                        SYN => {
                            self.dialect = Dialect::Sibo;
                            self.rx_state = RxState::StartDle;
                        }
                        ETB => {
                            self.dialect = Dialect::Era;
                            self.rx_state = RxState::StartDle;
                        }
                        _ => self.rx_state = RxState::Hunt,
                    }
                }
            }
            RxState::Data => {
                if value == DLE {
                    self.rx_state = RxState::DataStuff;
                } else if self.rx_room() {
                    self.rx_logical(value);
                } else {
                    self.rx_state = RxState::Hunt;
                    stats.rx_bad_frame();
                }
            }
            RxState::DataStuff => {
                if self.rx_cursor == Cursor::Payload && value == ETX {
                    let digest = mem::replace(&mut self.rx_digest, FRAME_CRC.digest());
                    self.rx_crc = digest.finalize();
                    self.rx_state = RxState::CrcHigh;
                } else {
                    let value = match value {
                        EOT => ETX,
                        SPC => DC1,
                        PNG => DC3,
                        other => other,
                    };
                    if self.rx_room() {
                        self.rx_logical(value);
                        self.rx_state = RxState::Data;
                    } else {
                        self.rx_state = RxState::Hunt;
                        stats.rx_bad_frame();
                    }
                }
            }
            RxState::CrcHigh => {
                if value == (self.rx_crc >> 8) as u8 {
                    self.rx_state = RxState::CrcLow;
                } else {
                    self.rx_state = RxState::Hunt;
                    stats.rx_bad_frame();
                }
            }
            RxState::CrcLow => {
                if value == (self.rx_crc & 0xFF) as u8 {
                    trace!(self.log, "frame received";
                           "context" => "rx",
                           "cont" => self.rx_data.cont,
                           "seq" => self.rx_data.seq,
                           "size" => self.rx_data.len());
                    self.rx_state = RxState::Idle;
                    stats.rx_frame();
                } else {
                    self.rx_state = RxState::Hunt;
                    stats.rx_bad_frame();
                }
            }
        }
    }

    #[inline]
    fn rx_room(&self) -> bool {
        self.rx_cursor != Cursor::Payload || self.rx_data.len() < MAX_DATA_RX
    }

    /// Process one unstuffed byte: header decode, then payload collection.
    fn rx_logical(&mut self, value: u8) {
        self.rx_digest.update(&[value]);
        match self.rx_cursor {
            Cursor::ControlSeq => {
                self.rx_data.cont = (value & 0xF0) >> 4;
                self.rx_data.seq = u16::from(value & 0x07);
                self.rx_cursor = if value & 0x08 != 0 {
                    Cursor::SeqExt
                } else {
                    Cursor::Payload
                };
            }
            Cursor::SeqExt => {
                self.rx_data.seq |= u16::from(value) << 3;
                self.rx_cursor = Cursor::Payload;
            }
            Cursor::Payload => self.rx_data.push(value),
        }
    }
}
