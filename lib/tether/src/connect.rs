//! Connection manager for the link layer: the connect handshake, the
//! sliding-window retransmission engine and the idle timer.

use crate::config::LinkOptions;
use crate::error::{LinkError, LinkResult};
use crate::frame::{Dialect, FrameCodec, FrameData, MAX_DATA_RX, MAX_DATA_TX};
use crate::mux::Multiplexor;
use crate::stats::Stats;
use crate::transport::{link_time, ByteTransport};
use crate::wire;
use filament::logging::{self, debug, Logger};
use filament::time::{centis, nonce};
use std::time::Instant;

pub(crate) const CONT_ACK: u8 = 0;
pub(crate) const CONT_DISC: u8 = 1;
pub(crate) const CONT_REQ: u8 = 2;
pub(crate) const CONT_DATA: u8 = 3;

const SEQ_DISC: u16 = 0;
const SEQ_REQ_SIBO: u16 = 0;
const SEQ_REQ_REQUEST: u16 = 1;
const SEQ_REQ_CONFIRM: u16 = 4;

const REQ_RETRIES: u32 = 4;
const DATA_RETRIES: u32 = 8;

const TIMEOUT_RETRY_OFFSET: u32 = 20;
const TIMEOUT_RETRY_BYTES_SCALE: u32 = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectState {
    Idle,
    IdleReq,
    IdleAck,
    Data,
    DataAck,
}

/// The transmit window ring. Frames are queued at the head, retired from
/// the tail by acknowledgements, and transmitted from the pending pointer
/// which trails between the two.
pub(crate) struct TxWindow {
    frames: Vec<FrameData>,
    head: usize,
    tail: usize,
    pending: usize,
    seq_tx: u16,
    era: bool,
    open: bool,
    queued: u32,
}

impl TxWindow {
    pub(crate) fn new(max_window: usize) -> TxWindow {
        TxWindow {
            frames: vec![FrameData::new(0, 0); max_window + 1],
            head: 0,
            tail: 0,
            pending: 0,
            seq_tx: 0,
            era: false,
            open: false,
            queued: 0,
        }
    }

    #[inline]
    fn inc(&self, ptr: usize) -> usize {
        (ptr + 1) % self.frames.len()
    }

    #[inline]
    fn seq_space(&self) -> u16 {
        if self.era {
            Dialect::Era.seq_space()
        } else {
            Dialect::Sibo.seq_space()
        }
    }

    #[inline]
    fn max_window(&self) -> usize {
        if self.era {
            self.frames.len() - 1
        } else {
            1
        }
    }

    /// Frames currently queued and unacknowledged.
    #[inline]
    pub(crate) fn used(&self) -> usize {
        (self.head + self.frames.len() - self.tail) % self.frames.len()
    }

    /// Free frames in the transmit window; zero when not connected.
    #[inline]
    pub(crate) fn free(&self) -> usize {
        if self.open {
            self.max_window() - self.used()
        } else {
            0
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.pending = 0;
        self.seq_tx = 0;
        self.queued = 0;
        self.open = false;
        self.era = false;
    }

    fn open(&mut self, era: bool) {
        self.reset();
        self.open = true;
        self.era = era;
    }

    /// Queue a data frame for windowed transmission. The control bits and
    /// sequence number of the copy are assigned here.
    pub(crate) fn send(&mut self, frame: &FrameData) -> LinkResult<()> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        if self.free() == 0 {
            return Err(LinkError::Busy);
        }
        self.seq_tx = (self.seq_tx + 1) % self.seq_space();
        self.head = self.inc(self.head);
        let head = self.head;
        self.frames[head] = frame.clone();
        self.frames[head].cont = CONT_DATA;
        self.frames[head].seq = self.seq_tx;
        self.queued += 1;
        Ok(())
    }

    /// Retire every frame up to and including the one acknowledged,
    /// pulling the pending pointer forward if it sat inside the retired
    /// range. Acks naming no queued frame leave the window untouched.
    fn ack(&mut self, seq: u16) {
        let mut tx = self.tail;
        let mut passed_pending = false;
        while tx != self.head {
            if tx == self.pending {
                passed_pending = true;
            }
            tx = self.inc(tx);
            if self.frames[tx].seq == seq {
                self.tail = tx;
                if passed_pending {
                    self.pending = tx;
                }
            }
        }
    }

    /// Rewind the pending pointer for a full window retransmit, returning
    /// the number of frames that will be resent.
    fn rewind(&mut self) -> u32 {
        self.pending = self.tail;
        self.used() as u32
    }

    /// The next frame awaiting (re)transmission, if any.
    fn next_pending(&mut self) -> Option<&FrameData> {
        if self.pending != self.head {
            self.pending = self.inc(self.pending);
            Some(&self.frames[self.pending])
        } else {
            None
        }
    }

    fn take_queued(&mut self) -> u32 {
        std::mem::replace(&mut self.queued, 0)
    }

    fn set_seq_tx(&mut self, seq: u16) {
        self.seq_tx = seq;
    }
}

#[cfg(test)]
impl TxWindow {
    pub(crate) fn test_open(max_window: usize, era: bool) -> TxWindow {
        let mut window = TxWindow::new(max_window);
        window.open(era);
        window
    }

    /// Pull every frame awaiting transmission and retire it, as a fully
    /// responsive peer would.
    pub(crate) fn drain_acked(&mut self) -> Vec<FrameData> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_pending() {
            frames.push(frame.clone());
        }
        if let Some(last) = frames.last() {
            self.ack(last.seq);
        }
        frames
    }
}

/// Connection state machine driving the handshake and the data window.
pub struct ConnectionEngine {
    active: bool,
    enable: bool,
    state: ConnectState,
    connected: bool,
    era: bool,

    seq_rx: u16,
    retries: u32,
    magic: u32,

    timer: Option<Instant>,
    idle_limit: u32,
    auto_baud: bool,
    active_baud: u32,

    ctrl: Option<FrameData>,
    window: TxWindow,
    rx_pending: Option<FrameData>,

    log: Logger,
}

impl ConnectionEngine {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(options: &LinkOptions, log: L) -> ConnectionEngine {
        ConnectionEngine {
            active: false,
            enable: false,
            state: ConnectState::Idle,
            connected: false,
            era: false,
            seq_rx: 0,
            retries: 0,
            magic: 0,
            timer: None,
            idle_limit: options.idle_disconnect_link,
            auto_baud: options.auto_baud,
            active_baud: options.driver_baud,
            ctrl: None,
            window: TxWindow::new(options.max_window as usize),
            rx_pending: None,
            log: logging::component(log, "connect"),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[inline]
    pub fn is_era(&self) -> bool {
        self.era
    }

    #[inline]
    pub(crate) fn ctrl_pending(&self) -> bool {
        self.ctrl.is_some()
    }

    #[inline]
    pub(crate) fn draining(&self) -> bool {
        self.state == ConnectState::DataAck
    }

    #[cfg(test)]
    pub(crate) fn magic(&self) -> u32 {
        self.magic
    }

    #[cfg(test)]
    pub(crate) fn window_mut(&mut self) -> &mut TxWindow {
        &mut self.window
    }

    /// Start the connection manager.
    pub fn start(&mut self, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        if !self.active {
            debug!(self.log, "starting connection handler"; "context" => "start");
            self.reset(mux, now)?;
            self.active = true;
            self.enable = true;
        }
        Ok(())
    }

    /// Disable reconnection attempts ahead of a shutdown.
    pub(crate) fn disable(&mut self) {
        self.enable = false;
    }

    /// Queue a disconnect frame and drop back to idle.
    pub(crate) fn disconnect(&mut self, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        self.tx_disc();
        self.reset(mux, now)
    }

    /// Stop the connection manager entirely.
    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.enable = false;
    }

    /// Handle a received frame, run the timers, poll the multiplexor and
    /// hand any ready frame to the codec.
    pub fn poll(
        &mut self,
        active: bool,
        rx_frame: Option<&FrameData>,
        tx_idle: bool,
        codec: &mut FrameCodec,
        mux: &mut Multiplexor,
        transport: &mut dyn ByteTransport,
        now: Instant,
        stats: &mut Stats,
    ) -> LinkResult<()> {
        if !self.active {
            return Ok(());
        }

        if !active {
            self.ctrl = None;
            return self.reset(mux, now);
        }

        self.active_baud = transport.baud();

        if let Some(frame) = rx_frame {
            self.rx(frame, mux, now, stats)?;
        }

        self.check_timer(codec, mux, transport, now, stats)?;

        if self.connected {
            let rx_data = self.rx_pending.take();
            mux.poll(rx_data.as_ref(), self.window.free() > 0, &mut self.window)?;

            let queued = self.window.take_queued();
            if queued > 0 {
                self.state = ConnectState::DataAck;
                self.retries = DATA_RETRIES;
                self.timer_retry(now);
            }
        }

        if tx_idle {
            self.tx_next(codec)?;
        }

        Ok(())
    }

    fn rx(
        &mut self,
        frame: &FrameData,
        mux: &mut Multiplexor,
        now: Instant,
        stats: &mut Stats,
    ) -> LinkResult<()> {
        match frame.cont {
            CONT_ACK => self.rx_ack(frame, mux, now),
            CONT_DISC => self.rx_disc(mux, now),
            CONT_REQ => match frame.seq {
                SEQ_REQ_SIBO => self.rx_req_sibo(mux, now),
                SEQ_REQ_REQUEST => self.rx_req_request(mux, now),
                SEQ_REQ_CONFIRM => self.rx_req_confirm(frame, mux, now),
                _ => Ok(()),
            },
            CONT_DATA => self.rx_data(frame, now, stats),
            _ => Ok(()),
        }
    }

    fn rx_ack(&mut self, frame: &FrameData, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        match self.state {
            ConnectState::IdleReq | ConnectState::IdleAck => {
                // Connection completed by acknowledge
                if self.enable {
                    let era = self.era;
                    self.window.open(era);
                    self.window.set_seq_tx(frame.seq);
                    self.seq_rx = 0;
                    self.timer_idle(now);
                    self.state = ConnectState::Data;
                    self.mux_connected(mux)?;
                }
            }
            ConnectState::DataAck => {
                self.window.ack(frame.seq);
                if self.window.is_empty() {
                    self.state = ConnectState::Data;
                    self.timer_idle(now);
                } else {
                    self.timer_retry(now);
                }
            }
            ConnectState::Idle | ConnectState::Data => {}
        }
        Ok(())
    }

    fn rx_disc(&mut self, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        match self.state {
            ConnectState::Idle => Ok(()),
            _ => {
                debug!(self.log, "disconnect received"; "context" => "rx");
                self.reset(mux, now)
            }
        }
    }

    fn rx_req_sibo(&mut self, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        match self.state {
            ConnectState::Idle => {
                if self.enable {
                    self.era = false;
                    self.tx_req_con();
                    self.timer_retry(now);
                    self.retries = REQ_RETRIES;
                    self.state = ConnectState::IdleAck;
                }
                Ok(())
            }
            ConnectState::IdleReq | ConnectState::IdleAck => {
                if self.enable {
                    self.era = false;
                    self.window.open(false);
                    self.seq_rx = 0;
                    self.tx_ack(self.seq_rx);
                    self.timer_idle(now);
                    self.state = ConnectState::Data;
                    self.mux_connected(mux)?;
                }
                Ok(())
            }
            ConnectState::Data | ConnectState::DataAck => {
                // Should not receive when already connected, so disconnect
                self.reset(mux, now)
            }
        }
    }

    fn rx_req_request(&mut self, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        match self.state {
            ConnectState::Idle | ConnectState::IdleReq | ConnectState::IdleAck => {
                if self.enable {
                    self.era = true;
                    self.tx_req_con();
                    self.timer_retry(now);
                    self.retries = REQ_RETRIES;
                    self.state = ConnectState::IdleAck;
                }
                Ok(())
            }
            ConnectState::Data | ConnectState::DataAck => self.reset(mux, now),
        }
    }

    fn rx_req_confirm(
        &mut self,
        frame: &FrameData,
        mux: &mut Multiplexor,
        now: Instant,
    ) -> LinkResult<()> {
        match self.state {
            ConnectState::IdleReq | ConnectState::IdleAck => {
                // The magic is an opaque session nonce; reject only our
                // own, which would indicate a looped-back line
                let magic = wire::Reader::new(frame.payload()).get_u32();
                match magic {
                    Ok(magic) if self.enable && magic != self.magic => {
                        self.era = true;
                        self.window.open(true);
                        self.seq_rx = 0;
                        self.tx_ack(self.seq_rx);
                        self.timer_idle(now);
                        self.state = ConnectState::Data;
                        self.mux_connected(mux)?;
                    }
                    _ => {}
                }
                Ok(())
            }
            ConnectState::Data | ConnectState::DataAck => self.reset(mux, now),
            ConnectState::Idle => Ok(()),
        }
    }

    fn rx_data(&mut self, frame: &FrameData, now: Instant, stats: &mut Stats) -> LinkResult<()> {
        match self.state {
            ConnectState::Data | ConnectState::DataAck => {
                if frame.seq == self.inc_seq(self.seq_rx) {
                    self.seq_rx = frame.seq;
                    self.rx_pending = Some(frame.clone());
                    self.tx_ack(self.seq_rx);
                    if self.state == ConnectState::Data {
                        self.timer_idle(now);
                    } else {
                        self.timer_retry(now);
                    }
                } else {
                    // Out of sequence: repeat the last acknowledgement
                    self.tx_ack(self.seq_rx);
                    stats.rx_retry_frame();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_timer(
        &mut self,
        codec: &mut FrameCodec,
        mux: &mut Multiplexor,
        transport: &mut dyn ByteTransport,
        now: Instant,
        stats: &mut Stats,
    ) -> LinkResult<()> {
        match self.timer {
            Some(deadline) if now >= deadline => {
                self.timer = None;
                self.on_timeout(codec, mux, transport, now, stats)
            }
            _ => Ok(()),
        }
    }

    fn on_timeout(
        &mut self,
        codec: &mut FrameCodec,
        mux: &mut Multiplexor,
        transport: &mut dyn ByteTransport,
        now: Instant,
        stats: &mut Stats,
    ) -> LinkResult<()> {
        match self.state {
            ConnectState::Idle => {
                if self.enable {
                    self.tx_req_req();
                    self.timer_retry(now);
                    self.state = ConnectState::IdleReq;
                }
                Ok(())
            }
            ConnectState::IdleReq => {
                if self.enable {
                    if self.auto_baud {
                        let (baud, changed) = transport.cycle_baud();
                        self.active_baud = baud;
                        codec.reset(changed);
                    }
                    self.tx_req_req();
                    self.timer_retry(now);
                    Ok(())
                } else {
                    self.reset(mux, now)
                }
            }
            ConnectState::IdleAck => {
                self.retries = self.retries.saturating_sub(1);
                if self.enable && self.retries > 0 {
                    self.tx_req_con();
                    self.timer_retry(now);
                    Ok(())
                } else {
                    self.reset(mux, now)
                }
            }
            ConnectState::Data => {
                // Inactivity timeout
                debug!(self.log, "idle timeout, disconnecting"; "context" => "timer");
                self.tx_disc();
                self.reset(mux, now)
            }
            ConnectState::DataAck => {
                self.retries = self.retries.saturating_sub(1);
                if self.retries > 0 {
                    let resent = self.window.rewind();
                    stats.tx_retries(resent);
                    debug!(self.log, "window retransmit"; "context" => "timer", "frames" => resent);
                    self.timer_retry(now);
                    Ok(())
                } else {
                    // The peer stopped acknowledging within the retry
                    // budget; report the timeout after dropping the link
                    debug!(self.log, "retry budget exhausted"; "context" => "timer");
                    self.tx_disc();
                    self.reset(mux, now)?;
                    Err(LinkError::Timeout)
                }
            }
        }
    }

    /// Start transmitting any waiting frame. Supervisory frames take
    /// priority over the data window.
    fn tx_next(&mut self, codec: &mut FrameCodec) -> LinkResult<()> {
        if let Some(frame) = self.ctrl.take() {
            codec.send(&frame)?;
        } else if let Some(frame) = self.window.next_pending() {
            codec.send(frame)?;
        }
        Ok(())
    }

    fn mux_connected(&mut self, mux: &mut Multiplexor) -> LinkResult<()> {
        if !self.connected {
            debug!(self.log, "link established";
                   "context" => "connect",
                   "dialect" => if self.era { "era" } else { "sibo" });
            mux.start(self.era)?;
            self.connected = true;
        }
        Ok(())
    }

    fn mux_disconnected(&mut self, mux: &mut Multiplexor, immediate: bool) -> LinkResult<()> {
        if self.connected {
            mux.end(immediate)?;
            self.connected = false;
        }
        Ok(())
    }

    /// Reset the state machine. Any queued supervisory frame is preserved
    /// so a disconnect notification still flushes.
    fn reset(&mut self, mux: &mut Multiplexor, now: Instant) -> LinkResult<()> {
        self.state = ConnectState::Idle;
        self.era = false;
        self.timer_retry(now);
        self.seq_rx = 0;
        self.window.reset();
        self.rx_pending = None;
        self.magic = nonce();
        self.mux_disconnected(mux, true)
    }

    #[inline]
    fn inc_seq(&self, seq: u16) -> u16 {
        (seq + 1)
            % if self.era {
                Dialect::Era.seq_space()
            } else {
                Dialect::Sibo.seq_space()
            }
    }

    fn timer_idle(&mut self, now: Instant) {
        self.timer = if self.idle_limit > 0 {
            Some(now + centis(self.idle_limit))
        } else {
            None
        };
    }

    fn timer_retry(&mut self, now: Instant) {
        let mut timeout = TIMEOUT_RETRY_OFFSET;
        if self.connected {
            let max_frame = if self.era { MAX_DATA_RX } else { MAX_DATA_TX };
            timeout += link_time(max_frame as u32 * TIMEOUT_RETRY_BYTES_SCALE, self.active_baud);
        }
        self.timer = Some(now + centis(timeout));
    }

    fn tx_ack(&mut self, seq: u16) {
        self.ctrl = Some(FrameData::new(CONT_ACK, seq));
    }

    fn tx_disc(&mut self) {
        self.ctrl = Some(FrameData::new(CONT_DISC, SEQ_DISC));
    }

    fn tx_req_req(&mut self) {
        self.ctrl = Some(FrameData::new(CONT_REQ, SEQ_REQ_REQUEST));
    }

    fn tx_req_con(&mut self) {
        let mut payload = [0u8; 4];
        wire::Writer::new(&mut payload)
            .put_u32(self.magic)
            .expect("magic always fits");
        let frame = FrameData::with_payload(CONT_REQ, SEQ_REQ_CONFIRM, &payload)
            .expect("confirm frame always fits");
        self.ctrl = Some(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryLink;
    use std::time::Duration;

    struct Rig {
        engine: ConnectionEngine,
        codec: FrameCodec,
        mux: Multiplexor,
        transport: MemoryLink,
        stats: Stats,
        now: Instant,
    }

    impl Rig {
        fn new() -> Rig {
            let options = LinkOptions::default();
            let mut codec = FrameCodec::new(None);
            codec.start();
            let mut rig = Rig {
                engine: ConnectionEngine::new(&options, None),
                codec,
                mux: Multiplexor::new(&options, None),
                transport: MemoryLink::pair().0,
                stats: Stats::new(),
                now: Instant::now(),
            };
            rig.engine.start(&mut rig.mux, rig.now).unwrap();
            rig
        }

        fn poll(&mut self, rx: Option<&FrameData>) {
            self.try_poll(rx).unwrap();
        }

        fn try_poll(&mut self, rx: Option<&FrameData>) -> LinkResult<()> {
            self.engine.poll(
                true,
                rx,
                self.codec.tx_idle(),
                &mut self.codec,
                &mut self.mux,
                &mut self.transport,
                self.now,
                &mut self.stats,
            )
        }

        fn advance(&mut self, duration: Duration) {
            self.now += duration;
        }

        /// Drain and decode the frame the codec is currently sending.
        fn sent_frame(&mut self) -> Option<FrameData> {
            if self.codec.tx_idle() {
                return None;
            }
            let mut decoder = FrameCodec::new(None);
            decoder.start();
            while self.codec.tx_pending() {
                let byte = self.codec.tx_byte(&mut self.stats);
                decoder.rx_byte(byte, &mut self.stats);
            }
            assert!(decoder.rx_complete(), "codec produced a malformed frame");
            Some(decoder.take_rx())
        }

        fn confirm_from_peer(&self, magic: u32) -> FrameData {
            let mut payload = [0u8; 4];
            wire::Writer::new(&mut payload).put_u32(magic).unwrap();
            FrameData::with_payload(CONT_REQ, SEQ_REQ_CONFIRM, &payload).unwrap()
        }

        /// Acknowledge outstanding traffic until the link goes quiet. The
        /// multiplexor sends its info frame and the registry connect as
        /// soon as a connection is established, so tests settle those
        /// exchanges before making assertions about the window.
        fn settle(&mut self) {
            for _ in 0..64 {
                self.poll(None);
                if let Some(frame) = self.sent_frame() {
                    if frame.cont == CONT_DATA {
                        let ack = FrameData::new(CONT_ACK, frame.seq);
                        self.poll(Some(&ack));
                    }
                    continue;
                }
                if self.engine.window_mut().is_empty()
                    && !self.engine.ctrl_pending()
                    && self.mux.ctrl_queue_empty()
                {
                    return;
                }
            }
            panic!("link did not settle");
        }

        /// Drive through the Era handshake via a peer confirm.
        fn connect_era(&mut self) {
            self.advance(Duration::from_secs(1));
            self.poll(None);
            let req = self.sent_frame().unwrap();
            assert_eq!((req.cont, req.seq), (CONT_REQ, SEQ_REQ_REQUEST));

            let confirm = self.confirm_from_peer(0xDEAD_BEEF);
            self.poll(Some(&confirm));
            assert!(self.engine.is_connected());
            let ack = self.sent_frame().unwrap();
            assert_eq!((ack.cont, ack.seq), (CONT_ACK, 0));

            self.settle();
            assert_eq!(self.engine.state(), ConnectState::Data);
        }

        /// Drive through the legacy handshake initiated by the peer.
        fn connect_sibo(&mut self) {
            let req = FrameData::new(CONT_REQ, SEQ_REQ_SIBO);
            self.poll(Some(&req));
            assert_eq!(self.engine.state(), ConnectState::IdleAck);
            let confirm = self.sent_frame().unwrap();
            assert_eq!((confirm.cont, confirm.seq), (CONT_REQ, SEQ_REQ_CONFIRM));

            let ack = FrameData::new(CONT_ACK, 0);
            self.poll(Some(&ack));
            assert!(self.engine.is_connected());
            self.settle();
        }
    }

    #[test]
    fn test_handshake_era_confirm() {
        let mut rig = Rig::new();
        rig.connect_era();
        assert!(rig.engine.is_connected());
        assert!(rig.engine.is_era());
        assert!(rig.mux.active());
    }

    #[test]
    fn test_handshake_starts_mux_once() {
        let mut rig = Rig::new();
        rig.connect_era();
        // A duplicate confirm while connected forces a disconnect rather
        // than a second start
        let confirm = rig.confirm_from_peer(0xDEAD_BEEF);
        rig.poll(Some(&confirm));
        assert_eq!(rig.engine.state(), ConnectState::Idle);
        assert!(!rig.engine.is_connected());
        assert!(!rig.mux.active());
    }

    #[test]
    fn test_handshake_rejects_own_magic() {
        let mut rig = Rig::new();
        rig.advance(Duration::from_secs(1));
        rig.poll(None);
        rig.sent_frame();

        let loopback = rig.confirm_from_peer(rig.engine.magic());
        rig.poll(Some(&loopback));
        assert_eq!(rig.engine.state(), ConnectState::IdleReq);
        assert!(!rig.engine.is_connected());
    }

    #[test]
    fn test_handshake_sibo() {
        let mut rig = Rig::new();
        rig.connect_sibo();
        assert_eq!(rig.engine.state(), ConnectState::Data);
        assert!(rig.engine.is_connected());
        assert!(!rig.engine.is_era());
    }

    #[test]
    fn test_rx_data_in_sequence() {
        let mut rig = Rig::new();
        rig.connect_era();

        let data = FrameData::with_payload(CONT_DATA, 1, &[9, 1, 1, 42]).unwrap();
        rig.poll(Some(&data));
        let ack = rig.sent_frame().unwrap();
        assert_eq!((ack.cont, ack.seq), (CONT_ACK, 1));
        assert_eq!(rig.stats.rx_retry_frames, 0);
    }

    #[test]
    fn test_rx_duplicate_data_acked_again() {
        let mut rig = Rig::new();
        rig.connect_era();

        let data = FrameData::with_payload(CONT_DATA, 1, &[9, 1, 1, 42]).unwrap();
        rig.poll(Some(&data));
        rig.sent_frame();
        rig.poll(Some(&data));
        let ack = rig.sent_frame().unwrap();
        assert_eq!((ack.cont, ack.seq), (CONT_ACK, 1));
        assert_eq!(rig.stats.rx_retry_frames, 1);
    }

    #[test]
    fn test_window_retransmit() {
        let mut rig = Rig::new();
        rig.connect_era();

        // Queue three data frames directly into the window
        for value in 1..=3u8 {
            let frame = FrameData::with_payload(0, 0, &[value]).unwrap();
            rig.engine.window_mut().send(&frame).unwrap();
        }
        rig.poll(None);
        assert_eq!(rig.engine.state(), ConnectState::DataAck);

        // All three go out in order
        let mut seqs = Vec::new();
        for _ in 0..3 {
            rig.poll(None);
            let frame = rig.sent_frame().unwrap();
            assert_eq!(frame.cont, CONT_DATA);
            seqs.push(frame.seq);
        }
        assert_eq!(seqs[1], seqs[0] + 1);
        assert_eq!(seqs[2], seqs[0] + 2);

        // Only the first is acknowledged
        let ack = FrameData::new(CONT_ACK, seqs[0]);
        rig.poll(Some(&ack));
        assert_eq!(rig.engine.state(), ConnectState::DataAck);

        // The retry timer fires and the remainder are resent
        rig.advance(Duration::from_secs(5));
        rig.poll(None);
        assert_eq!(rig.stats.tx_retry_frames, 2);
        let mut resent = Vec::new();
        loop {
            rig.poll(None);
            match rig.sent_frame() {
                Some(frame) => resent.push(frame.seq),
                None => break,
            }
        }
        assert_eq!(resent, vec![seqs[1], seqs[2]]);
    }

    #[test]
    fn test_ack_unknown_seq_ignored() {
        let mut rig = Rig::new();
        rig.connect_era();

        let frame = FrameData::with_payload(0, 0, &[1]).unwrap();
        rig.engine.window_mut().send(&frame).unwrap();
        rig.poll(None);
        rig.poll(None);
        rig.sent_frame();

        let ack = FrameData::new(CONT_ACK, 99);
        rig.poll(Some(&ack));
        assert_eq!(rig.engine.state(), ConnectState::DataAck);
        assert!(!rig.engine.window_mut().is_empty());
    }

    #[test]
    fn test_window_bound() {
        let mut rig = Rig::new();
        rig.connect_era();

        let frame = FrameData::with_payload(0, 0, &[7]).unwrap();
        for _ in 0..5 {
            rig.engine.window_mut().send(&frame).unwrap();
        }
        assert_eq!(rig.engine.window_mut().free(), 0);
        assert_eq!(rig.engine.window_mut().send(&frame), Err(LinkError::Busy));
        assert_eq!(rig.engine.window_mut().used(), 5);
    }

    #[test]
    fn test_sibo_window_is_one() {
        let mut rig = Rig::new();
        rig.connect_sibo();

        let frame = FrameData::with_payload(0, 0, &[7]).unwrap();
        rig.engine.window_mut().send(&frame).unwrap();
        assert_eq!(rig.engine.window_mut().send(&frame), Err(LinkError::Busy));
    }

    #[test]
    fn test_idle_disconnect() {
        let mut rig = Rig::new();
        rig.connect_era();

        // One minute of silence drops the link exactly once
        rig.advance(Duration::from_secs(61));
        rig.poll(None);
        assert_eq!(rig.engine.state(), ConnectState::Idle);
        assert!(!rig.engine.is_connected());
        assert!(!rig.mux.active());
        let disc = rig.sent_frame().unwrap();
        assert_eq!(disc.cont, CONT_DISC);
        assert!(rig.sent_frame().is_none());
    }

    #[test]
    fn test_retry_exhaustion_times_out() {
        let mut rig = Rig::new();
        rig.connect_era();

        let frame = FrameData::with_payload(0, 0, &[1]).unwrap();
        rig.engine.window_mut().send(&frame).unwrap();
        rig.poll(None);

        // Never acknowledge; let every retry elapse
        let mut result = Ok(());
        for _ in 0..DATA_RETRIES {
            rig.advance(Duration::from_secs(5));
            result = rig.try_poll(None);
            rig.sent_frame();
        }
        assert_eq!(result, Err(LinkError::Timeout));
        assert_eq!(rig.engine.state(), ConnectState::Idle);
        assert!(!rig.engine.is_connected());

        // The disconnect notification still flushes afterwards
        rig.poll(None);
        let disc = rig.sent_frame().unwrap();
        assert_eq!(disc.cont, CONT_DISC);
    }

    #[test]
    fn test_connect_retry_cycles_baud() {
        let mut rig = Rig::new();

        // First timeout issues the connect request at the initial rate
        rig.advance(Duration::from_secs(1));
        rig.poll(None);
        rig.sent_frame();
        assert_eq!(rig.transport.baud(), 115_200);

        // Each unanswered retry advances the automatic baud cycle
        rig.advance(Duration::from_secs(1));
        rig.poll(None);
        let req = rig.sent_frame().unwrap();
        assert_eq!((req.cont, req.seq), (CONT_REQ, SEQ_REQ_REQUEST));
        assert_eq!(rig.transport.baud(), 57_600);

        rig.advance(Duration::from_secs(1));
        rig.poll(None);
        assert_eq!(rig.transport.baud(), 38_400);
    }

    #[test]
    fn test_seq_wraps_in_sibo_space() {
        let mut rig = Rig::new();
        rig.connect_sibo();

        // Receive eight frames in sequence; the eighth wraps to zero
        for seq in (1..8).chain(std::iter::once(0)) {
            let data = FrameData::with_payload(CONT_DATA, seq, &[9, 1, 1, 9]).unwrap();
            rig.poll(Some(&data));
            let ack = rig.sent_frame().unwrap();
            assert_eq!((ack.cont, ack.seq), (CONT_ACK, seq));
        }
        assert_eq!(rig.stats.rx_retry_frames, 0);
    }
}
