//! NCP multiplexor and fragmentation: a byte-addressed channel bus on top
//! of connection data frames.
//!
//! Every data frame starts with a three byte header `{dest, src, type}`.
//! Channel 0 is reserved for control frames carrying multiplexor metadata;
//! all other channels carry application messages, fragmented to the frame
//! size on transmit and reassembled on receive.

use crate::config::LinkOptions;
use crate::connect::TxWindow;
use crate::error::{LinkError, LinkResult};
use crate::frame::{FrameData, MAX_DATA_TX};
use crate::registry::{Registry, RegistryCtx, REGISTRY_CHANNEL, REGISTRY_MTU, REGISTRY_NAME};
use crate::wire;
use filament::logging::{self, debug, trace, Logger};
use filament::time::nonce;
use indexmap::IndexSet;
use std::any::Any;

pub(crate) const CHANNEL_CTRL: u8 = 0;

const OFFSET_DEST: usize = 0;
const OFFSET_SRC: usize = 1;
const OFFSET_TYPE: usize = 2;
pub(crate) const OFFSET_DATA: usize = 3;

const MSG_DATA_XOFF: u8 = 0x01;
const MSG_DATA_XON: u8 = 0x02;
const MSG_CONNECT_TO_SERVER: u8 = 0x03;
const MSG_CONNECT_RESPONSE: u8 = 0x04;
const MSG_CHANNEL_CLOSED: u8 = 0x05;
const MSG_NCP_INFO: u8 = 0x06;
const MSG_CHANNEL_DISCONNECT: u8 = 0x07;
const MSG_NCP_END: u8 = 0x08;

const MSG_WRITE_COMPLETE: u8 = 0x01;
const MSG_WRITE_PARTIAL: u8 = 0x02;

pub(crate) const NCP_SIBO_VERSION: u8 = 2;
pub(crate) const NCP_SIBO_NEW_VERSION: u8 = 3;
pub(crate) const NCP_ERA_VERSION: u8 = 6;

const MAX_CTRL: usize = 100;

/// Status byte for a successful connect response.
const CONNECT_STATUS_OK: u8 = 0;
/// Status byte when no matching server exists (Sibo "file does not
/// exist").
const CONNECT_STATUS_NOT_FOUND: u8 = (-33i8) as u8;

/// Events delivered to a channel handler from the tick context.
#[derive(Debug)]
pub enum ChannelEvent<'a> {
    Start,
    End,
    ServerFailed,
    ServerConnected,
    ServerDisconnected,
    ServerData(&'a [u8]),
    ClientConnected,
    ClientDisconnected,
    ClientData(&'a [u8]),
    Idle,
}

/// Internal event selector; the payload slices are attached at dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EventKind {
    Start,
    End,
    ServerFailed,
    ServerConnected,
    ServerDisconnected,
    ServerData,
    ClientConnected,
    ClientDisconnected,
    ClientData,
    Idle,
}

/// A channel handler reacts to channel events and queues outgoing writes
/// through the supplied context. Handlers run inside the poll tick and
/// must return after bounded work.
pub trait ChannelHandler: 'static {
    fn poll(&mut self, event: ChannelEvent<'_>, ctx: &mut ChannelCtx<'_>) -> LinkResult<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Deferred operations requested from handler or registry context.
pub(crate) enum MuxOp {
    Connect { chan: u8, name: Option<String> },
    Destroy { chan: u8 },
    Register { requester: u8, name: String },
    Resolved { requester: u8, name: String },
    ResolveFailed { requester: u8 },
}

/// The per-direction message buffer of a channel: a whole message
/// deposited at once and drained in frame sized slices.
pub(crate) struct MsgBuffer {
    data: Box<[u8]>,
    used: usize,
    offset: usize,
}

impl MsgBuffer {
    pub(crate) fn new(size: usize) -> MsgBuffer {
        MsgBuffer {
            data: vec![0; size].into_boxed_slice(),
            used: 0,
            offset: 0,
        }
    }

    fn unused() -> MsgBuffer {
        MsgBuffer::new(0)
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub(crate) fn pending(&self) -> bool {
        self.used > 0
    }

    #[inline]
    fn clear(&mut self) {
        self.used = 0;
        self.offset = 0;
    }

    /// Deposit a whole outgoing message.
    pub(crate) fn deposit(&mut self, bytes: &[u8]) -> LinkResult<()> {
        if bytes.is_empty() || bytes.len() > self.capacity() {
            return Err(LinkError::BadParms);
        }
        if self.pending() {
            return Err(LinkError::Busy);
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.used = bytes.len();
        self.offset = 0;
        Ok(())
    }

    /// Append a received fragment. Overlength input is counted but not
    /// stored so the completed message can be recognised as oversize.
    fn append(&mut self, bytes: &[u8]) {
        if self.used + bytes.len() <= self.capacity() {
            self.data[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        }
        self.used += bytes.len();
    }

    /// The completed message, valid only when `used` fits the buffer.
    #[inline]
    fn delivered(&self) -> &[u8] {
        &self.data[..self.used.min(self.capacity())]
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SlotKind {
    App,
    Registry,
}

struct ChannelSlot {
    name: String,
    chan: u8,
    is_client: bool,
    is_server: bool,
    kind: SlotKind,
    handler: Option<Box<dyn ChannelHandler>>,
    client_peer: u8,
    server_peer: u8,
    client_rx: MsgBuffer,
    server_rx: MsgBuffer,
    client_tx: MsgBuffer,
    server_tx: MsgBuffer,
    registry_name: Option<String>,
    registry_tried: bool,
    upload: Option<Box<dyn FnMut() -> LinkResult<()>>>,
    upload_tried: bool,
}

/// Construction parameters for a channel.
pub struct ChannelConfig {
    pub name: String,
    pub chan: u8,
    pub client: bool,
    pub server: bool,
    pub mtu: usize,
    registry_name: Option<String>,
    upload: Option<Box<dyn FnMut() -> LinkResult<()>>>,
}

impl ChannelConfig {
    pub fn client(name: &str) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            chan: 0,
            client: true,
            server: false,
            mtu: 0,
            registry_name: None,
            upload: None,
        }
    }

    pub fn server(name: &str) -> ChannelConfig {
        ChannelConfig {
            server: true,
            client: false,
            ..ChannelConfig::client(name)
        }
    }

    pub fn client_server(name: &str) -> ChannelConfig {
        ChannelConfig {
            server: true,
            ..ChannelConfig::client(name)
        }
    }

    pub fn with_chan(mut self, chan: u8) -> ChannelConfig {
        self.chan = chan;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> ChannelConfig {
        self.mtu = mtu;
        self
    }

    /// Name registered through the link directory service when the plain
    /// connect is refused.
    pub fn with_registry(mut self, name: &str) -> ChannelConfig {
        self.registry_name = Some(name.to_string());
        self
    }

    /// Hook run once if registry resolution also fails, typically to
    /// upload the server program to the remote device before the final
    /// connect retry.
    pub fn with_upload<F: FnMut() -> LinkResult<()> + 'static>(mut self, upload: F) -> ChannelConfig {
        self.upload = Some(Box::new(upload));
        self
    }
}

/// Context handed to channel handlers for the duration of one event.
pub struct ChannelCtx<'a> {
    pub chan: u8,
    pub client_peer: u8,
    pub server_peer: u8,
    client_tx: &'a mut MsgBuffer,
    server_tx: &'a mut MsgBuffer,
    ops: &'a mut Vec<MuxOp>,
}

impl<'a> ChannelCtx<'a> {
    /// Queue a whole message towards the connected server.
    pub fn tx_server(&mut self, bytes: &[u8]) -> LinkResult<()> {
        if self.server_peer == CHANNEL_CTRL {
            return Err(LinkError::NotConnected);
        }
        self.server_tx.deposit(bytes)
    }

    /// Queue a whole message towards the connected client.
    pub fn tx_client(&mut self, bytes: &[u8]) -> LinkResult<()> {
        if self.client_peer == CHANNEL_CTRL {
            return Err(LinkError::NotConnected);
        }
        self.client_tx.deposit(bytes)
    }

    /// Room left for an outgoing server message.
    pub fn tx_server_idle(&self) -> bool {
        !self.server_tx.pending()
    }

    pub fn tx_client_idle(&self) -> bool {
        !self.client_tx.pending()
    }

    /// Re-issue the connect for this channel, optionally to a different
    /// server name.
    pub fn connect(&mut self, name: Option<&str>) {
        self.ops.push(MuxOp::Connect {
            chan: self.chan,
            name: name.map(str::to_string),
        });
    }

    /// Request destruction of this channel after the current event.
    pub fn destroy(&mut self) {
        self.ops.push(MuxOp::Destroy { chan: self.chan });
    }
}

/// Summary of one channel for status reporting.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub chan: u8,
    pub is_client: bool,
    pub is_server: bool,
    pub client_peer: u8,
    pub server_peer: u8,
}

struct CtrlQueue {
    frames: Vec<FrameData>,
    read: usize,
    write: usize,
}

impl CtrlQueue {
    fn new() -> CtrlQueue {
        CtrlQueue {
            frames: vec![FrameData::new(0, 0); MAX_CTRL],
            read: 0,
            write: 0,
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.read == self.write
    }

    fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    fn queue(&mut self, src: u8, msg: u8, body: &[u8]) -> LinkResult<()> {
        let next = (self.write + 1) % self.frames.len();
        if next == self.read {
            return Err(LinkError::MuxFull);
        }
        if OFFSET_DATA + body.len() > MAX_DATA_TX {
            return Err(LinkError::BufferFull);
        }
        let mut payload = [0u8; MAX_DATA_TX];
        payload[OFFSET_DEST] = CHANNEL_CTRL;
        payload[OFFSET_SRC] = src;
        payload[OFFSET_TYPE] = msg;
        payload[OFFSET_DATA..OFFSET_DATA + body.len()].copy_from_slice(body);
        let frame = &mut self.frames[self.write];
        frame.cont = 0;
        frame.seq = 0;
        frame.set_payload(&payload[..OFFSET_DATA + body.len()])?;
        self.write = next;
        Ok(())
    }

    fn front(&self) -> Option<&FrameData> {
        if self.is_empty() {
            None
        } else {
            Some(&self.frames[self.read])
        }
    }

    fn pop_front(&mut self) {
        if !self.is_empty() {
            self.read = (self.read + 1) % self.frames.len();
        }
    }
}

/// The multiplexor: channel slab, control frame queue, block list, and
/// the fragmentation scheduler.
pub struct Multiplexor {
    active: bool,
    era: bool,
    remote_version: u8,
    remote_id: u32,
    channels: Vec<Option<ChannelSlot>>,
    order: IndexSet<u8>,
    last_chan: u8,
    blocked: [bool; 256],
    ctrl: CtrlQueue,
    registry: Registry,
    ops: Vec<MuxOp>,
    default_mtu: usize,
    log: Logger,
}

impl Multiplexor {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(options: &LinkOptions, log: L) -> Multiplexor {
        let log = logging::component(log, "mux");
        Multiplexor {
            active: false,
            era: false,
            remote_version: 0,
            remote_id: 0,
            channels: (0..256).map(|_| None).collect(),
            order: IndexSet::new(),
            last_chan: CHANNEL_CTRL,
            blocked: [false; 256],
            ctrl: CtrlQueue::new(),
            registry: Registry::new(&log),
            ops: Vec::new(),
            default_mtu: options.mtu as usize,
            log,
        }
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn era(&self) -> bool {
        self.era
    }

    /// NCP version reported by the peer, zero before its info frame.
    #[inline]
    pub fn remote_version(&self) -> u8 {
        self.remote_version
    }

    /// Session identifier reported by the peer's info frame.
    #[inline]
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    #[inline]
    pub(crate) fn ctrl_queue_empty(&self) -> bool {
        self.ctrl.is_empty()
    }

    /// Channel summaries in creation order.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.order
            .iter()
            .filter_map(|&chan| self.channels[chan as usize].as_ref())
            .map(|slot| ChannelInfo {
                name: slot.name.clone(),
                chan: slot.chan,
                is_client: slot.is_client,
                is_server: slot.is_server,
                client_peer: slot.client_peer,
                server_peer: slot.server_peer,
            })
            .collect()
    }

    /// Borrow a channel's handler, e.g. to reach its request queue.
    pub fn handler_mut(&mut self, chan: u8) -> Option<&mut dyn ChannelHandler> {
        match self.channels[chan as usize].as_mut() {
            Some(slot) => slot.handler.as_mut().map(|h| &mut **h),
            None => None,
        }
    }

    /// Start the multiplexor once a connection reaches the data state.
    pub(crate) fn start(&mut self, era: bool) -> LinkResult<()> {
        if self.active {
            return Ok(());
        }
        debug!(self.log, "starting multiplexor";
               "context" => "start",
               "dialect" => if era { "era" } else { "sibo" });
        self.era = era;
        self.remote_version = 0;
        self.ctrl.clear();
        self.blocked = [false; 256];
        self.last_chan = CHANNEL_CTRL;
        self.queue_info()?;
        self.active = true;

        // The link directory service is both offered and consumed
        let config = ChannelConfig::client_server(REGISTRY_NAME)
            .with_chan(REGISTRY_CHANNEL)
            .with_mtu(REGISTRY_MTU);
        self.create(config, None, SlotKind::Registry)?;
        Ok(())
    }

    /// End the multiplexor. A graceful end queues the channel closure and
    /// termination frames and leaves the layer running so they can drain;
    /// an immediate end discards everything.
    pub(crate) fn end(&mut self, immediate: bool) -> LinkResult<()> {
        if !self.active {
            return Ok(());
        }
        debug!(self.log, "ending multiplexor"; "context" => "end", "immediate" => immediate);
        let channels: Vec<u8> = self.order.iter().cloned().collect();
        for chan in channels {
            self.destroy(chan, immediate)?;
        }
        if immediate {
            self.ctrl.clear();
            self.remote_version = 0;
            self.registry.reset();
            self.active = false;
        } else {
            self.ctrl.queue(CHANNEL_CTRL, MSG_NCP_END, &[])?;
        }
        Ok(())
    }

    /// Create a channel. A client channel immediately attempts to contact
    /// the named remote server.
    pub fn create_channel(
        &mut self,
        config: ChannelConfig,
        handler: Box<dyn ChannelHandler>,
    ) -> LinkResult<u8> {
        self.create(config, Some(handler), SlotKind::App)
    }

    fn create(
        &mut self,
        config: ChannelConfig,
        handler: Option<Box<dyn ChannelHandler>>,
        kind: SlotKind,
    ) -> LinkResult<u8> {
        if !self.active {
            return Err(LinkError::NoConnect);
        }
        if config.chan != CHANNEL_CTRL && self.channels[config.chan as usize].is_some() {
            return Err(LinkError::ChannelExists);
        }
        if self.order.len() >= 255 {
            return Err(LinkError::MuxFull);
        }

        // Choose a unique channel number
        let mut chan = config.chan;
        while chan == CHANNEL_CTRL || self.channels[chan as usize].is_some() {
            chan = chan.wrapping_add(1);
        }

        let mtu = if config.mtu == 0 { self.default_mtu } else { config.mtu };
        let is_client = config.client;
        let slot = ChannelSlot {
            name: config.name,
            chan,
            is_client: config.client,
            is_server: config.server,
            kind,
            handler,
            client_peer: CHANNEL_CTRL,
            server_peer: CHANNEL_CTRL,
            client_rx: if config.server { MsgBuffer::new(mtu) } else { MsgBuffer::unused() },
            server_rx: if config.client { MsgBuffer::new(mtu) } else { MsgBuffer::unused() },
            client_tx: if config.server { MsgBuffer::new(mtu) } else { MsgBuffer::unused() },
            server_tx: if config.client { MsgBuffer::new(mtu) } else { MsgBuffer::unused() },
            registry_name: config.registry_name,
            registry_tried: false,
            upload: config.upload,
            upload_tried: false,
        };
        self.channels[chan as usize] = Some(slot);
        self.order.insert(chan);

        debug!(self.log, "channel created"; "context" => "create", "chan" => chan);
        self.dispatch(chan, EventKind::Start)?;
        if is_client {
            if let Err(err) = self.queue_connect(chan, None) {
                self.channels[chan as usize] = None;
                self.order.shift_remove(&chan);
                return Err(err);
            }
        }
        Ok(chan)
    }

    /// Destroy a channel and any of its active connections.
    pub fn destroy(&mut self, chan: u8, immediate: bool) -> LinkResult<()> {
        let (client_peer, server_peer, kind) = match self.channels[chan as usize].as_mut() {
            Some(slot) => {
                let peers = (slot.client_peer, slot.server_peer, slot.kind);
                slot.client_peer = CHANNEL_CTRL;
                slot.server_peer = CHANNEL_CTRL;
                peers
            }
            None => return Ok(()),
        };

        if client_peer != CHANNEL_CTRL {
            if !immediate {
                self.ctrl.queue(client_peer, MSG_CHANNEL_CLOSED, &[])?;
            }
            self.dispatch(chan, EventKind::ClientDisconnected)?;
        }
        if server_peer != CHANNEL_CTRL {
            if !immediate {
                self.ctrl.queue(chan, MSG_CHANNEL_DISCONNECT, &[server_peer])?;
            }
            self.dispatch(chan, EventKind::ServerDisconnected)?;
        }
        self.dispatch(chan, EventKind::End)?;

        self.channels[chan as usize] = None;
        self.order.shift_remove(&chan);
        if kind == SlotKind::Registry {
            self.registry.reset();
        }
        debug!(self.log, "channel destroyed"; "context" => "destroy", "chan" => chan);
        Ok(())
    }

    /// Handle received data, poll idle channels and transmit pending
    /// frames through the connection window.
    pub(crate) fn poll(
        &mut self,
        rx: Option<&FrameData>,
        tx_idle: bool,
        win: &mut TxWindow,
    ) -> LinkResult<()> {
        if !self.active {
            return Ok(());
        }

        if let Some(frame) = rx {
            let payload = frame.payload();
            if payload.len() >= OFFSET_DATA {
                if payload[OFFSET_DEST] == CHANNEL_CTRL {
                    self.rx_ctrl(payload)?;
                } else {
                    self.rx_data(payload)?;
                }
            }
        }

        // Idle polls for connected channels with no transmission pending.
        // Dispatch cannot reshape the channel set mid-loop; structural
        // changes go through the deferred operation queue.
        let mut index = 0;
        while index < self.order.len() {
            let chan = *self.order.get_index(index).unwrap();
            let idle = match self.channels[chan as usize].as_ref() {
                Some(slot) => {
                    (slot.client_peer != CHANNEL_CTRL || slot.server_peer != CHANNEL_CTRL)
                        && !slot.client_tx.pending()
                        && !slot.server_tx.pending()
                }
                None => false,
            };
            if idle {
                self.dispatch(chan, EventKind::Idle)?;
            }
            index += 1;
        }

        self.apply_ops()?;

        if tx_idle {
            self.poll_tx(win)?;
        }
        Ok(())
    }

    fn queue_info(&mut self) -> LinkResult<()> {
        let mut body = [0u8; 5];
        let mut writer = wire::Writer::new(&mut body);
        writer.put_u8(if self.era { NCP_ERA_VERSION } else { NCP_SIBO_VERSION })?;
        writer.put_u32(nonce())?;
        self.ctrl.queue(CHANNEL_CTRL, MSG_NCP_INFO, &body)
    }

    fn queue_connect(&mut self, chan: u8, name: Option<&str>) -> LinkResult<()> {
        let name = match self.channels[chan as usize].as_ref() {
            Some(slot) if slot.is_client => {
                if slot.server_peer != CHANNEL_CTRL {
                    return Ok(());
                }
                name.unwrap_or(&slot.name).to_string()
            }
            Some(_) => return Err(LinkError::BadParms),
            None => return Ok(()),
        };
        debug!(self.log, "connecting to server"; "context" => "connect", "chan" => chan, "server" => &name);
        let mut body = [0u8; MAX_DATA_TX - OFFSET_DATA];
        let mut writer = wire::Writer::new(&mut body);
        writer.put_str(&name)?;
        let used = writer.position();
        self.ctrl.queue(chan, MSG_CONNECT_TO_SERVER, &body[..used])
    }

    fn rx_ctrl(&mut self, payload: &[u8]) -> LinkResult<()> {
        let src = payload[OFFSET_SRC];
        let msg = payload[OFFSET_TYPE];
        let body = &payload[OFFSET_DATA..];

        match msg {
            MSG_DATA_XOFF => {
                trace!(self.log, "xoff"; "context" => "rx", "chan" => src);
                self.blocked[src as usize] = true;
                Ok(())
            }
            MSG_DATA_XON => {
                trace!(self.log, "xon"; "context" => "rx", "chan" => src);
                self.blocked[src as usize] = false;
                Ok(())
            }
            MSG_CONNECT_TO_SERVER => {
                let name = match wire::Reader::new(body).get_str() {
                    Ok(name) => name.to_string(),
                    Err(_) => return Ok(()),
                };
                self.rx_connect_to_server(src, &name)
            }
            MSG_CONNECT_RESPONSE => {
                let mut reader = wire::Reader::new(body);
                match (reader.get_u8(), reader.get_u8()) {
                    (Ok(client), Ok(status)) => self.rx_connect_response(client, src, status as i8),
                    _ => Ok(()),
                }
            }
            MSG_CHANNEL_CLOSED => self.rx_channel_closed(src),
            MSG_NCP_INFO => {
                let mut reader = wire::Reader::new(body);
                match (reader.get_u8(), reader.get_u32()) {
                    (Ok(version), Ok(id)) => self.rx_info(version, id),
                    _ => Ok(()),
                }
            }
            MSG_CHANNEL_DISCONNECT => match wire::Reader::new(body).get_u8() {
                Ok(target) => self.rx_channel_disconnect(target, src),
                Err(_) => Ok(()),
            },
            MSG_NCP_END => self.rx_ncp_end(),
            _ => {
                trace!(self.log, "unrecognised control frame"; "context" => "rx", "type" => msg);
                Ok(())
            }
        }
    }

    fn rx_connect_to_server(&mut self, src: u8, name: &str) -> LinkResult<()> {
        debug!(self.log, "connect request"; "context" => "rx", "client" => src, "server" => name);

        // First free server channel offering this name wins
        let found = self.order.iter().cloned().find(|&chan| {
            match self.channels[chan as usize].as_ref() {
                Some(slot) => {
                    slot.is_server && slot.name == name && slot.client_peer == CHANNEL_CTRL
                }
                None => false,
            }
        });

        if let Some(chan) = found {
            if let Some(slot) = self.channels[chan as usize].as_mut() {
                slot.client_peer = src;
            }
            self.dispatch(chan, EventKind::ClientConnected)?;
            self.ctrl
                .queue(chan, MSG_CONNECT_RESPONSE, &[src, CONNECT_STATUS_OK])
        } else {
            self.ctrl.queue(
                CHANNEL_CTRL,
                MSG_CONNECT_RESPONSE,
                &[src, CONNECT_STATUS_NOT_FOUND],
            )
        }
    }

    fn rx_connect_response(&mut self, chan: u8, server: u8, status: i8) -> LinkResult<()> {
        debug!(self.log, "connect response";
               "context" => "rx",
               "chan" => chan,
               "server" => server,
               "status" => status);

        let slot = match self.channels[chan as usize].as_mut() {
            Some(slot) if slot.is_client => slot,
            _ => return Ok(()),
        };
        if status == 0 {
            slot.server_peer = server;
            self.dispatch(chan, EventKind::ServerConnected)
        } else {
            self.connect_failed(chan)
        }
    }

    /// A connect was refused: try the registry upgrade path, then the
    /// upload hook, then give up and tear the channel down.
    fn connect_failed(&mut self, chan: u8) -> LinkResult<()> {
        let slot = match self.channels[chan as usize].as_mut() {
            Some(slot) => slot,
            None => return Ok(()),
        };
        if let Some(name) = slot.registry_name.clone() {
            if !slot.registry_tried {
                slot.registry_tried = true;
                debug!(self.log, "connect refused, registering";
                       "context" => "fallback", "chan" => chan, "name" => &name);
                self.ops.push(MuxOp::Register { requester: chan, name });
                return Ok(());
            }
        }
        if slot.upload.is_some() && !slot.upload_tried {
            slot.upload_tried = true;
            let upload = slot.upload.as_mut().unwrap();
            if upload().is_ok() {
                debug!(self.log, "server uploaded, retrying connect";
                       "context" => "fallback", "chan" => chan);
                return self.queue_connect(chan, None);
            }
        }
        self.dispatch(chan, EventKind::ServerFailed)?;
        self.destroy(chan, false)
    }

    fn rx_channel_closed(&mut self, target: u8) -> LinkResult<()> {
        debug!(self.log, "channel closed by peer"; "context" => "rx", "chan" => target);
        let event = match self.channels[target as usize].as_mut() {
            Some(slot) if slot.client_peer != CHANNEL_CTRL => {
                slot.client_peer = CHANNEL_CTRL;
                slot.client_rx.clear();
                slot.client_tx.clear();
                Some(EventKind::ClientDisconnected)
            }
            Some(slot) if slot.server_peer != CHANNEL_CTRL => {
                slot.server_peer = CHANNEL_CTRL;
                slot.server_rx.clear();
                slot.server_tx.clear();
                Some(EventKind::ServerDisconnected)
            }
            _ => None,
        };
        match event {
            Some(event) => self.dispatch(target, event),
            None => Ok(()),
        }
    }

    fn rx_channel_disconnect(&mut self, target: u8, src: u8) -> LinkResult<()> {
        debug!(self.log, "channel disconnect"; "context" => "rx", "chan" => target, "peer" => src);
        let event = match self.channels[target as usize].as_mut() {
            Some(slot) if slot.server_peer == src => {
                slot.server_peer = CHANNEL_CTRL;
                slot.server_rx.clear();
                slot.server_tx.clear();
                Some(EventKind::ServerDisconnected)
            }
            Some(slot) if slot.client_peer == src => {
                slot.client_peer = CHANNEL_CTRL;
                slot.client_rx.clear();
                slot.client_tx.clear();
                Some(EventKind::ClientDisconnected)
            }
            _ => None,
        };
        match event {
            Some(event) => self.dispatch(target, event),
            None => Ok(()),
        }
    }

    fn rx_info(&mut self, version: u8, id: u32) -> LinkResult<()> {
        debug!(self.log, "peer info"; "context" => "rx", "version" => version, "id" => id);
        self.remote_version = version;
        self.remote_id = id;

        let era = version >= NCP_ERA_VERSION;
        if era != self.era {
            self.restart(era)?;
        }
        Ok(())
    }

    /// The peer speaks the other dialect: drop every connection, reset
    /// the multiplexor state and reconnect the registered clients.
    fn restart(&mut self, era: bool) -> LinkResult<()> {
        debug!(self.log, "dialect change, restarting multiplexor";
               "context" => "restart",
               "dialect" => if era { "era" } else { "sibo" });
        self.rx_ncp_end()?;
        self.era = era;
        self.ctrl.clear();
        self.blocked = [false; 256];
        self.registry.reset();
        self.queue_info()?;

        let clients: Vec<u8> = self
            .order
            .iter()
            .cloned()
            .filter(|&chan| {
                self.channels[chan as usize]
                    .as_ref()
                    .map(|slot| slot.is_client)
                    .unwrap_or(false)
            })
            .collect();
        for chan in clients {
            if let Some(slot) = self.channels[chan as usize].as_mut() {
                slot.registry_tried = false;
                slot.upload_tried = false;
            }
            self.queue_connect(chan, None)?;
        }
        Ok(())
    }

    fn rx_ncp_end(&mut self) -> LinkResult<()> {
        debug!(self.log, "peer ended multiplexor"; "context" => "rx");
        let channels: Vec<u8> = self.order.iter().cloned().collect();
        for chan in channels {
            let mut events = [None, None];
            if let Some(slot) = self.channels[chan as usize].as_mut() {
                if slot.client_peer != CHANNEL_CTRL {
                    slot.client_peer = CHANNEL_CTRL;
                    slot.client_rx.clear();
                    slot.client_tx.clear();
                    events[0] = Some(EventKind::ClientDisconnected);
                }
                if slot.server_peer != CHANNEL_CTRL {
                    slot.server_peer = CHANNEL_CTRL;
                    slot.server_rx.clear();
                    slot.server_tx.clear();
                    events[1] = Some(EventKind::ServerDisconnected);
                }
            }
            for event in events.iter().flatten() {
                self.dispatch(chan, *event)?;
            }
        }
        Ok(())
    }

    fn rx_data(&mut self, payload: &[u8]) -> LinkResult<()> {
        let dest = payload[OFFSET_DEST];
        let src = payload[OFFSET_SRC];
        let msg = payload[OFFSET_TYPE];
        let data = &payload[OFFSET_DATA..];

        if msg != MSG_WRITE_COMPLETE && msg != MSG_WRITE_PARTIAL {
            trace!(self.log, "unrecognised data frame"; "context" => "rx", "type" => msg);
            return Ok(());
        }

        let event = match self.channels[dest as usize].as_mut() {
            Some(slot) => {
                // A reply is only accepted once our own transmission in
                // that direction has flushed
                if slot.server_peer == src && !slot.server_tx.pending() {
                    if slot.server_rx.capacity() == 0 {
                        return Ok(());
                    }
                    slot.server_rx.append(data);
                    if msg == MSG_WRITE_COMPLETE {
                        let deliver = slot.server_rx.pending()
                            && slot.server_rx.used <= slot.server_rx.capacity();
                        if deliver {
                            Some(EventKind::ServerData)
                        } else {
                            slot.server_rx.clear();
                            None
                        }
                    } else {
                        None
                    }
                } else if slot.client_peer == src && !slot.client_tx.pending() {
                    if slot.client_rx.capacity() == 0 {
                        return Ok(());
                    }
                    slot.client_rx.append(data);
                    if msg == MSG_WRITE_COMPLETE {
                        let deliver = slot.client_rx.pending()
                            && slot.client_rx.used <= slot.client_rx.capacity();
                        if deliver {
                            Some(EventKind::ClientData)
                        } else {
                            slot.client_rx.clear();
                            None
                        }
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(event) = event {
            self.dispatch(dest, event)?;
            if let Some(slot) = self.channels[dest as usize].as_mut() {
                match event {
                    EventKind::ServerData => slot.server_rx.clear(),
                    EventKind::ClientData => slot.client_rx.clear(),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Run deferred operations requested during dispatch.
    fn apply_ops(&mut self) -> LinkResult<()> {
        while !self.ops.is_empty() {
            let op = self.ops.remove(0);
            match op {
                MuxOp::Connect { chan, name } => self.queue_connect(chan, name.as_deref())?,
                MuxOp::Destroy { chan } => self.destroy(chan, false)?,
                MuxOp::Register { requester, name } => self.registry.enqueue(requester, name),
                MuxOp::Resolved { requester, name } => {
                    debug!(self.log, "server name resolved";
                           "context" => "fallback", "chan" => requester, "name" => &name);
                    self.queue_connect(requester, Some(&name))?;
                }
                MuxOp::ResolveFailed { requester } => self.connect_failed(requester)?,
            }
        }
        Ok(())
    }

    /// Transmit one pending frame if possible: control frames strictly
    /// first, then data round-robin across the channels starting after
    /// the last one serviced.
    fn poll_tx(&mut self, win: &mut TxWindow) -> LinkResult<()> {
        if let Some(frame) = self.ctrl.front() {
            win.send(frame)?;
            self.ctrl.pop_front();
            return Ok(());
        }

        let count = self.order.len();
        if count == 0 {
            return Ok(());
        }
        let start = match self.order.get_index_of(&self.last_chan) {
            Some(index) => index + 1,
            None => 0,
        };
        for step in 0..count {
            let index = (start + step) % count;
            let chan = *self.order.get_index(index).unwrap();
            if self.eligible(chan) {
                self.last_chan = chan;
                return self.tx_data(chan, win);
            }
        }
        Ok(())
    }

    fn eligible(&self, chan: u8) -> bool {
        match self.channels[chan as usize].as_ref() {
            Some(slot) => {
                let server_ok = slot.server_tx.pending()
                    && slot.server_peer != CHANNEL_CTRL
                    && !self.blocked[slot.server_peer as usize];
                let client_ok = slot.client_tx.pending()
                    && slot.client_peer != CHANNEL_CTRL
                    && !self.blocked[slot.client_peer as usize];
                server_ok || client_ok
            }
            None => false,
        }
    }

    /// Slice the next fragment from one of the channel's direction
    /// buffers into a data frame. A transmission already in progress in
    /// one direction finishes before the other direction may interleave.
    fn tx_data(&mut self, chan: u8, win: &mut TxWindow) -> LinkResult<()> {
        let blocked = &self.blocked;
        let slot = match self.channels[chan as usize].as_mut() {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let server_ok = slot.server_tx.pending()
            && slot.server_peer != CHANNEL_CTRL
            && !blocked[slot.server_peer as usize];
        let client_ok = slot.client_tx.pending()
            && slot.client_peer != CHANNEL_CTRL
            && !blocked[slot.client_peer as usize];
        let client_in_progress = slot.client_tx.pending() && slot.client_tx.offset > 0;

        let (peer, buffer) = if server_ok && !client_in_progress {
            (slot.server_peer, &mut slot.server_tx)
        } else if client_ok {
            (slot.client_peer, &mut slot.client_tx)
        } else if server_ok {
            (slot.server_peer, &mut slot.server_tx)
        } else {
            return Ok(());
        };

        let remaining = buffer.used - buffer.offset;
        let size = remaining.min(MAX_DATA_TX - OFFSET_DATA);
        let complete = size == remaining;

        let mut payload = [0u8; MAX_DATA_TX];
        payload[OFFSET_DEST] = peer;
        payload[OFFSET_SRC] = chan;
        payload[OFFSET_TYPE] = if complete { MSG_WRITE_COMPLETE } else { MSG_WRITE_PARTIAL };
        payload[OFFSET_DATA..OFFSET_DATA + size]
            .copy_from_slice(&buffer.data[buffer.offset..buffer.offset + size]);
        buffer.offset += size;
        if complete {
            buffer.clear();
        }

        let frame = FrameData::with_payload(0, 0, &payload[..OFFSET_DATA + size])?;
        win.send(&frame)
    }

    /// Deliver one event to a channel, routing registry slots to the
    /// built-in directory client.
    fn dispatch(&mut self, chan: u8, event: EventKind) -> LinkResult<()> {
        let index = chan as usize;
        let kind = match self.channels[index].as_ref() {
            Some(slot) => slot.kind,
            None => return Ok(()),
        };

        match kind {
            SlotKind::Registry => {
                let slot = self.channels[index].as_mut().unwrap();
                let data = slot.server_rx.delivered();
                let mut ctx = RegistryCtx {
                    server_peer: slot.server_peer,
                    server_tx: &mut slot.server_tx,
                    ops: &mut self.ops,
                };
                self.registry.poll(event, data, &mut ctx)
            }
            SlotKind::App => {
                let mut handler = match self.channels[index].as_mut().unwrap().handler.take() {
                    Some(handler) => handler,
                    None => return Ok(()),
                };
                let result = {
                    let slot = self.channels[index].as_mut().unwrap();
                    let ev = match event {
                        EventKind::Start => ChannelEvent::Start,
                        EventKind::End => ChannelEvent::End,
                        EventKind::ServerFailed => ChannelEvent::ServerFailed,
                        EventKind::ServerConnected => ChannelEvent::ServerConnected,
                        EventKind::ServerDisconnected => ChannelEvent::ServerDisconnected,
                        EventKind::ServerData => ChannelEvent::ServerData(slot.server_rx.delivered()),
                        EventKind::ClientConnected => ChannelEvent::ClientConnected,
                        EventKind::ClientDisconnected => ChannelEvent::ClientDisconnected,
                        EventKind::ClientData => ChannelEvent::ClientData(slot.client_rx.delivered()),
                        EventKind::Idle => ChannelEvent::Idle,
                    };
                    let mut ctx = ChannelCtx {
                        chan: slot.chan,
                        client_peer: slot.client_peer,
                        server_peer: slot.server_peer,
                        client_tx: &mut slot.client_tx,
                        server_tx: &mut slot.server_tx,
                        ops: &mut self.ops,
                    };
                    handler.poll(ev, &mut ctx)
                };
                if let Some(slot) = self.channels[index].as_mut() {
                    slot.handler = Some(handler);
                }
                result
            }
        }
    }
}
