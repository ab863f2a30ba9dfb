//! The link driver: owns the transport and every layer above it, drives
//! one poll tick through the whole stack, and arbitrates between the two
//! users of the serial line (the remote link and the printer mirror).

use crate::config::LinkOptions;
use crate::connect::ConnectionEngine;
use crate::error::{LinkError, LinkResult};
use crate::frame::{Dialect, FrameCodec};
use crate::mux::{ChannelConfig, ChannelHandler, ChannelInfo, Multiplexor};
use crate::share::ForeHandle;
use crate::stats::Stats;
use crate::transport::ByteTransport;
use filament::escape::Escape;
use filament::logging::{self, debug, Logger};
use std::fmt;
use std::time::Instant;

/// The current user of the byte transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UserMode {
    Inactive,
    Link,
    Printer,
}

/// Destination for printer mirror traffic.
pub trait PrintSink {
    fn write(&mut self, byte: u8) -> LinkResult<()>;
}

impl<F: FnMut(u8) -> LinkResult<()>> PrintSink for F {
    fn write(&mut self, byte: u8) -> LinkResult<()> {
        self(byte)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ShutdownStage {
    Idle,
    DrainMux,
    DrainDisc,
}

/// One complete link stack over a byte transport.
pub struct LinkStack<T: ByteTransport> {
    transport: T,
    options: LinkOptions,
    mode: UserMode,
    frame: FrameCodec,
    connect: ConnectionEngine,
    mux: Multiplexor,
    stats: Stats,
    escape: Escape,
    printer: Option<Box<dyn PrintSink>>,
    prev_tx_ready: bool,
    shutdown: ShutdownStage,
    log: Logger,
}

impl<T: ByteTransport> LinkStack<T> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        transport: T,
        options: LinkOptions,
        log: L,
    ) -> LinkStack<T> {
        let log = logging::component(log, "link");
        LinkStack {
            frame: FrameCodec::new(&log),
            connect: ConnectionEngine::new(&options, &log),
            mux: Multiplexor::new(&options, &log),
            transport,
            options,
            mode: UserMode::Inactive,
            stats: Stats::new(),
            escape: Escape::new(),
            printer: None,
            prev_tx_ready: false,
            shutdown: ShutdownStage::Idle,
            log,
        }
    }

    #[inline]
    pub fn mode(&self) -> UserMode {
        self.mode
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.connect.is_connected()
    }

    #[inline]
    pub fn dialect(&self) -> Dialect {
        self.frame.dialect()
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    #[inline]
    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// A cloneable handle for raising the escape condition from outside
    /// the poll loop.
    pub fn escape(&self) -> Escape {
        self.escape.clone()
    }

    /// Claim the transport for the remote link and begin connecting.
    pub fn start_link(&mut self, now: Instant) -> LinkResult<()> {
        match self.mode {
            UserMode::Link => Ok(()),
            UserMode::Printer => Err(LinkError::Busy),
            UserMode::Inactive => {
                debug!(self.log, "starting remote link"; "context" => "start");
                self.transport.set_baud(self.options.driver_baud);
                self.frame.start();
                self.connect.start(&mut self.mux, now)?;
                self.prev_tx_ready = false;
                self.shutdown = ShutdownStage::Idle;
                self.mode = UserMode::Link;
                Ok(())
            }
        }
    }

    /// Claim the transport for the printer mirror.
    pub fn start_printer(&mut self, sink: Box<dyn PrintSink>) -> LinkResult<()> {
        match self.mode {
            UserMode::Link => Err(LinkError::Busy),
            _ => {
                debug!(self.log, "starting printer mirror"; "context" => "start");
                self.printer = Some(sink);
                self.mode = UserMode::Printer;
                Ok(())
            }
        }
    }

    /// Release the transport. An immediate end discards all state; a
    /// graceful end performs the closing handshake, polling with escape
    /// checking enabled until everything has flushed.
    pub fn end(&mut self, immediate: bool) -> LinkResult<()> {
        match self.mode {
            UserMode::Inactive => Ok(()),
            UserMode::Printer => {
                self.printer = None;
                self.mode = UserMode::Inactive;
                Ok(())
            }
            UserMode::Link => {
                if immediate {
                    self.mux.end(true)?;
                    self.connect.deactivate();
                    self.frame.end();
                    self.mode = UserMode::Inactive;
                    return Ok(());
                }
                self.begin_shutdown()?;
                let saved = self.escape.store();
                self.escape.enable();
                let result = loop {
                    if self.shutdown_complete() {
                        break Ok(());
                    }
                    if self.escape.check() {
                        break Err(LinkError::Escape);
                    }
                    if let Err(err) = self.poll(Instant::now()) {
                        break Err(err);
                    }
                };
                self.escape.restore(saved);
                result
            }
        }
    }

    /// Start a graceful shutdown without blocking; keep polling until
    /// `shutdown_complete` reports true.
    pub fn begin_shutdown(&mut self) -> LinkResult<()> {
        if self.mode != UserMode::Link || self.shutdown != ShutdownStage::Idle {
            return Ok(());
        }
        debug!(self.log, "beginning link shutdown"; "context" => "end");
        self.connect.disable();
        self.mux.end(false)?;
        self.shutdown = ShutdownStage::DrainMux;
        Ok(())
    }

    #[inline]
    pub fn shutdown_complete(&self) -> bool {
        self.mode != UserMode::Link
    }

    /// Drive one poll tick. The caller owns the cadence; `now` feeds every
    /// timer in the stack.
    pub fn poll(&mut self, now: Instant) -> LinkResult<()> {
        match self.mode {
            UserMode::Inactive => Ok(()),
            UserMode::Printer => self.poll_printer(),
            UserMode::Link => {
                self.poll_link(now)?;
                self.poll_shutdown(now)
            }
        }
    }

    fn poll_printer(&mut self) -> LinkResult<()> {
        if !self.transport.active() {
            return Ok(());
        }
        if let Some(byte) = self.transport.rx() {
            self.stats.rx_byte();
            if let Some(sink) = self.printer.as_mut() {
                sink.write(byte)?;
            }
        }
        Ok(())
    }

    fn poll_link(&mut self, now: Instant) -> LinkResult<()> {
        if !self.frame.active() {
            return Ok(());
        }

        let active = self.transport.active();
        let rx = if active { self.transport.rx() } else { None };
        let idle = rx.is_none();

        if !active {
            self.frame.reset(true);
        } else {
            if let Some(byte) = rx {
                self.stats.rx_byte();
                self.frame.rx_byte(byte, &mut self.stats);
            }
            if self.frame.tx_pending() && self.transport.tx_ready() {
                let byte = self.frame.tx_byte(&mut self.stats);
                if self.transport.tx(byte) {
                    self.stats.tx_byte();
                }
            }
        }

        let tx_ready = active && self.frame.tx_idle();
        let rx_ready = self.frame.rx_complete();

        if rx_ready || (tx_ready && !self.prev_tx_ready) || idle {
            let rx_frame = if rx_ready { Some(self.frame.take_rx()) } else { None };
            self.connect.poll(
                active,
                rx_frame.as_ref(),
                tx_ready,
                &mut self.frame,
                &mut self.mux,
                &mut self.transport,
                now,
                &mut self.stats,
            )?;
            // The negotiated dialect feeds back into frame encoding
            if self.connect.is_era() {
                self.frame.set_dialect(Dialect::Era);
            }
            self.prev_tx_ready = active && self.frame.tx_idle();
        }
        Ok(())
    }

    /// Advance the graceful shutdown ladder: flush the multiplexor's
    /// closing frames, then the disconnect, then stop the frame layer.
    fn poll_shutdown(&mut self, now: Instant) -> LinkResult<()> {
        match self.shutdown {
            ShutdownStage::Idle => Ok(()),
            ShutdownStage::DrainMux => {
                if self.mux.ctrl_queue_empty() && !self.connect.draining() {
                    self.connect.disconnect(&mut self.mux, now)?;
                    self.shutdown = ShutdownStage::DrainDisc;
                }
                Ok(())
            }
            ShutdownStage::DrainDisc => {
                if !self.connect.ctrl_pending() && self.frame.tx_idle() {
                    debug!(self.log, "link shutdown complete"; "context" => "end");
                    self.connect.deactivate();
                    self.frame.end();
                    self.shutdown = ShutdownStage::Idle;
                    self.mode = UserMode::Inactive;
                }
                Ok(())
            }
        }
    }

    /// Create a multiplexed channel; requires an established connection.
    pub fn create_channel(
        &mut self,
        config: ChannelConfig,
        handler: Box<dyn ChannelHandler>,
    ) -> LinkResult<u8> {
        self.mux.create_channel(config, handler)
    }

    pub fn destroy_channel(&mut self, chan: u8, immediate: bool) -> LinkResult<()> {
        self.mux.destroy(chan, immediate)
    }

    /// Reach into a channel's handler, e.g. to queue requests on its
    /// shared-access slot.
    pub fn with_channel<H, R, F>(&mut self, chan: u8, f: F) -> LinkResult<R>
    where
        H: ChannelHandler,
        F: FnOnce(&mut H) -> R,
    {
        match self.mux.handler_mut(chan) {
            Some(handler) => match handler.as_any_mut().downcast_mut::<H>() {
                Some(handler) => Ok(f(handler)),
                None => Err(LinkError::BadParms),
            },
            None => Err(LinkError::BadParms),
        }
    }

    /// Poll the stack until a foreground request completes. With `escape`
    /// set the wait can be cancelled cooperatively, in which case the
    /// in-flight request still completes on its own and its result is
    /// discarded.
    pub fn wait<R>(&mut self, handle: &ForeHandle<R>, escape: bool) -> LinkResult<R> {
        let saved = self.escape.store();
        if escape {
            self.escape.enable();
        }
        let result = loop {
            if let Some(result) = handle.try_take() {
                break result;
            }
            if escape && self.escape.check() {
                break Err(LinkError::Escape);
            }
            if let Err(err) = self.poll(Instant::now()) {
                break Err(err);
            }
        };
        self.escape.restore(saved);
        result
    }

    /// Snapshot of the whole stack for status reporting.
    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            mode: self.mode,
            connected: self.connect.is_connected(),
            dialect: self.frame.dialect(),
            remote_version: self.mux.remote_version(),
            stats: self.stats.clone(),
            channels: self.mux.channels(),
        }
    }
}

/// Point-in-time summary of the link state.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub mode: UserMode,
    pub connected: bool,
    pub dialect: Dialect,
    pub remote_version: u8,
    pub stats: Stats,
    pub channels: Vec<ChannelInfo>,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.mode {
            UserMode::Inactive => writeln!(f, "The serial link is not being used.")?,
            UserMode::Printer => writeln!(f, "The printer mirror is active.")?,
            UserMode::Link => {
                if self.connected {
                    writeln!(
                        f,
                        "Connected to {} device.",
                        match self.dialect {
                            Dialect::Sibo => "a Sibo",
                            Dialect::Era => "an Era",
                        }
                    )?;
                } else {
                    writeln!(f, "Not connected to a remote device.")?;
                }
            }
        }
        if self.remote_version != 0 {
            let name = match self.remote_version {
                crate::mux::NCP_SIBO_VERSION => "old Sibo",
                crate::mux::NCP_SIBO_NEW_VERSION => "new Sibo",
                crate::mux::NCP_ERA_VERSION => "Era",
                _ => "unrecognised",
            };
            writeln!(f, "Remote NCP version {} ({}).", self.remote_version, name)?;
        }
        write!(f, "{} valid frames", self.stats.rx_frames)?;
        if self.stats.rx_bad_frames != 0 {
            write!(f, " and {} invalid frames", self.stats.rx_bad_frames)?;
        }
        write!(f, " received")?;
        if self.stats.rx_retry_frames != 0 {
            write!(f, ", including {} retries", self.stats.rx_retry_frames)?;
        }
        writeln!(f, ".")?;
        write!(f, "{} frames transmitted", self.stats.tx_frames)?;
        if self.stats.tx_retry_frames != 0 {
            write!(f, ", including {} retries", self.stats.tx_retry_frames)?;
        }
        writeln!(f, ".")?;
        for info in &self.channels {
            write!(f, "{} on channel {}", info.name, info.chan)?;
            if info.is_client {
                if info.server_peer == 0 {
                    write!(f, ", not connected to a server")?;
                } else {
                    write!(f, ", connected to server on {}", info.server_peer)?;
                }
            }
            if info.is_server {
                if info.client_peer == 0 {
                    write!(f, ", not connected to a client")?;
                } else {
                    write!(f, ", connected to client on {}", info.client_peer)?;
                }
            }
            writeln!(f, ".")?;
        }
        Ok(())
    }
}
