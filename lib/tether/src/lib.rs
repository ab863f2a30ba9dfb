//! Tether bridges a desktop host to a handheld remote device over a
//! serial link. The crate implements the layered wire stack that runs on
//! top of a raw byte transport: self-delimiting CRC-protected frames, a
//! sliding-window connection engine with automatic dialect detection, a
//! channel multiplexor with fragmentation and flow control, and the
//! shared-access request layer used by every channel client.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod connect;
pub mod error;
pub mod frame;
pub mod link;
pub mod mux;
pub mod share;
pub mod stats;
pub mod status;
pub mod transport;
pub mod wire;

mod registry;

pub mod prelude {
    pub use crate::config::LinkOptions;
    pub use crate::error::{LinkError, LinkResult};
    pub use crate::frame::Dialect;
    pub use crate::link::{LinkStack, LinkStatus, PrintSink, UserMode};
    pub use crate::mux::{ChannelConfig, ChannelCtx, ChannelEvent, ChannelHandler, ChannelInfo};
    pub use crate::share::{ForeHandle, SharedAccess, ShareProto};
    pub use crate::stats::Stats;
    pub use crate::status::RemoteError;
    pub use crate::transport::{ByteTransport, MemoryLink};
}
