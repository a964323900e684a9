//! EzProxy interception core.
//!
//! An intercepting TCP/UDP proxy: a fleet of listeners feeds
//! bidirectional traffic through one interception pipeline that can
//! copy, mutate, drop, or synchronously filter every packet, with live
//! control exposed to operators over a bidirectional message stream.

pub mod config;
pub mod control;
pub mod error;
pub mod spawner;
pub mod transport;

pub use control::{
    AttachError, AttachOptions, ControlSession, ControlStream, FilterAction, Permissions,
};
pub use error::{ProxyError, Result};
pub use spawner::{
    ConnectionAdder, ErrorSink, FanoutRecord, MpxProto, PacketFilter, ProxyContainer,
    ProxyListener, ProxySpawner,
};
pub use transport::{
    PacketEvent, TcpListener, TcpProxy, Transport, UdpListener, UdpOverTcpListener,
    UdpOverTcpProxy, UdpProxy, UDP_OVER_TCP_MPX,
};

/// Packed proxy version: `major.minor.revision`, one byte each, with the
/// top bit flagging experimental builds.
pub const PROXY_VERSION: u32 = 0x02_02_01;

const VERSION_EXPERIMENTAL: u32 = 0x8000_0000;

/// Render a packed version as `major.minor` + `r<revision>`, with an `e`
/// suffix on experimental builds.
pub fn version_string(version: u32) -> String {
    let suffix = if version & VERSION_EXPERIMENTAL != 0 {
        "e"
    } else {
        ""
    };
    let major = (version >> 16) & 0xff;
    let minor = (version >> 8) & 0xff;
    let revision = version & 0xff;
    format!("{major}.{minor}r{revision}{suffix}")
}
