//! Multiplex registry: named listeners beyond the primary pair.
//!
//! Operators register extra listeners under a chosen name; the entry pins
//! the protocol and bind address so two registrations can never fight
//! over one socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::{ProxyError, Result};

/// Protocol claimed by a registry entry. `Any` collides with everything
/// on the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpxProto {
    Tcp,
    Udp,
    Any,
}

impl MpxProto {
    fn collides(self, other: MpxProto) -> bool {
        self == MpxProto::Any || other == MpxProto::Any || self == other
    }
}

impl std::fmt::Display for MpxProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MpxProto::Tcp => "tcp",
            MpxProto::Udp => "udp",
            MpxProto::Any => "any",
        })
    }
}

#[derive(Debug, Clone)]
struct MpxEntry {
    proto: MpxProto,
    addr: SocketAddr,
}

/// Name → listener address table.
#[derive(Debug, Default)]
pub struct MpxRegistry {
    entries: Mutex<HashMap<String, MpxEntry>>,
}

impl MpxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for a listener on `addr`. Fails on a duplicate name,
    /// or when another entry already claims the same address with a
    /// colliding protocol.
    pub fn register(&self, name: &str, proto: MpxProto, addr: SocketAddr) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(ProxyError::MpxNameTaken(name.to_string()));
        }
        if entries
            .values()
            .any(|e| e.addr == addr && e.proto.collides(proto))
        {
            return Err(ProxyError::MpxAddrCollision {
                name: name.to_string(),
                addr,
            });
        }
        entries.insert(name.to_string(), MpxEntry { proto, addr });
        Ok(())
    }

    /// Bind address registered under `name`.
    pub fn addr(&self, name: &str) -> Result<SocketAddr> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.addr)
            .ok_or_else(|| ProxyError::MpxNotFound(name.to_string()))
    }

    /// Every registered entry as `(name, protocol, address)`.
    pub fn addrs(&self) -> Vec<(String, MpxProto, SocketAddr)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(name, e)| (name.clone(), e.proto, e.addr))
            .collect()
    }
}
