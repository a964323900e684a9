//! Shared constants and small domain types.

use serde::{Deserialize, Serialize};

/// The transport network a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(format!("unknown network '{other}'")),
        }
    }
}

/// `Target` value addressing every live session (Inject / Close).
pub const TARGET_ALL: i64 = -1;

/// `PktNum` value on observer-mode packets, which carry no sequence.
pub const PKT_NUM_NONE: i64 = -1;

/// Inject `Extra` bit: deliver to the client side.
pub const INJECT_TO_CLIENT: u64 = 1 << 0;
/// Inject `Extra` bit: deliver to the server side.
pub const INJECT_TO_SERVER: u64 = 1 << 1;

/// Filter `Extra` bit: set to allow the packet, clear to drop it.
pub const FILTER_ALLOW: u64 = 1 << 0;

/// Envelope statuses, following HTTP conventions.
pub const STATUS_OK: i32 = 200;
pub const STATUS_BAD_REQUEST: i32 = 400;
pub const STATUS_FORBIDDEN: i32 = 403;
pub const STATUS_NOT_FOUND: i32 = 404;
pub const STATUS_TIMEOUT: i32 = 408;
pub const STATUS_GONE: i32 = 410;
