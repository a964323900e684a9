//! Per-packet capture flags.

use serde::{Deserialize, Serialize};

/// Bitset attached to every captured packet.
///
/// Serializes as the raw `u32` so operators can mask bits directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapFlags(pub u32);

impl CapFlags {
    /// Direction bit: set for serverbound packets, clear for clientbound.
    pub const TO_SERVER: CapFlags = CapFlags(1 << 0);
    /// The packet originated from the inject API, not from a peer.
    pub const INJECTED: CapFlags = CapFlags(1 << 1);

    /// No flags set (clientbound, captured from a peer).
    pub const fn empty() -> Self {
        CapFlags(0)
    }

    pub fn is_serverbound(self) -> bool {
        self.0 & Self::TO_SERVER.0 != 0
    }

    pub fn is_clientbound(self) -> bool {
        !self.is_serverbound()
    }

    pub fn is_injected(self) -> bool {
        self.0 & Self::INJECTED.0 != 0
    }

    pub fn contains(self, other: CapFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CapFlags {
    type Output = CapFlags;

    fn bitor(self, rhs: CapFlags) -> CapFlags {
        CapFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CapFlags {
    fn bitor_assign(&mut self, rhs: CapFlags) {
        self.0 |= rhs.0;
    }
}
