//! # ezproxy-wire
//!
//! Wire types for the operator control stream.
//!
//! Everything that crosses the control stream is a JSON envelope:
//!
//! - Core → operator: [`Envelope`] `{Status, Data}`, where a 200 wraps a
//!   typed [`ServerMsg`] and any other status wraps an error string.
//! - Operator → core: [`ClientMsg`] `{Type, Target, Data, Extra}`.
//!
//! Packet payloads serialize as base64 strings. Field names are
//! PascalCase on the wire; the exported constants pin down the bit and
//! status conventions both sides rely on.

mod envelope;
mod flags;
mod types;

pub use envelope::{ClientMsg, ClientMsgType, Envelope, EnvelopeBody, PacketRecord, ServerMsg, ServerMsgType};
pub use flags::CapFlags;
pub use types::*;
