//! Wire protocol: framed packets, control messages and the stream handler.

pub mod control;
pub mod handler;
pub mod packet;

pub use control::{ClientInfo, ClientsUpdate, ControlMessage, ControlType, RejectReason};
pub use handler::ProtocolHandler;
pub use packet::{Packet, PacketType};

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic nanoseconds since the first call in this process. Packet
/// timestamps are sender-local, so only differences on the same host are
/// meaningful.
pub fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}
