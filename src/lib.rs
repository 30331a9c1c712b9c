//! Bidirectional real-time audio transport between a source host (a radio
//! USB sound interface, typically) and one or more networked clients.
//!
//! The server captures RX audio from a single device and broadcasts it to
//! every connected client; clients may contribute TX audio, which is
//! arbitrated by priority into a single stream played back at the source.
//! Everything rides a framed, CRC-checked packet protocol on plain TCP.
//!
//! # Architecture
//!
//! ```text
//! capture device ──► Broadcaster ──► per-session writer ──► wire ──►
//!     client reader ──► RX RingBuffer ──► playback device
//!
//! client capture ──► TX RingBuffer ──► wire ──► session reader ──►
//!     Mixer (arbitration) ──► TX RingBuffer ──► playback device
//! ```
//!
//! Device discovery and opening is out of scope: the crate consumes
//! [`CaptureSource`] and [`PlaybackSink`] handles supplied by the caller.

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod server;
pub mod stats;

pub(crate) mod worker;

pub use audio::buffer::RingBuffer;
pub use audio::device::{CaptureSource, PlaybackSink};
pub use client::{AudioClient, ClientConfig};
pub use config::{BufferPolicy, StreamConfig, StreamFormat};
pub use error::{AudioError, Result};
pub use events::StreamListener;
pub use protocol::control::{ClientInfo, ClientsUpdate, ControlMessage, RejectReason};
pub use protocol::packet::{Packet, PacketType};
pub use server::mixer::{TxPriority, TxResult};
pub use server::AudioServer;
pub use stats::StreamStats;
