//! gate-wire - Wire protocol for the gate client agent
//!
//! This crate provides the two framings the agent speaks:
//! - the client-facing protocol (`u16 length; u16 msgtype; payload`), and
//! - the internal message director envelope
//!   (`u8 recipients; u64 * n; u64 sender; u16 msgtype; payload`).
//!
//! plus the typed datagram buffer/cursor shared by both and the decoded
//! message enums each direction dispatches on.

pub mod codec;
pub mod datagram;
pub mod messages;

pub use codec::FrameCodec;
pub use datagram::{Datagram, DatagramIter, WireError, DATAGRAM_MAX_SIZE};
pub use messages::{frames, ClientMessage, DisconnectReason, InternalMessage};
