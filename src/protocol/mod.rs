//! Wire types for the presence gateway.
//!
//! # Submodules
//!
//! * [`frames`] - Gateway frames: opcodes, handshake and heartbeat payloads
//! * [`activity`] - The activity model carried by presence updates
//!
//! Frames are JSON over a persistent websocket; the targeted gateway
//! protocol version is 10 with JSON encoding.

pub mod activity;
pub mod frames;

/// Targeted gateway protocol version.
pub const GATEWAY_VERSION: u8 = 10;
