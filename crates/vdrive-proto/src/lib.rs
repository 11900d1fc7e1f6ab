//! vdrive-proto: the BLE side channel wire format
//!
//! ```text
//! Packet    : START(0xAA) | len:u16_be | payload[len] | STOP(0x55)   payload ≤ 247
//!   DataEv  : kind:u16_be | channel:u8 | fragment                    value ≤ 244
//!     Frag  : total:u8 | seq:u8 | protobuf chunk                     chunk ≤ 242
//! ```
//!
//! The protobuf schema is frozen: field numbers and types must not change,
//! deployed mobile clients depend on them.

pub mod edm;
pub mod fragment;
pub mod wire;

pub use edm::{packet, PacketParser};
pub use fragment::{split, Reassembler};
pub use wire::{
    Cipher, Configuration, Envelope, ErrorCode, KeyExchange, Message, OpCode, PairingQrCode,
    Signature, Status,
};

/// Maximum EDM packet payload.
pub const PAYLOAD_MAX_LENGTH: usize = 247;

/// Maximum data event/command value (channel byte + fragment).
pub const FRAGMENT_MAX_LENGTH: usize = 244;

/// Maximum protobuf chunk carried by one fragment.
pub const CHUNK_MAX_LENGTH: usize = 242;

pub const EDM_START: u8 = 0xAA;
pub const EDM_STOP: u8 = 0x55;

/// Inbound payload kind (peer → device).
pub const DATA_EVENT: u16 = 0x0031;

/// Outbound payload kind (device → peer).
pub const DATA_COMMAND: u16 = 0x0036;
