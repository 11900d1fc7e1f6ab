//! Protobuf envelope schema.
//!
//! Field numbers are frozen for compatibility with deployed mobile clients.

use prost::Message as _;

use vdrive_core::{VdriveError, VdriveResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum OpCode {
    Null = 0,
    Pair = 1,
    Session = 2,
    Unlock = 3,
    Lock = 4,
    Status = 5,
    Configuration = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Null = 0,
    GenericError = 1,
    InvalidSession = 2,
    InvalidMessage = 3,
    PairingKeyNegotiationFailed = 4,
    SessionKeyNegotiationFailed = 5,
    UnlockFailed = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Cipher {
    None = 0,
    Aes128CbcPlain = 1,
    Aes128CbcEssiv = 2,
    Aes128XtsPlain = 3,
    Aes256XtsPlain = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signature {
    /// SHA-256 of the signed data
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub r: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub s: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Serialized [`Message`]
    #[prost(bytes = "vec", tag = "1")]
    pub message: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub signature: Option<Signature>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// Milliseconds since the Unix epoch, peer clock domain
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(bool, tag = "2")]
    pub response: bool,
    #[prost(enumeration = "OpCode", tag = "3")]
    pub op_code: i32,
    #[prost(enumeration = "ErrorCode", tag = "4")]
    pub error: i32,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyExchange {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PairingQrCode {
    #[prost(string, tag = "1")]
    pub ble_name: String,
    #[prost(uint64, tag = "2")]
    pub nonce: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub pub_key: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub signature: Option<Signature>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Configuration {
    #[prost(enumeration = "Cipher", tag = "1")]
    pub cipher: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(uint64, tag = "2")]
    pub capacity: u64,
    #[prost(bool, tag = "3")]
    pub locked: bool,
    #[prost(message, optional, tag = "4")]
    pub configuration: Option<Configuration>,
}

macro_rules! wire_bytes {
    ($($ty:ty),+) => {
        $(impl $ty {
            pub fn to_bytes(&self) -> Vec<u8> {
                self.encode_to_vec()
            }

            pub fn from_bytes(buf: &[u8]) -> VdriveResult<Self> {
                <$ty>::decode(buf).map_err(|e| {
                    VdriveError::InvalidMessage(format!(
                        concat!(stringify!($ty), " decode: {}"), e
                    ))
                })
            }
        })+
    };
}

wire_bytes!(Envelope, Message, KeyExchange, PairingQrCode, Configuration, Status);
