//! EDM packet framing over the BLE module UART.

use vdrive_core::{VdriveError, VdriveResult};

use crate::{CHUNK_MAX_LENGTH, DATA_COMMAND, DATA_EVENT, EDM_START, EDM_STOP, PAYLOAD_MAX_LENGTH};

/// Frame a payload into an EDM packet.
pub fn packet(payload: &[u8]) -> VdriveResult<Vec<u8>> {
    if payload.is_empty() || payload.len() > PAYLOAD_MAX_LENGTH {
        return Err(VdriveError::Proto(format!(
            "invalid packet payload length {}",
            payload.len()
        )));
    }

    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(EDM_START);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(EDM_STOP);

    Ok(out)
}

/// Frame a data command (device → peer) for `channel`.
pub fn data_command(channel: u8, fragment: &[u8]) -> VdriveResult<Vec<u8>> {
    let mut value = Vec::with_capacity(3 + fragment.len());
    value.extend_from_slice(&DATA_COMMAND.to_be_bytes());
    value.push(channel);
    value.extend_from_slice(fragment);

    packet(&value)
}

/// Decode a data event payload into `(channel, fragment)`.
///
/// Anything that is not a well-formed data event is silently dropped, the
/// module emits other event kinds on the same channel.
pub fn data_event(payload: &[u8]) -> Option<(u8, &[u8])> {
    if payload.len() < 3 + 2 {
        return None;
    }

    let kind = u16::from_be_bytes([payload[0], payload[1]]);

    if kind != DATA_EVENT {
        return None;
    }

    Some((payload[2], &payload[3..]))
}

/// Incremental EDM packet scanner.
///
/// Feeds of arbitrary UART byte runs come out as complete packet payloads.
/// The scanner hunts for a start byte, validates the length field, and
/// drops buffered garbage (bad length, missing stop byte) wholesale before
/// resynchronizing, like the reference receive loop.
#[derive(Default)]
pub struct PacketParser {
    buf: Vec<u8>,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();

        loop {
            // hunt for the beginning of a packet
            match self.buf.iter().position(|&b| b == EDM_START) {
                Some(0) => {}
                Some(i) => {
                    self.buf.drain(..i);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }

            if self.buf.len() < 3 {
                break;
            }

            let length = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;

            if length == 0 || length > PAYLOAD_MAX_LENGTH {
                self.buf.clear();
                break;
            }

            // start + len + payload + stop
            let total = length + 4;

            if self.buf.len() < total {
                break;
            }

            if self.buf[total - 1] == EDM_STOP {
                out.push(self.buf[3..total - 1].to_vec());
            }

            self.buf.drain(..total);
        }

        out
    }
}

/// Chunk limit sanity: a maximum-size chunk still fits the framing budget.
const _: () = assert!(CHUNK_MAX_LENGTH + 2 + 3 == PAYLOAD_MAX_LENGTH);
