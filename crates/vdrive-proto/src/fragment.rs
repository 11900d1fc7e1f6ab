//! Envelope fragmentation and reassembly.
//!
//! Each fragment carries `total:u8 | seq:u8 | chunk`, `seq` counting from 1.
//! Reassembly keeps one buffer per channel; out-of-order or orphaned
//! fragments discard the buffer and the sequence is ignored.

use vdrive_core::{VdriveError, VdriveResult};

use crate::CHUNK_MAX_LENGTH;

/// Split an envelope into framed fragments (`⌈len / 242⌉` of them).
pub fn split(envelope: &[u8]) -> VdriveResult<Vec<Vec<u8>>> {
    let chunks: Vec<&[u8]> = envelope.chunks(CHUNK_MAX_LENGTH).collect();

    if chunks.len() > u8::MAX as usize {
        return Err(VdriveError::Proto(format!(
            "envelope too large for fragmentation: {} bytes",
            envelope.len()
        )));
    }

    let total = chunks.len() as u8;

    Ok(chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut frag = Vec::with_capacity(2 + chunk.len());
            frag.push(total);
            frag.push(i as u8 + 1);
            frag.extend_from_slice(chunk);
            frag
        })
        .collect())
}

/// Per-channel reassembly state.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the reassembled envelope when complete.
    pub fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 2 {
            return None;
        }

        let (total, seq, chunk) = (data[0], data[1], &data[2..]);

        if total == 1 {
            return Some(chunk.to_vec());
        }

        if (seq > 1 && self.buf.is_empty()) || seq > total || seq == 0 {
            self.buf = Vec::new();
            return None;
        }

        if seq == 1 {
            self.buf = Vec::with_capacity(total as usize * CHUNK_MAX_LENGTH);
        }

        self.buf.extend_from_slice(chunk);

        if seq == total {
            return Some(std::mem::take(&mut self.buf));
        }

        None
    }
}
