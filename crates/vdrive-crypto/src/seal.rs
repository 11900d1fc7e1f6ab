//! AES-OFB + HMAC-SHA256 sealing.
//!
//! Sealed format: `IV(16) ‖ ciphertext ‖ HMAC-SHA256(key, IV ‖ ciphertext)(32)`.
//! Used for BLE session payloads (32-byte session key → AES-256) and the
//! persistent configuration (16-byte SNVS key → AES-128, padded to a fixed
//! block count).

use aes::{Aes128, Aes256};
use hmac::{Hmac, Mac};
use ofb::cipher::{KeyIvInit, StreamCipher};
use sha2::Sha256;

use vdrive_core::{VdriveError, VdriveResult, AES_BLOCK_SIZE};

use crate::random;

type HmacSha256 = Hmac<Sha256>;

const MAC_SIZE: usize = 32;

fn ofb_xor(key: &[u8], iv: &[u8], buf: &mut [u8]) -> VdriveResult<()> {
    match key.len() {
        16 => ofb::Ofb::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| VdriveError::Crypto(format!("OFB init: {e}")))?
            .apply_keystream(buf),
        32 => ofb::Ofb::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| VdriveError::Crypto(format!("OFB init: {e}")))?
            .apply_keystream(buf),
        n => return Err(VdriveError::Crypto(format!("invalid OFB key length {n}"))),
    }

    Ok(())
}

fn mac(key: &[u8], parts: &[&[u8]]) -> VdriveResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| VdriveError::Crypto(format!("HMAC init: {e}")))?;

    for part in parts {
        mac.update(part);
    }

    Ok(mac.finalize().into_bytes().to_vec())
}

/// Seal `input` into exactly `length` bytes, zero-padding the plaintext.
pub fn seal(key: &[u8], input: &[u8], length: usize) -> VdriveResult<Vec<u8>> {
    let Some(plain_len) = length.checked_sub(AES_BLOCK_SIZE + MAC_SIZE) else {
        return Err(VdriveError::Crypto("seal target too small".into()));
    };

    if input.len() > plain_len {
        return Err(VdriveError::Crypto(format!(
            "seal input too large: {} > {plain_len}",
            input.len()
        )));
    }

    let iv = random(AES_BLOCK_SIZE);

    let mut body = vec![0u8; plain_len];
    body[..input.len()].copy_from_slice(input);
    ofb_xor(key, &iv, &mut body)?;

    let tag = mac(key, &[&iv, &body])?;

    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag);

    Ok(out)
}

/// Authenticate and open a sealed buffer, returning the padded plaintext.
pub fn unseal(key: &[u8], input: &[u8]) -> VdriveResult<Vec<u8>> {
    if input.len() < AES_BLOCK_SIZE + MAC_SIZE {
        return Err(VdriveError::Crypto("invalid length for unseal".into()));
    }

    let (iv, rest) = input.split_at(AES_BLOCK_SIZE);
    let (body, tag) = rest.split_at(rest.len() - MAC_SIZE);

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| VdriveError::Crypto(format!("HMAC init: {e}")))?;
    mac.update(iv);
    mac.update(body);
    mac.verify_slice(tag)
        .map_err(|_| VdriveError::Crypto("invalid HMAC".into()))?;

    let mut plain = body.to_vec();
    ofb_xor(key, iv, &mut plain)?;

    Ok(plain)
}

/// Encrypt a session payload: fresh IV prefix, no authentication (the
/// enclosing envelope is signed).
pub fn ofb_encrypt(key: &[u8], plaintext: &[u8]) -> VdriveResult<Vec<u8>> {
    let iv = random(AES_BLOCK_SIZE);

    let mut out = Vec::with_capacity(AES_BLOCK_SIZE + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);
    ofb_xor(key, &iv, &mut out[AES_BLOCK_SIZE..])?;

    Ok(out)
}

/// Decrypt a session payload produced by [`ofb_encrypt`].
pub fn ofb_decrypt(key: &[u8], ciphertext: &[u8]) -> VdriveResult<Vec<u8>> {
    if ciphertext.len() < AES_BLOCK_SIZE {
        return Err(VdriveError::InvalidMessage("short ciphertext".into()));
    }

    let (iv, body) = ciphertext.split_at(AES_BLOCK_SIZE);
    let mut plain = body.to_vec();
    ofb_xor(key, iv, &mut plain)?;

    Ok(plain)
}
