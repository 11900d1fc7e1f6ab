//! ECDSA-P256 envelope signatures.
//!
//! The wire signature carries the SHA-256 digest of the signed data along
//! with big-endian `r` and `s`. The digest is compared before curve
//! verification; a mismatch is rejected without further work.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use vdrive_core::{VdriveError, VdriveResult};

/// Decoded ECDSA signature with its message digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaSig {
    pub digest: [u8; 32],
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl EcdsaSig {
    /// Build from wire fields, left-padding `r`/`s` shorter than 32 bytes
    /// (minimal big-integer encodings are accepted).
    pub fn from_wire(digest: &[u8], r: &[u8], s: &[u8]) -> VdriveResult<Self> {
        Ok(Self {
            digest: pad32(digest)?,
            r: pad32(r)?,
            s: pad32(s)?,
        })
    }
}

fn pad32(b: &[u8]) -> VdriveResult<[u8; 32]> {
    if b.len() > 32 {
        return Err(VdriveError::InvalidMessage("oversized signature field".into()));
    }

    let mut out = [0u8; 32];
    out[32 - b.len()..].copy_from_slice(b);
    Ok(out)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Sign `data` (SHA-256 prehash) with `key`.
pub fn sign(key: &SecretKey, data: &[u8]) -> VdriveResult<EcdsaSig> {
    let signing = SigningKey::from(key);
    let sig: Signature = signing.sign(data);

    let (r, s) = sig.split_bytes();

    Ok(EcdsaSig {
        digest: sha256(data),
        r: r.into(),
        s: s.into(),
    })
}

/// Verify `sig` over `data` against `key`.
pub fn verify(key: &PublicKey, data: &[u8], sig: &EcdsaSig) -> VdriveResult<()> {
    if sig.digest != sha256(data) {
        return Err(VdriveError::Crypto("signature error, data mismatch".into()));
    }

    let signature = Signature::from_scalars(sig.r, sig.s)
        .map_err(|_| VdriveError::Crypto("signature error, malformed scalars".into()))?;

    VerifyingKey::from(key)
        .verify(data, &signature)
        .map_err(|_| VdriveError::Crypto("signature error, invalid".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = SecretKey::random(&mut OsRng);
        let data = b"envelope bytes";

        let sig = sign(&key, data).unwrap();
        verify(&key.public_key(), data, &sig).unwrap();
    }

    #[test]
    fn test_verify_rejects_wrong_data() {
        let key = SecretKey::random(&mut OsRng);

        let sig = sign(&key, b"signed").unwrap();
        assert!(verify(&key.public_key(), b"other", &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let key = SecretKey::random(&mut OsRng);
        let other = SecretKey::random(&mut OsRng);

        let sig = sign(&key, b"signed").unwrap();
        assert!(verify(&other.public_key(), b"signed", &sig).is_err());
    }

    #[test]
    fn test_wire_padding() {
        let sig = EcdsaSig::from_wire(&[0u8; 32], &[1, 2, 3], &[0xFF; 32]).unwrap();

        assert_eq!(&sig.r[..29], &[0u8; 29]);
        assert_eq!(&sig.r[29..], &[1, 2, 3]);
        assert!(EcdsaSig::from_wire(&[0u8; 33], &[], &[]).is_err());
    }
}
