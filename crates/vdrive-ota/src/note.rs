//! Signed notes: checkpoints and release statements.
//!
//! A note is a text body followed by a blank line and one signature line
//! per signer:
//!
//! ```text
//! <body line 1>
//! ...
//!
//! - <key name> <base64(ed25519 signature)>
//! ```
//!
//! The signature covers the body including its trailing newline. Checkpoint
//! bodies are `origin \n size \n base64(root)`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use vdrive_core::{VdriveError, VdriveResult};

use crate::merkle::Hash;

const SIG_PREFIX: &str = "- ";

/// Parsed checkpoint body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root: Hash,
}

/// Verify a note's signature and return its body.
///
/// `origin` pins the expected key name on the signature line; a statement
/// signed under a different origin is rejected.
pub fn verify_body(note: &[u8], key: &VerifyingKey, origin: &str) -> VdriveResult<Vec<u8>> {
    let text = std::str::from_utf8(note)
        .map_err(|_| VdriveError::Ota("note is not valid UTF-8".into()))?;

    let (body, sig_lines) = text
        .split_once("\n\n")
        .ok_or_else(|| VdriveError::Ota("note has no signature section".into()))?;

    let mut body = body.to_string();
    body.push('\n');

    for line in sig_lines.lines() {
        let Some(rest) = line.strip_prefix(SIG_PREFIX) else {
            continue;
        };

        let Some((name, sig_b64)) = rest.split_once(' ') else {
            continue;
        };

        if name != origin {
            continue;
        }

        let sig_bytes = BASE64
            .decode(sig_b64)
            .map_err(|e| VdriveError::Ota(format!("malformed note signature: {e}")))?;

        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| VdriveError::Ota("malformed note signature length".into()))?;

        key.verify(body.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| VdriveError::Ota("invalid note signature".into()))?;

        return Ok(body.into_bytes());
    }

    Err(VdriveError::Ota(format!("no note signature from {origin}")))
}

/// Verify a checkpoint note and parse its body.
pub fn verify_checkpoint(
    note: &[u8],
    key: &VerifyingKey,
    origin: &str,
) -> VdriveResult<Checkpoint> {
    let body = verify_body(note, key, origin)?;
    let body = String::from_utf8(body).expect("verified body was UTF-8");

    let mut lines = body.lines();

    let cp_origin = lines
        .next()
        .ok_or_else(|| VdriveError::Ota("checkpoint missing origin".into()))?;

    if cp_origin != origin {
        return Err(VdriveError::Ota(format!(
            "checkpoint origin mismatch: {cp_origin}"
        )));
    }

    let size = lines
        .next()
        .and_then(|l| l.parse::<u64>().ok())
        .ok_or_else(|| VdriveError::Ota("checkpoint missing tree size".into()))?;

    let root = lines
        .next()
        .and_then(|l| BASE64.decode(l).ok())
        .and_then(|b| <Hash>::try_from(b).ok())
        .ok_or_else(|| VdriveError::Ota("checkpoint missing root hash".into()))?;

    Ok(Checkpoint {
        origin: cp_origin.to_string(),
        size,
        root,
    })
}

/// Sign a note body (release tooling and tests). The body must not contain
/// a blank line.
pub fn sign(body: &[u8], name: &str, key: &SigningKey) -> Vec<u8> {
    let mut body = body.to_vec();

    if body.last() != Some(&b'\n') {
        body.push(b'\n');
    }

    let sig = key.sign(&body);

    let mut note = body;
    note.push(b'\n');
    note.extend_from_slice(SIG_PREFIX.as_bytes());
    note.extend_from_slice(name.as_bytes());
    note.push(b' ');
    note.extend_from_slice(BASE64.encode(sig.to_bytes()).as_bytes());
    note.push(b'\n');

    note
}

/// Format a checkpoint body (release tooling and tests).
pub fn checkpoint_body(origin: &str, size: u64, root: &Hash) -> Vec<u8> {
    format!("{origin}\n{size}\n{}\n", BASE64.encode(root)).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let (sk, vk) = keypair();
        let root = [7u8; 32];

        let note = sign(&checkpoint_body("vaultdrive/firmware", 42, &root), "vaultdrive/firmware", &sk);
        let cp = verify_checkpoint(&note, &vk, "vaultdrive/firmware").unwrap();

        assert_eq!(cp.origin, "vaultdrive/firmware");
        assert_eq!(cp.size, 42);
        assert_eq!(cp.root, root);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (sk, _) = keypair();
        let (_, other_vk) = keypair();

        let note = sign(b"statement", "origin", &sk);
        assert!(verify_body(&note, &other_vk, "origin").is_err());
    }

    #[test]
    fn test_wrong_origin_rejected() {
        let (sk, vk) = keypair();

        let note = sign(b"statement", "origin-a", &sk);
        assert!(verify_body(&note, &vk, "origin-b").is_err());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (sk, vk) = keypair();

        let mut note = sign(b"statement", "origin", &sk);
        note[0] ^= 0x20;

        assert!(verify_body(&note, &vk, "origin").is_err());
    }

    #[test]
    fn test_origin_mismatch_inside_checkpoint() {
        let (sk, vk) = keypair();
        let root = [1u8; 32];

        // signed under the right name, but the body claims another log
        let note = sign(&checkpoint_body("other/log", 1, &root), "vaultdrive/firmware", &sk);
        assert!(verify_checkpoint(&note, &vk, "vaultdrive/firmware").is_err());
    }
}
