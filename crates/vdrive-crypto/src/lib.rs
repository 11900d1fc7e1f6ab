//! vdrive-crypto: the trust path of VaultDrive
//!
//! Key hierarchy:
//! ```text
//! Secure element root secret (device-bound)
//!   ├── SNVS key  ("floppySNVS", exported):  seals the persistent config
//!   ├── salt      ("floppyESSIV", exported): ESSIV key, BEK diversifier pepper
//!   └── BLOCK key (PBKDF2(salt, mode ‖ UA longterm pub))
//!        ├── CBC: used directly (element slot or CPU)
//!        └── XTS: PBKDF2-expanded to the 32/64-byte composite key
//! UA/MD longterm ECDSA-P256:  pairing identity, envelope signatures
//! UA/MD ephemeral ECDSA-P256: per-session; ECDH + HKDF give the session key
//! Session key (AES-256-OFB):  BLE payload confidentiality
//! ```

pub mod block;
pub mod keyring;
pub mod persist;
pub mod seal;
pub mod sign;

pub use block::BlockCipher;
pub use keyring::{CipherKind, KeyIndex, Keyring};
pub use persist::{PersistentConfig, ProofBundle, Settings};

use rand::RngCore;

/// PBKDF2 iteration count for block-key diversification.
pub const PBKDF2_ITER: u32 = 4096;

/// SNVS key derivation diversifier.
pub const SNVS_DIV: &[u8] = b"floppySNVS";

/// ESSIV key derivation diversifier.
pub const ESSIV_DIV: &[u8] = b"floppyESSIV";

/// CSPRNG bytes. Failure of the system entropy source is unrecoverable.
pub fn random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}
