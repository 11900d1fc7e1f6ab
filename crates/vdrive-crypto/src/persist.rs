//! Persistent configuration, sealed on a reserved eMMC block range.
//!
//! The record is serialized as JSON, sealed with the SNVS key
//! (`IV ‖ OFB ciphertext ‖ HMAC`, see [`crate::seal`]) and padded to
//! [`CONF_BLOCKS_V2`] blocks. The read path also accepts the legacy
//! 2-block image written by earlier firmware revisions.

use serde::{Deserialize, Serialize};

use vdrive_core::{VdriveError, VdriveResult};

use crate::keyring::CipherKind;
use crate::seal;

/// First eMMC block of the configuration region.
pub const MMC_CONF_BLOCK: u64 = 2_097_152;

/// Legacy configuration image size in blocks.
pub const CONF_BLOCKS_LEGACY: usize = 2;

/// Current configuration image size in blocks.
pub const CONF_BLOCKS_V2: usize = 2048;

/// User-visible settings carried in the configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub cipher: CipherKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cipher: CipherKind::Aes128CbcPlain,
        }
    }
}

/// Transparency-log evidence for the last accepted firmware update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    /// Signed checkpoint note of the log at release time
    pub new_checkpoint: Vec<u8>,
    /// Signed firmware-release statement (the log leaf)
    pub firmware_release: Vec<u8>,
    /// Index of the release leaf in the log
    pub leaf_index: u64,
    /// RFC 6962 inclusion path, leaf to root
    pub inclusion_proof: Vec<Vec<u8>>,
    /// RFC 6962 consistency path from the previously stored checkpoint
    pub consistency_proof: Vec<Vec<u8>>,
    /// All leaf hashes of the release batch; dropped before persisting
    pub leaf_hashes: Vec<Vec<u8>>,
}

/// The record stored on eMMC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentConfig {
    /// UA long-term private key, SEC1 EC DER
    pub armory_longterm: Vec<u8>,
    /// MD long-term public key, SPKI DER (empty until paired)
    #[serde(default)]
    pub mobile_longterm: Vec<u8>,
    pub settings: Settings,
    #[serde(default)]
    pub proof_bundle: Option<ProofBundle>,
}

impl PersistentConfig {
    /// Serialize and seal into a `blocks × block_size` image.
    pub fn store(&self, snvs: &[u8], blocks: usize, block_size: usize) -> VdriveResult<Vec<u8>> {
        let plain = serde_json::to_vec(self)
            .map_err(|e| VdriveError::Storage(format!("config encode: {e}")))?;

        seal::seal(snvs, &plain, blocks * block_size)
    }

    /// Open and deserialize a sealed image. Any authentication or decode
    /// failure is an error; a partial record is never produced.
    pub fn parse(snvs: &[u8], sealed: &[u8]) -> VdriveResult<Self> {
        let plain = seal::unseal(snvs, sealed)?;

        // The plaintext is zero-padded; take the first JSON value only.
        let mut stream = serde_json::Deserializer::from_slice(&plain).into_iter::<Self>();

        match stream.next() {
            Some(Ok(conf)) => Ok(conf),
            Some(Err(e)) => Err(VdriveError::Storage(format!("config decode: {e}"))),
            None => Err(VdriveError::Storage("empty config image".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistentConfig {
        PersistentConfig {
            armory_longterm: vec![1, 2, 3, 4],
            mobile_longterm: vec![5, 6],
            settings: Settings {
                cipher: CipherKind::Aes128CbcEssiv,
            },
            proof_bundle: Some(ProofBundle {
                new_checkpoint: b"checkpoint".to_vec(),
                leaf_index: 9,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_store_parse_roundtrip() {
        let snvs = [0x10u8; 16];
        let conf = sample();

        let sealed = conf.store(&snvs, CONF_BLOCKS_LEGACY, 512).unwrap();
        assert_eq!(sealed.len(), CONF_BLOCKS_LEGACY * 512);

        let parsed = PersistentConfig::parse(&snvs, &sealed).unwrap();
        assert_eq!(parsed, conf);
    }

    #[test]
    fn test_corrupted_mac_fails_whole_load() {
        let snvs = [0x10u8; 16];
        let mut sealed = sample().store(&snvs, CONF_BLOCKS_LEGACY, 512).unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(PersistentConfig::parse(&snvs, &sealed).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = sample().store(&[1u8; 16], CONF_BLOCKS_LEGACY, 512).unwrap();
        assert!(PersistentConfig::parse(&[2u8; 16], &sealed).is_err());
    }

    #[test]
    fn test_garbage_plaintext_fails() {
        // Authenticates fine but carries no JSON record
        let snvs = [3u8; 16];
        let sealed = seal::seal(&snvs, b"\x00\x00\x00", 1024).unwrap();

        assert!(PersistentConfig::parse(&snvs, &sealed).is_err());
    }
}
