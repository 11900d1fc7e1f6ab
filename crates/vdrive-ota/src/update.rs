//! The update flow: extract, verify, flash, persist evidence.

use std::collections::BTreeMap;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use vdrive_core::config::OtaConfig;
use vdrive_core::{BlockDev, Led, Leds, VdriveError, VdriveResult};
use vdrive_crypto::persist::ProofBundle;
use vdrive_crypto::Keyring;

use crate::archive::{self, CSF_PATH, IMX_PATH};
use crate::{merkle, note};

/// First eMMC block of the firmware image.
pub const FIRMWARE_LBA: u64 = 2;

/// Firmware-release statement body: what the log leaf commits to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareRelease {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub platform_id: String,
    pub revision: String,
    /// Artifact name → hex SHA-256
    pub artifact_sha256: BTreeMap<String, String>,
}

/// Build-time update authentication material. Absent keys disable
/// verification but not flashing (development images).
pub struct AuthKeys {
    pub fr_public: Option<VerifyingKey>,
    pub log_public: Option<VerifyingKey>,
    pub log_origin: String,
}

impl AuthKeys {
    pub fn from_config(config: &OtaConfig) -> VdriveResult<Self> {
        Ok(Self {
            fr_public: parse_key(&config.fr_public_key)?,
            log_public: parse_key(&config.log_public_key)?,
            log_origin: config.log_origin.clone(),
        })
    }

    /// No authentication material at all.
    pub fn disabled() -> Self {
        Self {
            fr_public: None,
            log_public: None,
            log_origin: String::new(),
        }
    }
}

/// An all-zero embedded key means "no key".
fn parse_key(hex_key: &str) -> VdriveResult<Option<VerifyingKey>> {
    if hex_key.is_empty() {
        return Ok(None);
    }

    let bytes = hex::decode(hex_key)
        .map_err(|e| VdriveError::Ota(format!("malformed authentication key: {e}")))?;

    if bytes.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VdriveError::Ota("authentication key must be 32 bytes".into()))?;

    VerifyingKey::from_bytes(&bytes)
        .map(Some)
        .map_err(|e| VdriveError::Ota(format!("invalid authentication key: {e}")))
}

pub struct Updater {
    mmc: Arc<dyn BlockDev>,
    leds: Arc<dyn Leds>,
    keys: AuthKeys,
}

impl Updater {
    pub fn new(mmc: Arc<dyn BlockDev>, leds: Arc<dyn Leds>, keys: AuthKeys) -> Self {
        Self { mmc, leds, keys }
    }

    /// Run a full update from raw archive bytes. The white LED is lit for
    /// the duration; failures light blue and leave flash and checkpoint
    /// untouched.
    pub async fn run(&self, archive: &[u8], keyring: &mut Keyring) -> VdriveResult<()> {
        self.leds.set(Led::White, true);

        let result = self.apply(archive, keyring).await;
        self.leds.set(Led::White, false);

        match &result {
            Ok(()) => {
                self.leds.set(Led::Blue, false);
                info!("firmware update complete");
            }
            Err(e) => {
                self.leds.set(Led::Blue, true);
                error!("firmware update error, {e}");
            }
        }

        result
    }

    async fn apply(&self, buf: &[u8], keyring: &mut Keyring) -> VdriveResult<()> {
        let (imx, csf, proof) = archive::extract(buf)?;

        if let Some(bundle) = self.verify(&imx, &csf, &proof, keyring.conf.proof_bundle.as_ref())? {
            keyring.conf.proof_bundle = Some(bundle);
            keyring.save().await?;
        }

        // append the secure-boot signature block and pad to whole blocks
        let mut firmware = imx;
        firmware.extend_from_slice(&csf);

        let block_size = self.mmc.info().block_size;
        let padded = firmware.len().div_ceil(block_size) * block_size;
        firmware.resize(padded, 0);

        self.mmc.write_blocks(FIRMWARE_LBA, &firmware).await
    }

    /// Transparency verification. Returns the bundle to persist (leaf
    /// hashes dropped), or `None` when authentication is disabled.
    fn verify(
        &self,
        imx: &[u8],
        csf: &[u8],
        proof: &[u8],
        stored: Option<&ProofBundle>,
    ) -> VdriveResult<Option<ProofBundle>> {
        let (Some(fr_key), Some(log_key)) = (&self.keys.fr_public, &self.keys.log_public) else {
            warn!("missing update authentication keys, firmware accepted unverified");
            return Ok(None);
        };

        if proof.is_empty() {
            return Err(VdriveError::Ota("missing proof".into()));
        }

        let mut bundle: ProofBundle = serde_json::from_slice(proof)
            .map_err(|e| VdriveError::Ota(format!("malformed proof bundle: {e}")))?;

        let origin = self.keys.log_origin.as_str();

        // the log vouches for the new checkpoint
        let checkpoint = note::verify_checkpoint(&bundle.new_checkpoint, log_key, origin)?;

        // the release statement is signed under the log origin and commits
        // to the artifact hashes
        let release_body = note::verify_body(&bundle.firmware_release, fr_key, origin)?;
        let release: FirmwareRelease = serde_json::from_slice(&release_body)
            .map_err(|e| VdriveError::Ota(format!("malformed release statement: {e}")))?;

        check_artifact(&release, IMX_PATH, imx)?;
        check_artifact(&release, CSF_PATH, csf)?;

        // the statement is in the log the checkpoint describes
        let leaf = merkle::leaf_hash(&bundle.firmware_release);
        let inclusion = hashes(&bundle.inclusion_proof)?;
        merkle::verify_inclusion(
            &leaf,
            bundle.leaf_index,
            checkpoint.size,
            &inclusion,
            &checkpoint.root,
        )?;

        // the log extends the one we last accepted
        if let Some(stored) = stored {
            let old = note::verify_checkpoint(&stored.new_checkpoint, log_key, origin)?;
            let consistency = hashes(&bundle.consistency_proof)?;
            merkle::verify_consistency(
                old.size,
                checkpoint.size,
                &old.root,
                &checkpoint.root,
                &consistency,
            )?;
        }

        info!(size = checkpoint.size, revision = %release.revision, "update proof verified");

        bundle.leaf_hashes.clear();
        Ok(Some(bundle))
    }
}

fn check_artifact(release: &FirmwareRelease, name: &str, data: &[u8]) -> VdriveResult<()> {
    let expected = release
        .artifact_sha256
        .get(name)
        .ok_or_else(|| VdriveError::Ota(format!("release does not cover {name}")))?;

    let expected = hex::decode(expected)
        .map_err(|e| VdriveError::Ota(format!("malformed artifact hash for {name}: {e}")))?;

    let actual: [u8; 32] = Sha256::digest(data).into();

    if expected != actual {
        return Err(VdriveError::Ota(format!("artifact hash mismatch for {name}")));
    }

    Ok(())
}

fn hashes(raw: &[Vec<u8>]) -> VdriveResult<Vec<merkle::Hash>> {
    raw.iter()
        .map(|h| {
            merkle::Hash::try_from(h.as_slice())
                .map_err(|_| VdriveError::Ota("malformed proof hash".into()))
        })
        .collect()
}
