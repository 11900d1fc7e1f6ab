//! Runtime key store and cipher arming.
//!
//! The keyring owns the long-term and ephemeral P-256 identities, the
//! element-derived `snvs`/`salt` values and the BLE session key, and is the
//! only component that loads block-encryption keys (directly or via a slot).

use std::sync::Arc;

use hkdf::Hkdf;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use vdrive_core::{BlockDev, KeySlot, SecureElement, VdriveError, VdriveResult};

use crate::block::{BlockCipher, CbcBackend, EssivBackend};
use crate::persist::{PersistentConfig, Settings, CONF_BLOCKS_LEGACY, CONF_BLOCKS_V2, MMC_CONF_BLOCK};
use crate::seal;
use crate::sign::{self, EcdsaSig};
use crate::{ESSIV_DIV, PBKDF2_ITER, SNVS_DIV};

/// Whether CBC block ciphering runs on the secure element.
pub const HW_CBC: bool = cfg!(feature = "hw-cbc");

/// Whether ESSIV IV encryption runs on the secure element.
pub const HW_ESSIV: bool = cfg!(feature = "hw-essiv");

/// BLE peer key indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyIndex {
    UaLongterm,
    UaEphemeral,
    MdLongterm,
    MdEphemeral,
}

/// Configured FDE cipher mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    None,
    Aes128CbcPlain,
    Aes128CbcEssiv,
    Aes128XtsPlain,
    Aes256XtsPlain,
}

pub struct Keyring {
    se: Arc<dyn SecureElement>,
    mmc: Arc<dyn BlockDev>,
    conf_lba: u64,

    /// Persistent configuration, kept in sync with the eMMC image
    pub conf: PersistentConfig,

    armory_longterm: Option<SecretKey>,
    mobile_longterm: Option<PublicKey>,

    armory_ephemeral: Option<SecretKey>,
    mobile_ephemeral: Option<PublicKey>,

    pre_master: Zeroizing<Vec<u8>>,
    session_key: Zeroizing<Vec<u8>>,

    /// ESSIV key and BEK diversification pepper
    salt: Zeroizing<Vec<u8>>,
    /// Persistent storage sealing key
    snvs: Zeroizing<Vec<u8>>,
}

impl Keyring {
    pub fn new(se: Arc<dyn SecureElement>, mmc: Arc<dyn BlockDev>) -> Self {
        Self::with_conf_lba(se, mmc, MMC_CONF_BLOCK)
    }

    /// Place the configuration region at a non-default LBA (small test disks).
    pub fn with_conf_lba(se: Arc<dyn SecureElement>, mmc: Arc<dyn BlockDev>, conf_lba: u64) -> Self {
        Self {
            se,
            mmc,
            conf_lba,
            conf: PersistentConfig::default(),
            armory_longterm: None,
            mobile_longterm: None,
            armory_ephemeral: None,
            mobile_ephemeral: None,
            pre_master: Zeroizing::new(Vec::new()),
            session_key: Zeroizing::new(Vec::new()),
            salt: Zeroizing::new(Vec::new()),
            snvs: Zeroizing::new(Vec::new()),
        }
    }

    /// Derive storage keys, load (or initialize) the persistent
    /// configuration, and restore the long-term identities from it.
    pub async fn init(&mut self, overwrite: bool) -> VdriveResult<()> {
        self.snvs = self.se.derive_exported(SNVS_DIV, KeySlot::Snvs)?;

        if self.load().await.is_err() || overwrite {
            self.reset().await?;
        }

        let armory = self.conf.armory_longterm.clone();
        self.import(KeyIndex::UaLongterm, true, &armory)?;

        // we might not be paired yet, so a missing/invalid mobile key is fine
        if !self.conf.mobile_longterm.is_empty() {
            let mobile = self.conf.mobile_longterm.clone();

            if let Err(e) = self.import(KeyIndex::MdLongterm, false, &mobile) {
                tracing::warn!("stored mobile key unusable: {e}");
            }
        }

        self.salt = self.se.derive_exported(ESSIV_DIV, KeySlot::Essiv)?;

        Ok(())
    }

    /// Fresh configuration: keep (or mint) the UA long-term key, default
    /// cipher, no paired peer, no checkpoint.
    async fn reset(&mut self) -> VdriveResult<()> {
        if self.armory_longterm.is_none() {
            self.new_longterm_key();
        }

        self.conf = PersistentConfig {
            armory_longterm: self.export(KeyIndex::UaLongterm, true)?,
            mobile_longterm: Vec::new(),
            settings: Settings::default(),
            proof_bundle: None,
        };

        self.save().await
    }

    pub fn new_longterm_key(&mut self) {
        self.armory_longterm = Some(SecretKey::random(&mut OsRng));
    }

    pub fn has_mobile_longterm(&self) -> bool {
        self.mobile_longterm.is_some()
    }

    // ── Serialization ─────────────────────────────────────────────────────

    pub fn export(&self, index: KeyIndex, private: bool) -> VdriveResult<Vec<u8>> {
        let (priv_key, pub_key) = match index {
            KeyIndex::UaLongterm => (self.armory_longterm.as_ref(), None),
            KeyIndex::UaEphemeral => (self.armory_ephemeral.as_ref(), None),
            KeyIndex::MdLongterm => (None, self.mobile_longterm.as_ref()),
            KeyIndex::MdEphemeral => (None, self.mobile_ephemeral.as_ref()),
        };

        if private {
            let key = priv_key.ok_or_else(|| VdriveError::Keyring("invalid key".into()))?;

            Ok(key
                .to_sec1_der()
                .map_err(|e| VdriveError::Keyring(format!("private key export: {e}")))?
                .to_vec())
        } else {
            let key = pub_key
                .copied()
                .or_else(|| priv_key.map(|k| k.public_key()))
                .ok_or_else(|| VdriveError::Keyring("invalid key".into()))?;

            Ok(key
                .to_public_key_der()
                .map_err(|e| VdriveError::Keyring(format!("public key export: {e}")))?
                .as_bytes()
                .to_vec())
        }
    }

    pub fn import(&mut self, index: KeyIndex, private: bool, der: &[u8]) -> VdriveResult<()> {
        match (index, private) {
            (KeyIndex::UaLongterm, true) => {
                self.armory_longterm = Some(
                    SecretKey::from_sec1_der(der)
                        .map_err(|e| VdriveError::Keyring(format!("private key import: {e}")))?,
                );
                Ok(())
            }
            (KeyIndex::MdLongterm, false) => {
                self.mobile_longterm = Some(parse_spki(der)?);
                Ok(())
            }
            (KeyIndex::MdEphemeral, false) => {
                self.mobile_ephemeral = Some(parse_spki(der)?);
                Ok(())
            }
            _ => Err(VdriveError::Keyring("invalid key index".into())),
        }
    }

    // ── Session keys ──────────────────────────────────────────────────────

    /// Generate the UA ephemeral keypair and derive the session key from
    /// ECDH with the MD ephemeral key, bound to `nonce` via HKDF-SHA256.
    /// Any failure clears all ephemeral state.
    pub fn new_session_keys(&mut self, nonce: &[u8]) -> VdriveResult<()> {
        let result = self.derive_session(nonce);

        if result.is_err() {
            self.clear_session_keys();
        }

        result
    }

    fn derive_session(&mut self, nonce: &[u8]) -> VdriveResult<()> {
        let armory = SecretKey::random(&mut OsRng);

        let mobile = self
            .mobile_ephemeral
            .as_ref()
            .ok_or_else(|| VdriveError::Keyring("mobile ephemeral key missing".into()))?;

        // The shared X coordinate is fixed-width big-endian (32 bytes).
        let shared = p256::ecdh::diffie_hellman(armory.to_nonzero_scalar(), mobile.as_affine());
        self.pre_master = Zeroizing::new(shared.raw_secret_bytes().to_vec());

        let hk = Hkdf::<Sha256>::new(Some(nonce), &self.pre_master);
        let mut key = Zeroizing::new(vec![0u8; 32]);
        hk.expand(&[], &mut key)
            .map_err(|e| VdriveError::Keyring(format!("HKDF expand: {e}")))?;

        self.session_key = key;
        self.armory_ephemeral = Some(armory);

        Ok(())
    }

    pub fn clear_session_keys(&mut self) {
        self.armory_ephemeral = None;
        self.mobile_ephemeral = None;
        self.pre_master = Zeroizing::new(Vec::new());
        self.session_key = Zeroizing::new(Vec::new());
    }

    pub fn has_session_key(&self) -> bool {
        !self.session_key.is_empty()
    }

    pub fn encrypt_session(&self, payload: &[u8]) -> VdriveResult<Vec<u8>> {
        if self.session_key.is_empty() {
            return Err(VdriveError::InvalidSession);
        }

        seal::ofb_encrypt(&self.session_key, payload)
    }

    pub fn decrypt_session(&self, payload: &[u8]) -> VdriveResult<Vec<u8>> {
        if self.session_key.is_empty() {
            return Err(VdriveError::InvalidSession);
        }

        seal::ofb_decrypt(&self.session_key, payload)
    }

    // ── Envelope signatures ───────────────────────────────────────────────

    /// Sign with the UA ephemeral key inside a session, the long-term key
    /// otherwise.
    pub fn sign(&self, data: &[u8], ephemeral: bool) -> VdriveResult<EcdsaSig> {
        let key = if ephemeral {
            self.armory_ephemeral.as_ref()
        } else {
            self.armory_longterm.as_ref()
        }
        .ok_or_else(|| VdriveError::Keyring("signing key unavailable".into()))?;

        sign::sign(key, data)
    }

    /// Verify against the MD ephemeral key inside a session, the long-term
    /// key otherwise.
    pub fn verify(&self, data: &[u8], sig: &EcdsaSig, ephemeral: bool) -> VdriveResult<()> {
        let key = if ephemeral {
            self.mobile_ephemeral.as_ref()
        } else {
            self.mobile_longterm.as_ref()
        }
        .ok_or_else(|| VdriveError::Keyring("verification key unavailable".into()))?;

        sign::verify(key, data, sig)
    }

    // ── Block encryption key ──────────────────────────────────────────────

    /// Arm (or clear) the FDE cipher. The BEK diversifier combines the
    /// caller-supplied unlock material with the UA long-term public key, so
    /// both a re-pairing and a new unlock secret change the BEK.
    pub fn set_cipher(&mut self, kind: CipherKind, diversifier: &[u8]) -> VdriveResult<BlockCipher> {
        if kind != CipherKind::None && self.salt.len() != 16 {
            return Err(VdriveError::Keyring("keyring not initialized".into()));
        }

        match kind {
            CipherKind::Aes128CbcPlain | CipherKind::Aes128CbcEssiv => {
                let backend = if HW_CBC {
                    self.derive_block_key(diversifier)?;
                    CbcBackend::Element(self.se.clone())
                } else {
                    let dek = self.derive_block_key_exported(diversifier)?;
                    let mut key = Zeroizing::new([0u8; 16]);
                    key.copy_from_slice(&dek);
                    CbcBackend::Soft(key)
                };

                let essiv = if kind == CipherKind::Aes128CbcEssiv {
                    Some(if HW_ESSIV {
                        EssivBackend::Element(self.se.clone())
                    } else {
                        let mut key = Zeroizing::new([0u8; 16]);
                        key.copy_from_slice(&self.salt);
                        EssivBackend::Soft(key)
                    })
                } else {
                    None
                };

                Ok(BlockCipher::Cbc { backend, essiv })
            }
            CipherKind::Aes128XtsPlain | CipherKind::Aes256XtsPlain => {
                let size = if kind == CipherKind::Aes256XtsPlain { 64 } else { 32 };

                let dek = self.derive_block_key_exported(diversifier)?;

                let mut composite = Zeroizing::new(vec![0u8; size]);
                pbkdf2_hmac::<Sha256>(&dek, &self.salt, PBKDF2_ITER, &mut composite);

                if size == 64 {
                    BlockCipher::xts256(&composite)
                } else {
                    BlockCipher::xts128(&composite)
                }
            }
            CipherKind::None => {
                // repoint the block slot away from the previous key
                self.se.derive_key(&[0u8; 16], KeySlot::Block)?;
                Ok(BlockCipher::None)
            }
        }
    }

    /// BEK slot diversifier: `PBKDF2(salt, mode_div ‖ UA_longterm_pub)`.
    fn bek_diversifier(&self, diversifier: &[u8]) -> VdriveResult<Zeroizing<[u8; 16]>> {
        let armory_pub = self.export(KeyIndex::UaLongterm, false)?;

        let mut input = diversifier.to_vec();
        input.extend_from_slice(&armory_pub);

        let mut out = Zeroizing::new([0u8; 16]);
        pbkdf2_hmac::<Sha256>(&self.salt, &input, PBKDF2_ITER, out.as_mut());

        Ok(out)
    }

    fn derive_block_key(&self, diversifier: &[u8]) -> VdriveResult<()> {
        let div = self.bek_diversifier(diversifier)?;
        self.se.derive_key(div.as_ref(), KeySlot::Block)
    }

    fn derive_block_key_exported(&self, diversifier: &[u8]) -> VdriveResult<Zeroizing<Vec<u8>>> {
        let div = self.bek_diversifier(diversifier)?;
        self.se.derive_exported(div.as_ref(), KeySlot::Block)
    }

    // ── Persistent configuration ──────────────────────────────────────────

    async fn load_at(&self, blocks: usize) -> VdriveResult<PersistentConfig> {
        let block_size = self.mmc.info().block_size;

        let mut sealed = vec![0u8; blocks * block_size];
        self.mmc.read_blocks(self.conf_lba, &mut sealed).await?;

        PersistentConfig::parse(&self.snvs, &sealed)
    }

    /// Load the configuration, tolerating the legacy image size.
    pub async fn load(&mut self) -> VdriveResult<()> {
        for blocks in [CONF_BLOCKS_V2, CONF_BLOCKS_LEGACY] {
            if let Ok(conf) = self.load_at(blocks).await {
                self.conf = conf;
                return Ok(());
            }
        }

        Err(VdriveError::Storage("no valid configuration image".into()))
    }

    /// Seal and write the configuration region atomically (single
    /// fixed-size block write).
    pub async fn save(&self) -> VdriveResult<()> {
        let block_size = self.mmc.info().block_size;
        let sealed = self.conf.store(&self.snvs, CONF_BLOCKS_V2, block_size)?;

        self.mmc.write_blocks(self.conf_lba, &sealed).await
    }
}

fn parse_spki(der: &[u8]) -> VdriveResult<PublicKey> {
    PublicKey::from_public_key_der(der)
        .map_err(|e| VdriveError::Keyring(format!("incompatible key: {e}")))
}
