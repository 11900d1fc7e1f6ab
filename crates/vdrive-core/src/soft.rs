//! Software stand-ins for the hardware seams.
//!
//! `SoftElement` keeps derived keys process-local behind the same slot
//! interface as the real secure element, which weakens the hardware-binding
//! threat model: on this backend the slot keys do exist in CPU-addressable
//! memory. Platforms with a real element replace it at the trait seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use aes::cipher::{block_padding::NoPadding, BlockEncrypt, BlockEncryptMut, BlockDecryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{VdriveError, VdriveResult};
use crate::hal::{BlockDev, DevInfo, KeySlot, Led, Leds, SecureElement, KEY_SLOTS};
use crate::AES_BLOCK_SIZE;

type CbcEnc = cbc::Encryptor<Aes128>;
type CbcDec = cbc::Decryptor<Aes128>;

/// Software secure element seeded by a device-unique 32-byte secret.
pub struct SoftElement {
    seed: Zeroizing<[u8; 32]>,
    slots: RwLock<[Option<Zeroizing<[u8; 16]>>; KEY_SLOTS]>,
}

impl SoftElement {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed: Zeroizing::new(seed),
            slots: RwLock::new(Default::default()),
        }
    }

    /// Fresh random seed; device identity will not survive a restart.
    pub fn ephemeral() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::new(seed)
    }

    fn derive(&self, diversifier: &[u8]) -> VdriveResult<Zeroizing<[u8; 16]>> {
        let hk = Hkdf::<Sha256>::new(None, self.seed.as_ref());
        let mut key = Zeroizing::new([0u8; 16]);
        hk.expand(diversifier, key.as_mut())
            .map_err(|e| VdriveError::Crypto(format!("key derivation failed: {e}")))?;
        Ok(key)
    }

    fn slot_key(&self, slot: KeySlot) -> VdriveResult<Zeroizing<[u8; 16]>> {
        self.slots.read().expect("slot lock poisoned")[slot as usize]
            .clone()
            .ok_or_else(|| VdriveError::Crypto(format!("key slot {slot:?} not loaded")))
    }
}

impl SecureElement for SoftElement {
    fn unique_id(&self) -> [u8; 8] {
        let hk = Hkdf::<Sha256>::new(None, self.seed.as_ref());
        let mut uid = [0u8; 8];
        hk.expand(b"vdriveUID", &mut uid).expect("HKDF expand");
        uid
    }

    fn derive_key(&self, diversifier: &[u8], slot: KeySlot) -> VdriveResult<()> {
        let key = self.derive(diversifier)?;
        self.slots.write().expect("slot lock poisoned")[slot as usize] = Some(key);
        Ok(())
    }

    fn derive_exported(
        &self,
        diversifier: &[u8],
        slot: KeySlot,
    ) -> VdriveResult<Zeroizing<Vec<u8>>> {
        let key = self.derive(diversifier)?;
        self.slots.write().expect("slot lock poisoned")[slot as usize] = Some(key.clone());
        Ok(Zeroizing::new(key.to_vec()))
    }

    fn set_key(&self, slot: KeySlot, key: &[u8]) -> VdriveResult<()> {
        if key.len() != 16 {
            return Err(VdriveError::Crypto(format!(
                "invalid key length {} for slot {slot:?}",
                key.len()
            )));
        }

        let mut k = Zeroizing::new([0u8; 16]);
        k.copy_from_slice(key);
        self.slots.write().expect("slot lock poisoned")[slot as usize] = Some(k);
        Ok(())
    }

    fn cbc_chain(
        &self,
        slot: KeySlot,
        ivs: &[u8],
        buf: &mut [u8],
        block_size: usize,
        encrypt: bool,
    ) -> VdriveResult<()> {
        if block_size == 0 || buf.len() % block_size != 0 {
            return Err(VdriveError::Crypto("invalid chain geometry".into()));
        }

        let blocks = buf.len() / block_size;

        if ivs.len() < blocks * AES_BLOCK_SIZE {
            return Err(VdriveError::Crypto("short IV buffer".into()));
        }

        let key = self.slot_key(slot)?;

        for (i, unit) in buf.chunks_exact_mut(block_size).enumerate() {
            let iv = &ivs[i * AES_BLOCK_SIZE..(i + 1) * AES_BLOCK_SIZE];
            let len = unit.len();

            if encrypt {
                CbcEnc::new_from_slices(key.as_ref(), iv)
                    .map_err(|e| VdriveError::Crypto(format!("CBC init: {e}")))?
                    .encrypt_padded_mut::<NoPadding>(unit, len)
                    .map_err(|e| VdriveError::Crypto(format!("CBC encrypt: {e}")))?;
            } else {
                CbcDec::new_from_slices(key.as_ref(), iv)
                    .map_err(|e| VdriveError::Crypto(format!("CBC init: {e}")))?
                    .decrypt_padded_mut::<NoPadding>(unit)
                    .map_err(|e| VdriveError::Crypto(format!("CBC decrypt: {e}")))?;
            }
        }

        Ok(())
    }

    fn encrypt_block(&self, slot: KeySlot, block: &mut [u8]) -> VdriveResult<()> {
        if block.len() != AES_BLOCK_SIZE {
            return Err(VdriveError::Crypto("invalid block length".into()));
        }

        let key = self.slot_key(slot)?;
        let cipher = Aes128::new_from_slice(key.as_ref())
            .map_err(|e| VdriveError::Crypto(format!("AES init: {e}")))?;
        cipher.encrypt_block(aes::cipher::generic_array::GenericArray::from_mut_slice(block));
        Ok(())
    }
}

/// RAM-backed block device.
pub struct MemDisk {
    data: RwLock<Vec<u8>>,
    block_size: usize,
}

impl MemDisk {
    pub fn new(blocks: u64, block_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; blocks as usize * block_size]),
            block_size,
        }
    }

    pub fn from_vec(data: Vec<u8>, block_size: usize) -> Self {
        debug_assert_eq!(data.len() % block_size, 0);
        Self {
            data: RwLock::new(data),
            block_size,
        }
    }

    /// Copy of the whole disk contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().expect("disk lock poisoned").clone()
    }
}

#[async_trait]
impl BlockDev for MemDisk {
    fn info(&self) -> DevInfo {
        DevInfo {
            blocks: (self.data.read().expect("disk lock poisoned").len() / self.block_size) as u64,
            block_size: self.block_size,
        }
    }

    async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> VdriveResult<()> {
        let data = self.data.read().expect("disk lock poisoned");
        let start = lba as usize * self.block_size;
        let end = start + buf.len();

        if end > data.len() {
            return Err(VdriveError::Storage("read exceeds disk size".into()));
        }

        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    async fn write_blocks(&self, lba: u64, buf: &[u8]) -> VdriveResult<()> {
        let mut data = self.data.write().expect("disk lock poisoned");
        let start = lba as usize * self.block_size;
        let end = start + buf.len();

        if end > data.len() {
            return Err(VdriveError::Storage("write exceeds disk size".into()));
        }

        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// LED state holder; real boards drive GPIOs, tests assert on it.
#[derive(Default)]
pub struct SoftLeds {
    blue: AtomicBool,
    white: AtomicBool,
}

impl SoftLeds {
    pub fn is_on(&self, led: Led) -> bool {
        match led {
            Led::Blue => self.blue.load(Ordering::Relaxed),
            Led::White => self.white.load(Ordering::Relaxed),
        }
    }
}

impl Leds for SoftLeds {
    fn set(&self, led: Led, on: bool) {
        tracing::debug!(?led, on, "led");
        match led {
            Led::Blue => self.blue.store(on, Ordering::Relaxed),
            Led::White => self.white.store(on, Ordering::Relaxed),
        }
    }
}
