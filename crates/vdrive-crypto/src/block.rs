//! Block-cipher modes for the FDE data path.
//!
//! The chain unit is the *logical* block (`multiplier × 512` bytes): one
//! 16-byte IV is derived per logical block and CBC runs across the whole
//! unit. Existing encrypted volumes depend on this exact interpretation.

use std::sync::Arc;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::{Aes128, Aes256};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use vdrive_core::{KeySlot, SecureElement, VdriveError, VdriveResult, AES_BLOCK_SIZE};

type CbcEnc = cbc::Encryptor<Aes128>;
type CbcDec = cbc::Decryptor<Aes128>;

/// CBC data-path backend: CPU key or element slot.
pub enum CbcBackend {
    Soft(Zeroizing<[u8; 16]>),
    Element(Arc<dyn SecureElement>),
}

/// ESSIV IV-encryption backend.
pub enum EssivBackend {
    Soft(Zeroizing<[u8; 16]>),
    Element(Arc<dyn SecureElement>),
}

/// An armed block cipher, or `None` when the drive is locked / passthrough.
pub enum BlockCipher {
    None,
    Cbc {
        backend: CbcBackend,
        essiv: Option<EssivBackend>,
    },
    Xts128(Box<Xts128<Aes128>>),
    Xts256(Box<Xts128<Aes256>>),
}

impl BlockCipher {
    /// Build an AES-128-XTS cipher from a 32-byte composite key.
    pub fn xts128(key: &[u8]) -> VdriveResult<Self> {
        if key.len() != 32 {
            return Err(VdriveError::Crypto("invalid XTS-128 key length".into()));
        }

        let c1 = Aes128::new_from_slice(&key[..16])
            .map_err(|e| VdriveError::Crypto(format!("XTS data key: {e}")))?;
        let c2 = Aes128::new_from_slice(&key[16..])
            .map_err(|e| VdriveError::Crypto(format!("XTS tweak key: {e}")))?;

        Ok(Self::Xts128(Box::new(Xts128::new(c1, c2))))
    }

    /// Build an AES-256-XTS cipher from a 64-byte composite key.
    pub fn xts256(key: &[u8]) -> VdriveResult<Self> {
        if key.len() != 64 {
            return Err(VdriveError::Crypto("invalid XTS-256 key length".into()));
        }

        let c1 = Aes256::new_from_slice(&key[..32])
            .map_err(|e| VdriveError::Crypto(format!("XTS data key: {e}")))?;
        let c2 = Aes256::new_from_slice(&key[32..])
            .map_err(|e| VdriveError::Crypto(format!("XTS tweak key: {e}")))?;

        Ok(Self::Xts256(Box::new(Xts128::new(c1, c2))))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Encrypt or decrypt `buf` in place. `buf` covers whole logical blocks
    /// of `block_size` bytes starting at logical address `lba`.
    pub fn apply(
        &self,
        buf: &mut [u8],
        lba: u64,
        block_size: usize,
        encrypt: bool,
    ) -> VdriveResult<()> {
        if block_size == 0 || buf.len() % block_size != 0 {
            return Err(VdriveError::Crypto("invalid cipher geometry".into()));
        }

        match self {
            Self::None => Ok(()),
            Self::Cbc { backend, essiv } => cbc_apply(backend, essiv, buf, lba, block_size, encrypt),
            Self::Xts128(xts) => {
                if encrypt {
                    xts.encrypt_area(buf, block_size, lba as u128, get_tweak_default);
                } else {
                    xts.decrypt_area(buf, block_size, lba as u128, get_tweak_default);
                }
                Ok(())
            }
            Self::Xts256(xts) => {
                if encrypt {
                    xts.encrypt_area(buf, block_size, lba as u128, get_tweak_default);
                } else {
                    xts.decrypt_area(buf, block_size, lba as u128, get_tweak_default);
                }
                Ok(())
            }
        }
    }
}

/// plain64 IV: big-endian LBA in the first 8 bytes, zeros in the rest.
fn plain_iv(lba: u64) -> [u8; AES_BLOCK_SIZE] {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    iv[..8].copy_from_slice(&lba.to_be_bytes());
    iv
}

fn essiv_transform(essiv: &EssivBackend, iv: &mut [u8; AES_BLOCK_SIZE]) -> VdriveResult<()> {
    match essiv {
        EssivBackend::Soft(key) => {
            let cipher = Aes128::new_from_slice(key.as_ref())
                .map_err(|e| VdriveError::Crypto(format!("ESSIV init: {e}")))?;
            cipher.encrypt_block(aes::cipher::generic_array::GenericArray::from_mut_slice(iv));
            Ok(())
        }
        EssivBackend::Element(se) => se.encrypt_block(KeySlot::Essiv, iv),
    }
}

fn cbc_apply(
    backend: &CbcBackend,
    essiv: &Option<EssivBackend>,
    buf: &mut [u8],
    lba: u64,
    block_size: usize,
    encrypt: bool,
) -> VdriveResult<()> {
    let blocks = buf.len() / block_size;

    match backend {
        CbcBackend::Soft(key) => {
            for (i, unit) in buf.chunks_exact_mut(block_size).enumerate() {
                let mut iv = plain_iv(lba + i as u64);

                if let Some(essiv) = essiv {
                    essiv_transform(essiv, &mut iv)?;
                }

                let len = unit.len();

                if encrypt {
                    CbcEnc::new_from_slices(key.as_ref(), &iv)
                        .map_err(|e| VdriveError::Crypto(format!("CBC init: {e}")))?
                        .encrypt_padded_mut::<NoPadding>(unit, len)
                        .map_err(|e| VdriveError::Crypto(format!("CBC encrypt: {e}")))?;
                } else {
                    CbcDec::new_from_slices(key.as_ref(), &iv)
                        .map_err(|e| VdriveError::Crypto(format!("CBC init: {e}")))?
                        .decrypt_padded_mut::<NoPadding>(unit)
                        .map_err(|e| VdriveError::Crypto(format!("CBC decrypt: {e}")))?;
                }
            }

            Ok(())
        }
        CbcBackend::Element(se) => {
            let mut ivs = vec![0u8; blocks * AES_BLOCK_SIZE];

            for i in 0..blocks {
                let mut iv = plain_iv(lba + i as u64);

                if let Some(essiv) = essiv {
                    essiv_transform(essiv, &mut iv)?;
                }

                ivs[i * AES_BLOCK_SIZE..(i + 1) * AES_BLOCK_SIZE].copy_from_slice(&iv);
            }

            se.cbc_chain(KeySlot::Block, &ivs, buf, block_size, encrypt)
        }
    }
}
