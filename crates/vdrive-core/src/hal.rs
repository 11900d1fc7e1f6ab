//! Hardware abstraction traits.
//!
//! Three seams separate the firmware core from the platform: block storage
//! (SD card, eMMC, RAM disks), the secure element holding derived keys in
//! slots the CPU cannot read back, and the two feedback LEDs.

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::VdriveResult;

/// Geometry of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevInfo {
    pub blocks: u64,
    pub block_size: usize,
}

impl DevInfo {
    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.blocks * self.block_size as u64
    }
}

/// Raw block storage. Addresses are physical LBAs; buffers must be a
/// multiple of the block size.
#[async_trait]
pub trait BlockDev: Send + Sync {
    fn info(&self) -> DevInfo;
    async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> VdriveResult<()>;
    async fn write_blocks(&self, lba: u64, buf: &[u8]) -> VdriveResult<()>;
}

/// Key RAM slots of the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum KeySlot {
    /// Block encryption key for the FDE data path
    Block = 0,
    /// IV encryption key for ESSIV computation
    Essiv = 1,
    /// Persistent storage encryption key
    Snvs = 2,
}

pub const KEY_SLOTS: usize = 3;

/// Hardware-bound key derivation and offloaded block ciphering.
///
/// A key derived into a slot never crosses this trait boundary again; only
/// the slot index does. `derive_exported` is the escape hatch for keys the
/// CPU legitimately needs (and mirrors a derivation mode of the real
/// element), it loads the slot *and* returns the bytes.
pub trait SecureElement: Send + Sync {
    /// Device-unique identifier, used for the USB serial number.
    fn unique_id(&self) -> [u8; 8];

    /// Derive a 16-byte key from the element's root secret and `diversifier`,
    /// keeping it inside `slot`.
    fn derive_key(&self, diversifier: &[u8], slot: KeySlot) -> VdriveResult<()>;

    /// Derive as above but also export the key bytes, loading `slot` on the way.
    fn derive_exported(
        &self,
        diversifier: &[u8],
        slot: KeySlot,
    ) -> VdriveResult<Zeroizing<Vec<u8>>>;

    /// Load caller-provided key material into `slot`.
    fn set_key(&self, slot: KeySlot, key: &[u8]) -> VdriveResult<()>;

    /// AES-128-CBC over `blocks` chained units of `block_size` bytes, one
    /// 16-byte IV per unit taken from `ivs`, under the key in `slot`.
    fn cbc_chain(
        &self,
        slot: KeySlot,
        ivs: &[u8],
        buf: &mut [u8],
        block_size: usize,
        encrypt: bool,
    ) -> VdriveResult<()>;

    /// Encrypt a single AES block in place under the key in `slot`
    /// (ESSIV IV computation).
    fn encrypt_block(&self, slot: KeySlot, block: &mut [u8]) -> VdriveResult<()>;
}

/// Feedback LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    /// Advertising / pairing feedback
    Blue,
    /// Unlocked / update in progress
    White,
}

pub trait Leds: Send + Sync {
    fn set(&self, led: Led, on: bool);
}
