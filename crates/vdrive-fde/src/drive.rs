use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::task::JoinSet;

use vdrive_core::{BlockDev, DevInfo, VdriveError, VdriveResult};
use vdrive_crypto::BlockCipher;

/// Host-visible blocks are this many physical blocks, amortizing per-block
/// IV derivation. Pairing mode reverts to 1.
pub const BLOCK_SIZE_MULTIPLIER: usize = 8;

/// Logical blocks handed to a decrypt task while the next batch is read.
pub const READ_PIPELINE_SIZE: usize = 12;

/// Logical blocks encrypted per overlapped storage write.
pub const WRITE_PIPELINE_SIZE: usize = 20;

struct Backend {
    dev: Arc<dyn BlockDev>,
    pairing: bool,
}

/// The logical storage unit the host talks to.
///
/// The cipher is swapped only while `ready == false`; the data path takes a
/// snapshot per command, so in-flight I/O always runs under a consistent key.
pub struct Drive {
    backend: RwLock<Backend>,
    cipher: RwLock<Arc<BlockCipher>>,
    ready: AtomicBool,
    multiplier: usize,
}

impl Drive {
    pub fn new(dev: Arc<dyn BlockDev>, multiplier: usize) -> Self {
        Self {
            backend: RwLock::new(Backend { dev, pairing: false }),
            cipher: RwLock::new(Arc::new(BlockCipher::None)),
            ready: AtomicBool::new(false),
            multiplier,
        }
    }

    /// Swap in a different backing device (pairing disk ↔ SD card).
    pub fn set_backend(&self, dev: Arc<dyn BlockDev>, pairing: bool) {
        let mut backend = self.backend.write().expect("backend lock poisoned");
        backend.dev = dev;
        backend.pairing = pairing;
    }

    pub fn backend(&self) -> Arc<dyn BlockDev> {
        self.backend.read().expect("backend lock poisoned").dev.clone()
    }

    pub fn pairing(&self) -> bool {
        self.backend.read().expect("backend lock poisoned").pairing
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn cipher_on(&self) -> bool {
        !self.cipher.read().expect("cipher lock poisoned").is_none()
    }

    /// Block multiplier in effect (pairing disks are exposed 1:1).
    pub fn multiplier(&self) -> usize {
        if self.pairing() {
            1
        } else {
            self.multiplier
        }
    }

    pub fn physical_info(&self) -> DevInfo {
        self.backend().info()
    }

    /// Host-visible geometry, scaled by the multiplier.
    pub fn logical_info(&self) -> DevInfo {
        let info = self.physical_info();
        let mult = self.multiplier();

        DevInfo {
            blocks: info.blocks / mult as u64,
            block_size: info.block_size * mult,
        }
    }

    /// Arm the cipher and mark the volume present.
    pub fn unlock(&self, cipher: BlockCipher) {
        debug_assert!(!self.is_ready());
        *self.cipher.write().expect("cipher lock poisoned") = Arc::new(cipher);
        self.set_ready(true);
    }

    /// Invalidate the volume and drop the cipher.
    pub fn lock(&self) {
        self.set_ready(false);
        *self.cipher.write().expect("cipher lock poisoned") = Arc::new(BlockCipher::None);
    }

    fn snapshot(&self) -> Arc<BlockCipher> {
        self.cipher.read().expect("cipher lock poisoned").clone()
    }

    /// Read `blocks` logical blocks at logical `lba`, decrypting in batches
    /// pipelined against storage reads. A locked drive reads as zeros.
    pub async fn read(&self, lba: u64, blocks: usize) -> VdriveResult<Vec<u8>> {
        let mult = self.multiplier();
        let dev = self.backend();
        let block_size = dev.info().block_size * mult;

        let mut out = vec![0u8; blocks * block_size];

        if !self.is_ready() {
            return Ok(out);
        }

        let cipher = self.snapshot();
        let decrypt = !self.pairing() && !cipher.is_none();

        let mut tasks: JoinSet<VdriveResult<(usize, Vec<u8>)>> = JoinSet::new();
        let mut i = 0;

        while i < blocks {
            let batch = READ_PIPELINE_SIZE.min(blocks - i);
            let span = i * block_size..(i + batch) * block_size;

            if decrypt {
                let mut chunk = vec![0u8; batch * block_size];
                dev.read_blocks((lba + i as u64) * mult as u64, &mut chunk).await?;

                let cipher = cipher.clone();
                let chunk_lba = lba + i as u64;
                let idx = i;

                tasks.spawn_blocking(move || {
                    cipher.apply(&mut chunk, chunk_lba, block_size, false)?;
                    Ok((idx, chunk))
                });
            } else {
                dev.read_blocks((lba + i as u64) * mult as u64, &mut out[span]).await?;
            }

            i += batch;
        }

        while let Some(joined) = tasks.join_next().await {
            let (idx, chunk) = joined
                .map_err(|e| VdriveError::Crypto(format!("decrypt task failed: {e}")))??;

            out[idx * block_size..idx * block_size + chunk.len()].copy_from_slice(&chunk);
        }

        Ok(out)
    }

    /// Write whole logical blocks at logical `lba`, encrypting each batch
    /// inline and overlapping the storage writes. The first error wins.
    /// A locked drive drops writes.
    pub async fn write(&self, lba: u64, buf: &[u8]) -> VdriveResult<()> {
        let mult = self.multiplier();
        let dev = self.backend();
        let block_size = dev.info().block_size * mult;

        if block_size == 0 || buf.len() % block_size != 0 {
            return Err(VdriveError::Storage(format!(
                "unaligned write length {}",
                buf.len()
            )));
        }

        if !self.is_ready() {
            return Ok(());
        }

        let cipher = self.snapshot();
        let encrypt = !self.pairing() && !cipher.is_none();
        let blocks = buf.len() / block_size;

        let mut tasks: JoinSet<VdriveResult<()>> = JoinSet::new();
        let mut i = 0;

        while i < blocks {
            let batch = WRITE_PIPELINE_SIZE.min(blocks - i);
            let mut chunk = buf[i * block_size..(i + batch) * block_size].to_vec();

            if encrypt {
                cipher.apply(&mut chunk, lba + i as u64, block_size, true)?;
            }

            let dev = dev.clone();
            let phys = (lba + i as u64) * mult as u64;

            tasks.spawn(async move { dev.write_blocks(phys, &chunk).await });

            i += batch;
        }

        let mut first_err = None;

        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| VdriveError::Storage(format!("write task failed: {e}")))
                .and_then(|r| r);

            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
