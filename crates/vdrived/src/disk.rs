//! File-backed block device.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use vdrive_core::{BlockDev, DevInfo, VdriveError, VdriveResult, BLOCK_SIZE};

pub struct FileDisk {
    file: Mutex<File>,
    blocks: u64,
}

impl FileDisk {
    /// Open (or create, sized sparsely) a disk image.
    pub async fn open(path: &Path, blocks: u64) -> VdriveResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let len = blocks * BLOCK_SIZE as u64;

        if file.metadata().await?.len() < len {
            file.set_len(len).await?;
        }

        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }

    /// Open an existing image, deriving the block count from its size.
    pub async fn open_existing(path: &Path) -> VdriveResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        let blocks = file.metadata().await?.len() / BLOCK_SIZE as u64;

        if blocks == 0 {
            return Err(VdriveError::Storage(format!(
                "empty disk image: {}",
                path.display()
            )));
        }

        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }
}

#[async_trait]
impl BlockDev for FileDisk {
    fn info(&self) -> DevInfo {
        DevInfo {
            blocks: self.blocks,
            block_size: BLOCK_SIZE,
        }
    }

    async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> VdriveResult<()> {
        if lba * BLOCK_SIZE as u64 + buf.len() as u64 > self.blocks * BLOCK_SIZE as u64 {
            return Err(VdriveError::Storage("read exceeds disk size".into()));
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64)).await?;
        file.read_exact(buf).await?;

        Ok(())
    }

    async fn write_blocks(&self, lba: u64, buf: &[u8]) -> VdriveResult<()> {
        if lba * BLOCK_SIZE as u64 + buf.len() as u64 > self.blocks * BLOCK_SIZE as u64 {
            return Err(VdriveError::Storage("write exceeds disk size".into()));
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64)).await?;
        file.write_all(buf).await?;
        file.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let disk = FileDisk::open(&path, 16).await.unwrap();
        assert_eq!(disk.info().blocks, 16);

        let data = vec![0xA5u8; 2 * BLOCK_SIZE];
        disk.write_blocks(3, &data).await.unwrap();

        let mut back = vec![0u8; 2 * BLOCK_SIZE];
        disk.read_blocks(3, &mut back).await.unwrap();
        assert_eq!(back, data);

        // sparse region reads as zeros
        disk.read_blocks(10, &mut back).await.unwrap();
        assert!(back.iter().all(|&b| b == 0));

        assert!(disk.read_blocks(15, &mut back).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let disk = FileDisk::open(&path, 8).await.unwrap();
            disk.write_blocks(0, &vec![7u8; BLOCK_SIZE]).await.unwrap();
        }

        let disk = FileDisk::open_existing(&path).await.unwrap();
        assert_eq!(disk.info().blocks, 8);

        let mut buf = vec![0u8; BLOCK_SIZE];
        disk.read_blocks(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![7u8; BLOCK_SIZE]);
    }
}
