//! Synthesized FAT16 pairing disk.
//!
//! A single-partition RAM disk (16800 × 512 bytes) exposing the pairing QR
//! code, a README, the firmware revision and the last accepted transparency
//! checkpoint. The host may write into it; on eject the root directory is
//! scanned for an update archive.

use std::io::{Cursor, Read, Write};
use std::sync::RwLock;

use async_trait::async_trait;
use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};

use vdrive_core::{BlockDev, DevInfo, VdriveError, VdriveResult, BLOCK_SIZE};

/// Total pairing disk size in blocks.
pub const PAIRING_DISK_BLOCKS: u64 = 16800;

/// First LBA of the FAT16 partition.
pub const PARTITION_LBA: u64 = 2048;

/// Partition length in sectors.
pub const PARTITION_SECTORS: u32 = 14752;

const BOOT_SIGNATURE: u16 = 0xAA55;

/// Update archive file name (8.3).
pub const UPDATE_PATH: &str = "UPDATE.ZIP";

const CODE_PATH: &str = "QR.PNG";
const README_PATH: &str = "README.TXT";
const VERSION_PATH: &str = "VERSION.TXT";
const CHECKPOINT_PATH: &str = "LASTCHKP.BIN";

const README: &str = "
Please install the VaultDrive companion application on your phone
and scan file QR.PNG
";

pub struct PairingDisk {
    data: RwLock<Vec<u8>>,
}

impl PairingDisk {
    /// Build the disk image: MBR, partition gap, formatted FAT16 volume
    /// carrying the pairing files.
    pub fn build(code: &[u8], revision: &str, checkpoint: Option<&[u8]>) -> VdriveResult<Self> {
        let mut partition = vec![0u8; PARTITION_SECTORS as usize * BLOCK_SIZE];

        {
            let mut cursor = Cursor::new(&mut partition[..]);

            fatfs::format_volume(
                &mut cursor,
                FormatVolumeOptions::new()
                    .fat_type(FatType::Fat16)
                    .volume_label(*b"F-Secure   "),
            )
            .map_err(|e| VdriveError::Storage(format!("FAT format: {e:?}")))?;

            let fs = FileSystem::new(cursor, FsOptions::new())
                .map_err(|e| VdriveError::Storage(format!("FAT mount: {e:?}")))?;

            {
                let root = fs.root_dir();

                if !code.is_empty() {
                    add_file(&root, CODE_PATH, code)?;
                    add_file(&root, README_PATH, README.as_bytes())?;
                }

                add_file(&root, VERSION_PATH, revision.as_bytes())?;

                if let Some(checkpoint) = checkpoint {
                    add_file(&root, CHECKPOINT_PATH, checkpoint)?;
                }
            }

            fs.unmount()
                .map_err(|e| VdriveError::Storage(format!("FAT unmount: {e:?}")))?;
        }

        let mut data = mbr();
        data.resize(PARTITION_LBA as usize * BLOCK_SIZE, 0);
        data.extend_from_slice(&partition);

        debug_assert_eq!(data.len(), PAIRING_DISK_BLOCKS as usize * BLOCK_SIZE);

        Ok(Self {
            data: RwLock::new(data),
        })
    }

    /// Scan the root directory for an update archive dropped by the host.
    pub fn update_archive(&self) -> VdriveResult<Option<Vec<u8>>> {
        let partition = {
            let data = self.data.read().expect("disk lock poisoned");
            data[PARTITION_LBA as usize * BLOCK_SIZE..].to_vec()
        };

        let fs = FileSystem::new(Cursor::new(partition), FsOptions::new())
            .map_err(|e| VdriveError::Storage(format!("FAT mount: {e:?}")))?;

        let root = fs.root_dir();

        for entry in root.iter() {
            let entry = entry.map_err(|e| VdriveError::Storage(format!("FAT read: {e:?}")))?;

            if entry.is_file() && entry.file_name().eq_ignore_ascii_case(UPDATE_PATH) {
                let mut archive = Vec::with_capacity(entry.len() as usize);
                entry
                    .to_file()
                    .read_to_end(&mut archive)
                    .map_err(VdriveError::Io)?;

                return Ok(Some(archive));
            }
        }

        Ok(None)
    }
}

/// MBR with one active FAT16 partition and the boot signature.
fn mbr() -> Vec<u8> {
    let mut sector = vec![0u8; BLOCK_SIZE];

    // first partition entry
    let entry = &mut sector[446..462];
    // status + first CHS
    entry[0..4].copy_from_slice(&[0x00, 0x00, 0x21, 0x18]);
    // type: FAT16 (> 32 MiB window semantics preserved from the reference)
    entry[4] = 0x06;
    // last CHS
    entry[5..8].copy_from_slice(&[0x01, 0x2a, 0xc7]);
    entry[8..12].copy_from_slice(&(PARTITION_LBA as u32).to_le_bytes());
    entry[12..16].copy_from_slice(&PARTITION_SECTORS.to_le_bytes());

    sector[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    sector
}

fn add_file<IO>(root: &fatfs::Dir<'_, IO>, path: &str, data: &[u8]) -> VdriveResult<()>
where
    IO: fatfs::ReadWriteSeek,
{
    let mut file = root
        .create_file(path)
        .map_err(|e| VdriveError::Storage(format!("FAT create {path}: {e:?}")))?;

    file.write_all(data)
        .map_err(|e| VdriveError::Storage(format!("FAT write {path}: {e:?}")))?;

    Ok(())
}

#[async_trait]
impl BlockDev for PairingDisk {
    fn info(&self) -> DevInfo {
        DevInfo {
            blocks: PAIRING_DISK_BLOCKS,
            block_size: BLOCK_SIZE,
        }
    }

    async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> VdriveResult<()> {
        let data = self.data.read().expect("disk lock poisoned");
        let start = lba as usize * BLOCK_SIZE;
        let end = start + buf.len();

        if end > data.len() {
            return Err(VdriveError::Storage("read exceeds disk size".into()));
        }

        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    async fn write_blocks(&self, lba: u64, buf: &[u8]) -> VdriveResult<()> {
        let mut data = self.data.write().expect("disk lock poisoned");
        let start = lba as usize * BLOCK_SIZE;

        if start + buf.len() > data.len() {
            return Err(VdriveError::Storage("write exceeds disk size".into()));
        }

        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(disk: &PairingDisk, name: &str) -> Option<Vec<u8>> {
        let data = disk.data.read().unwrap();
        let partition = data[PARTITION_LBA as usize * BLOCK_SIZE..].to_vec();

        let fs = FileSystem::new(Cursor::new(partition), FsOptions::new()).unwrap();
        let root = fs.root_dir();

        for entry in root.iter() {
            let entry = entry.unwrap();
            if entry.is_file() && entry.file_name().eq_ignore_ascii_case(name) {
                let mut out = Vec::new();
                entry.to_file().read_to_end(&mut out).unwrap();
                return Some(out);
            }
        }

        None
    }

    #[test]
    fn test_mbr_layout() {
        let disk = PairingDisk::build(b"qr-bytes", "0.4.0", None).unwrap();
        let data = disk.data.read().unwrap();

        assert_eq!(data.len(), PAIRING_DISK_BLOCKS as usize * BLOCK_SIZE);

        // boot signature
        assert_eq!(data[510], 0x55);
        assert_eq!(data[511], 0xAA);

        // partition entry: type 0x06, first LBA 2048
        assert_eq!(data[446 + 4], 0x06);
        assert_eq!(
            u32::from_le_bytes(data[446 + 8..446 + 12].try_into().unwrap()),
            PARTITION_LBA as u32
        );
        assert_eq!(
            u32::from_le_bytes(data[446 + 12..446 + 16].try_into().unwrap()),
            PARTITION_SECTORS
        );
    }

    #[test]
    fn test_fat16_validates_and_files_present() {
        let disk = PairingDisk::build(b"qr-bytes", "0.4.0", Some(b"checkpoint")).unwrap();

        assert_eq!(read_back(&disk, "QR.PNG").unwrap(), b"qr-bytes");
        assert_eq!(read_back(&disk, "VERSION.TXT").unwrap(), b"0.4.0");
        assert_eq!(read_back(&disk, "LASTCHKP.BIN").unwrap(), b"checkpoint");
        assert!(read_back(&disk, "README.TXT").is_some());
    }

    #[test]
    fn test_no_code_omits_qr_and_readme() {
        let disk = PairingDisk::build(b"", "0.4.0", None).unwrap();

        assert!(read_back(&disk, "QR.PNG").is_none());
        assert!(read_back(&disk, "README.TXT").is_none());
        assert!(read_back(&disk, "LASTCHKP.BIN").is_none());
        assert!(read_back(&disk, "VERSION.TXT").is_some());
    }

    #[test]
    fn test_update_archive_roundtrip() {
        let disk = PairingDisk::build(b"qr", "0.4.0", None).unwrap();
        assert!(disk.update_archive().unwrap().is_none());

        // emulate the host dropping UPDATE.ZIP into the root directory
        {
            let mut data = disk.data.write().unwrap();
            let partition = &mut data[PARTITION_LBA as usize * BLOCK_SIZE..];
            let cursor = Cursor::new(partition);

            let fs = FileSystem::new(cursor, FsOptions::new()).unwrap();
            let mut file = fs.root_dir().create_file(UPDATE_PATH).unwrap();
            file.write_all(b"archive contents").unwrap();
            drop(file);
            fs.unmount().unwrap();
        }

        assert_eq!(disk.update_archive().unwrap().unwrap(), b"archive contents");
    }

    #[tokio::test]
    async fn test_block_dev_bounds() {
        let disk = PairingDisk::build(b"qr", "0.4.0", None).unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE];
        disk.read_blocks(0, &mut buf).await.unwrap();
        assert_eq!(&buf[510..512], &[0x55, 0xAA]);

        assert!(disk.read_blocks(PAIRING_DISK_BLOCKS, &mut buf).await.is_err());
    }
}
