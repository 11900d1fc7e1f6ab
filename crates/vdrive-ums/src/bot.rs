//! Bulk-Only Transport wrappers (CBW/CSW).

use vdrive_core::{VdriveError, VdriveResult};

pub const CBW_LENGTH: usize = 31;
pub const CSW_LENGTH: usize = 13;
pub const CBW_CB_MAX_LENGTH: usize = 16;

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;

pub const CSW_STATUS_OK: u8 = 0x00;
pub const CSW_STATUS_COMMAND_FAILED: u8 = 0x01;

/// Command Block Wrapper, host → device.
#[derive(Debug, Clone)]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub command_block: [u8; CBW_CB_MAX_LENGTH],
}

impl Cbw {
    pub fn parse(buf: &[u8]) -> VdriveResult<Self> {
        if buf.len() != CBW_LENGTH {
            return Err(VdriveError::Scsi(format!(
                "invalid CBW size {} != {CBW_LENGTH}",
                buf.len()
            )));
        }

        let signature = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));

        if signature != CBW_SIGNATURE {
            return Err(VdriveError::Scsi(format!("invalid CBW signature {signature:#x}")));
        }

        let cb_length = buf[14];

        if !(6..=CBW_CB_MAX_LENGTH as u8).contains(&cb_length) {
            return Err(VdriveError::Scsi(format!(
                "invalid command block length {cb_length}"
            )));
        }

        let mut command_block = [0u8; CBW_CB_MAX_LENGTH];
        command_block.copy_from_slice(&buf[15..31]);

        Ok(Self {
            tag: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            data_transfer_length: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            flags: buf[12],
            lun: buf[13] & 0x0F,
            cb_length,
            command_block,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CBW_LENGTH);
        out.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.data_transfer_length.to_le_bytes());
        out.push(self.flags);
        out.push(self.lun);
        out.push(self.cb_length);
        out.extend_from_slice(&self.command_block);
        out
    }
}

/// Command Status Wrapper, device → host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

impl Csw {
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            data_residue: 0,
            status: CSW_STATUS_OK,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CSW_LENGTH);
        out.extend_from_slice(&CSW_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.data_residue.to_le_bytes());
        out.push(self.status);
        out
    }

    pub fn parse(buf: &[u8]) -> VdriveResult<Self> {
        if buf.len() != CSW_LENGTH {
            return Err(VdriveError::Scsi(format!("invalid CSW size {}", buf.len())));
        }

        let signature = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));

        if signature != CSW_SIGNATURE {
            return Err(VdriveError::Scsi(format!("invalid CSW signature {signature:#x}")));
        }

        Ok(Self {
            tag: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            data_residue: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            status: buf[12],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cbw() -> Cbw {
        let mut command_block = [0u8; 16];
        command_block[0] = 0x28;

        Cbw {
            tag: 0xCAFE_BABE,
            data_transfer_length: 4096,
            flags: 0x80,
            lun: 0,
            cb_length: 10,
            command_block,
        }
    }

    #[test]
    fn test_cbw_roundtrip() {
        let cbw = sample_cbw();
        let parsed = Cbw::parse(&cbw.to_bytes()).unwrap();

        assert_eq!(parsed.tag, cbw.tag);
        assert_eq!(parsed.data_transfer_length, cbw.data_transfer_length);
        assert_eq!(parsed.command_block, cbw.command_block);
    }

    #[test]
    fn test_cbw_rejects_bad_signature() {
        let mut bytes = sample_cbw().to_bytes();
        bytes[0] = 0;

        assert!(Cbw::parse(&bytes).is_err());
    }

    #[test]
    fn test_cbw_rejects_bad_lengths() {
        assert!(Cbw::parse(&[0u8; 30]).is_err());

        let mut bytes = sample_cbw().to_bytes();
        bytes[14] = 3; // below the SCSI minimum
        assert!(Cbw::parse(&bytes).is_err());
        bytes[14] = 17;
        assert!(Cbw::parse(&bytes).is_err());
    }

    #[test]
    fn test_csw_roundtrip() {
        let csw = Csw {
            tag: 7,
            data_residue: 512,
            status: CSW_STATUS_COMMAND_FAILED,
        };

        let bytes = csw.to_bytes();
        assert_eq!(bytes.len(), CSW_LENGTH);
        assert_eq!(Csw::parse(&bytes).unwrap(), csw);
    }
}
