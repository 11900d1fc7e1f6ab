//! SCSI/UFI command subset for host autodiscovery and block I/O.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use vdrive_core::{Led, Leds, VdriveError, VdriveResult};
use vdrive_fde::Drive;

use crate::bot::{Cbw, Csw, CSW_STATUS_COMMAND_FAILED};
use crate::{PRODUCT_ID, PRODUCT_REVISION, VENDOR_ID};

// Direct Access Block commands (SPC-5 and SBC-4)
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const START_STOP_UNIT: u8 = 0x1b;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const MODE_SENSE_10: u8 = 0x5a;
pub const SERVICE_ACTION: u8 = 0x9e;
pub const REPORT_LUNS: u8 = 0xa0;

// service actions
pub const READ_CAPACITY_16: u8 = 0x10;

/// Side effects the device task must perform outside the SCSI path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmsEvent {
    /// Host ejected the unlocked volume; key teardown is owed
    Eject,
    /// Host ejected the pairing disk; pairing feedback and the OTA check run
    PairingEject,
}

/// A WRITE_10 whose payload spans upcoming OUT transfers. At most one is
/// outstanding; a CBW arriving while one is pending is a protocol error.
struct PendingWrite {
    tag: u32,
    lba: u64,
    size: usize,
    status: u8,
}

pub struct UmsHandler {
    drive: Arc<Drive>,
    leds: Arc<dyn Leds>,
    events: mpsc::UnboundedSender<UmsEvent>,
    pending: Option<PendingWrite>,
}

impl UmsHandler {
    pub fn new(
        drive: Arc<Drive>,
        leds: Arc<dyn Leds>,
        events: mpsc::UnboundedSender<UmsEvent>,
    ) -> Self {
        Self {
            drive,
            leds,
            events,
            pending: None,
        }
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending.is_some()
    }

    /// Process one bulk OUT transfer (a CBW, or write data if a write is
    /// pending). Returns the IN transfers to queue, in order.
    pub async fn handle_out(&mut self, buf: &[u8]) -> Vec<Vec<u8>> {
        if let Some(pending) = self.pending.take() {
            return self.complete_write(pending, buf).await;
        }

        let cbw = match Cbw::parse(buf) {
            Ok(cbw) => cbw,
            Err(e) => {
                warn!("dropping malformed CBW: {e}");
                return Vec::new();
            }
        };

        let mut csw = Csw::new(cbw.tag);

        match self.handle_cdb(&cbw, &mut csw).await {
            Ok(CdbOutcome::NoData) => vec![csw.to_bytes()],
            Ok(CdbOutcome::Data(data)) => vec![data, csw.to_bytes()],
            Ok(CdbOutcome::ExpectData) => Vec::new(),
            Err(e) => {
                debug!("CDB {:#04x} failed: {e}", cbw.command_block[0]);
                csw.data_residue = cbw.data_transfer_length;
                csw.status = CSW_STATUS_COMMAND_FAILED;
                vec![csw.to_bytes()]
            }
        }
    }

    async fn complete_write(&mut self, pending: PendingWrite, buf: &[u8]) -> Vec<Vec<u8>> {
        let mut csw = Csw::new(pending.tag);
        csw.status = pending.status;

        if buf.len() != pending.size {
            warn!(
                expected = pending.size,
                got = buf.len(),
                "write transfer length mismatch"
            );
            csw.data_residue = pending.size as u32;
            csw.status = CSW_STATUS_COMMAND_FAILED;
            return vec![csw.to_bytes()];
        }

        if let Err(e) = self.drive.write(pending.lba, buf).await {
            warn!("write failed: {e}");
            csw.status = CSW_STATUS_COMMAND_FAILED;
        }

        vec![csw.to_bytes()]
    }

    async fn handle_cdb(&mut self, cbw: &Cbw, csw: &mut Csw) -> VdriveResult<CdbOutcome> {
        let cmd = &cbw.command_block;
        let op = cmd[0];
        let length = cbw.data_transfer_length as usize;

        if cbw.lun != 0 {
            return Err(VdriveError::Scsi("invalid LUN".into()));
        }

        let ready = self.drive.is_ready();

        match op {
            TEST_UNIT_READY => {
                if !ready {
                    csw.status = CSW_STATUS_COMMAND_FAILED;
                }
                Ok(CdbOutcome::NoData)
            }
            INQUIRY => Ok(CdbOutcome::Data(inquiry(ready, length))),
            REQUEST_SENSE => sense(ready, length).map(CdbOutcome::Data),
            START_STOP_UNIT => {
                self.start_stop(cmd[4] & 1 == 1, csw);
                Ok(CdbOutcome::NoData)
            }
            MODE_SENSE_6 | MODE_SENSE_10 => Ok(CdbOutcome::Data(mode_sense(length))),
            REPORT_LUNS => Ok(CdbOutcome::Data(report_luns(length))),
            READ_FORMAT_CAPACITIES => read_format_capacities(&self.drive).map(CdbOutcome::Data),
            READ_CAPACITY_10 => read_capacity_10(&self.drive).map(CdbOutcome::Data),
            SERVICE_ACTION => match cmd[1] & 0x1F {
                READ_CAPACITY_16 => read_capacity_16(&self.drive, length).map(CdbOutcome::Data),
                action => Err(VdriveError::Scsi(format!(
                    "unsupported service action {action:#x}"
                ))),
            },
            READ_10 | WRITE_10 => {
                if !ready {
                    csw.status = CSW_STATUS_COMMAND_FAILED;
                }

                let lba = u32::from_be_bytes(cmd[2..6].try_into().expect("4 bytes")) as u64;
                let blocks = u16::from_be_bytes(cmd[7..9].try_into().expect("2 bytes")) as usize;

                if op == READ_10 {
                    let data = self.drive.read(lba, blocks).await?;
                    Ok(CdbOutcome::Data(data))
                } else {
                    let block_size = self.drive.logical_info().block_size;

                    if block_size * blocks != length {
                        return Err(VdriveError::Scsi(format!(
                            "unexpected {blocks} block write transfer length ({length})"
                        )));
                    }

                    self.pending = Some(PendingWrite {
                        tag: cbw.tag,
                        lba,
                        size: length,
                        status: csw.status,
                    });

                    Ok(CdbOutcome::ExpectData)
                }
            }
            PREVENT_ALLOW_MEDIUM_REMOVAL => Ok(CdbOutcome::NoData),
            _ => Err(VdriveError::Scsi(format!(
                "unsupported CDB operation code {op:#x}"
            ))),
        }
    }

    fn start_stop(&mut self, start: bool, csw: &mut Csw) {
        let ready = self.drive.is_ready();
        let pairing = self.drive.pairing();

        if !ready && start {
            // a locked drive cannot be started by the host
            csw.status = CSW_STATUS_COMMAND_FAILED;
        } else if ready && !start && !pairing {
            // lock at eject
            self.drive.lock();
            self.leds.set(Led::White, false);
            let _ = self.events.send(UmsEvent::Eject);
        } else {
            self.drive.set_ready(start);
        }

        if !self.drive.is_ready() && pairing {
            let _ = self.events.send(UmsEvent::PairingEject);
        }
    }
}

enum CdbOutcome {
    NoData,
    Data(Vec<u8>),
    ExpectData,
}

/// Standard INQUIRY data; the peripheral qualifier reflects readiness.
fn inquiry(ready: bool, length: usize) -> Vec<u8> {
    let mut data = vec![0u8; 5];

    if !ready {
        // peripheral qualifier: not connected
        data[0] |= 0b001 << 5;
    }

    // removable medium
    data[1] = 0x80;
    // SPC-3 compliant
    data[2] = 0x05;
    // response data format
    data[3] = 0x02;
    // additional length
    data[4] = length.saturating_sub(5) as u8;

    // unused or obsolete flags
    data.extend_from_slice(&[0u8; 3]);

    data.extend_from_slice(VENDOR_ID.as_bytes());
    data.extend_from_slice(PRODUCT_ID.as_bytes());
    data.extend_from_slice(PRODUCT_REVISION.as_bytes());

    data.resize(length.max(data.len()), 0);
    data.truncate(length);

    data
}

/// Fixed-format sense data: NOT READY / MEDIUM NOT PRESENT while locked.
fn sense(ready: bool, length: usize) -> VdriveResult<Vec<u8>> {
    let mut data = vec![0u8; 18];

    if !ready {
        // sense key: NOT READY
        data[2] = 0x02;
        // additional sense code: MEDIUM NOT PRESENT
        data[12] = 0x3a;
    }

    // error code
    data[0] = 0x70;
    // additional sense length
    data[7] = (data.len() - 1 - 7) as u8;

    if length < data.len() {
        return Err(VdriveError::Scsi(format!(
            "unsupported REQUEST_SENSE transfer length {length}"
        )));
    }

    Ok(data)
}

/// Mode pages are unsupported; an empty parameter list is returned.
fn mode_sense(length: usize) -> Vec<u8> {
    let mut data = vec![0u8; length];

    if length > 0 {
        data[0] = length as u8;
    }

    data
}

/// One LUN, first-level addressing.
fn report_luns(length: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(16);

    data.extend_from_slice(&8u32.to_be_bytes());
    data.extend_from_slice(&[0u8; 4]);
    data.extend_from_slice(&[0u8; 8]);

    data.truncate(length.min(data.len()));
    data
}

fn read_capacity_10(drive: &Drive) -> VdriveResult<Vec<u8>> {
    let info = drive.logical_info();

    if info.blocks == 0 {
        return Err(VdriveError::Scsi("invalid block count".into()));
    }

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&(info.blocks as u32 - 1).to_be_bytes());
    data.extend_from_slice(&(info.block_size as u32).to_be_bytes());

    Ok(data)
}

fn read_capacity_16(drive: &Drive, length: usize) -> VdriveResult<Vec<u8>> {
    let info = drive.logical_info();

    if info.blocks == 0 {
        return Err(VdriveError::Scsi("invalid block count".into()));
    }

    let mut data = vec![0u8; 32];
    data[..8].copy_from_slice(&(info.blocks - 1).to_be_bytes());
    data[8..16].copy_from_slice(&(info.block_size as u64).to_be_bytes());

    data.truncate(length.min(data.len()));
    Ok(data)
}

fn read_format_capacities(drive: &Drive) -> VdriveResult<Vec<u8>> {
    let info = drive.logical_info();

    let mut data = Vec::with_capacity(12);
    // capacity list length
    data.extend_from_slice(&8u32.to_be_bytes());
    data.extend_from_slice(&(info.blocks as u32).to_be_bytes());
    // descriptor code: formatted media | block length
    data.extend_from_slice(&(0b10u32 << 24 | info.block_size as u32 & 0x00FF_FFFF).to_be_bytes());

    Ok(data)
}
