//! vdrive-ums: the host-facing storage surface.
//!
//! [`scsi::UmsHandler`] implements the SCSI/UFI subset a host needs for
//! autodiscovery and block I/O against a [`vdrive_fde::Drive`];
//! [`pairing::PairingDisk`] is the synthesized FAT16 volume advertised
//! while unpaired; [`qr`] renders the signed pairing code it publishes.

pub mod bot;
pub mod pairing;
pub mod qr;
pub mod scsi;

pub use bot::{Cbw, Csw};
pub use pairing::PairingDisk;
pub use scsi::{UmsEvent, UmsHandler};

/// USB vendor id (pid.codes open-source allocation).
pub const USB_VENDOR_ID: u16 = 0x1209;

/// USB product id.
pub const USB_PRODUCT_ID: u16 = 0x2702;

/// SCSI vendor identification, exactly 8 bytes.
pub const VENDOR_ID: &str = "F-Secure";

/// SCSI product identification, exactly 16 bytes.
pub const PRODUCT_ID: &str = "USB armory Mk II";

/// SCSI product revision, exactly 4 bytes.
pub const PRODUCT_REVISION: &str = "1.00";
