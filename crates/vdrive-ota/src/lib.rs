//! vdrive-ota: over-the-air firmware updates.
//!
//! An update archive dropped onto the pairing disk carries the firmware
//! image, its secure-boot signature block, and a transparency-log proof
//! bundle. The device refuses to flash anything the log has not committed
//! to, and refuses a log that is not an append-only extension of the last
//! checkpoint it accepted.

pub mod archive;
pub mod merkle;
pub mod note;
mod update;

pub use update::{AuthKeys, Updater, FIRMWARE_LBA};
