use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level device configuration (loaded from vdrive.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VdriveConfig {
    pub daemon: DaemonConfig,
    pub device: DeviceConfig,
    pub fde: FdeConfig,
    pub ota: OtaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket carrying raw EDM frames to/from the BLE module
    pub uart_socket: PathBuf,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backing image for the external SD card (absent card → pairing mode)
    pub sd_image: Option<PathBuf>,
    /// Backing image for the internal eMMC (persistent config + firmware)
    pub mmc_image: PathBuf,
    /// Device-unique secure-element seed, hex (generated when missing)
    pub element_seed: Option<String>,
    /// Advertised BLE peripheral name
    pub ble_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FdeConfig {
    /// Host-visible block size = physical block size × multiplier
    pub block_multiplier: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Firmware-release manifest authentication key (hex, 32 bytes).
    /// Empty disables update authentication.
    pub fr_public_key: String,
    /// Transparency-log checkpoint authentication key (hex, 32 bytes)
    pub log_public_key: String,
    /// Expected transparency-log origin line
    pub log_origin: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            uart_socket: PathBuf::from("/run/vdrived/uart.sock"),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sd_image: None,
            mmc_image: PathBuf::from("/var/lib/vdrived/mmc.img"),
            element_seed: None,
            ble_name: "VaultDrive".into(),
        }
    }
}

impl Default for FdeConfig {
    fn default() -> Self {
        Self { block_multiplier: 8 }
    }
}
