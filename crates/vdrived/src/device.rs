//! Device bring-up and task wiring.
//!
//! Boot order mirrors the hardware: eMMC first (persistent config), then
//! SD detection; a missing card drops the device into pairing mode with
//! the synthesized QR disk.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, warn};

use vdrive_core::config::VdriveConfig;
use vdrive_core::soft::{SoftElement, SoftLeds};
use vdrive_core::{BlockDev, Led, Leds, SecureElement};
use vdrive_crypto::persist::{CONF_BLOCKS_V2, MMC_CONF_BLOCK};
use vdrive_crypto::{CipherKind, Keyring};
use vdrive_fde::Drive;
use vdrive_ota::{AuthKeys, Updater};
use vdrive_session::Handler;
use vdrive_ums::{qr, PairingDisk, UmsEvent, UmsHandler};

use crate::disk::FileDisk;
use crate::transport;

const REVISION: &str = env!("CARGO_PKG_VERSION");

pub async fn run(config: VdriveConfig) -> Result<()> {
    let se = Arc::new(element(&config)?);

    let serial = hex::encode_upper(se.unique_id());
    info!(serial, "secure element ready");

    // eMMC: configuration region plus the firmware area
    let mmc_blocks = MMC_CONF_BLOCK + CONF_BLOCKS_V2 as u64 + 16;
    let mmc = Arc::new(
        FileDisk::open(&config.device.mmc_image, mmc_blocks)
            .await
            .context("opening eMMC image")?,
    );

    let mut keyring = Keyring::new(se.clone(), mmc.clone());
    keyring.init(false).await.context("keyring init")?;

    let leds: Arc<SoftLeds> = Arc::new(SoftLeds::default());
    let pairing_complete = Arc::new(Notify::new());
    let (ums_tx, mut ums_rx) = mpsc::unbounded_channel();

    // SD detection decides between the encrypted volume and pairing mode
    let sd: Option<Arc<dyn BlockDev>> = match &config.device.sd_image {
        Some(path) => match FileDisk::open_existing(path).await {
            Ok(disk) => Some(Arc::new(disk)),
            Err(e) => {
                warn!("SD image unavailable: {e}  (entering pairing mode)");
                None
            }
        },
        None => None,
    };

    let mut pairing_nonce = None;
    let mut pairing_disk = None;

    let drive = match sd {
        Some(sd) => Arc::new(Drive::new(sd, config.fde.block_multiplier)),
        None => {
            let nonce = u64::from_be_bytes(
                vdrive_crypto::random(8).try_into().expect("8 byte nonce"),
            );

            let code = qr::pairing_code(&mut keyring, &config.device.ble_name, nonce)?;
            let checkpoint = keyring
                .conf
                .proof_bundle
                .as_ref()
                .map(|pb| pb.new_checkpoint.clone());

            let disk = Arc::new(PairingDisk::build(&code, REVISION, checkpoint.as_deref())?);

            let drive = Arc::new(Drive::new(disk.clone(), config.fde.block_multiplier));
            drive.set_backend(disk.clone(), true);
            drive.set_ready(true);

            pairing_nonce = Some(nonce);
            pairing_disk = Some(disk);

            info!(ble_name = %config.device.ble_name, "pairing mode: QR disk advertised");
            drive
        }
    };

    let mut handler = Handler::new(
        keyring,
        drive.clone(),
        leds.clone(),
        pairing_complete.clone(),
        REVISION,
    );

    if let Some(nonce) = pairing_nonce {
        handler.start_pairing(nonce);
        tokio::spawn(blink(leds.clone(), pairing_complete.clone()));
    } else {
        leds.set(Led::Blue, true);
    }

    let handler = Arc::new(Mutex::new(handler));
    let ums = Arc::new(Mutex::new(UmsHandler::new(
        drive.clone(),
        leds.clone(),
        ums_tx,
    )));

    let updater = Updater::new(
        mmc.clone(),
        leds.clone(),
        AuthKeys::from_config(&config.ota)?,
    );

    // transports
    let uart_path = config.daemon.uart_socket.clone();
    let uart_handler = handler.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::serve_uart(&uart_path, uart_handler).await {
            tracing::error!("BLE UART transport failed: {e}");
        }
    });

    let bulk_path = config.daemon.uart_socket.with_extension("bulk");
    let bulk_ums = ums.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::serve_bulk(&bulk_path, bulk_ums).await {
            tracing::error!("USB bulk transport failed: {e}");
        }
    });

    // storage-side events drive key teardown and the update check
    while let Some(event) = ums_rx.recv().await {
        match event {
            UmsEvent::Eject => {
                let mut handler = handler.lock().await;

                if let Err(e) = handler.keyring.set_cipher(CipherKind::None, &[0u8; 16]) {
                    warn!("cipher teardown failed: {e}");
                }

                info!("volume ejected, drive locked");
            }
            UmsEvent::PairingEject => {
                pairing_complete.notify_waiters();

                let Some(disk) = &pairing_disk else {
                    continue;
                };

                match disk.update_archive() {
                    Ok(Some(archive)) => {
                        let mut handler = handler.lock().await;
                        let _ = updater.run(&archive, &mut handler.keyring).await;
                    }
                    Ok(None) => info!("pairing disk ejected, no update archive"),
                    Err(e) => warn!("pairing disk scan failed: {e}"),
                }
            }
        }
    }

    Ok(())
}

fn element(config: &VdriveConfig) -> Result<SoftElement> {
    match &config.device.element_seed {
        Some(seed_hex) => {
            let seed: [u8; 32] = hex::decode(seed_hex)
                .context("parsing element_seed")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("element_seed must be 32 bytes"))?;

            Ok(SoftElement::new(seed))
        }
        None => {
            warn!("no element_seed configured, device identity is ephemeral");
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            Ok(SoftElement::new(seed))
        }
    }
}

/// Pairing feedback: 1 Hz blue blink until the pairing concludes.
async fn blink(leds: Arc<SoftLeds>, done: Arc<Notify>) {
    let mut on = false;

    loop {
        tokio::select! {
            _ = done.notified() => {
                leds.set(Led::Blue, false);
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                on = !on;
                leds.set(Led::Blue, on);
            }
        }
    }
}
