//! Pairing QR code: a signed record of the advertised BLE identity.

use qrcode::{EcLevel, QrCode};

use vdrive_core::{VdriveError, VdriveResult};
use vdrive_crypto::{KeyIndex, Keyring};
use vdrive_proto::wire::{PairingQrCode, Signature};

/// Rendered code edge length in pixels (including the quiet zone).
pub const QR_CODE_SIZE: u32 = 117;

/// Generate the pairing code for a fresh advertisement.
///
/// A new UA long-term key is minted here; it is persisted only if the
/// pairing completes.
pub fn pairing_code(keyring: &mut Keyring, ble_name: &str, nonce: u64) -> VdriveResult<Vec<u8>> {
    keyring.new_longterm_key();

    let pub_key = keyring.export(KeyIndex::UaLongterm, false)?;

    let mut record = PairingQrCode {
        ble_name: ble_name.to_string(),
        nonce,
        pub_key,
        signature: None,
    };

    let sig = keyring.sign(&signed_data(&record), false)?;

    record.signature = Some(Signature {
        data: sig.digest.to_vec(),
        r: sig.r.to_vec(),
        s: sig.s.to_vec(),
    });

    render_png(&record.to_bytes())
}

/// The signature covers `ble_name ‖ BE64(nonce) ‖ pubkey`.
pub fn signed_data(record: &PairingQrCode) -> Vec<u8> {
    let mut data = Vec::with_capacity(record.ble_name.len() + 8 + record.pub_key.len());
    data.extend_from_slice(record.ble_name.as_bytes());
    data.extend_from_slice(&record.nonce.to_be_bytes());
    data.extend_from_slice(&record.pub_key);
    data
}

/// Render the record into a grayscale PNG of roughly [`QR_CODE_SIZE`] pixels.
fn render_png(data: &[u8]) -> VdriveResult<Vec<u8>> {
    let code = QrCode::with_error_correction_level(data, EcLevel::M)
        .map_err(|e| VdriveError::Other(anyhow::anyhow!("QR encoding: {e}")))?;

    let width = code.width();
    let quiet = 4;
    let scale = (QR_CODE_SIZE as usize / (width + 2 * quiet)).max(1);
    let size = (width + 2 * quiet) * scale;

    let colors = code.to_colors();
    let mut pixels = vec![0xFFu8; size * size];

    for y in 0..width {
        for x in 0..width {
            if colors[y * width + x] == qrcode::Color::Dark {
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = (x + quiet) * scale + dx;
                        let py = (y + quiet) * scale + dy;
                        pixels[py * size + px] = 0x00;
                    }
                }
            }
        }
    }

    let mut out = Vec::new();

    {
        let mut encoder = png::Encoder::new(&mut out, size as u32, size as u32);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Eight);

        let mut writer = encoder
            .write_header()
            .map_err(|e| VdriveError::Other(anyhow::anyhow!("PNG header: {e}")))?;
        writer
            .write_image_data(&pixels)
            .map_err(|e| VdriveError::Other(anyhow::anyhow!("PNG data: {e}")))?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vdrive_core::soft::{MemDisk, SoftElement};
    use vdrive_crypto::persist::CONF_BLOCKS_V2;
    use vdrive_crypto::sign::{verify, EcdsaSig};
    use p256::pkcs8::DecodePublicKey;

    async fn keyring() -> Keyring {
        let se = Arc::new(SoftElement::new([8u8; 32]));
        let mmc = Arc::new(MemDisk::new(CONF_BLOCKS_V2 as u64 + 16, 512));
        let mut kr = Keyring::with_conf_lba(se, mmc, 0);
        kr.init(false).await.unwrap();
        kr
    }

    #[tokio::test]
    async fn test_pairing_code_is_png() {
        let mut kr = keyring().await;
        let png = pairing_code(&mut kr, "VD-1234", 42).unwrap();

        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[tokio::test]
    async fn test_signature_binds_name_nonce_key() {
        let mut kr = keyring().await;
        pairing_code(&mut kr, "VD-1234", 7).unwrap();

        // rebuild the record the way a scanning client would and verify
        let pub_key = kr.export(KeyIndex::UaLongterm, false).unwrap();
        let record = PairingQrCode {
            ble_name: "VD-1234".into(),
            nonce: 7,
            pub_key: pub_key.clone(),
            signature: None,
        };

        let sig = kr.sign(&signed_data(&record), false).unwrap();
        let armory = p256::PublicKey::from_public_key_der(&pub_key).unwrap();
        verify(&armory, &signed_data(&record), &sig).unwrap();

        // a different nonce must not verify
        let mut tampered = record;
        tampered.nonce = 8;
        assert!(verify(
            &armory,
            &signed_data(&tampered),
            &EcdsaSig {
                digest: sig.digest,
                r: sig.r,
                s: sig.s
            }
        )
        .is_err());
    }
}
