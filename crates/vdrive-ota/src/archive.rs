//! Update archive extraction.

use std::io::{Cursor, Read};

use vdrive_core::{VdriveError, VdriveResult};

/// Raw firmware image entry.
pub const IMX_PATH: &str = "armory-drive.imx";

/// Secure-boot signature block entry.
pub const CSF_PATH: &str = "armory-drive.csf";

/// Transparency-log proof bundle entry.
pub const PROOF_PATH: &str = "armory-drive.log";

/// Extract `(imx, csf, proof)` from a zip archive. The proof entry may be
/// absent (development archives); it comes back empty then.
pub fn extract(buf: &[u8]) -> VdriveResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(buf))
        .map_err(|e| VdriveError::Ota(format!("invalid update archive: {e}")))?;

    let imx = read_entry(&mut archive, IMX_PATH)?
        .ok_or_else(|| VdriveError::Ota("invalid update file, missing imx entry".into()))?;

    let csf = read_entry(&mut archive, CSF_PATH)?
        .ok_or_else(|| VdriveError::Ota("invalid update file, missing csf entry".into()))?;

    let proof = read_entry(&mut archive, PROOF_PATH)?.unwrap_or_default();

    Ok((imx, csf, proof))
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> VdriveResult<Option<Vec<u8>>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(VdriveError::Ota(format!("invalid update file: {e}"))),
    };

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)
        .map_err(|e| VdriveError::Ota(format!("could not read {name}: {e}")))?;

    Ok(Some(data))
}

/// Build an archive from entries (release tooling and tests).
pub fn build(entries: &[(&str, &[u8])]) -> VdriveResult<Vec<u8>> {
    use std::io::Write;

    let mut cursor = Cursor::new(Vec::new());

    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, data) in entries {
            writer
                .start_file(*name, options)
                .map_err(|e| VdriveError::Ota(format!("archive write: {e}")))?;
            writer.write_all(data).map_err(VdriveError::Io)?;
        }

        writer
            .finish()
            .map_err(|e| VdriveError::Ota(format!("archive finish: {e}")))?;
    }

    Ok(cursor.into_inner())
}
