use std::path::{Path, PathBuf};

use dicom_encoding::TransferSyntaxIndex;
use dicom_pixeldata::{PixelDecoder, Transcode};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_dictionary_std::uids;
use tracing::{debug, info, warn};

use dcmkit_common::dicom::{read_full, write_object};

/// Compressed source syntaxes that trigger a transcode when the peer
/// rejects the native format.
pub const COMPRESSED_SOURCE_SYNTAXES: &[&str] = &[
    uids::JPEG2000_LOSSLESS,
    uids::JPEG2000,
    uids::JPEG_BASELINE8_BIT,
    uids::JPEG_EXTENDED12_BIT,
    uids::JPEG_LOSSLESS,
    uids::JPEG_LOSSLESS_SV1,
    uids::JPEGLS_LOSSLESS,
    uids::JPEGLS_NEAR_LOSSLESS,
];

/// Result of preparing one rejected file for retry.
#[derive(Debug)]
pub(crate) struct PreparedFile {
    /// The file to send: a sidecar when transcoding succeeded, the
    /// original otherwise.
    pub path: PathBuf,
    pub converted: bool,
}

/// Converts a format-rejected file to Explicit VR Little Endian in a
/// sidecar below `sidecar_dir`, validating the conversion by reading it
/// back. Any failure falls back to the original file.
pub(crate) fn prepare_for_retry(path: &Path, sidecar_dir: &Path) -> PreparedFile {
    let original = PreparedFile {
        path: path.to_path_buf(),
        converted: false,
    };
    let obj = match read_full(path) {
        Ok(obj) => obj,
        Err(e) => {
            warn!("Cannot read {} for transcoding: {}", path.display(), e);
            return original;
        }
    };
    let source_ts = obj.meta().transfer_syntax().trim_end_matches('\0').to_string();
    if !COMPRESSED_SOURCE_SYNTAXES.contains(&source_ts.as_str()) {
        debug!(
            "No conversion needed for {} ({})",
            path.display(),
            source_ts
        );
        return original;
    }

    info!("Converting {} from {}", path.display(), source_ts);
    let Some(target_ts) = TransferSyntaxRegistry.get(uids::EXPLICIT_VR_LITTLE_ENDIAN) else {
        warn!("Explicit VR Little Endian is not in the transfer syntax registry");
        return original;
    };
    let mut converted = obj;
    if let Err(e) = converted.transcode(target_ts) {
        warn!("Failed to transcode {}: {}", path.display(), e);
        return original;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "instance".to_string());
    let sidecar = sidecar_dir.join(format!("{file_name}.converted.dcm"));
    if let Err(e) = write_object(converted, &sidecar) {
        warn!("Failed to write transcoded sidecar for {}: {}", path.display(), e);
        return original;
    }

    if validate_transcoded(&sidecar, path) {
        info!("Successfully converted and validated {}", path.display());
        PreparedFile {
            path: sidecar,
            converted: true,
        }
    } else {
        warn!(
            "Converted file failed validation, sending original: {}",
            path.display()
        );
        let _ = std::fs::remove_file(&sidecar);
        original
    }
}

/// A transcoded sidecar must be readable, carry the uncompressed
/// transfer syntax, and decode to the same pixel geometry as its
/// source.
fn validate_transcoded(sidecar: &Path, original: &Path) -> bool {
    let Ok(converted) = read_full(sidecar) else {
        return false;
    };
    if converted.meta().transfer_syntax().trim_end_matches('\0')
        != uids::EXPLICIT_VR_LITTLE_ENDIAN
    {
        return false;
    }
    let Ok(source) = read_full(original) else {
        return false;
    };
    let (Ok(converted_pixels), Ok(source_pixels)) =
        (converted.decode_pixel_data(), source.decode_pixel_data())
    else {
        return false;
    };
    converted_pixels.rows() == source_pixels.rows()
        && converted_pixels.columns() == source_pixels.columns()
        && converted_pixels.number_of_frames() == source_pixels.number_of_frames()
        && converted_pixels.samples_per_pixel() == source_pixels.samples_per_pixel()
}
