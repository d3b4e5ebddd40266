use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use dicom_core::Tag;
use dicom_dictionary_std::tags::{PIXEL_DATA, SOP_CLASS_UID};
use dicom_object::{
    DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject, OpenFileOptions, ReadError,
    WriteError,
};
use tracing::debug;

/// Implementation class UID written into the file meta group of every
/// dataset produced by this tool.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828748093849841973836826270922126124";
/// Implementation version name written next to [`IMPLEMENTATION_CLASS_UID`].
pub const IMPLEMENTATION_VERSION_NAME: &str = "DCMKIT_01";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not a DICOM file: {}", .0.display())]
    NotADicomFile(PathBuf),
    #[error("Truncated DICOM file: {}", .0.display())]
    Truncated(PathBuf),
    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),
    #[error("Failed to read DICOM data: {0}")]
    Read(#[from] ReadError),
    #[error("Failed to write DICOM data: {0}")]
    Write(#[from] WriteError),
    #[error("Failed to assemble file meta group: {0}")]
    Meta(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reads a DICOM file, loading every element up to (but not including)
/// the pixel data.
///
/// This is the cheap read used for hierarchy building, validation of
/// header content and DICOMDIR generation. Files that fail the DICOM
/// detection heuristic are reported as [`Error::NotADicomFile`] rather
/// than as a parse error.
pub fn read_metadata<P>(path: P) -> Result<DefaultDicomObject>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    debug!("Reading DICOM metadata from: {}", path.display());
    match OpenFileOptions::new().read_until(PIXEL_DATA).open_file(path) {
        Ok(obj) => Ok(obj),
        Err(e) => Err(classify_read_error(e, path)),
    }
}

/// Reads a DICOM file in full, including pixel data.
///
/// Required before decompression, transcoding and any write-back.
pub fn read_full<P>(path: P) -> Result<DefaultDicomObject>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    debug!("Reading full DICOM dataset from: {}", path.display());
    match dicom_object::open_file(path) {
        Ok(obj) => Ok(obj),
        Err(e) => Err(classify_read_error(e, path)),
    }
}

fn classify_read_error(e: ReadError, path: &Path) -> Error {
    if !is_dicom_file(path) {
        return Error::NotADicomFile(path.to_path_buf());
    }
    // a stream that ends mid-element is a truncation, not a parse bug
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return Error::Truncated(path.to_path_buf());
            }
        }
        source = current.source();
    }
    Error::Read(e)
}

/// Writes a dataset back to `path` with a rebuilt file meta group.
///
/// The media storage SOP class/instance UIDs are mirrored from the
/// dataset so that writes stay consistent after tag mutation, and the
/// implementation class UID and version name of this tool are always
/// emitted. The transfer syntax of the source object is kept.
pub fn write_object<P>(obj: DefaultDicomObject, path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let transfer_syntax = obj.meta().transfer_syntax().trim_end_matches('\0').to_string();
    let inner = obj.into_inner();
    let sop_class_uid = get_str_or_default(&inner, SOP_CLASS_UID);
    let file_obj = inner
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(transfer_syntax)
                .media_storage_sop_class_uid(sop_class_uid)
                .implementation_class_uid(IMPLEMENTATION_CLASS_UID)
                .implementation_version_name(IMPLEMENTATION_VERSION_NAME),
        )
        .map_err(|e| Error::Meta(e.to_string()))?;
    debug!("Writing DICOM dataset to: {}", path.display());
    file_obj.write_to_file(path)?;
    Ok(())
}

/// Checks whether a file looks like DICOM without parsing it.
///
/// `.dcm` extensions are accepted outright. Otherwise the `DICM` magic at
/// offset 128 is checked, and as a last resort the first bytes are
/// scanned for the little-endian group patterns `0x0008`/`0x0010` that a
/// preamble-less part-10 stream would start with.
pub fn is_dicom_file<P>(path: P) -> bool
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("dcm"))
        .unwrap_or(false)
    {
        return true;
    }
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut preamble = [0u8; 132];
    if file.read_exact(&mut preamble).is_ok() && &preamble[128..132] == b"DICM" {
        return true;
    }
    if file.seek(SeekFrom::Start(0)).is_err() {
        return false;
    }
    let mut head = [0u8; 256];
    let n = file.read(&mut head).unwrap_or(0);
    head[..n.min(32)]
        .windows(2)
        .any(|w| w == [0x08, 0x00] || w == [0x10, 0x00])
}

/// Generates a DICOM-valid unique identifier.
///
/// Uses the UUID-derived `2.25.<decimal>` form, which needs no
/// registration authority and stays well below the 64 character limit.
pub fn generate_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

fn get_str_internal(obj: &InMemDicomObject, tag: Tag, log_errors: bool) -> Option<String> {
    let elem = match obj.element_opt(tag) {
        Ok(Some(elem)) => elem,
        Ok(None) => return None,
        Err(e) => {
            if log_errors {
                debug!("Unable to access element {}: {}", tag, e);
            }
            return None;
        }
    };
    match elem.to_str() {
        Ok(value) => Some(value.chars().filter(|c| *c != '\0').collect::<String>().trim().to_string()),
        Err(e) => {
            if log_errors {
                debug!("Unable to convert element {} to string: {}", tag, e);
            }
            None
        }
    }
}

/// Get the string value of an element, trimmed and with padding
/// characters removed. `None` when the element is absent or not
/// convertible.
pub fn get_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    get_str_internal(obj, tag, true)
}

/// Like [`get_str`], but an absent or unconvertible element yields an
/// empty string.
pub fn get_str_or_default(obj: &InMemDicomObject, tag: Tag) -> String {
    get_str_internal(obj, tag, false).unwrap_or_default()
}

/// Get an element value as an integer, if present and convertible.
pub fn get_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    let elem = obj.element_opt(tag).ok().flatten()?;
    elem.to_int::<i64>()
        .ok()
        .or_else(|| get_str_internal(obj, tag, false)?.parse::<i64>().ok())
}
