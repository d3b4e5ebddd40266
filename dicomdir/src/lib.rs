//! Media-storage directory (DICOMDIR) generation and the export modes
//! built on top of it.

mod builder;
mod export;
mod paths;

pub use builder::{DicomdirBuilder, DicomdirSummary, read_referenced_files, validate_dicomdir};
pub use export::{ExportReport, export_dicomdir_zip, export_flat, export_zip};
pub use paths::generate_paths;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No valid DICOM files found for export")]
    NoValidFiles,
    #[error("Generated DICOMDIR failed validation: {0}")]
    InvalidDicomdir(String),
    #[error("Referenced file does not exist: {}", .0.display())]
    DanglingReference(PathBuf),
    #[error(transparent)]
    Dicom(#[from] dcmkit_common::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
