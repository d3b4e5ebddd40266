use std::path::PathBuf;

use dicom_core::Tag;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to establish association with {addr}: {source}")]
    Association {
        addr: String,
        #[source]
        source: Box<dicom_ul::association::Error>,
    },
    #[error("Association protocol error: {0}")]
    Protocol(#[source] Box<dicom_ul::association::Error>),
    #[error("Failed to read file meta from {}: {message}", .path.display())]
    Probe { path: PathBuf, message: String },
    #[error("Could not construct DIMSE command: {0}")]
    CreateCommand(#[source] Box<dicom_object::WriteError>),
    #[error("Failed to encode dataset for the wire: {0}")]
    WriteDataset(#[source] Box<dicom_object::WriteError>),
    #[error("Failed to decode response dataset: {0}")]
    ReadDataset(#[source] Box<dicom_object::ReadError>),
    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),
    #[error("Missing attribute {0} in response")]
    MissingAttribute(Tag),
    #[error("Unexpected PDU received from peer")]
    UnexpectedPdu,
    #[error(transparent)]
    Dicom(#[from] dcmkit_common::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
