pub mod cancel;
pub mod dicom;
pub mod fs;

pub use cancel::CancelFlag;
pub use dicom::{
    Error, Result, generate_uid, is_dicom_file, read_full, read_metadata, write_object,
};
