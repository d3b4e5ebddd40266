//! Template-driven anonymization of DICOM files with run-scoped UID
//! remapping and date shifting.

mod builtin;
mod date;
mod engine;
mod store;
mod template;
mod uid;

pub use builtin::builtin_templates;
pub use date::DateShifter;
pub use engine::{AnonymizationEngine, AnonymizationResult, RunSummary};
pub use store::TemplateStore;
pub use template::{AnonymizationAction, AnonymizationRule, AnonymizationTemplate};
pub use uid::UidMapper;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode templates: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
