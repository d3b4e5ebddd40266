//! Compliance checking of DICOM files and collections.
//!
//! Individual rules implement [`ValidationRule`]; the
//! [`DicomValidator`] dispatches per-file rules through
//! [`DicomValidator::validate_file`] and both rule kinds through
//! [`DicomValidator::validate_collection`].

mod rules;
mod stats;
mod validator;

pub use rules::{
    DateTimeFormatRule, DuplicateUidRule, PersonNameFormatRule, PixelDataRule, RequiredTagsRule,
    SeriesConsistencyRule, StudyConsistencyRule, TransferSyntaxRule, UidFormatRule,
    ValidationRule, ValueRepresentationRule,
};
pub use stats::{CollectionStatistics, TagPresence};
pub use validator::{
    CollectionSummary, CollectionValidationResult, DicomValidator, ValidationResult,
};

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Error => "Error",
            Severity::Warning => "Warning",
            Severity::Info => "Info",
        };
        f.write_str(name)
    }
}

/// One finding produced by a validation rule.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub tag: Option<String>,
    pub file_path: Option<PathBuf>,
    pub suggested_fix: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationIssue {
    pub fn new<C, M>(severity: Severity, category: C, message: M) -> Self
    where
        C: Into<String>,
        M: Into<String>,
    {
        ValidationIssue {
            severity,
            category: category.into(),
            message: message.into(),
            tag: None,
            file_path: None,
            suggested_fix: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tag<T: ToString>(mut self, tag: T) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn with_file(mut self, path: &std::path::Path) -> Self {
        self.file_path = Some(path.to_path_buf());
        self
    }

    pub fn with_fix<F: Into<String>>(mut self, fix: F) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)
    }
}
