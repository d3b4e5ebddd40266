use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dicom_object::DefaultDicomObject;
use tracing::{debug, info};

use dcmkit_common::CancelFlag;
use dcmkit_common::dicom::read_full;

use crate::rules::{
    DateTimeFormatRule, DuplicateUidRule, PersonNameFormatRule, PixelDataRule, RequiredTagsRule,
    SeriesConsistencyRule, StudyConsistencyRule, TransferSyntaxRule, UidFormatRule,
    ValidationRule, ValueRepresentationRule,
};
use crate::stats::{self, CollectionStatistics};
use crate::{Severity, ValidationIssue};

/// Findings for one file.
#[derive(Debug)]
pub struct ValidationResult {
    pub file_path: PathBuf,
    pub issues: Vec<ValidationIssue>,
    pub is_valid_dicom: bool,
}

impl ValidationResult {
    fn new(file_path: PathBuf) -> Self {
        ValidationResult {
            file_path,
            issues: Vec::new(),
            is_valid_dicom: true,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Warning)
    }

    pub fn issues_by_severity(&self, severity: Severity) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == severity)
            .collect()
    }
}

/// Findings and statistics for a whole collection. File results are
/// keyed (and therefore reported) in path order regardless of the order
/// in which they were produced.
#[derive(Debug, Default)]
pub struct CollectionValidationResult {
    pub file_results: BTreeMap<PathBuf, ValidationResult>,
    pub collection_issues: Vec<ValidationIssue>,
    pub statistics: CollectionStatistics,
    pub cancelled: bool,
}

/// Aggregate counts over a collection result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSummary {
    pub total_files: usize,
    pub files_with_errors: usize,
    pub files_with_warnings: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub valid_files: usize,
}

impl CollectionValidationResult {
    pub fn summary(&self) -> CollectionSummary {
        let total_files = self.file_results.len();
        let files_with_errors = self
            .file_results
            .values()
            .filter(|r| r.has_errors())
            .count();
        let files_with_warnings = self
            .file_results
            .values()
            .filter(|r| r.has_warnings())
            .count();
        let count = |severity: Severity| {
            self.file_results
                .values()
                .map(|r| r.issues_by_severity(severity).len())
                .sum::<usize>()
                + self
                    .collection_issues
                    .iter()
                    .filter(|i| i.severity == severity)
                    .count()
        };
        CollectionSummary {
            total_files,
            files_with_errors,
            files_with_warnings,
            total_errors: count(Severity::Error),
            total_warnings: count(Severity::Warning),
            valid_files: total_files - files_with_errors,
        }
    }
}

/// Applies the standard rule set to files and collections.
pub struct DicomValidator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl DicomValidator {
    pub fn new() -> Self {
        let rules: Vec<Box<dyn ValidationRule>> = vec![
            Box::new(RequiredTagsRule),
            Box::new(UidFormatRule::new()),
            Box::new(DateTimeFormatRule::new()),
            Box::new(PersonNameFormatRule),
            Box::new(ValueRepresentationRule),
            Box::new(PixelDataRule),
            Box::new(TransferSyntaxRule),
            Box::new(DuplicateUidRule),
            Box::new(StudyConsistencyRule),
            Box::new(SeriesConsistencyRule),
        ];
        info!("DICOM validator initialized with {} rules", rules.len());
        DicomValidator { rules }
    }

    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.push(rule);
    }

    /// Runs every per-file rule against one file.
    pub fn validate_file(&self, path: &Path) -> ValidationResult {
        let (result, _) = self.validate_file_keeping_dataset(path);
        result
    }

    fn validate_file_keeping_dataset(
        &self,
        path: &Path,
    ) -> (ValidationResult, Option<DefaultDicomObject>) {
        let mut result = ValidationResult::new(path.to_path_buf());
        if !path.exists() {
            result.issues.push(
                ValidationIssue::new(
                    Severity::Error,
                    "File System",
                    format!("File does not exist: {}", path.display()),
                )
                .with_file(path),
            );
            result.is_valid_dicom = false;
            return (result, None);
        }
        let obj = match read_full(path) {
            Ok(obj) => obj,
            Err(e) => {
                result.is_valid_dicom = false;
                result.issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        "DICOM Format",
                        format!("Cannot read as DICOM file: {e}"),
                    )
                    .with_file(path)
                    .with_fix("Verify file is valid DICOM format"),
                );
                return (result, None);
            }
        };
        for rule in &self.rules {
            result.issues.extend(rule.validate_dataset(&obj, path));
        }
        debug!(
            "Validated {}: {} issue(s)",
            path.display(),
            result.issues.len()
        );
        (result, Some(obj))
    }

    /// Runs per-file rules on every file, then collection rules once
    /// over all successfully parsed datasets, and derives statistics.
    pub fn validate_collection<F>(
        &self,
        paths: &[PathBuf],
        cancel: &CancelFlag,
        mut progress: F,
    ) -> CollectionValidationResult
    where
        F: FnMut(usize, usize, &str),
    {
        let mut collection = CollectionValidationResult::default();
        let mut datasets: Vec<(DefaultDicomObject, PathBuf)> = Vec::new();

        for (index, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                collection.cancelled = true;
                break;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            progress(index + 1, paths.len(), &name);
            let (result, dataset) = self.validate_file_keeping_dataset(path);
            collection.file_results.insert(path.clone(), result);
            if let Some(obj) = dataset {
                datasets.push((obj, path.clone()));
            }
        }

        if !collection.cancelled {
            for rule in &self.rules {
                collection
                    .collection_issues
                    .extend(rule.validate_collection(&datasets));
            }
        }
        collection.statistics = stats::generate(&datasets);
        collection
    }
}

impl Default for DicomValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
    use dicom_dictionary_std::tags;
    use dicom_dictionary_std::uids::CT_IMAGE_STORAGE;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use tempfile::TempDir;

    use super::*;

    struct FileSpec<'a> {
        sop_uid: &'a str,
        patient_id: &'a str,
        study_uid: &'a str,
        series_uid: &'a str,
        study_date: &'a str,
        modality: &'a str,
    }

    impl Default for FileSpec<'_> {
        fn default() -> Self {
            FileSpec {
                sop_uid: "1.2.3.1",
                patient_id: "P1",
                study_uid: "1.2.3",
                series_uid: "1.2.3.9",
                study_date: "20230615",
                modality: "OT",
            }
        }
    }

    fn write_file(dir: &Path, name: &str, spec: &FileSpec) -> PathBuf {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.sop_uid),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(spec.patient_id),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.study_uid),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.series_uid),
        ));
        obj.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from(spec.study_date),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from(spec.modality),
        ));
        let path = dir.join(name);
        let file_obj = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(dicom_transfer_syntax_registry::default().erased().uid())
                    .media_storage_sop_class_uid(CT_IMAGE_STORAGE),
            )
            .unwrap();
        file_obj.write_to_file(&path).unwrap();
        path
    }

    fn run_collection(validator: &DicomValidator, paths: &[PathBuf]) -> CollectionValidationResult {
        validator.validate_collection(paths, &CancelFlag::new(), |_, _, _| {})
    }

    #[test]
    fn well_formed_file_has_no_required_tag_errors() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "ok.dcm", &FileSpec::default());

        let validator = DicomValidator::new();
        let result = validator.validate_file(&path);
        assert!(result.is_valid_dicom);
        let required_tag_errors: Vec<_> = result
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Error && i.category == "Compliance")
            .collect();
        assert!(required_tag_errors.is_empty(), "{required_tag_errors:?}");
    }

    #[test]
    fn missing_identity_tags_are_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bare.dcm");
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3.1"),
        ));
        let file_obj = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(dicom_transfer_syntax_registry::default().erased().uid())
                    .media_storage_sop_class_uid(CT_IMAGE_STORAGE),
            )
            .unwrap();
        file_obj.write_to_file(&path).unwrap();

        let validator = DicomValidator::new();
        let result = validator.validate_file(&path);
        assert!(result.has_errors());
        let missing: Vec<_> = result
            .issues
            .iter()
            .filter(|i| i.message.starts_with("Missing required tag"))
            .collect();
        assert_eq!(missing.len(), 3); // PatientID, StudyInstanceUID, SeriesInstanceUID
    }

    #[test]
    fn invalid_uid_and_date_are_flagged() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "bad.dcm",
            &FileSpec {
                study_uid: "1.2.3",
                study_date: "20231345",
                ..Default::default()
            },
        );
        // overwrite with an invalid series UID
        let mut obj = dcmkit_common::read_full(&path).unwrap();
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("not-a-uid"),
        ));
        dcmkit_common::write_object(obj, &path).unwrap();

        let validator = DicomValidator::new();
        let result = validator.validate_file(&path);
        assert!(
            result
                .issues
                .iter()
                .any(|i| i.message.contains("Invalid UID format"))
        );
        assert!(
            result
                .issues
                .iter()
                .any(|i| i.message.contains("Invalid date format"))
        );
    }

    #[test]
    fn duplicate_sop_instance_uid_is_one_collection_error_naming_both_files() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for index in 0..5 {
            let uid = if index == 1 || index == 3 {
                "1.2.3.42".to_string()
            } else {
                format!("1.2.3.{index}")
            };
            paths.push(write_file(
                dir.path(),
                &format!("f{index}.dcm"),
                &FileSpec {
                    sop_uid: &uid,
                    series_uid: &format!("1.2.3.9.{index}"),
                    ..Default::default()
                },
            ));
        }

        let validator = DicomValidator::new();
        let collection = run_collection(&validator, &paths);
        let duplicates: Vec<_> = collection
            .collection_issues
            .iter()
            .filter(|i| i.category == "Integrity" && i.severity == Severity::Error)
            .collect();
        assert_eq!(duplicates.len(), 1);
        let message = &duplicates[0].message;
        assert!(message.contains("1.2.3.42"));
        assert!(message.contains("f1.dcm") && message.contains("f3.dcm"), "{message}");
    }

    #[test]
    fn study_patient_mismatch_is_error_and_date_mismatch_is_warning() {
        let dir = TempDir::new().unwrap();
        let a = write_file(dir.path(), "a.dcm", &FileSpec::default());
        let b = write_file(
            dir.path(),
            "b.dcm",
            &FileSpec {
                sop_uid: "1.2.3.2",
                patient_id: "P2",
                study_date: "20230616",
                ..Default::default()
            },
        );

        let validator = DicomValidator::new();
        let collection = run_collection(&validator, &[a, b]);
        assert!(
            collection
                .collection_issues
                .iter()
                .any(|i| i.severity == Severity::Error
                    && i.message.contains("Inconsistent Patient IDs"))
        );
        assert!(
            collection
                .collection_issues
                .iter()
                .any(|i| i.severity == Severity::Warning
                    && i.message.contains("Inconsistent Study Dates"))
        );
    }

    #[test]
    fn series_modality_mismatch_is_warning() {
        let dir = TempDir::new().unwrap();
        let a = write_file(dir.path(), "a.dcm", &FileSpec::default());
        let b = write_file(
            dir.path(),
            "b.dcm",
            &FileSpec {
                sop_uid: "1.2.3.2",
                modality: "MR",
                ..Default::default()
            },
        );

        let validator = DicomValidator::new();
        let collection = run_collection(&validator, &[a, b]);
        assert!(
            collection
                .collection_issues
                .iter()
                .any(|i| i.severity == Severity::Warning
                    && i.message.contains("Inconsistent Modalities"))
        );
    }

    #[test]
    fn statistics_count_unique_entities() {
        let dir = TempDir::new().unwrap();
        let a = write_file(dir.path(), "a.dcm", &FileSpec::default());
        let b = write_file(
            dir.path(),
            "b.dcm",
            &FileSpec {
                sop_uid: "1.2.3.2",
                series_uid: "1.2.3.8",
                modality: "CT",
                ..Default::default()
            },
        );

        let validator = DicomValidator::new();
        let collection = run_collection(&validator, &[a, b]);
        let stats = &collection.statistics;
        assert_eq!(stats.total_instances, 2);
        assert_eq!(stats.unique_patients, 1);
        assert_eq!(stats.unique_studies, 1);
        assert_eq!(stats.unique_series, 2);
        assert_eq!(stats.modality_distribution.get("OT"), Some(&1));
        assert_eq!(stats.modality_distribution.get("CT"), Some(&1));
        let patient_presence = stats
            .tag_presence
            .get(&Tag(0x0010, 0x0020).to_string())
            .unwrap();
        assert_eq!(patient_presence.present, 2);
        assert_eq!(patient_presence.percentage, 100.0);
    }

    #[test]
    fn unreadable_file_is_invalid_but_collection_continues() {
        let dir = TempDir::new().unwrap();
        let good = write_file(dir.path(), "good.dcm", &FileSpec::default());
        let bad = dir.path().join("bad.bin");
        std::fs::write(&bad, b"this is definitely not a dicom file").unwrap();

        let validator = DicomValidator::new();
        let collection = run_collection(&validator, &[bad.clone(), good.clone()]);
        assert_eq!(collection.file_results.len(), 2);
        assert!(!collection.file_results[&bad].is_valid_dicom);
        assert!(collection.file_results[&good].is_valid_dicom);
        assert_eq!(collection.statistics.total_instances, 1);

        let summary = collection.summary();
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.files_with_errors, 1);
        assert_eq!(summary.valid_files, 1);
    }

    #[test]
    fn report_is_ordered_by_path() {
        let dir = TempDir::new().unwrap();
        let z = write_file(dir.path(), "z.dcm", &FileSpec::default());
        let a = write_file(
            dir.path(),
            "a.dcm",
            &FileSpec {
                sop_uid: "1.2.3.2",
                ..Default::default()
            },
        );

        let validator = DicomValidator::new();
        // hand the files over in reverse order on purpose
        let collection = run_collection(&validator, &[z.clone(), a.clone()]);
        let ordered: Vec<_> = collection.file_results.keys().cloned().collect();
        assert_eq!(ordered, vec![a, z]);
    }
}
