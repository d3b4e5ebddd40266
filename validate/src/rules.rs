use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use dicom_core::dictionary::{DataDictionary, DataDictionaryEntry, VirtualVr};
use dicom_core::value::Value;
use dicom_core::VR;
use dicom_dictionary_std::tags::{
    BITS_ALLOCATED, BITS_STORED, COLUMNS, ECHO_TIME, HIGH_BIT, MODALITY, PATIENT_ID,
    PIXEL_DATA, PIXEL_REPRESENTATION, REPETITION_TIME, ROWS, SAMPLES_PER_PIXEL,
    SERIES_INSTANCE_UID, SLICE_THICKNESS, SOP_CLASS_UID, SOP_INSTANCE_UID, STUDY_DATE,
    STUDY_INSTANCE_UID,
};
use dicom_dictionary_std::{uids, StandardDataDictionary};
use dicom_object::DefaultDicomObject;
use regex::Regex;

use dcmkit_common::dicom::{get_int, get_str_or_default};

use crate::{Severity, ValidationIssue};

/// A validation rule. Concrete rules override one or both entry points;
/// the defaults report nothing.
pub trait ValidationRule {
    fn name(&self) -> &'static str;

    fn validate_dataset(&self, _obj: &DefaultDicomObject, _path: &Path) -> Vec<ValidationIssue> {
        Vec::new()
    }

    fn validate_collection(
        &self,
        _datasets: &[(DefaultDicomObject, PathBuf)],
    ) -> Vec<ValidationIssue> {
        Vec::new()
    }
}

/// Presence and non-emptiness of the identity tags every instance must
/// carry, plus modality-keyed extras.
pub struct RequiredTagsRule;

const CATEGORY_COMPLIANCE: &str = "Compliance";
const CATEGORY_FORMAT: &str = "Format";
const CATEGORY_INTEGRITY: &str = "Integrity";
const CATEGORY_CONSISTENCY: &str = "Consistency";
const CATEGORY_IMAGE_DATA: &str = "Image Data";
const CATEGORY_ENCODING: &str = "Encoding";

impl ValidationRule for RequiredTagsRule {
    fn name(&self) -> &'static str {
        "Required Tags"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let required = [
            (SOP_CLASS_UID, "SOP Class UID"),
            (SOP_INSTANCE_UID, "SOP Instance UID"),
            (PATIENT_ID, "Patient ID"),
            (STUDY_INSTANCE_UID, "Study Instance UID"),
            (SERIES_INSTANCE_UID, "Series Instance UID"),
        ];
        for (tag, name) in required {
            if obj.get(tag).is_none() {
                issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        CATEGORY_COMPLIANCE,
                        format!("Missing required tag: {name} {tag}"),
                    )
                    .with_tag(tag)
                    .with_file(path)
                    .with_fix(format!("Add {name} tag to DICOM header")),
                );
            } else if get_str_or_default(obj, tag).is_empty() {
                issues.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        CATEGORY_COMPLIANCE,
                        format!("Required tag {name} is empty"),
                    )
                    .with_tag(tag)
                    .with_file(path)
                    .with_fix(format!("Provide value for {name}")),
                );
            }
        }

        let modality = get_str_or_default(obj, MODALITY);
        let extras: &[_] = match modality.as_str() {
            "CT" => &[(SLICE_THICKNESS, "SliceThickness")],
            "MR" => &[
                (REPETITION_TIME, "RepetitionTime"),
                (ECHO_TIME, "EchoTime"),
            ],
            _ => &[],
        };
        for (tag, name) in extras {
            if obj.get(*tag).is_none() {
                issues.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        CATEGORY_COMPLIANCE,
                        format!("Missing {modality}-specific tag: {name} {tag}"),
                    )
                    .with_tag(tag)
                    .with_file(path),
                );
            }
        }
        issues
    }
}

/// Every UI element must be dotted decimal and at most 64 characters.
pub struct UidFormatRule {
    pattern: Regex,
}

impl UidFormatRule {
    pub fn new() -> Self {
        UidFormatRule {
            pattern: Regex::new(r"^[0-9]+(\.[0-9]+)*$").unwrap(),
        }
    }
}

impl Default for UidFormatRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationRule for UidFormatRule {
    fn name(&self) -> &'static str {
        "UID Format"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for elem in obj.iter() {
            if elem.vr() != VR::UI {
                continue;
            }
            let tag = elem.header().tag;
            let Ok(values) = elem.value().to_multi_str() else {
                continue;
            };
            for value in values.iter() {
                let value = value.trim_end_matches('\0').trim();
                if value.is_empty() {
                    continue;
                }
                if !self.pattern.is_match(value) {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Error,
                            CATEGORY_FORMAT,
                            format!("Invalid UID format in tag {tag}: {value}"),
                        )
                        .with_tag(tag)
                        .with_file(path)
                        .with_fix("UID must contain only digits and periods"),
                    );
                } else if value.len() > 64 {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Error,
                            CATEGORY_FORMAT,
                            format!("UID too long in tag {tag} (max 64 chars): {}", value.len()),
                        )
                        .with_tag(tag)
                        .with_file(path)
                        .with_fix("Shorten UID to 64 characters or less"),
                    );
                }
            }
        }
        issues
    }
}

/// DA values must be real calendar dates in `YYYYMMDD`; TM values must
/// match `HH(MM(SS(.F{1,6})?)?)?`.
pub struct DateTimeFormatRule {
    time_pattern: Regex,
}

impl DateTimeFormatRule {
    pub fn new() -> Self {
        DateTimeFormatRule {
            time_pattern: Regex::new(r"^\d{2}(\d{2}(\d{2}(\.\d{1,6})?)?)?$").unwrap(),
        }
    }

    fn is_valid_date(value: &str) -> bool {
        value.len() == 8 && NaiveDate::parse_from_str(value, "%Y%m%d").is_ok()
    }
}

impl Default for DateTimeFormatRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationRule for DateTimeFormatRule {
    fn name(&self) -> &'static str {
        "Date/Time Format"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for elem in obj.iter() {
            let tag = elem.header().tag;
            let vr = elem.vr();
            if vr != VR::DA && vr != VR::TM {
                continue;
            }
            let Ok(values) = elem.value().to_multi_str() else {
                continue;
            };
            for value in values.iter() {
                let value = value.trim_end_matches('\0').trim();
                if value.is_empty() {
                    continue;
                }
                if vr == VR::DA && !Self::is_valid_date(value) {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Error,
                            CATEGORY_FORMAT,
                            format!("Invalid date format in tag {tag}: {value}"),
                        )
                        .with_tag(tag)
                        .with_file(path)
                        .with_fix("Use YYYYMMDD format"),
                    );
                } else if vr == VR::TM && !self.time_pattern.is_match(value) {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Error,
                            CATEGORY_FORMAT,
                            format!("Invalid time format in tag {tag}: {value}"),
                        )
                        .with_tag(tag)
                        .with_file(path)
                        .with_fix("Use HHMMSS.FFFFFF format"),
                    );
                }
            }
        }
        issues
    }
}

/// PN components are limited to 64 characters and must not contain
/// control characters other than tab, CR and LF.
pub struct PersonNameFormatRule;

impl ValidationRule for PersonNameFormatRule {
    fn name(&self) -> &'static str {
        "Person Name Format"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for elem in obj.iter() {
            if elem.vr() != VR::PN {
                continue;
            }
            let tag = elem.header().tag;
            let Ok(value) = elem.to_str() else {
                continue;
            };
            if value
                .chars()
                .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
            {
                issues.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        CATEGORY_FORMAT,
                        format!("Person name contains control characters: {tag}"),
                    )
                    .with_tag(tag)
                    .with_file(path)
                    .with_fix("Remove control characters from person name"),
                );
            }
            for (index, component) in value.split('^').enumerate() {
                if component.len() > 64 {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Warning,
                            CATEGORY_FORMAT,
                            format!(
                                "Person name component {} too long (>64 chars): {tag}",
                                index + 1
                            ),
                        )
                        .with_tag(tag)
                        .with_file(path)
                        .with_fix("Shorten person name components to 64 chars or less"),
                    );
                }
            }
        }
        issues
    }
}

/// The element VR should match the dictionary VR. Informational only,
/// because several tags legitimately allow more than one VR.
pub struct ValueRepresentationRule;

impl ValidationRule for ValueRepresentationRule {
    fn name(&self) -> &'static str {
        "Value Representation"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for elem in obj.iter() {
            let tag = elem.header().tag;
            let Some(entry) = StandardDataDictionary.by_tag(tag) else {
                continue;
            };
            if let VirtualVr::Exact(expected) = entry.vr() {
                let found = elem.vr();
                if found != expected {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Info,
                            CATEGORY_FORMAT,
                            format!(
                                "Unexpected VR for tag {tag}: found {found}, expected {expected}"
                            ),
                        )
                        .with_tag(tag)
                        .with_file(path),
                    );
                }
            }
        }
        issues
    }
}

/// Pixel data must come with its descriptive tags, and its byte count
/// should be plausible for the stated geometry.
pub struct PixelDataRule;

impl ValidationRule for PixelDataRule {
    fn name(&self) -> &'static str {
        "Pixel Data"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let Some(pixel_data) = obj.get(PIXEL_DATA) else {
            return issues;
        };

        let required = [
            (ROWS, "Rows"),
            (COLUMNS, "Columns"),
            (BITS_ALLOCATED, "BitsAllocated"),
            (BITS_STORED, "BitsStored"),
            (HIGH_BIT, "HighBit"),
            (PIXEL_REPRESENTATION, "PixelRepresentation"),
        ];
        let mut all_present = true;
        for (tag, name) in required {
            if obj.get(tag).is_none() {
                all_present = false;
                issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        CATEGORY_IMAGE_DATA,
                        format!("Missing required pixel tag: {name} {tag}"),
                    )
                    .with_tag(tag)
                    .with_file(path)
                    .with_fix(format!("Add {name} tag for proper pixel data interpretation")),
                );
            }
        }

        if all_present {
            // the plausibility check only applies to native pixel data;
            // encapsulated fragments are legitimately much smaller
            if let Value::Primitive(primitive) = pixel_data.value() {
                let rows = get_int(obj, ROWS).unwrap_or(0);
                let columns = get_int(obj, COLUMNS).unwrap_or(0);
                let bits_allocated = get_int(obj, BITS_ALLOCATED).unwrap_or(0);
                let samples = get_int(obj, SAMPLES_PER_PIXEL).unwrap_or(1);
                let expected = rows * columns * (bits_allocated / 8).max(1) * samples;
                let actual = primitive.calculate_byte_len() as i64;
                if expected > 0 && actual < expected / 10 {
                    issues.push(
                        ValidationIssue::new(
                            Severity::Warning,
                            CATEGORY_IMAGE_DATA,
                            format!(
                                "Pixel data size unusually small: {actual} bytes (expected ~{expected})"
                            ),
                        )
                        .with_file(path)
                        .with_fix("Verify pixel data is not corrupted"),
                    );
                }
            }
        }
        issues
    }
}

/// The file meta group must name a transfer syntax; unrecognized ones
/// are reported as informational.
pub struct TransferSyntaxRule;

const RECOGNIZED_TRANSFER_SYNTAXES: &[&str] = &[
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_BIG_ENDIAN,
    uids::JPEG_BASELINE8_BIT,
    uids::JPEG2000_LOSSLESS,
    uids::JPEG2000,
    uids::RLE_LOSSLESS,
];

impl ValidationRule for TransferSyntaxRule {
    fn name(&self) -> &'static str {
        "Transfer Syntax"
    }

    fn validate_dataset(&self, obj: &DefaultDicomObject, path: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let transfer_syntax = obj.meta().transfer_syntax().trim_end_matches('\0').trim();
        if transfer_syntax.is_empty() {
            issues.push(
                ValidationIssue::new(
                    Severity::Error,
                    CATEGORY_ENCODING,
                    "Missing Transfer Syntax UID in file meta information",
                )
                .with_tag("(0002,0010)")
                .with_file(path)
                .with_fix("Add Transfer Syntax UID to file meta header"),
            );
        } else if !RECOGNIZED_TRANSFER_SYNTAXES.contains(&transfer_syntax) {
            issues.push(
                ValidationIssue::new(
                    Severity::Info,
                    CATEGORY_ENCODING,
                    format!("Unknown or uncommon Transfer Syntax: {transfer_syntax}"),
                )
                .with_tag("(0002,0010)")
                .with_file(path),
            );
        }
        issues
    }
}

/// A SOP Instance UID may only occur in one file of a collection.
pub struct DuplicateUidRule;

impl ValidationRule for DuplicateUidRule {
    fn name(&self) -> &'static str {
        "Duplicate UIDs"
    }

    fn validate_collection(
        &self,
        datasets: &[(DefaultDicomObject, PathBuf)],
    ) -> Vec<ValidationIssue> {
        let mut by_uid: BTreeMap<String, Vec<&PathBuf>> = BTreeMap::new();
        for (obj, path) in datasets {
            let uid = get_str_or_default(obj, SOP_INSTANCE_UID);
            if !uid.is_empty() {
                by_uid.entry(uid).or_default().push(path);
            }
        }
        by_uid
            .into_iter()
            .filter(|(_, files)| files.len() > 1)
            .map(|(uid, files)| {
                let listing = files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                ValidationIssue::new(
                    Severity::Error,
                    CATEGORY_INTEGRITY,
                    format!(
                        "Duplicate SOP Instance UID {uid} found in {} files: {listing}",
                        files.len()
                    ),
                )
                .with_fix("Ensure each DICOM instance has a unique SOP Instance UID")
            })
            .collect()
    }
}

/// All files of one study must agree on PatientID, and should agree on
/// StudyDate.
pub struct StudyConsistencyRule;

impl ValidationRule for StudyConsistencyRule {
    fn name(&self) -> &'static str {
        "Study Consistency"
    }

    fn validate_collection(
        &self,
        datasets: &[(DefaultDicomObject, PathBuf)],
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut studies: BTreeMap<String, Vec<&DefaultDicomObject>> = BTreeMap::new();
        for (obj, _) in datasets {
            let study_uid = get_str_or_default(obj, STUDY_INSTANCE_UID);
            if !study_uid.is_empty() {
                studies.entry(study_uid).or_default().push(obj);
            }
        }
        for (study_uid, members) in studies {
            if members.len() < 2 {
                continue;
            }
            let patient_ids: std::collections::BTreeSet<String> = members
                .iter()
                .map(|obj| get_str_or_default(obj, PATIENT_ID))
                .collect();
            if patient_ids.len() > 1 {
                issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        CATEGORY_CONSISTENCY,
                        format!(
                            "Inconsistent Patient IDs in study {study_uid}: {patient_ids:?}"
                        ),
                    )
                    .with_fix("All instances in a study must have the same Patient ID"),
                );
            }
            let study_dates: std::collections::BTreeSet<String> = members
                .iter()
                .map(|obj| get_str_or_default(obj, STUDY_DATE))
                .collect();
            if study_dates.len() > 1 {
                issues.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        CATEGORY_CONSISTENCY,
                        format!(
                            "Inconsistent Study Dates in study {study_uid}: {study_dates:?}"
                        ),
                    )
                    .with_fix("All instances in a study should have the same Study Date"),
                );
            }
        }
        issues
    }
}

/// All files of one series should agree on Modality.
pub struct SeriesConsistencyRule;

impl ValidationRule for SeriesConsistencyRule {
    fn name(&self) -> &'static str {
        "Series Consistency"
    }

    fn validate_collection(
        &self,
        datasets: &[(DefaultDicomObject, PathBuf)],
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut series: BTreeMap<String, Vec<&DefaultDicomObject>> = BTreeMap::new();
        for (obj, _) in datasets {
            let series_uid = get_str_or_default(obj, SERIES_INSTANCE_UID);
            if !series_uid.is_empty() {
                series.entry(series_uid).or_default().push(obj);
            }
        }
        for (series_uid, members) in series {
            if members.len() < 2 {
                continue;
            }
            let modalities: std::collections::BTreeSet<String> = members
                .iter()
                .map(|obj| get_str_or_default(obj, MODALITY))
                .collect();
            if modalities.len() > 1 {
                issues.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        CATEGORY_CONSISTENCY,
                        format!(
                            "Inconsistent Modalities in series {series_uid}: {modalities:?}"
                        ),
                    )
                    .with_fix("All instances in a series should have the same Modality"),
                );
            }
        }
        issues
    }
}
