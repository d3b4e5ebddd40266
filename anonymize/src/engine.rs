use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use dicom_core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::InMemDicomObject;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use dcmkit_common::CancelFlag;
use dcmkit_common::dicom::{read_full, write_object};

use crate::date::DateShifter;
use crate::template::{AnonymizationAction, AnonymizationTemplate};
use crate::uid::UidMapper;

/// Outcome of one anonymization run. Files are modified in place;
/// per-file errors never abort the batch.
#[derive(Debug, Default)]
pub struct AnonymizationResult {
    pub processed_files: Vec<PathBuf>,
    /// Failed and skipped files with their error message. Skips carry a
    /// `Skipped:` prefix and are counted in `skipped_count`.
    pub failed_files: Vec<(PathBuf, String)>,
    pub skipped_count: usize,
    /// The UID map used for this run.
    pub uid_mappings: HashMap<String, String>,
    pub date_shift_applied: bool,
    pub duration: Duration,
    pub cancelled: bool,
}

impl AnonymizationResult {
    pub fn anonymized_count(&self) -> usize {
        self.processed_files.len()
    }

    pub fn summary(&self) -> RunSummary {
        let total_files = self.processed_files.len() + self.failed_files.len();
        let anonymized_count = self.anonymized_count();
        RunSummary {
            total_files,
            anonymized_count,
            failed_count: self.failed_files.len() - self.skipped_count,
            skipped_count: self.skipped_count,
            success_rate: if total_files > 0 {
                anonymized_count as f64 / total_files as f64 * 100.0
            } else {
                0.0
            },
            duration_seconds: self.duration.as_secs_f64(),
            uid_mappings_count: self.uid_mappings.len(),
            date_shift_applied: self.date_shift_applied,
        }
    }
}

/// Aggregate statistics of a run, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub total_files: usize,
    pub anonymized_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub success_rate: f64,
    pub duration_seconds: f64,
    pub uid_mappings_count: usize,
    pub date_shift_applied: bool,
}

/// Applies anonymization templates to file collections.
///
/// The UID map lives on the engine so that it can be retained across
/// runs; a run with `preserve_relationships` clears it first so the map
/// is exactly the scope of that run.
#[derive(Debug, Default)]
pub struct AnonymizationEngine {
    uid_mapper: UidMapper,
}

impl AnonymizationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anonymizes every file of the collection with the given template,
    /// in place. `progress` receives `(current, total, file name)`
    /// before each file; cancellation is observed between files.
    pub fn anonymize_collection<F>(
        &mut self,
        template: &AnonymizationTemplate,
        paths: &[PathBuf],
        cancel: &CancelFlag,
        mut progress: F,
    ) -> AnonymizationResult
    where
        F: FnMut(usize, usize, &str),
    {
        let started = Instant::now();
        let mut result = AnonymizationResult::default();

        if template.preserve_relationships {
            self.uid_mapper.clear();
        }
        let date_shifter = template.date_shift_days.map(DateShifter::new);
        result.date_shift_applied = date_shifter.is_some();

        for (index, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            progress(index + 1, paths.len(), &name);
            self.anonymize_file(path, template, date_shifter.as_ref(), &mut result);
        }

        result.uid_mappings = self.uid_mapper.mappings().clone();
        result.duration = started.elapsed();
        result
    }

    fn anonymize_file(
        &mut self,
        path: &PathBuf,
        template: &AnonymizationTemplate,
        shifter: Option<&DateShifter>,
        result: &mut AnonymizationResult,
    ) {
        if !path.exists() {
            result
                .failed_files
                .push((path.clone(), "File does not exist".to_string()));
            return;
        }
        let mut obj = match read_full(path) {
            Ok(obj) => obj,
            Err(e) => {
                result
                    .failed_files
                    .push((path.clone(), format!("Skipped: cannot read DICOM file: {e}")));
                result.skipped_count += 1;
                return;
            }
        };

        for rule in &template.rules {
            if let Err(e) = apply_rule(&mut obj, rule.tag.as_str(), rule.action, &rule.replacement_value, &mut self.uid_mapper, shifter)
            {
                warn!(
                    "Failed to apply rule '{}' to {}: {}",
                    rule.tag,
                    path.display(),
                    e
                );
            }
        }

        if template.remove_private_tags {
            remove_matching_groups(&mut obj, |group| group % 2 == 1);
        }
        if template.remove_curves {
            remove_matching_groups(&mut obj, |group| group & 0xFF00 == 0x5000);
        }
        if template.remove_overlays {
            remove_matching_groups(&mut obj, |group| group & 0xFF00 == 0x6000);
        }

        match write_object(obj, path) {
            Ok(()) => {
                debug!("Anonymized {}", path.display());
                result.processed_files.push(path.clone());
            }
            Err(e) => {
                result
                    .failed_files
                    .push((path.clone(), format!("Anonymization failed: {e}")));
            }
        }
    }
}

/// Resolves a tag selector: dictionary keyword, `(GGGG,EEEE)` pair or
/// bare 8-digit hex.
fn parse_tag(selector: &str) -> Option<Tag> {
    if let Some(tag) = StandardDataDictionary.parse_tag(selector) {
        return Some(tag);
    }
    let trimmed = selector.trim().trim_start_matches('(').trim_end_matches(')');
    let parts: Vec<&str> = trimmed.split(',').collect();
    if parts.len() == 2 {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(parts[0].trim(), 16),
            u16::from_str_radix(parts[1].trim(), 16),
        ) {
            return Some(Tag(group, element));
        }
    }
    if trimmed.len() == 8 {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(&trimmed[0..4], 16),
            u16::from_str_radix(&trimmed[4..8], 16),
        ) {
            return Some(Tag(group, element));
        }
    }
    None
}

fn apply_rule(
    obj: &mut InMemDicomObject,
    selector: &str,
    action: AnonymizationAction,
    replacement: &str,
    mapper: &mut UidMapper,
    shifter: Option<&DateShifter>,
) -> Result<(), String> {
    let tag =
        parse_tag(selector).ok_or_else(|| format!("could not parse tag selector '{selector}'"))?;
    let (vr, text) = match obj.get(tag) {
        Some(element) => (
            element.vr(),
            element.to_str().map(|s| s.trim().to_string()).ok(),
        ),
        None => return Ok(()),
    };

    match action {
        AnonymizationAction::Remove => {
            obj.remove_element(tag);
        }
        AnonymizationAction::Keep => {}
        AnonymizationAction::Blank => {
            obj.put(DataElement::new(tag, vr, blank_value(vr)));
        }
        AnonymizationAction::Replace => {
            obj.put(DataElement::new(tag, vr, replace_value(vr, replacement)));
        }
        AnonymizationAction::Hash => {
            let text = text.ok_or("value is not hashable as a string")?;
            let digest = hash16(&text);
            let value = if vr == VR::PN {
                format!("HASH{digest}")
            } else {
                digest
            };
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }
        AnonymizationAction::DateShift => {
            let Some(shifter) = shifter else {
                return Ok(());
            };
            let Some(text) = text else {
                return Ok(());
            };
            // TM values are never shifted
            let shifted = match vr {
                VR::DA => shifter.shift_date(&text),
                VR::DT => shifter.shift_datetime(&text),
                _ => return Ok(()),
            };
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(shifted)));
        }
        AnonymizationAction::UidRemap => {
            if vr == VR::UI {
                let text = text.ok_or("UID value is not readable")?;
                let mapped = mapper.get_mapped_uid(&text);
                obj.put(DataElement::new(tag, vr, PrimitiveValue::from(mapped)));
            }
        }
    }
    Ok(())
}

fn blank_value(vr: VR) -> PrimitiveValue {
    match vr {
        VR::DA => PrimitiveValue::from("19000101"),
        VR::TM => PrimitiveValue::from("000000"),
        VR::DT => PrimitiveValue::from("19000101000000"),
        VR::IS | VR::DS => PrimitiveValue::from("0"),
        VR::US => PrimitiveValue::from(0_u16),
        VR::SS => PrimitiveValue::from(0_i16),
        VR::UL => PrimitiveValue::from(0_u32),
        VR::SL => PrimitiveValue::from(0_i32),
        VR::FL => PrimitiveValue::from(0.0_f32),
        VR::FD => PrimitiveValue::from(0.0_f64),
        _ => PrimitiveValue::from(""),
    }
}

fn replace_value(vr: VR, replacement: &str) -> PrimitiveValue {
    match vr {
        VR::US => PrimitiveValue::from(replacement.parse::<u16>().unwrap_or(0)),
        VR::SS => PrimitiveValue::from(replacement.parse::<i16>().unwrap_or(0)),
        VR::UL => PrimitiveValue::from(replacement.parse::<u32>().unwrap_or(0)),
        VR::SL => PrimitiveValue::from(replacement.parse::<i32>().unwrap_or(0)),
        VR::FL => PrimitiveValue::from(replacement.parse::<f32>().unwrap_or(0.0)),
        VR::FD => PrimitiveValue::from(replacement.parse::<f64>().unwrap_or(0.0)),
        _ => PrimitiveValue::from(replacement),
    }
}

fn hash16(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()[..16]
        .to_string()
}

fn remove_matching_groups<F>(obj: &mut InMemDicomObject, matches: F)
where
    F: Fn(u16) -> bool,
{
    let doomed: Vec<Tag> = obj.tags().filter(|tag| matches(tag.group())).collect();
    for tag in doomed {
        obj.remove_element(tag);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use dicom_dictionary_std::tags;
    use dicom_dictionary_std::uids::CT_IMAGE_STORAGE;
    use dicom_object::FileMetaTableBuilder;
    use tempfile::TempDir;

    use dcmkit_common::dicom::{get_str, get_str_or_default, read_metadata};

    use crate::template::AnonymizationRule;

    use super::*;

    fn write_test_file(dir: &Path, name: &str, study_uid: &str, sop_uid: &str) -> PathBuf {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_uid),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Doe^Jane"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("PAT001"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            PrimitiveValue::from("19751123"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from("20230615"),
        ));
        obj.put(DataElement::new(
            Tag(0x0009, 0x0010),
            VR::LO,
            PrimitiveValue::from("PRIVATE CREATOR"),
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

    fn run(template: &AnonymizationTemplate, paths: &[PathBuf]) -> AnonymizationResult {
        AnonymizationEngine::new().anonymize_collection(
            template,
            paths,
            &CancelFlag::new(),
            |_, _, _| {},
        )
    }

    #[test]
    fn date_shift_rule_shifts_study_date() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");

        let mut template = AnonymizationTemplate::new("shift", "");
        template.date_shift_days = Some(-365);
        template.add_rule(AnonymizationRule::new("StudyDate", AnonymizationAction::DateShift));

        let result = run(&template, &[path.clone()]);
        assert_eq!(result.anonymized_count(), 1);
        assert!(result.date_shift_applied);

        let obj = read_metadata(&path).unwrap();
        assert_eq!(get_str_or_default(&obj, tags::STUDY_DATE), "20220615");
    }

    #[test]
    fn uid_remap_is_consistent_across_files() {
        let dir = TempDir::new().unwrap();
        let a = write_test_file(dir.path(), "a.dcm", "1.2.3.4.5", "1.2.3.4.5.1");
        let b = write_test_file(dir.path(), "b.dcm", "1.2.3.4.5", "1.2.3.4.5.2");

        let mut template = AnonymizationTemplate::new("remap", "");
        template.add_rule(AnonymizationRule::new(
            "StudyInstanceUID",
            AnonymizationAction::UidRemap,
        ));

        let result = run(&template, &[a.clone(), b.clone()]);
        assert_eq!(result.anonymized_count(), 2);

        let uid_a = get_str_or_default(&read_metadata(&a).unwrap(), tags::STUDY_INSTANCE_UID);
        let uid_b = get_str_or_default(&read_metadata(&b).unwrap(), tags::STUDY_INSTANCE_UID);
        assert_eq!(uid_a, uid_b);
        assert_ne!(uid_a, "1.2.3.4.5");
        assert_eq!(result.uid_mappings.get("1.2.3.4.5"), Some(&uid_a));
    }

    #[test]
    fn hash_rule_prefixes_person_names() {
        let dir = TempDir::new().unwrap();
        let a = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");
        let b = write_test_file(dir.path(), "b.dcm", "1.2.3", "1.2.3.2");

        let mut template = AnonymizationTemplate::new("hash", "");
        template.add_rule(AnonymizationRule::new("PatientName", AnonymizationAction::Hash));
        template.add_rule(AnonymizationRule::new("PatientID", AnonymizationAction::Hash));

        run(&template, &[a.clone(), b.clone()]);

        let obj = read_metadata(&a).unwrap();
        let name = get_str_or_default(&obj, tags::PATIENT_NAME);
        let id = get_str_or_default(&obj, tags::PATIENT_ID);
        assert!(name.starts_with("HASH"), "PN hash must carry prefix: {name}");
        assert_eq!(name.len(), "HASH".len() + 16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        // hashing is deterministic: the same input hashes identically in
        // the second file
        let other = read_metadata(&b).unwrap();
        assert_eq!(get_str_or_default(&other, tags::PATIENT_ID), id);
    }

    #[test]
    fn blank_rule_uses_vr_zero_values() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");

        let mut template = AnonymizationTemplate::new("blank", "");
        template.add_rule(AnonymizationRule::new(
            "PatientBirthDate",
            AnonymizationAction::Blank,
        ));
        template.add_rule(AnonymizationRule::new("PatientName", AnonymizationAction::Blank));

        run(&template, &[path.clone()]);
        let obj = read_metadata(&path).unwrap();
        assert_eq!(get_str_or_default(&obj, tags::PATIENT_BIRTH_DATE), "19000101");
        assert_eq!(get_str_or_default(&obj, tags::PATIENT_NAME), "");
    }

    #[test]
    fn replace_and_blank_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");

        let mut template = AnonymizationTemplate::new("replace", "");
        template.add_rule(AnonymizationRule::with_replacement(
            "PatientName",
            AnonymizationAction::Replace,
            "RESEARCH_PATIENT",
        ));
        template.add_rule(AnonymizationRule::new(
            "PatientBirthDate",
            AnonymizationAction::Blank,
        ));

        run(&template, &[path.clone()]);
        let first = read_metadata(&path).unwrap();
        let name_first = get_str_or_default(&first, tags::PATIENT_NAME);

        run(&template, &[path.clone()]);
        let second = read_metadata(&path).unwrap();
        assert_eq!(get_str_or_default(&second, tags::PATIENT_NAME), name_first);
        assert_eq!(name_first, "RESEARCH_PATIENT");
        assert_eq!(
            get_str_or_default(&second, tags::PATIENT_BIRTH_DATE),
            "19000101"
        );
    }

    #[test]
    fn remove_rule_and_private_cleanup_delete_elements() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");

        let mut template = AnonymizationTemplate::new("strip", "");
        template.add_rule(AnonymizationRule::new("PatientID", AnonymizationAction::Remove));
        template.remove_private_tags = true;

        run(&template, &[path.clone()]);
        let obj = read_metadata(&path).unwrap();
        assert!(get_str(&obj, tags::PATIENT_ID).is_none());
        assert!(obj.get(Tag(0x0009, 0x0010)).is_none());
        // non-private content survives
        assert_eq!(get_str_or_default(&obj, tags::PATIENT_NAME), "Doe^Jane");
    }

    #[test]
    fn empty_rule_list_leaves_files_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");

        let template = AnonymizationTemplate::new("noop", "");
        let result = run(&template, &[path.clone()]);
        assert_eq!(result.anonymized_count(), 1);

        let obj = read_metadata(&path).unwrap();
        assert_eq!(get_str_or_default(&obj, tags::PATIENT_NAME), "Doe^Jane");
        assert_eq!(get_str_or_default(&obj, tags::STUDY_DATE), "20230615");
    }

    #[test]
    fn sop_uid_remap_keeps_written_file_readable() {
        let dir = TempDir::new().unwrap();
        let path = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");

        let mut template = AnonymizationTemplate::new("sop", "");
        template.add_rule(AnonymizationRule::new(
            "SOPInstanceUID",
            AnonymizationAction::UidRemap,
        ));

        let result = run(&template, &[path.clone()]);
        assert_eq!(result.anonymized_count(), 1);

        // identity invariants hold after the write, and the meta group
        // follows the remapped SOP instance UID
        let obj = dcmkit_common::read_full(&path).unwrap();
        let sop = get_str_or_default(&obj, tags::SOP_INSTANCE_UID);
        assert_ne!(sop, "1.2.3.1");
        assert_eq!(
            obj.meta()
                .media_storage_sop_instance_uid
                .trim_end_matches('\0'),
            sop
        );
    }

    #[test]
    fn failures_do_not_abort_the_batch() {
        let dir = TempDir::new().unwrap();
        let good = write_test_file(dir.path(), "good.dcm", "1.2.3", "1.2.3.1");
        let missing = dir.path().join("missing.dcm");

        let mut template = AnonymizationTemplate::new("t", "");
        template.add_rule(AnonymizationRule::new("PatientID", AnonymizationAction::Hash));

        let result = run(&template, &[missing.clone(), good.clone()]);
        assert_eq!(result.anonymized_count(), 1);
        assert_eq!(result.failed_files.len(), 1);
        assert_eq!(result.failed_files[0].0, missing);
        let summary = result.summary();
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.failed_count, 1);
    }

    #[test]
    fn empty_batch_completes_immediately_with_zero_counts() {
        let template = AnonymizationTemplate::new("t", "");
        let result = run(&template, &[]);
        assert_eq!(result.anonymized_count(), 0);
        assert!(result.failed_files.is_empty());
        assert!(!result.cancelled);
        assert_eq!(result.summary().success_rate, 0.0);
    }

    #[test]
    fn cancellation_reports_partial_outcome() {
        let dir = TempDir::new().unwrap();
        let a = write_test_file(dir.path(), "a.dcm", "1.2.3", "1.2.3.1");
        let b = write_test_file(dir.path(), "b.dcm", "1.2.3", "1.2.3.2");

        let mut template = AnonymizationTemplate::new("t", "");
        template.add_rule(AnonymizationRule::new("PatientID", AnonymizationAction::Hash));

        let cancel = CancelFlag::new();
        let mut engine = AnonymizationEngine::new();
        // cancel after the first progress callback fires
        let result = {
            let cancel_inner = cancel.clone();
            engine.anonymize_collection(&template, &[a, b], &cancel, move |_, _, _| {
                cancel_inner.cancel();
            })
        };
        assert!(result.cancelled);
        assert_eq!(result.anonymized_count(), 1);
    }

    #[test]
    fn tag_selector_accepts_literal_pairs() {
        assert_eq!(parse_tag("(0010,0010)"), Some(Tag(0x0010, 0x0010)));
        assert_eq!(parse_tag("00100020"), Some(Tag(0x0010, 0x0020)));
        assert_eq!(parse_tag("PatientID"), Some(Tag(0x0010, 0x0020)));
        assert_eq!(parse_tag("NoSuchKeyword"), None);
    }
}
