use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dicom_core::value::{DataSetSequence, Value};
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags::{
    DIRECTORY_RECORD_SEQUENCE, DIRECTORY_RECORD_TYPE, FILE_SET_CONSISTENCY_FLAG, FILE_SET_ID,
    INSTANCE_NUMBER, MODALITY, OFFSET_OF_REFERENCED_LOWER_LEVEL_DIRECTORY_ENTITY,
    OFFSET_OF_THE_FIRST_DIRECTORY_RECORD_OF_THE_ROOT_DIRECTORY_ENTITY,
    OFFSET_OF_THE_LAST_DIRECTORY_RECORD_OF_THE_ROOT_DIRECTORY_ENTITY,
    OFFSET_OF_THE_NEXT_DIRECTORY_RECORD, PATIENT_ID, PATIENT_NAME, RECORD_IN_USE_FLAG,
    REFERENCED_FILE_ID, REFERENCED_SOP_CLASS_UID_IN_FILE, REFERENCED_SOP_INSTANCE_UID_IN_FILE,
    REFERENCED_TRANSFER_SYNTAX_UID_IN_FILE, SERIES_DESCRIPTION, SERIES_INSTANCE_UID,
    SERIES_NUMBER, SOP_CLASS_UID, SOP_INSTANCE_UID, SPECIFIC_CHARACTER_SET, STUDY_DATE,
    STUDY_DESCRIPTION, STUDY_ID, STUDY_INSTANCE_UID, STUDY_TIME,
};
use dicom_dictionary_std::uids::{EXPLICIT_VR_LITTLE_ENDIAN, MEDIA_STORAGE_DIRECTORY_STORAGE};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use tracing::{debug, info, warn};

use dcmkit_common::dicom::{
    generate_uid, get_str_or_default, read_full, read_metadata, IMPLEMENTATION_CLASS_UID,
    IMPLEMENTATION_VERSION_NAME,
};

use crate::{Error, Result};

const DEFAULT_FILE_SET_ID: &str = "DICOM_EXPORT";

#[derive(Debug, Clone)]
struct PatientInfo {
    patient_id: String,
    patient_name: String,
    studies: Vec<String>,
}

#[derive(Debug, Clone)]
struct StudyInfo {
    study_uid: String,
    description: String,
    date: String,
    time: String,
    study_id: String,
    series: Vec<String>,
}

#[derive(Debug, Clone)]
struct SeriesInfo {
    series_uid: String,
    description: String,
    number: String,
    modality: String,
    images: Vec<usize>,
}

#[derive(Debug, Clone)]
struct ImageInfo {
    referenced_file_id: Vec<String>,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax: String,
    instance_number: String,
}

/// Builds a PS3.10 DICOMDIR over a staged `DICOM/...` tree.
///
/// Records are emitted in a flat sequence ordered patient → study →
/// series → image; sibling offsets are zeroed and left to the writer as
/// link metadata.
#[derive(Debug)]
pub struct DicomdirBuilder {
    file_set_id: String,
    patients: BTreeMap<String, PatientInfo>,
    studies: BTreeMap<String, StudyInfo>,
    series: BTreeMap<String, SeriesInfo>,
    images: Vec<ImageInfo>,
}

impl DicomdirBuilder {
    pub fn new(file_set_id: &str) -> Self {
        DicomdirBuilder {
            file_set_id: sanitize_file_set_id(file_set_id),
            patients: BTreeMap::new(),
            studies: BTreeMap::new(),
            series: BTreeMap::new(),
            images: Vec::new(),
        }
    }

    /// Registers staged files. `mapping` maps the original file to its
    /// staged copy below `base_dir` (the directory that will hold the
    /// DICOMDIR). Metadata is read from the originals; reference paths
    /// are derived from the staged copies. Unreadable files are skipped.
    pub fn add_dicom_files(&mut self, mapping: &BTreeMap<PathBuf, PathBuf>, base_dir: &Path) {
        info!("Building DICOMDIR structure for {} files", mapping.len());
        self.patients.clear();
        self.studies.clear();
        self.series.clear();
        self.images.clear();

        for (original, staged) in mapping {
            let obj = match read_metadata(original) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(
                        "Could not process file {} for DICOMDIR: {}",
                        original.display(),
                        e
                    );
                    continue;
                }
            };

            let patient_id = or_default(get_str_or_default(&obj, PATIENT_ID), "UNKNOWN");
            let patient_name = or_default(get_str_or_default(&obj, PATIENT_NAME), "UNKNOWN");
            let study_uid = or_else_uid(get_str_or_default(&obj, STUDY_INSTANCE_UID));
            let series_uid = or_else_uid(get_str_or_default(&obj, SERIES_INSTANCE_UID));
            let modality = or_default(get_str_or_default(&obj, MODALITY), "OT");
            let transfer_syntax = {
                let ts = obj.meta().transfer_syntax().trim_end_matches('\0').to_string();
                if ts.is_empty() {
                    dicom_dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()
                } else {
                    ts
                }
            };

            let referenced_file_id = match pathdiff::diff_paths(staged, base_dir) {
                Some(relative) => relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>(),
                None => {
                    warn!(
                        "Staged path {} is not relative to {}",
                        staged.display(),
                        base_dir.display()
                    );
                    continue;
                }
            };

            let patient = self
                .patients
                .entry(patient_id.clone())
                .or_insert_with(|| PatientInfo {
                    patient_id: patient_id.clone(),
                    patient_name,
                    studies: Vec::new(),
                });

            let study_key = format!("{patient_id}#{study_uid}");
            if !patient.studies.contains(&study_key) {
                patient.studies.push(study_key.clone());
            }
            self.studies
                .entry(study_key.clone())
                .or_insert_with(|| StudyInfo {
                    study_uid,
                    description: get_str_or_default(&obj, STUDY_DESCRIPTION),
                    date: get_str_or_default(&obj, STUDY_DATE),
                    time: get_str_or_default(&obj, STUDY_TIME),
                    study_id: get_str_or_default(&obj, STUDY_ID),
                    series: Vec::new(),
                });

            let series_key = format!("{study_key}#{series_uid}");
            let study = self.studies.get_mut(&study_key).expect("study just inserted");
            if !study.series.contains(&series_key) {
                study.series.push(series_key.clone());
            }
            self.series
                .entry(series_key.clone())
                .or_insert_with(|| SeriesInfo {
                    series_uid,
                    description: get_str_or_default(&obj, SERIES_DESCRIPTION),
                    number: or_default(get_str_or_default(&obj, SERIES_NUMBER), "1"),
                    modality,
                    images: Vec::new(),
                });

            let image_index = self.images.len();
            self.images.push(ImageInfo {
                referenced_file_id,
                sop_class_uid: get_str_or_default(&obj, SOP_CLASS_UID),
                sop_instance_uid: or_else_uid(get_str_or_default(&obj, SOP_INSTANCE_UID)),
                transfer_syntax,
                instance_number: or_default(get_str_or_default(&obj, INSTANCE_NUMBER), "1"),
            });
            self.series
                .get_mut(&series_key)
                .expect("series just inserted")
                .images
                .push(image_index);
        }

        info!(
            "DICOMDIR structure: {} patients, {} studies, {} series, {} images",
            self.patients.len(),
            self.studies.len(),
            self.series.len(),
            self.images.len()
        );
    }

    /// Writes the DICOMDIR file.
    pub fn generate(&self, output_path: &Path) -> Result<()> {
        info!("Generating DICOMDIR at {}", output_path.display());
        if self.images.is_empty() {
            return Err(Error::NoValidFiles);
        }

        let mut root = InMemDicomObject::new_empty();
        root.put(DataElement::new(
            FILE_SET_ID,
            VR::CS,
            PrimitiveValue::from(self.file_set_id.as_str()),
        ));
        root.put(DataElement::new(
            SPECIFIC_CHARACTER_SET,
            VR::CS,
            PrimitiveValue::from("ISO_IR 100"),
        ));
        root.put(DataElement::new(
            FILE_SET_CONSISTENCY_FLAG,
            VR::US,
            PrimitiveValue::from(0_u16),
        ));
        root.put(DataElement::new(
            OFFSET_OF_THE_FIRST_DIRECTORY_RECORD_OF_THE_ROOT_DIRECTORY_ENTITY,
            VR::UL,
            PrimitiveValue::from(0_u32),
        ));
        root.put(DataElement::new(
            OFFSET_OF_THE_LAST_DIRECTORY_RECORD_OF_THE_ROOT_DIRECTORY_ENTITY,
            VR::UL,
            PrimitiveValue::from(0_u32),
        ));
        root.put(DataElement::new(
            DIRECTORY_RECORD_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(self.build_records()),
        ));

        let file_obj = root
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(MEDIA_STORAGE_DIRECTORY_STORAGE)
                    .media_storage_sop_instance_uid(generate_uid())
                    .implementation_class_uid(IMPLEMENTATION_CLASS_UID)
                    .implementation_version_name(IMPLEMENTATION_VERSION_NAME),
            )
            .map_err(|e| dcmkit_common::Error::Meta(e.to_string()))
            .map_err(Error::Dicom)?;
        file_obj
            .write_to_file(output_path)
            .map_err(dcmkit_common::Error::Write)
            .map_err(Error::Dicom)?;
        info!("DICOMDIR created successfully");
        Ok(())
    }

    fn build_records(&self) -> Vec<InMemDicomObject> {
        let mut records = Vec::new();
        for patient in self.patients.values() {
            records.push(patient_record(patient));
            let mut studies: Vec<&StudyInfo> = patient
                .studies
                .iter()
                .filter_map(|key| self.studies.get(key))
                .collect();
            studies.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.time.cmp(&b.time)));
            for study in studies {
                records.push(study_record(study));
                let mut series: Vec<&SeriesInfo> = study
                    .series
                    .iter()
                    .filter_map(|key| self.series.get(key))
                    .collect();
                series.sort_by_key(|s| s.number.trim().parse::<i64>().unwrap_or(0));
                for series_info in series {
                    records.push(series_record(series_info));
                    let mut images: Vec<&ImageInfo> = series_info
                        .images
                        .iter()
                        .filter_map(|index| self.images.get(*index))
                        .collect();
                    images.sort_by_key(|i| i.instance_number.trim().parse::<i64>().unwrap_or(0));
                    for image in images {
                        records.push(image_record(image));
                    }
                }
            }
        }
        debug!("Built {} directory records", records.len());
        records
    }
}

fn base_record(record_type: &str) -> InMemDicomObject {
    let mut record = InMemDicomObject::new_empty();
    record.put(DataElement::new(
        OFFSET_OF_THE_NEXT_DIRECTORY_RECORD,
        VR::UL,
        PrimitiveValue::from(0_u32),
    ));
    record.put(DataElement::new(
        RECORD_IN_USE_FLAG,
        VR::US,
        PrimitiveValue::from(0xFFFF_u16),
    ));
    record.put(DataElement::new(
        OFFSET_OF_REFERENCED_LOWER_LEVEL_DIRECTORY_ENTITY,
        VR::UL,
        PrimitiveValue::from(0_u32),
    ));
    record.put(DataElement::new(
        DIRECTORY_RECORD_TYPE,
        VR::CS,
        PrimitiveValue::from(record_type),
    ));
    record
}

fn patient_record(patient: &PatientInfo) -> InMemDicomObject {
    let mut record = base_record("PATIENT");
    record.put(DataElement::new(
        PATIENT_ID,
        VR::LO,
        PrimitiveValue::from(clamp(&patient.patient_id, 64)),
    ));
    record.put(DataElement::new(
        PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from(clamp(&patient.patient_name, 320)),
    ));
    record
}

fn study_record(study: &StudyInfo) -> InMemDicomObject {
    let mut record = base_record("STUDY");
    record.put(DataElement::new(
        STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study.study_uid.as_str()),
    ));
    if !study.date.is_empty() {
        record.put(DataElement::new(
            STUDY_DATE,
            VR::DA,
            PrimitiveValue::from(clamp(&study.date, 8)),
        ));
    }
    if !study.time.is_empty() {
        record.put(DataElement::new(
            STUDY_TIME,
            VR::TM,
            PrimitiveValue::from(clamp(&study.time, 16)),
        ));
    }
    if !study.description.is_empty() {
        record.put(DataElement::new(
            STUDY_DESCRIPTION,
            VR::LO,
            PrimitiveValue::from(clamp(&study.description, 64)),
        ));
    }
    if !study.study_id.is_empty() {
        record.put(DataElement::new(
            STUDY_ID,
            VR::SH,
            PrimitiveValue::from(clamp(&study.study_id, 16)),
        ));
    }
    record
}

fn series_record(series: &SeriesInfo) -> InMemDicomObject {
    let mut record = base_record("SERIES");
    record.put(DataElement::new(
        SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(series.series_uid.as_str()),
    ));
    record.put(DataElement::new(
        MODALITY,
        VR::CS,
        PrimitiveValue::from(clamp(&series.modality, 16)),
    ));
    if !series.number.is_empty() {
        record.put(DataElement::new(
            SERIES_NUMBER,
            VR::IS,
            PrimitiveValue::from(clamp(&series.number, 12)),
        ));
    }
    if !series.description.is_empty() {
        record.put(DataElement::new(
            SERIES_DESCRIPTION,
            VR::LO,
            PrimitiveValue::from(clamp(&series.description, 64)),
        ));
    }
    record
}

fn image_record(image: &ImageInfo) -> InMemDicomObject {
    let mut record = base_record("IMAGE");
    record.put(DataElement::new(
        REFERENCED_FILE_ID,
        VR::CS,
        PrimitiveValue::Strs(image.referenced_file_id.clone().into()),
    ));
    record.put(DataElement::new(
        REFERENCED_SOP_CLASS_UID_IN_FILE,
        VR::UI,
        PrimitiveValue::from(image.sop_class_uid.as_str()),
    ));
    record.put(DataElement::new(
        REFERENCED_SOP_INSTANCE_UID_IN_FILE,
        VR::UI,
        PrimitiveValue::from(image.sop_instance_uid.as_str()),
    ));
    record.put(DataElement::new(
        REFERENCED_TRANSFER_SYNTAX_UID_IN_FILE,
        VR::UI,
        PrimitiveValue::from(image.transfer_syntax.as_str()),
    ));
    if !image.instance_number.is_empty() {
        record.put(DataElement::new(
            INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(clamp(&image.instance_number, 12)),
        ));
    }
    record
}

fn clamp(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn or_else_uid(value: String) -> String {
    if value.is_empty() { generate_uid() } else { value }
}

/// Sanitizes a FileSetID to the CS character repertoire: uppercase,
/// `[A-Z0-9 _]` only, mixed runs of space and underscore collapsed to a
/// single underscore, trimmed, then truncated to 16 characters.
/// Truncation on an already-short result is a no-op. Empty or fully
/// invalid input falls back to `DICOM_EXPORT`.
pub(crate) fn sanitize_file_set_id(value: &str) -> String {
    let upper = value.to_uppercase();
    let mut out = String::with_capacity(upper.len());
    for c in upper.chars() {
        let mapped = if c.is_ascii_uppercase() || c.is_ascii_digit() || c == ' ' || c == '_' {
            c
        } else {
            '_'
        };
        if mapped == '_' || mapped == ' ' {
            match out.chars().last() {
                Some('_') => {}
                Some(' ') => {
                    if mapped == '_' {
                        out.pop();
                        out.push('_');
                    }
                }
                _ => out.push(mapped),
            }
        } else {
            out.push(mapped);
        }
    }
    let trimmed = out.trim_matches(['_', ' ']).to_string();
    if trimmed.is_empty() {
        return DEFAULT_FILE_SET_ID.to_string();
    }
    trimmed.chars().take(16).collect()
}

/// Summary of a validated DICOMDIR.
#[derive(Debug, Default)]
pub struct DicomdirSummary {
    pub record_counts: BTreeMap<String, usize>,
}

/// Re-reads an emitted DICOMDIR and checks that it is a readable DICOM
/// dataset with the required file-set elements, a non-empty record
/// sequence containing at least one PATIENT record, and IMAGE records
/// whose ReferencedFileID resolves to an existing file.
pub fn validate_dicomdir(dicomdir_path: &Path) -> Result<DicomdirSummary> {
    info!("Validating DICOMDIR: {}", dicomdir_path.display());
    let obj = read_full(dicomdir_path)?;

    for (tag, name) in [
        (FILE_SET_ID, "FileSetID"),
        (SPECIFIC_CHARACTER_SET, "SpecificCharacterSet"),
        (FILE_SET_CONSISTENCY_FLAG, "FileSetConsistencyFlag"),
        (DIRECTORY_RECORD_SEQUENCE, "DirectoryRecordSequence"),
    ] {
        if obj.get(tag).is_none() {
            return Err(Error::InvalidDicomdir(format!(
                "missing required element {name}"
            )));
        }
    }

    let sequence = obj
        .get(DIRECTORY_RECORD_SEQUENCE)
        .expect("checked above");
    let items: &[InMemDicomObject] = match sequence.value() {
        Value::Sequence(seq) => seq.items(),
        _ => {
            return Err(Error::InvalidDicomdir(
                "DirectoryRecordSequence is not a sequence".to_string(),
            ));
        }
    };
    if items.is_empty() {
        return Err(Error::InvalidDicomdir(
            "DICOMDIR has no directory records".to_string(),
        ));
    }

    let base_dir = dicomdir_path.parent().unwrap_or(Path::new("."));
    let mut summary = DicomdirSummary::default();
    for record in items {
        let record_type = get_str_or_default(record, DIRECTORY_RECORD_TYPE);
        *summary
            .record_counts
            .entry(record_type.clone())
            .or_insert(0) += 1;
        if record_type == "IMAGE" {
            let components = match record.get(REFERENCED_FILE_ID) {
                Some(elem) => match elem.value().to_multi_str() {
                    Ok(values) => values.to_vec(),
                    Err(_) => Vec::new(),
                },
                None => Vec::new(),
            };
            if components.is_empty() {
                return Err(Error::InvalidDicomdir(
                    "IMAGE record without ReferencedFileID".to_string(),
                ));
            }
            let mut referenced = base_dir.to_path_buf();
            for component in &components {
                referenced.push(component.trim_end_matches('\0').trim());
            }
            if !referenced.exists() {
                return Err(Error::DanglingReference(referenced));
            }
        }
    }

    if summary.record_counts.get("PATIENT").copied().unwrap_or(0) == 0 {
        return Err(Error::InvalidDicomdir(
            "DICOMDIR has no PATIENT record".to_string(),
        ));
    }
    info!("DICOMDIR validation passed: {:?}", summary.record_counts);
    Ok(summary)
}

/// Reads an existing DICOMDIR and resolves each IMAGE record's
/// ReferencedFileID against the DICOMDIR's directory. Records pointing
/// at missing files are skipped.
pub fn read_referenced_files(dicomdir_path: &Path) -> Result<Vec<PathBuf>> {
    let obj = read_full(dicomdir_path)?;
    let sequence = obj
        .get(DIRECTORY_RECORD_SEQUENCE)
        .ok_or_else(|| Error::InvalidDicomdir("missing DirectoryRecordSequence".to_string()))?;
    let items: &[InMemDicomObject] = match sequence.value() {
        Value::Sequence(seq) => seq.items(),
        _ => {
            return Err(Error::InvalidDicomdir(
                "DirectoryRecordSequence is not a sequence".to_string(),
            ));
        }
    };

    let base_dir = dicomdir_path.parent().unwrap_or(Path::new("."));
    let mut files = Vec::new();
    for record in items {
        if get_str_or_default(record, DIRECTORY_RECORD_TYPE) != "IMAGE" {
            continue;
        }
        let Some(elem) = record.get(REFERENCED_FILE_ID) else {
            continue;
        };
        let Ok(components) = elem.value().to_multi_str() else {
            continue;
        };
        let mut referenced = base_dir.to_path_buf();
        for component in components.iter() {
            referenced.push(component.trim_end_matches('\0').trim());
        }
        if referenced.exists() {
            files.push(referenced);
        } else {
            warn!(
                "DICOMDIR references a missing file: {}",
                referenced.display()
            );
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_accents_symbols_and_runs() {
        assert_eq!(sanitize_file_set_id("Hôpital #1"), "H_PITAL_1");
    }

    #[test]
    fn sanitize_keeps_valid_ids_untouched() {
        assert_eq!(sanitize_file_set_id("DICOM EXPORT"), "DICOM EXPORT");
        assert_eq!(sanitize_file_set_id("ARCHIVE_01"), "ARCHIVE_01");
    }

    #[test]
    fn sanitize_truncates_after_cleaning() {
        assert_eq!(
            sanitize_file_set_id("A VERY LONG FILE SET IDENTIFIER"),
            "A VERY LONG FILE"
        );
        // short results are not padded or further cut
        assert_eq!(sanitize_file_set_id("OK"), "OK");
    }

    #[test]
    fn sanitize_falls_back_when_nothing_survives() {
        assert_eq!(sanitize_file_set_id(""), "DICOM_EXPORT");
        assert_eq!(sanitize_file_set_id("###"), "DICOM_EXPORT");
    }

    #[test]
    fn sanitize_uppercases() {
        assert_eq!(sanitize_file_set_id("teaching set"), "TEACHING SET");
    }
}
