//! Level-scoped merge operations.
//!
//! Each merge keeps the identifying metadata of a chosen primary node
//! and rewrites every instance file under the secondary nodes to adopt
//! it, in place. Preconditions are checked before any file is touched;
//! a precondition failure never produces a partial merge. Callers
//! rebuild the hierarchy from the updated files afterwards.

use std::path::PathBuf;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags::{
    PATIENT_ID, PATIENT_NAME, SERIES_DESCRIPTION, SERIES_INSTANCE_UID, SERIES_NUMBER,
    STUDY_DESCRIPTION, STUDY_ID, STUDY_INSTANCE_UID,
};
use tracing::{error, info};

use dcmkit_common::dicom::{get_str_or_default, read_full, read_metadata, write_object};

use crate::{Error, Hierarchy, Level, NodeId, Result};

/// Outcome of a merge batch. Per-file failures never abort the batch.
#[derive(Debug, Default)]
pub struct MergeReport {
    pub updated: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub warnings: Vec<String>,
}

/// Merges two or more patients. The secondaries' files adopt the
/// primary's PatientID and PatientName.
pub fn merge_patients(
    hierarchy: &Hierarchy,
    primary: NodeId,
    secondaries: &[NodeId],
) -> Result<MergeReport> {
    check_selection(hierarchy, Level::Patient, primary, secondaries)?;

    let sample = primary_sample(hierarchy, primary)?;
    let patient_id = get_str_or_default(&sample, PATIENT_ID);
    let patient_name = get_str_or_default(&sample, PATIENT_NAME);
    info!(
        "Merging {} secondary patient(s) into '{}'",
        secondaries.len(),
        patient_id
    );

    let mut report = MergeReport::default();
    rewrite_files(hierarchy, secondaries, &mut report, |obj| {
        obj.put(DataElement::new(
            PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(patient_id.as_str()),
        ));
        obj.put(DataElement::new(
            PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(patient_name.as_str()),
        ));
    });
    Ok(report)
}

/// Merges two or more studies under the same patient. The secondaries'
/// files adopt the primary's StudyInstanceUID, StudyDescription and
/// StudyID.
pub fn merge_studies(
    hierarchy: &Hierarchy,
    primary: NodeId,
    secondaries: &[NodeId],
) -> Result<MergeReport> {
    check_selection(hierarchy, Level::Study, primary, secondaries)?;
    if !same_parent(hierarchy, primary, secondaries) {
        return Err(Error::StudiesNotUnderSamePatient);
    }

    let sample = primary_sample(hierarchy, primary)?;
    let study_uid = get_str_or_default(&sample, STUDY_INSTANCE_UID);
    let study_description = get_str_or_default(&sample, STUDY_DESCRIPTION);
    let study_id = get_str_or_default(&sample, STUDY_ID);
    info!(
        "Merging {} secondary study(ies) into '{}'",
        secondaries.len(),
        study_uid
    );

    let mut report = MergeReport::default();
    rewrite_files(hierarchy, secondaries, &mut report, |obj| {
        obj.put(DataElement::new(
            STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid.as_str()),
        ));
        obj.put(DataElement::new(
            STUDY_DESCRIPTION,
            VR::LO,
            PrimitiveValue::from(study_description.as_str()),
        ));
        obj.put(DataElement::new(
            STUDY_ID,
            VR::SH,
            PrimitiveValue::from(study_id.as_str()),
        ));
    });
    Ok(report)
}

/// Merges two or more series under the same study. The secondaries'
/// files adopt the primary's SeriesInstanceUID, SeriesDescription and
/// SeriesNumber; Modality stays per-file, with conflicts surfaced as
/// warnings.
pub fn merge_series(
    hierarchy: &Hierarchy,
    primary: NodeId,
    secondaries: &[NodeId],
) -> Result<MergeReport> {
    check_selection(hierarchy, Level::Series, primary, secondaries)?;
    if !same_parent(hierarchy, primary, secondaries) {
        return Err(Error::SeriesNotUnderSameStudy);
    }

    let sample = primary_sample(hierarchy, primary)?;
    let series_uid = get_str_or_default(&sample, SERIES_INSTANCE_UID);
    let series_description = get_str_or_default(&sample, SERIES_DESCRIPTION);
    let series_number = get_str_or_default(&sample, SERIES_NUMBER);
    let primary_modality = get_str_or_default(&sample, dicom_dictionary_std::tags::MODALITY);
    info!(
        "Merging {} secondary series into '{}'",
        secondaries.len(),
        series_uid
    );

    let mut report = MergeReport::default();
    for secondary in secondaries {
        if let Some(first) = hierarchy.collect_instance_paths(*secondary).first() {
            if let Ok(obj) = read_metadata(first) {
                let modality = get_str_or_default(&obj, dicom_dictionary_std::tags::MODALITY);
                if !modality.is_empty() && !primary_modality.is_empty() && modality != primary_modality
                {
                    report
                        .warnings
                        .push(format!("Modality conflict: {} != {}", modality, primary_modality));
                }
            }
        }
    }

    rewrite_files(hierarchy, secondaries, &mut report, |obj| {
        obj.put(DataElement::new(
            SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid.as_str()),
        ));
        if !series_description.is_empty() {
            obj.put(DataElement::new(
                SERIES_DESCRIPTION,
                VR::LO,
                PrimitiveValue::from(series_description.as_str()),
            ));
        }
        if !series_number.is_empty() {
            obj.put(DataElement::new(
                SERIES_NUMBER,
                VR::IS,
                PrimitiveValue::from(series_number.as_str()),
            ));
        }
    });
    Ok(report)
}

fn check_selection(
    hierarchy: &Hierarchy,
    level: Level,
    primary: NodeId,
    secondaries: &[NodeId],
) -> Result<()> {
    if secondaries.is_empty() {
        return Err(Error::NotEnoughNodes(level.name()));
    }
    for id in std::iter::once(&primary).chain(secondaries) {
        let node = hierarchy.get(*id).ok_or(Error::UnknownNode)?;
        if node.level != level {
            return Err(Error::UnexpectedLevel {
                expected: level.name(),
                found: node.level.name(),
            });
        }
    }
    Ok(())
}

fn same_parent(hierarchy: &Hierarchy, primary: NodeId, secondaries: &[NodeId]) -> bool {
    let parent = hierarchy.node(primary).parent;
    secondaries
        .iter()
        .all(|id| hierarchy.node(*id).parent == parent)
}

fn primary_sample(
    hierarchy: &Hierarchy,
    primary: NodeId,
) -> Result<dicom_object::DefaultDicomObject> {
    let paths = hierarchy.collect_instance_paths(primary);
    let first = paths.first().ok_or(Error::PrimaryHasNoFiles)?;
    read_metadata(first).map_err(Error::PrimaryRead)
}

fn rewrite_files<F>(
    hierarchy: &Hierarchy,
    secondaries: &[NodeId],
    report: &mut MergeReport,
    mut apply: F,
) where
    F: FnMut(&mut dicom_object::InMemDicomObject),
{
    for path in hierarchy.collect_instance_paths_many(secondaries) {
        let result = read_full(&path).and_then(|mut obj| {
            apply(&mut obj);
            write_object(obj, &path)
        });
        match result {
            Ok(()) => report.updated += 1,
            Err(e) => {
                error!("Failed to merge file {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }
}
