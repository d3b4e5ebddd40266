use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use dicom_dictionary_std::tags::{
    MODALITY, PATIENT_ID, SERIES_INSTANCE_UID, STUDY_INSTANCE_UID,
};
use dicom_object::DefaultDicomObject;

use dcmkit_common::dicom::get_str_or_default;

/// How often one tag occurs across the collection.
#[derive(Debug, Clone, PartialEq)]
pub struct TagPresence {
    pub present: usize,
    pub missing: usize,
    pub percentage: f64,
}

/// Derived statistics over all successfully parsed datasets of a
/// collection run.
#[derive(Debug, Clone, Default)]
pub struct CollectionStatistics {
    pub modality_distribution: BTreeMap<String, usize>,
    /// Keyed by the `(GGGG,EEEE)` rendering of the tag.
    pub tag_presence: BTreeMap<String, TagPresence>,
    pub total_instances: usize,
    pub unique_patients: usize,
    pub unique_studies: usize,
    pub unique_series: usize,
}

pub(crate) fn generate(datasets: &[(DefaultDicomObject, PathBuf)]) -> CollectionStatistics {
    let mut stats = CollectionStatistics::default();
    if datasets.is_empty() {
        return stats;
    }
    stats.total_instances = datasets.len();

    for (obj, _) in datasets {
        let modality = {
            let m = get_str_or_default(obj, MODALITY);
            if m.is_empty() { "Unknown".to_string() } else { m }
        };
        *stats.modality_distribution.entry(modality).or_insert(0) += 1;
    }

    let mut all_tags = BTreeSet::new();
    for (obj, _) in datasets {
        all_tags.extend(obj.tags());
    }
    for tag in all_tags {
        let present = datasets
            .iter()
            .filter(|(obj, _)| obj.get(tag).is_some())
            .count();
        stats.tag_presence.insert(
            tag.to_string(),
            TagPresence {
                present,
                missing: datasets.len() - present,
                percentage: present as f64 / datasets.len() as f64 * 100.0,
            },
        );
    }

    let mut patients = BTreeSet::new();
    let mut studies = BTreeSet::new();
    let mut series = BTreeSet::new();
    for (obj, _) in datasets {
        let patient = get_str_or_default(obj, PATIENT_ID);
        if !patient.is_empty() {
            patients.insert(patient);
        }
        let study = get_str_or_default(obj, STUDY_INSTANCE_UID);
        if !study.is_empty() {
            studies.insert(study);
        }
        let series_uid = get_str_or_default(obj, SERIES_INSTANCE_UID);
        if !series_uid.is_empty() {
            series.insert(series_uid);
        }
    }
    stats.unique_patients = patients.len();
    stats.unique_studies = studies.len();
    stats.unique_series = series.len();
    stats
}
