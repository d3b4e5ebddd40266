use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags::{
    INSTANCE_NUMBER, PATIENT_ID, PATIENT_NAME, SERIES_DESCRIPTION, SERIES_INSTANCE_UID,
    STUDY_DESCRIPTION, STUDY_INSTANCE_UID,
};
use tracing::{info, warn};

use dcmkit_common::dicom::{get_int, get_str_or_default, read_metadata};

/// Generates the standard media layout
/// `DICOM/PATnnnnn/STUnnnnn/SERnnnnn/IMGnnnnn` for the given files.
///
/// The study counter resets per patient, the series counter per study
/// and the image counter per series; images are numbered in
/// InstanceNumber order. Unreadable files are skipped.
pub fn generate_paths(filepaths: &[PathBuf]) -> BTreeMap<PathBuf, String> {
    info!("Generating DICOM standard paths for {} files", filepaths.len());

    // patient key -> study key -> series key -> [(path, instance number)]
    type SeriesMap = BTreeMap<String, Vec<(PathBuf, i64)>>;
    type StudyMap = BTreeMap<String, SeriesMap>;
    let mut hierarchy: BTreeMap<String, StudyMap> = BTreeMap::new();

    for path in filepaths {
        let obj = match read_metadata(path) {
            Ok(obj) => obj,
            Err(e) => {
                warn!("Could not read DICOM file {}: {}", path.display(), e);
                continue;
            }
        };
        let patient_key = format!(
            "{}^{}",
            or_unknown(get_str_or_default(&obj, PATIENT_ID)),
            or_unknown(get_str_or_default(&obj, PATIENT_NAME)),
        );
        let study_key = format!(
            "{}^{}",
            or_unknown(get_str_or_default(&obj, STUDY_INSTANCE_UID)),
            get_str_or_default(&obj, STUDY_DESCRIPTION),
        );
        let series_key = format!(
            "{}^{}",
            or_unknown(get_str_or_default(&obj, SERIES_INSTANCE_UID)),
            get_str_or_default(&obj, SERIES_DESCRIPTION),
        );
        let instance_number = get_int(&obj, INSTANCE_NUMBER).unwrap_or(1);

        hierarchy
            .entry(patient_key)
            .or_default()
            .entry(study_key)
            .or_default()
            .entry(series_key)
            .or_default()
            .push((path.clone(), instance_number));
    }

    let mut mapping = BTreeMap::new();
    for (patient_index, studies) in hierarchy.into_values().enumerate() {
        let patient_dir = format!("PAT{:05}", patient_index + 1);
        for (study_index, series_map) in studies.into_values().enumerate() {
            let study_dir = format!("STU{:05}", study_index + 1);
            for (series_index, mut instances) in series_map.into_values().enumerate() {
                let series_dir = format!("SER{:05}", series_index + 1);
                instances.sort_by_key(|(_, number)| *number);
                for (image_index, (path, _)) in instances.into_iter().enumerate() {
                    let dicom_path = format!(
                        "DICOM/{patient_dir}/{study_dir}/{series_dir}/IMG{:05}",
                        image_index + 1
                    );
                    mapping.insert(path, dicom_path);
                }
            }
        }
    }
    info!("Generated {} DICOM standard paths", mapping.len());
    mapping
}

fn or_unknown(value: String) -> String {
    if value.is_empty() {
        "UNKNOWN".to_string()
    } else {
        value
    }
}

/// Resolves a generated relative layout path against a staging root.
pub(crate) fn staged_path(base: &Path, dicom_path: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in dicom_path.split('/') {
        out.push(component);
    }
    out
}
