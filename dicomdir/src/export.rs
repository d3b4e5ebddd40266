use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::FileOptions;

use dcmkit_common::CancelFlag;

use crate::builder::{DicomdirBuilder, validate_dicomdir};
use crate::paths::{generate_paths, staged_path};
use crate::{Error, Result};

/// Outcome of an export run.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub exported: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub output: PathBuf,
    pub cancelled: bool,
}

/// Copies the selected files into a flat directory, disambiguating
/// duplicate file names with a numeric suffix.
pub fn export_flat<F>(
    paths: &[PathBuf],
    output_dir: &Path,
    cancel: &CancelFlag,
    mut progress: F,
) -> Result<ExportReport>
where
    F: FnMut(usize, usize, &str),
{
    std::fs::create_dir_all(output_dir)?;
    let mut report = ExportReport {
        output: output_dir.to_path_buf(),
        ..Default::default()
    };
    for (index, path) in paths.iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let name = file_name_of(path);
        progress(index + 1, paths.len(), &name);
        let target = unique_target(output_dir, &name);
        match std::fs::copy(path, &target) {
            Ok(_) => report.exported += 1,
            Err(e) => {
                warn!("Failed to copy {}: {}", path.display(), e);
                report.failed.push((path.clone(), e.to_string()));
            }
        }
    }
    info!(
        "Flat export finished: {} copied, {} failed",
        report.exported,
        report.failed.len()
    );
    Ok(report)
}

/// Packs the selected files into a plain zip archive (flat names).
pub fn export_zip<F>(
    paths: &[PathBuf],
    zip_path: &Path,
    cancel: &CancelFlag,
    mut progress: F,
) -> Result<ExportReport>
where
    F: FnMut(usize, usize, &str),
{
    let file = std::fs::File::create(zip_path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut used_names = std::collections::BTreeSet::new();

    let mut report = ExportReport {
        output: zip_path.to_path_buf(),
        ..Default::default()
    };
    for (index, path) in paths.iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let base = file_name_of(path);
        progress(index + 1, paths.len(), &base);
        let mut name = base.clone();
        let mut suffix = 0;
        while !used_names.insert(name.clone()) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        let result = std::fs::read(path).and_then(|content| {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(&content)
        });
        match result {
            Ok(()) => report.exported += 1,
            Err(e) => {
                warn!("Failed to add {} to archive: {}", path.display(), e);
                report.failed.push((path.clone(), e.to_string()));
            }
        }
    }
    zip.finish()?;
    info!(
        "Zip export finished: {} packed, {} failed",
        report.exported,
        report.failed.len()
    );
    Ok(report)
}

/// Stages the selected files into the standard `DICOM/PATnnnnn/...`
/// tree, writes and validates a DICOMDIR at the staging root, and packs
/// the whole tree into a zip archive.
pub fn export_dicomdir_zip<F>(
    paths: &[PathBuf],
    zip_path: &Path,
    file_set_id: &str,
    cancel: &CancelFlag,
    mut progress: F,
) -> Result<ExportReport>
where
    F: FnMut(usize, usize, &str),
{
    let staging = tempfile::tempdir()?;
    let base_dir = staging.path();

    let mapping = generate_paths(paths);
    if mapping.is_empty() {
        return Err(Error::NoValidFiles);
    }

    let mut report = ExportReport {
        output: zip_path.to_path_buf(),
        ..Default::default()
    };
    let mut staged_mapping: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    let total = mapping.len();
    for (index, (original, layout)) in mapping.iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        progress(index + 1, total, &file_name_of(original));
        let target = staged_path(base_dir, layout);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::copy(original, &target) {
            Ok(_) => {
                staged_mapping.insert(original.clone(), target);
                report.exported += 1;
            }
            Err(e) => {
                warn!("Failed to stage {}: {}", original.display(), e);
                report.failed.push((original.clone(), e.to_string()));
            }
        }
    }
    if staged_mapping.is_empty() {
        return Err(Error::NoValidFiles);
    }

    let mut builder = DicomdirBuilder::new(file_set_id);
    builder.add_dicom_files(&staged_mapping, base_dir);
    let dicomdir_path = base_dir.join("DICOMDIR");
    builder.generate(&dicomdir_path)?;
    validate_dicomdir(&dicomdir_path)?;

    if cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }
    zip_directory(base_dir, zip_path)?;
    info!(
        "DICOMDIR zip export finished: {} files in {}",
        report.exported,
        zip_path.display()
    );
    Ok(report)
}

fn zip_directory(source_dir: &Path, zip_path: &Path) -> Result<()> {
    let file = std::fs::File::create(zip_path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.path().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .expect("walked entries live under the source directory");
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options)?;
        let content = std::fs::read(entry.path())?;
        zip.write_all(&content)?;
    }
    zip.finish()?;
    Ok(())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let mut target = dir.join(name);
    let mut suffix = 0;
    while target.exists() {
        target = dir.join(format!("{name}_{suffix}"));
        suffix += 1;
    }
    target
}

#[cfg(test)]
mod tests {
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::tags;
    use dicom_dictionary_std::uids::CT_IMAGE_STORAGE;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use tempfile::TempDir;

    use super::*;

    fn write_instance(
        dir: &Path,
        name: &str,
        patient: &str,
        study: &str,
        series: &str,
        sop: &str,
        number: &str,
    ) -> PathBuf {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(patient),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Test^Patient"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from("CT"),
        ));
        obj.put(DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(number),
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

    fn sample_collection(dir: &Path) -> Vec<PathBuf> {
        vec![
            write_instance(dir, "a.dcm", "P1", "1.2.1", "1.2.1.1", "1.2.1.1.1", "1"),
            write_instance(dir, "b.dcm", "P1", "1.2.1", "1.2.1.1", "1.2.1.1.2", "2"),
            write_instance(dir, "c.dcm", "P2", "1.2.2", "1.2.2.1", "1.2.2.1.1", "1"),
        ]
    }

    #[test]
    fn generate_paths_resets_counters_per_scope() {
        let dir = TempDir::new().unwrap();
        let paths = sample_collection(dir.path());
        let mapping = generate_paths(&paths);
        assert_eq!(mapping.len(), 3);

        let layouts: Vec<&String> = paths.iter().map(|p| mapping.get(p).unwrap()).collect();
        assert_eq!(layouts[0], "DICOM/PAT00001/STU00001/SER00001/IMG00001");
        assert_eq!(layouts[1], "DICOM/PAT00001/STU00001/SER00001/IMG00002");
        // second patient starts its own study/series/image numbering
        assert_eq!(layouts[2], "DICOM/PAT00002/STU00001/SER00001/IMG00001");
    }

    #[test]
    fn dicomdir_zip_contains_tree_and_index() {
        let dir = TempDir::new().unwrap();
        let paths = sample_collection(dir.path());
        let zip_path = dir.path().join("export.zip");

        let report = export_dicomdir_zip(
            &paths,
            &zip_path,
            "Hôpital #1",
            &CancelFlag::new(),
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!(report.exported, 3);
        assert!(report.failed.is_empty());
        assert!(zip_path.exists());

        let file = std::fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"DICOMDIR".to_string()));
        assert!(
            names
                .iter()
                .any(|n| n.starts_with("DICOM/PAT00001/STU00001/SER00001/"))
        );
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn staged_dicomdir_passes_validation_and_references_resolve() {
        let dir = TempDir::new().unwrap();
        let paths = sample_collection(dir.path());

        let staging = TempDir::new().unwrap();
        let mapping = generate_paths(&paths);
        let mut staged = BTreeMap::new();
        for (original, layout) in &mapping {
            let target = staged_path(staging.path(), layout);
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::copy(original, &target).unwrap();
            staged.insert(original.clone(), target);
        }

        let mut builder = DicomdirBuilder::new("UNIT TEST");
        builder.add_dicom_files(&staged, staging.path());
        let dicomdir = staging.path().join("DICOMDIR");
        builder.generate(&dicomdir).unwrap();

        let summary = validate_dicomdir(&dicomdir).unwrap();
        assert_eq!(summary.record_counts.get("PATIENT"), Some(&2));
        assert_eq!(summary.record_counts.get("STUDY"), Some(&2));
        assert_eq!(summary.record_counts.get("SERIES"), Some(&2));
        assert_eq!(summary.record_counts.get("IMAGE"), Some(&3));

        // the DICOMDIR is itself a readable DICOM dataset
        let obj = dcmkit_common::read_full(&dicomdir).unwrap();
        assert_eq!(
            obj.meta()
                .media_storage_sop_class_uid
                .trim_end_matches('\0'),
            dicom_dictionary_std::uids::MEDIA_STORAGE_DIRECTORY_STORAGE
        );
    }

    #[test]
    fn validation_rejects_dangling_references() {
        let dir = TempDir::new().unwrap();
        let paths = sample_collection(dir.path());

        let staging = TempDir::new().unwrap();
        let mapping = generate_paths(&paths);
        let mut staged = BTreeMap::new();
        for (original, layout) in &mapping {
            let target = staged_path(staging.path(), layout);
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::copy(original, &target).unwrap();
            staged.insert(original.clone(), target);
        }
        let mut builder = DicomdirBuilder::new("X");
        builder.add_dicom_files(&staged, staging.path());
        let dicomdir = staging.path().join("DICOMDIR");
        builder.generate(&dicomdir).unwrap();

        // break one reference
        let victim = staged.values().next().unwrap();
        std::fs::remove_file(victim).unwrap();
        assert!(matches!(
            validate_dicomdir(&dicomdir),
            Err(Error::DanglingReference(_))
        ));
    }

    #[test]
    fn flat_export_disambiguates_name_collisions() {
        let dir = TempDir::new().unwrap();
        let sub_a = dir.path().join("a");
        let sub_b = dir.path().join("b");
        std::fs::create_dir_all(&sub_a).unwrap();
        std::fs::create_dir_all(&sub_b).unwrap();
        let first = write_instance(&sub_a, "same.dcm", "P1", "1.1", "1.1.1", "1.1.1.1", "1");
        let second = write_instance(&sub_b, "same.dcm", "P1", "1.1", "1.1.1", "1.1.1.2", "2");

        let out = dir.path().join("out");
        let report =
            export_flat(&[first, second], &out, &CancelFlag::new(), |_, _, _| {}).unwrap();
        assert_eq!(report.exported, 2);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 2);
    }

    #[test]
    fn plain_zip_contains_every_file() {
        let dir = TempDir::new().unwrap();
        let paths = sample_collection(dir.path());
        let zip_path = dir.path().join("plain.zip");

        let report = export_zip(&paths, &zip_path, &CancelFlag::new(), |_, _, _| {}).unwrap();
        assert_eq!(report.exported, 3);

        let file = std::fs::File::open(&zip_path).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 3);
    }
}
