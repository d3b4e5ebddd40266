use std::path::{Path, PathBuf};

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids::CT_IMAGE_STORAGE;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use tempfile::TempDir;

use dcmkit_anonymize::{AnonymizationEngine, TemplateStore};
use dcmkit_common::CancelFlag;
use dcmkit_common::dicom::{get_str, get_str_or_default, read_metadata};

fn write_instance(dir: &Path, name: &str, study_uid: &str, sop_uid: &str) -> PathBuf {
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
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.999.1"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("Maier^Anna"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from("PAT-77"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_BIRTH_DATE,
        VR::DA,
        PrimitiveValue::from("19660302"),
    ));
    obj.put(DataElement::new(
        tags::STUDY_DATE,
        VR::DA,
        PrimitiveValue::from("20230615"),
    ));
    obj.put(DataElement::new(
        tags::REFERRING_PHYSICIAN_NAME,
        VR::PN,
        PrimitiveValue::from("House^Gregory"),
    ));
    obj.put(DataElement::new(
        Tag(0x0009, 0x1001),
        VR::LO,
        PrimitiveValue::from("vendor secret"),
    ));
    let path = dir.join(name);
    obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax(dicom_transfer_syntax_registry::default().erased().uid())
            .media_storage_sop_class_uid(CT_IMAGE_STORAGE),
    )
    .unwrap()
    .write_to_file(&path)
    .unwrap();
    path
}

#[test]
fn research_standard_template_end_to_end() {
    let data_dir = TempDir::new().unwrap();
    let config_dir = TempDir::new().unwrap();
    let a = write_instance(data_dir.path(), "a.dcm", "1.2.840.555.1", "1.2.840.555.1.1");
    let b = write_instance(data_dir.path(), "b.dcm", "1.2.840.555.1", "1.2.840.555.1.2");

    let store = TemplateStore::load(config_dir.path());
    let template = store.get("Research Standard").unwrap().clone();

    let mut engine = AnonymizationEngine::new();
    let result = engine.anonymize_collection(
        &template,
        &[a.clone(), b.clone()],
        &CancelFlag::new(),
        |_, _, _| {},
    );
    assert_eq!(result.anonymized_count(), 2);
    assert!(result.failed_files.is_empty());
    assert!(result.date_shift_applied);

    let obj_a = read_metadata(&a).unwrap();
    let obj_b = read_metadata(&b).unwrap();

    // identity handling: replaced name, hashed id, blanked birth date
    assert_eq!(get_str_or_default(&obj_a, tags::PATIENT_NAME), "RESEARCH_PATIENT");
    let hashed_id = get_str_or_default(&obj_a, tags::PATIENT_ID);
    assert_eq!(hashed_id.len(), 16);
    assert_ne!(hashed_id, "PAT-77");
    assert_eq!(get_str_or_default(&obj_a, tags::PATIENT_BIRTH_DATE), "19000101");

    // the study date moved back exactly one year
    assert_eq!(get_str_or_default(&obj_a, tags::STUDY_DATE), "20220615");

    // physician and private data are gone
    assert!(get_str(&obj_a, tags::REFERRING_PHYSICIAN_NAME).is_none());
    assert!(obj_a.get(Tag(0x0009, 0x1001)).is_none());

    // relationship preservation: both files share the same remapped
    // study UID, distinct from the original
    let study_a = get_str_or_default(&obj_a, tags::STUDY_INSTANCE_UID);
    let study_b = get_str_or_default(&obj_b, tags::STUDY_INSTANCE_UID);
    assert_eq!(study_a, study_b);
    assert_ne!(study_a, "1.2.840.555.1");
    assert_eq!(result.uid_mappings.get("1.2.840.555.1"), Some(&study_a));

    // remapped SOP instance UIDs stay unique per file
    let sop_a = get_str_or_default(&obj_a, tags::SOP_INSTANCE_UID);
    let sop_b = get_str_or_default(&obj_b, tags::SOP_INSTANCE_UID);
    assert_ne!(sop_a, sop_b);

    // the written files still satisfy the identity invariants
    assert!(get_str(&obj_a, tags::SOP_CLASS_UID).is_some());
    assert_eq!(
        obj_a.meta().media_storage_sop_instance_uid.trim_end_matches('\0'),
        sop_a
    );
}
