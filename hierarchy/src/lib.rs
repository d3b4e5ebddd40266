//! Reconstructs the Patient → Study → Series → Instance tree from an
//! unordered set of DICOM files and provides the subtree traversal,
//! merge and delete operations that every batch engine builds on.
//!
//! Nodes live in an arena and are addressed by [`NodeId`] handles;
//! parent links are indices, so the tree is acyclic by construction.
//!
//! Known limitation: when PatientID is absent the patient key falls back
//! to PatientName, so two different patients sharing a name collapse
//! into one node.

mod error;
pub mod merge;

pub use error::{Error, Result};
pub use merge::{MergeReport, merge_patients, merge_series, merge_studies};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags::{
    INSTANCE_NUMBER, MODALITY, PATIENT_ID, PATIENT_NAME, SERIES_DESCRIPTION, SERIES_INSTANCE_UID,
    SERIES_NUMBER, SOP_INSTANCE_UID, STUDY_DATE, STUDY_DESCRIPTION, STUDY_ID, STUDY_INSTANCE_UID,
    STUDY_TIME,
};
use dicom_object::InMemDicomObject;
use tracing::{debug, warn};

use dcmkit_common::dicom::{get_str_or_default, read_metadata};

const UNKNOWN: &str = "Unknown";

/// Identity keys and display metadata extracted from one instance file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceMeta {
    pub path: PathBuf,
    pub patient_id: String,
    pub patient_name: String,
    pub study_uid: String,
    pub study_date: String,
    pub study_time: String,
    pub study_description: String,
    pub study_id: String,
    pub series_uid: String,
    pub series_number: String,
    pub series_description: String,
    pub modality: String,
    pub sop_instance_uid: String,
    pub instance_number: String,
}

impl InstanceMeta {
    pub fn from_object(obj: &InMemDicomObject, path: &Path) -> Self {
        InstanceMeta {
            path: path.to_path_buf(),
            patient_id: get_str_or_default(obj, PATIENT_ID),
            patient_name: get_str_or_default(obj, PATIENT_NAME),
            study_uid: get_str_or_default(obj, STUDY_INSTANCE_UID),
            study_date: get_str_or_default(obj, STUDY_DATE),
            study_time: get_str_or_default(obj, STUDY_TIME),
            study_description: get_str_or_default(obj, STUDY_DESCRIPTION),
            study_id: get_str_or_default(obj, STUDY_ID),
            series_uid: get_str_or_default(obj, SERIES_INSTANCE_UID),
            series_number: get_str_or_default(obj, SERIES_NUMBER),
            series_description: get_str_or_default(obj, SERIES_DESCRIPTION),
            modality: get_str_or_default(obj, MODALITY),
            sop_instance_uid: get_str_or_default(obj, SOP_INSTANCE_UID),
            instance_number: get_str_or_default(obj, INSTANCE_NUMBER),
        }
    }

    /// Patient grouping key. Falls back to the patient name with a
    /// sentinel suffix when the ID is missing.
    pub fn patient_key(&self) -> String {
        if !self.patient_id.is_empty() {
            self.patient_id.clone()
        } else if !self.patient_name.is_empty() {
            format!("{}#NOID", self.patient_name)
        } else {
            UNKNOWN.to_string()
        }
    }

    pub fn study_key(&self) -> String {
        if self.study_uid.is_empty() {
            UNKNOWN.to_string()
        } else {
            self.study_uid.clone()
        }
    }

    pub fn series_key(&self) -> String {
        if self.series_uid.is_empty() {
            UNKNOWN.to_string()
        } else {
            self.series_uid.clone()
        }
    }

    /// Instance grouping key; the file path stands in when the SOP
    /// instance UID is missing so that such files stay distinct.
    pub fn instance_key(&self) -> String {
        if self.sop_instance_uid.is_empty() {
            self.path.display().to_string()
        } else {
            self.sop_instance_uid.clone()
        }
    }

    fn patient_label(&self) -> String {
        match (self.patient_name.is_empty(), self.patient_id.is_empty()) {
            (false, false) => format!("{} ({})", self.patient_name, self.patient_id),
            (false, true) => self.patient_name.clone(),
            (true, false) => self.patient_id.clone(),
            (true, true) => UNKNOWN.to_string(),
        }
    }

    fn study_label(&self) -> String {
        if !self.study_description.is_empty() {
            self.study_description.clone()
        } else if !self.study_uid.is_empty() {
            self.study_uid.clone()
        } else {
            UNKNOWN.to_string()
        }
    }

    fn series_label(&self) -> String {
        if !self.series_description.is_empty() {
            self.series_description.clone()
        } else if !self.series_uid.is_empty() {
            self.series_uid.clone()
        } else {
            UNKNOWN.to_string()
        }
    }
}

/// Handle of a node in the hierarchy arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Patient,
    Study,
    Series,
    Instance,
}

impl Level {
    pub fn name(self) -> &'static str {
        match self {
            Level::Patient => "patient",
            Level::Study => "study",
            Level::Series => "series",
            Level::Instance => "instance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub level: Level,
    pub key: String,
    pub label: String,
    pub parent: Option<NodeId>,
    /// Owning file path; present on instance nodes only.
    pub path: Option<PathBuf>,
    children: Vec<NodeId>,
    sort_text: String,
    sort_number: Option<i64>,
}

impl Node {
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// A file that could not be read during a build; the build itself never
/// aborts on unreadable input.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub hierarchy: Hierarchy,
    pub skipped: Vec<SkippedFile>,
}

/// The four-level DICOM tree plus a per-path metadata cache for fast
/// re-display.
#[derive(Debug, Default)]
pub struct Hierarchy {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    cache: HashMap<PathBuf, InstanceMeta>,
}

impl Hierarchy {
    /// Builds a hierarchy by reading the metadata of every given file.
    /// Unreadable files are skipped and reported.
    pub fn build<I, P>(paths: I) -> BuildOutcome
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self::build_with_progress(paths, &dcmkit_common::CancelFlag::new(), |_, _, _| {})
    }

    /// Like [`Hierarchy::build`], but reports per-file progress and
    /// stops early (keeping the partial tree) when cancelled.
    pub fn build_with_progress<I, P, F>(
        paths: I,
        cancel: &dcmkit_common::CancelFlag,
        mut progress: F,
    ) -> BuildOutcome
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        F: FnMut(usize, usize, &str),
    {
        let paths: Vec<_> = paths.into_iter().collect();
        let total = paths.len();
        let mut hierarchy = Hierarchy::default();
        let mut skipped = Vec::new();
        for (index, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let path = path.as_ref();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            progress(index + 1, total, &name);
            match read_metadata(path) {
                Ok(obj) => {
                    let meta = InstanceMeta::from_object(&obj, path);
                    hierarchy.insert(meta);
                }
                Err(e) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), e);
                    skipped.push(SkippedFile {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        hierarchy.sort();
        debug!(
            "Hierarchy built: {} patients, {} instances, {} skipped",
            hierarchy.roots.len(),
            hierarchy.cache.len(),
            skipped.len()
        );
        BuildOutcome { hierarchy, skipped }
    }

    fn insert(&mut self, meta: InstanceMeta) {
        let patient = self.find_or_create_root(meta.patient_key(), meta.patient_label());
        let study = self.find_or_create_child(
            patient,
            Level::Study,
            meta.study_key(),
            meta.study_label(),
            format!("{}{}", meta.study_date, meta.study_time),
            None,
        );
        let series = self.find_or_create_child(
            study,
            Level::Series,
            meta.series_key(),
            meta.series_label(),
            String::new(),
            meta.series_number.parse::<i64>().ok(),
        );
        let instance = self.push_node(Node {
            level: Level::Instance,
            key: meta.instance_key(),
            label: meta.instance_key(),
            parent: Some(series),
            path: Some(meta.path.clone()),
            children: Vec::new(),
            sort_text: String::new(),
            sort_number: meta.instance_number.parse::<i64>().ok(),
        });
        self.nodes[series.0].children.push(instance);
        self.cache.insert(meta.path.clone(), meta);
    }

    fn find_or_create_root(&mut self, key: String, label: String) -> NodeId {
        if let Some(id) = self
            .roots
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].key == key)
        {
            return id;
        }
        let id = self.push_node(Node {
            level: Level::Patient,
            key,
            label,
            parent: None,
            path: None,
            children: Vec::new(),
            sort_text: String::new(),
            sort_number: None,
        });
        self.roots.push(id);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn find_or_create_child(
        &mut self,
        parent: NodeId,
        level: Level,
        key: String,
        label: String,
        sort_text: String,
        sort_number: Option<i64>,
    ) -> NodeId {
        if let Some(id) = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].key == key)
        {
            return id;
        }
        let id = self.push_node(Node {
            level,
            key,
            label,
            parent: Some(parent),
            path: None,
            children: Vec::new(),
            sort_text,
            sort_number,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn sort(&mut self) {
        let mut roots = std::mem::take(&mut self.roots);
        roots.sort_by(|a, b| self.compare(*a, *b));
        self.roots = roots;
        for index in 0..self.nodes.len() {
            let mut children = std::mem::take(&mut self.nodes[index].children);
            children.sort_by(|a, b| self.compare(*a, *b));
            self.nodes[index].children = children;
        }
    }

    fn compare(&self, a: NodeId, b: NodeId) -> Ordering {
        let na = &self.nodes[a.0];
        let nb = &self.nodes[b.0];
        match na.level {
            Level::Patient => na.key.cmp(&nb.key),
            Level::Study => na
                .sort_text
                .cmp(&nb.sort_text)
                .then_with(|| na.key.cmp(&nb.key)),
            // Missing or non-numeric numbers sort last.
            Level::Series | Level::Instance => {
                let ka = (na.sort_number.is_none(), na.sort_number.unwrap_or(0));
                let kb = (nb.sort_number.is_none(), nb.sort_number.unwrap_or(0));
                ka.cmp(&kb).then_with(|| na.key.cmp(&nb.key))
            }
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Direct access to a node. The id must come from this hierarchy.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Cached metadata for a loaded instance file.
    pub fn meta(&self, path: &Path) -> Option<&InstanceMeta> {
        self.cache.get(path)
    }

    /// Finds an attached node by level and key (patient key, study or
    /// series instance UID, SOP instance UID).
    pub fn find(&self, level: Level, key: &str) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if node.level == level && node.key == key {
                return Some(id);
            }
            stack.extend(node.children.iter().copied());
        }
        None
    }

    /// Counts of (patients, studies, series, instances), attached nodes
    /// only.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0usize, 0usize, 0usize, 0usize);
        let mut stack: Vec<NodeId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            match node.level {
                Level::Patient => counts.0 += 1,
                Level::Study => counts.1 += 1,
                Level::Series => counts.2 += 1,
                Level::Instance => counts.3 += 1,
            }
            stack.extend(node.children.iter().copied());
        }
        counts
    }

    /// Collects the file paths of every instance below `id`, in document
    /// order. This is the primitive behind "operate on this subtree".
    pub fn collect_instance_paths(&self, id: NodeId) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.collect_into(id, &mut paths);
        paths
    }

    /// Collects instance paths under several selected nodes, in document
    /// order, without duplicates when selections overlap.
    pub fn collect_instance_paths_many(&self, ids: &[NodeId]) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for id in ids {
            self.collect_into(*id, &mut paths);
        }
        let mut seen = std::collections::HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));
        paths
    }

    fn collect_into(&self, id: NodeId, out: &mut Vec<PathBuf>) {
        let node = &self.nodes[id.0];
        if let Some(path) = &node.path {
            out.push(path.clone());
            return;
        }
        for child in &node.children {
            self.collect_into(*child, out);
        }
    }

    /// Detaches the instance owning `path` from the tree; parents left
    /// without children cascade away. The arena slot itself is retained.
    pub fn remove_path(&mut self, path: &Path) {
        let Some(id) = self
            .nodes
            .iter()
            .position(|n| n.path.as_deref() == Some(path))
        else {
            return;
        };
        self.cache.remove(path);
        self.detach(NodeId(id));
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.nodes[id.0].parent;
        match parent {
            Some(pid) => {
                self.nodes[pid.0].children.retain(|c| *c != id);
                if self.nodes[pid.0].children.is_empty() {
                    self.detach(pid);
                }
            }
            None => {
                self.roots.retain(|r| *r != id);
            }
        }
    }
}

/// Outcome of a deletion batch.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Removes from disk every instance file under the selected nodes and
/// detaches the corresponding tree entries. Deletion is final.
pub fn delete_files(hierarchy: &mut Hierarchy, ids: &[NodeId]) -> DeleteReport {
    let mut report = DeleteReport::default();
    for path in hierarchy.collect_instance_paths_many(ids) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                hierarchy.remove_path(&path);
                report.deleted += 1;
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::tags;
    use dicom_dictionary_std::uids::CT_IMAGE_STORAGE;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use tempfile::TempDir;

    use super::*;

    pub(crate) struct TestInstance<'a> {
        pub patient_id: &'a str,
        pub patient_name: &'a str,
        pub study_uid: &'a str,
        pub series_uid: &'a str,
        pub sop_uid: &'a str,
        pub instance_number: Option<&'a str>,
        pub modality: &'a str,
    }

    impl Default for TestInstance<'_> {
        fn default() -> Self {
            TestInstance {
                patient_id: "P1",
                patient_name: "Doe^John",
                study_uid: "1.2.3.1",
                series_uid: "1.2.3.1.1",
                sop_uid: "1.2.3.1.1.1",
                instance_number: Some("1"),
                modality: "CT",
            }
        }
    }

    pub(crate) fn write_instance(dir: &Path, name: &str, spec: &TestInstance) -> PathBuf {
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
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(spec.patient_name),
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
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from(spec.modality),
        ));
        if let Some(number) = spec.instance_number {
            obj.put(DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from(number),
            ));
        }
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

    #[test]
    fn builds_four_level_tree() {
        let dir = TempDir::new().unwrap();
        let a = write_instance(dir.path(), "a.dcm", &TestInstance::default());
        let b = write_instance(
            dir.path(),
            "b.dcm",
            &TestInstance {
                sop_uid: "1.2.3.1.1.2",
                instance_number: Some("2"),
                ..Default::default()
            },
        );
        let c = write_instance(
            dir.path(),
            "c.dcm",
            &TestInstance {
                series_uid: "1.2.3.1.2",
                sop_uid: "1.2.3.1.2.1",
                ..Default::default()
            },
        );

        let outcome = Hierarchy::build([&a, &b, &c]);
        assert!(outcome.skipped.is_empty());
        let h = outcome.hierarchy;
        assert_eq!(h.roots().len(), 1);
        let (patients, studies, series, instances) = h.counts();
        assert_eq!((patients, studies, series, instances), (1, 1, 2, 3));

        let all = h.collect_instance_paths(h.roots()[0]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn unreadable_files_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let good = write_instance(dir.path(), "good.dcm", &TestInstance::default());
        let bad = dir.path().join("bad.bin");
        std::fs::write(&bad, b"not dicom at all, nothing to see").unwrap();

        let outcome = Hierarchy::build([&good, &bad]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].path, bad);
        assert_eq!(outcome.hierarchy.counts().3, 1);
    }

    #[test]
    fn missing_instance_number_sorts_last() {
        let dir = TempDir::new().unwrap();
        let late = write_instance(
            dir.path(),
            "late.dcm",
            &TestInstance {
                sop_uid: "1.2.3.1.1.9",
                instance_number: None,
                ..Default::default()
            },
        );
        let first = write_instance(
            dir.path(),
            "first.dcm",
            &TestInstance {
                sop_uid: "1.2.3.1.1.1",
                instance_number: Some("1"),
                ..Default::default()
            },
        );
        let second = write_instance(
            dir.path(),
            "second.dcm",
            &TestInstance {
                sop_uid: "1.2.3.1.1.2",
                instance_number: Some("10"),
                ..Default::default()
            },
        );

        let h = Hierarchy::build([&late, &first, &second]).hierarchy;
        let paths = h.collect_instance_paths(h.roots()[0]);
        assert_eq!(paths, vec![first, second, late]);
    }

    #[test]
    fn patient_fallback_key_uses_name() {
        let dir = TempDir::new().unwrap();
        let path = write_instance(
            dir.path(),
            "noid.dcm",
            &TestInstance {
                patient_id: "",
                ..Default::default()
            },
        );
        let h = Hierarchy::build([&path]).hierarchy;
        assert_eq!(h.node(h.roots()[0]).key, "Doe^John#NOID");
    }

    #[test]
    fn delete_removes_files_and_cascades() {
        let dir = TempDir::new().unwrap();
        let a = write_instance(dir.path(), "a.dcm", &TestInstance::default());
        let b = write_instance(
            dir.path(),
            "b.dcm",
            &TestInstance {
                series_uid: "1.2.3.1.2",
                sop_uid: "1.2.3.1.2.1",
                ..Default::default()
            },
        );

        let mut h = Hierarchy::build([&a, &b]).hierarchy;
        let series_node = {
            let patient = h.roots()[0];
            let study = h.node(patient).children()[0];
            h.node(study).children()[0]
        };
        let report = delete_files(&mut h, &[series_node]);
        assert_eq!(report.deleted, 1);
        assert!(report.failed.is_empty());
        assert!(!a.exists());
        assert!(b.exists());
        // the emptied series is gone, its sibling survives
        let (_, _, series, instances) = h.counts();
        assert_eq!((series, instances), (1, 1));
    }
}
