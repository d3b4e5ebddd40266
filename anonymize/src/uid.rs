use std::collections::HashMap;

use dcmkit_common::generate_uid;

/// Mapping from original to freshly generated UIDs, scoped to one
/// anonymization run. The same original UID always maps to the same new
/// UID within that run, which is what keeps study/series/instance links
/// intact after remapping.
#[derive(Debug, Clone, Default)]
pub struct UidMapper {
    map: HashMap<String, String>,
}

impl UidMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the consistent replacement for `original`, generating and
    /// recording a fresh UID on first sight.
    pub fn get_mapped_uid(&mut self, original: &str) -> String {
        self.map
            .entry(original.to_string())
            .or_insert_with(generate_uid)
            .clone()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn mappings(&self) -> &HashMap<String, String> {
        &self.map
    }
}
