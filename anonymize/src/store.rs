use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::builtin::builtin_templates;
use crate::template::AnonymizationTemplate;
use crate::Result;

const TEMPLATES_FILE: &str = "anonymization_templates.json";

#[derive(Debug, Serialize, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: Vec<AnonymizationTemplate>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// Persistent template collection backed by a single JSON file in the
/// configuration directory.
///
/// Built-in templates are always present after a load; user templates
/// with the same name shadow them. Mutations save synchronously, which
/// is acceptable because the file stays small.
#[derive(Debug)]
pub struct TemplateStore {
    path: PathBuf,
    templates: BTreeMap<String, AnonymizationTemplate>,
}

impl TemplateStore {
    /// Loads the store from `<config_dir>/anonymization_templates.json`.
    /// A missing or unreadable file yields the built-ins only.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(TEMPLATES_FILE);
        let mut templates = BTreeMap::new();
        for template in builtin_templates() {
            templates.insert(template.name.clone(), template);
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<TemplateFile>(&content) {
                Ok(file) => {
                    for template in file.templates {
                        templates.insert(template.name.clone(), template);
                    }
                }
                Err(e) => {
                    error!("Failed to parse template file {}: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("Failed to read template file {}: {}", path.display(), e);
            }
        }
        info!("Loaded {} anonymization templates", templates.len());
        TemplateStore { path, templates }
    }

    /// Writes every template (built-ins included) back to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = TemplateFile {
            templates: self.templates.values().cloned().collect(),
            version: "1.0".to_string(),
            last_updated: Some(Utc::now()),
        };
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, content)?;
        info!("Saved {} anonymization templates", self.templates.len());
        Ok(())
    }

    pub fn add(&mut self, template: AnonymizationTemplate) -> Result<()> {
        self.templates.insert(template.name.clone(), template);
        self.save()
    }

    /// Removes a template by name; returns whether it existed.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let existed = self.templates.remove(name).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    pub fn get(&self, name: &str) -> Option<&AnonymizationTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
