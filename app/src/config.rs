use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const APP_NAME: &str = "dcmkit";

/// A configured network send destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub label: String,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub calling_ae_title: Option<String>,
}

/// User configuration, persisted as YAML at the platform config path.
/// Unknown keys are ignored; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_path: Option<PathBuf>,
    pub log_level: String,
    pub ae_title: String,
    pub destinations: Vec<Destination>,
    pub window_size: [u32; 2],
    pub default_export_dir: PathBuf,
    pub default_import_dir: PathBuf,
    pub show_image_preview: bool,
    pub theme: String,
    pub file_picker_native: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        AppConfig {
            log_path: None,
            log_level: "INFO".to_string(),
            ae_title: "DCMKIT".to_string(),
            destinations: Vec::new(),
            window_size: [1200, 800],
            default_export_dir: home.join("DICOM_Exports"),
            default_import_dir: home.join("Downloads"),
            show_image_preview: false,
            theme: "dark".to_string(),
            file_picker_native: false,
        }
    }
}

/// Platform configuration directory for this application.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yml")
}

impl AppConfig {
    /// Loads the configuration. A missing file writes the defaults back
    /// to disk; an unreadable or unparsable file falls back to the
    /// in-memory defaults without touching it.
    pub fn load(override_path: Option<&Path>) -> (AppConfig, PathBuf) {
        let path = override_path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                match serde_yaml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Loaded configuration from {}", path.display());
                        (config, path)
                    }
                    Err(e) => {
                        error!("Could not parse config {}: {}", path.display(), e);
                        (AppConfig::default(), path)
                    }
                }
            }
            Ok(_) => (AppConfig::default(), path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                if let Err(e) = config.save(&path) {
                    error!("Could not write default config {}: {}", path.display(), e);
                } else {
                    info!("Created default configuration at {}", path.display());
                }
                (config, path)
            }
            Err(e) => {
                error!("Could not read config {}: {}", path.display(), e);
                (AppConfig::default(), path)
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_yaml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn find_destination(&self, label: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.label == label)
    }

    /// The configured log level as a tracing level filter.
    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_uppercase().as_str() {
            "DEBUG" => tracing::Level::DEBUG,
            "WARNING" | "WARN" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let (config, loaded_path) = AppConfig::load(Some(&path));
        assert_eq!(config, AppConfig::default());
        assert_eq!(loaded_path, path);
        assert!(path.exists());

        // the written file parses back to the same configuration
        let (reloaded, _) = AppConfig::load(Some(&path));
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_fills_missing_keys_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "ae_title: WORKSTATION\ntheme: light\nunknown_key: whatever\n",
        )
        .unwrap();

        let (config, _) = AppConfig::load(Some(&path));
        assert_eq!(config.ae_title, "WORKSTATION");
        assert_eq!(config.theme, "light");
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.window_size, [1200, 800]);
    }

    #[test]
    fn destinations_roundtrip_and_resolve_by_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let mut config = AppConfig::default();
        config.destinations.push(Destination {
            label: "pacs1".to_string(),
            ae_title: "PACS1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 104,
            calling_ae_title: None,
        });
        config.save(&path).unwrap();

        let (reloaded, _) = AppConfig::load(Some(&path));
        let dest = reloaded.find_destination("pacs1").unwrap();
        assert_eq!(dest.host, "10.0.0.5");
        assert_eq!(dest.port, 104);
        assert!(reloaded.find_destination("nope").is_none());
    }

    #[test]
    fn log_levels_map_to_tracing() {
        let mut config = AppConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.log_level = "WARNING".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::WARN);
        config.log_level = "debug".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }
}
