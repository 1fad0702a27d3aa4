// ⚙️ Engine configuration (YAML)
//
// Every field has a default, so an empty document is a valid config.

use crate::enrichment::BUILTIN_STEPS;
use crate::entity::EntityKind;
use crate::loader::SourceFile;
use crate::logging::Profile;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite archive; None keeps generations in memory only
    pub database_path: Option<PathBuf>,

    /// rayon pool size for normalization and enrichment (0 = one per core)
    pub worker_threads: usize,

    pub external_step_timeout_ms: u64,

    /// Materialize `unchanged` records in the change set
    pub include_unchanged: bool,

    pub enrichment: EnrichmentConfig,

    /// Explicit input files, ingested in this order
    pub sources: Vec<SourceFile>,

    /// Every *.csv in this directory is ingested after `sources`, sorted by
    /// file name, jurisdiction detected from the name
    pub input_directory: Option<PathBuf>,

    /// Entity kind for files found in `input_directory`
    pub input_kind: EntityKind,

    pub log_profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Built-in step names, applied in this order
    pub enabled_steps: Vec<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        EnrichmentConfig {
            enabled_steps: BUILTIN_STEPS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: None,
            worker_threads: 0,
            external_step_timeout_ms: 2000,
            include_unchanged: false,
            enrichment: EnrichmentConfig::default(),
            sources: Vec::new(),
            input_directory: None,
            input_kind: EntityKind::Company,
            log_profile: Profile::Development,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn external_step_timeout(&self) -> Duration {
        Duration::from_millis(self.external_step_timeout_ms)
    }

    /// `sources` followed by the CSV files of `input_directory`
    pub fn resolved_sources(&self) -> Result<Vec<SourceFile>> {
        let mut sources = self.sources.clone();
        if let Some(dir) = &self.input_directory {
            let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
                .with_context(|| format!("Failed to list input directory {}", dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
                })
                .collect();
            found.sort();
            sources.extend(found.into_iter().map(|path| SourceFile {
                path,
                jurisdiction: None,
                kind: self.input_kind,
            }));
        }
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = EngineConfig::from_yaml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.external_step_timeout(), Duration::from_millis(2000));
        assert_eq!(config.enrichment.enabled_steps.len(), BUILTIN_STEPS.len());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
worker_threads: 4
include_unchanged: true
enrichment:
  enabled_steps: [capital_band, incorporation_year]
sources:
  - path: data/maharashtra.csv
  - path: data/dirs.csv
    jurisdiction: GJ
    kind: director
log_profile: production
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert!(config.include_unchanged);
        assert_eq!(config.external_step_timeout_ms, 2000);
        assert_eq!(config.enrichment.enabled_steps, vec!["capital_band", "incorporation_year"]);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].kind, EntityKind::Company);
        assert_eq!(config.sources[1].kind, EntityKind::Director);
        assert_eq!(config.sources[1].jurisdiction.as_deref(), Some("GJ"));
        assert_eq!(config.log_profile, Profile::Production);
    }

    #[test]
    fn test_unknown_field_value_is_error() {
        assert!(EngineConfig::from_yaml("worker_threads: many").is_err());
    }

    #[test]
    fn test_input_directory_lists_csv_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["maharashtra.csv", "delhi.CSV", "notes.txt", "gujarat.csv"] {
            std::fs::write(dir.path().join(name), "cin\n").unwrap();
        }
        let config = EngineConfig {
            input_directory: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };

        let names: Vec<String> = config
            .resolved_sources()
            .unwrap()
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["delhi.CSV", "gujarat.csv", "maharashtra.csv"]);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(EngineConfig::load(Path::new("/nonexistent/registry.yaml")).is_err());
    }
}
