// Configuration Storage Service
// Handles settings file read/write, version backup and conversion into an AnalysisConfig

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::models::{
    CategoryDefinition, ChunkingOptions, DetectorKind, ExtractionOptions, MergeGranularity,
};
use crate::services::detection::category_catalog::CategorySet;
use crate::services::detection::error::AnalysisError;
use crate::services::detection::orchestrator::AnalysisConfig;

const CONFIG_FILE_NAME: &str = "config.json";
const BACKUPS_KEPT: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persisted engine settings. Every field has a serde default so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub chunking: ChunkingOptions,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub detector: DetectorKind,
    #[serde(default)]
    pub merge: MergeGranularity,
    #[serde(default = "default_context_radius")]
    pub context_radius: usize,
    #[serde(default = "default_min_document_chars")]
    pub min_document_chars: usize,
    #[serde(default)]
    pub extraction: ExtractionOptions,
    /// `name[:model]` of the structured-extraction service.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Replaces the built-in category table when present.
    #[serde(default)]
    pub categories: Option<Vec<CategoryDefinition>>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            chunking: ChunkingOptions::default(),
            confidence_threshold: default_confidence_threshold(),
            detector: DetectorKind::default(),
            merge: MergeGranularity::default(),
            context_radius: default_context_radius(),
            min_document_chars: default_min_document_chars(),
            extraction: ExtractionOptions::default(),
            provider: None,
            providers: HashMap::new(),
            api_keys: HashMap::new(),
            categories: None,
        }
    }
}

impl EngineSettings {
    /// Build and validate the runtime configuration.
    pub fn to_analysis_config(&self) -> Result<AnalysisConfig, AnalysisError> {
        let categories = match &self.categories {
            Some(defs) => Arc::new(CategorySet::from_definitions(defs.clone())?),
            None => CategorySet::builtin(),
        };
        let config = AnalysisConfig {
            chunking: self.chunking.clone(),
            confidence_threshold: self.confidence_threshold,
            detector: self.detector,
            merge: self.merge,
            context_radius: self.context_radius,
            min_document_chars: self.min_document_chars,
            categories,
            extraction: self.extraction.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub model: Option<String>,
    pub base_url: Option<String>,
}

fn default_version() -> String { env!("CARGO_PKG_VERSION").to_string() }
fn default_confidence_threshold() -> f64 { 0.7 }
fn default_context_radius() -> usize { 90 }
fn default_min_document_chars() -> usize { 10 }

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("clauseguard"))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)
            .map_err(|e| ConfigError::io("create config dir", &self.config_dir, e))
    }

    /// Load settings; a missing file yields defaults.
    pub fn load(&self) -> Result<EngineSettings, ConfigError> {
        if !self.config_file.exists() {
            return Ok(EngineSettings::default());
        }

        let content = fs::read_to_string(&self.config_file)
            .map_err(|e| ConfigError::io("read", &self.config_file, e))?;

        Ok(serde_json::from_str(&content)?)
    }

    /// Save settings, backing up the previous file first
    pub fn save(&self, settings: &EngineSettings) -> Result<(), ConfigError> {
        self.ensure_dir()?;

        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.config_file, content)
            .map_err(|e| ConfigError::io("write", &self.config_file, e))
    }

    fn create_backup(&self) -> Result<(), ConfigError> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)
            .map_err(|e| ConfigError::io("create backup dir", &backup_dir, e))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file)
            .map_err(|e| ConfigError::io("back up", &backup_file, e))?;

        self.cleanup_old_backups(&backup_dir, BACKUPS_KEPT)
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), ConfigError> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| ConfigError::io("read backup dir", backup_dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // names embed the timestamp, so lexical order is oldest first
        entries.sort_by_key(|e| e.file_name());

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }

    /// Get provider API key from config file
    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let settings = self.load()?;
        Ok(settings.api_keys.get(provider).cloned())
    }

    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), ConfigError> {
        let mut settings = self.load()?;
        settings.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&settings)
    }

    pub fn delete_api_key(&self, provider: &str) -> Result<(), ConfigError> {
        let mut settings = self.load()?;
        settings.api_keys.remove(provider);
        self.save(&settings)
    }

    /// Get provider base URL from config file
    pub fn get_provider_url(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let settings = self.load()?;
        Ok(settings.providers.get(provider).and_then(|p| p.base_url.clone()))
    }

    pub fn set_provider_url(&self, provider: &str, url: &str) -> Result<(), ConfigError> {
        let mut settings = self.load()?;
        let provider_config = settings.providers.entry(provider.to_string()).or_default();
        provider_config.base_url = Some(url.to_string());
        self.save(&settings)
    }
}
