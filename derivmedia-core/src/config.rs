use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DerivmediaConfig {
    pub paths: PathsSection,
    pub tools: ToolsSection,
    #[serde(default)]
    pub derivatives: DerivativesSection,
    #[serde(default)]
    pub converters: ConvertersSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub thumbnails: ThumbnailSection,
    #[serde(default)]
    pub leases: LeaseSection,
    #[serde(default)]
    pub delivery: DeliverySection,
}

impl DerivmediaConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.storage_root)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    /// SQLite database shared by the resource, settings, job and lease stores.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("derivmedia.sqlite")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub storage_root: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub ghostscript: PathBuf,
    pub convert: PathBuf,
    pub pdftohtml: PathBuf,
    #[serde(default = "ToolsSection::default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "ToolsSection::default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

impl ToolsSection {
    fn default_timeout() -> u64 {
        3600
    }

    fn default_probe_timeout() -> u64 {
        20
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DerivativesSection {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default = "DerivativesSection::default_max_size_live")]
    pub max_size_live: u64,
}

impl DerivativesSection {
    fn default_max_size_live() -> u64 {
        30
    }
}

impl Default for DerivativesSection {
    fn default() -> Self {
        Self {
            enable: Vec::new(),
            max_size_live: Self::default_max_size_live(),
        }
    }
}

/// One admin-supplied converter entry, kept in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct ConverterEntry {
    pub pattern: String,
    pub command: String,
}

impl ConverterEntry {
    pub fn new(pattern: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvertersSection {
    #[serde(default)]
    pub audio: Vec<ConverterEntry>,
    #[serde(default)]
    pub video: Vec<ConverterEntry>,
    #[serde(default)]
    pub pdf: Vec<ConverterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchSection {
    #[serde(default = "BatchSection::default_page_size")]
    pub page_size: usize,
    #[serde(default = "BatchSection::default_workers")]
    pub workers: usize,
}

impl BatchSection {
    fn default_page_size() -> usize {
        25
    }

    fn default_workers() -> usize {
        1
    }
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            page_size: Self::default_page_size(),
            workers: Self::default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailSection {
    #[serde(default = "ThumbnailSection::default_percentage")]
    pub percentage: i64,
    #[serde(default = "ThumbnailSection::default_fallback")]
    pub fallback_timestamp_seconds: f64,
}

impl ThumbnailSection {
    fn default_percentage() -> i64 {
        25
    }

    fn default_fallback() -> f64 {
        10.0
    }
}

impl Default for ThumbnailSection {
    fn default() -> Self {
        Self {
            percentage: Self::default_percentage(),
            fallback_timestamp_seconds: Self::default_fallback(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "LeaseSection::default_ttl")]
    pub ttl_seconds: i64,
}

impl LeaseSection {
    fn default_ttl() -> i64 {
        7200
    }
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_seconds: Self::default_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    #[serde(default = "DeliverySection::default_bind")]
    pub bind: String,
    #[serde(default = "DeliverySection::default_cache_days")]
    pub cache_max_age_days: u32,
    #[serde(default)]
    pub archive_comment: String,
}

impl DeliverySection {
    fn default_bind() -> String {
        "127.0.0.1:8088".to_string()
    }

    fn default_cache_days() -> u32 {
        30
    }
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            cache_max_age_days: Self::default_cache_days(),
            archive_comment: String::new(),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DerivmediaConfig> {
    let config: DerivmediaConfig = load_toml(path)?;
    if config.batch.page_size == 0 {
        return Err(ConfigError::Invalid {
            key: "batch.page_size".into(),
            reason: "must be greater than zero".into(),
        });
    }
    if config.batch.workers == 0 {
        return Err(ConfigError::Invalid {
            key: "batch.workers".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/derivmedia.toml");
        let config = load_config(path).expect("config should parse");
        assert_eq!(config.batch.page_size, 25);
        assert_eq!(config.derivatives.max_size_live, 30);
        assert_eq!(config.converters.audio.len(), 2);
        assert_eq!(config.converters.audio[0].pattern, "mp3/{filename}.mp3");
        assert_eq!(config.converters.video[1].pattern, "mp4/{filename}.mp4");
        assert_eq!(config.thumbnails.percentage, 25);
        assert_eq!(
            config.storage_root(),
            PathBuf::from("/var/lib/derivmedia/files")
        );
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config("/nonexistent/derivmedia.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/derivmedia.toml"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
