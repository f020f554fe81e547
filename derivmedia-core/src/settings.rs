use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::{ConverterEntry, ConvertersSection, DerivmediaConfig};
use crate::derivative::DerivativeType;
use crate::sqlite::{open_connection, open_flags};
use crate::validator::RuleFamily;

const SETTINGS_SCHEMA: &str = include_str!("../../sql/settings.sql");

pub const ENABLE_KEY: &str = "derivativemedia_enable";
pub const MAX_SIZE_LIVE_KEY: &str = "derivativemedia_max_size_live";
pub const THUMBNAIL_PERCENTAGE_KEY: &str = "derivativemedia_video_thumbnail_percentage";

pub fn converters_key(family: RuleFamily) -> String {
    format!("derivativemedia_converters_{}", family.as_str())
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to open settings database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on settings database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("settings database path not configured")]
    MissingStore,
    #[error("invalid value for setting {key}: {source}")]
    Value {
        key: String,
        source: serde_json::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Key/value settings, JSON encoded.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> SettingsResult<Option<Value>>;
    fn set(&self, key: &str, value: &Value) -> SettingsResult<()>;
}

/// Typed read of `key`, `default` when unset.
pub fn setting_or<T: DeserializeOwned>(
    store: &dyn SettingsStore,
    key: &str,
    default: T,
) -> SettingsResult<T> {
    match store.get(key)? {
        Some(value) => serde_json::from_value(value).map_err(|source| SettingsError::Value {
            key: key.to_string(),
            source,
        }),
        None => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSettingsStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSettingsStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SettingsResult<SqliteSettingsStore> {
        let path = self.path.ok_or(SettingsError::MissingStore)?;
        Ok(SqliteSettingsStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSettingsStore {
    pub fn builder() -> SqliteSettingsStoreBuilder {
        SqliteSettingsStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SettingsResult<Self> {
        SqliteSettingsStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> SettingsResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| SettingsError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> SettingsResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SETTINGS_SCHEMA)?;
        Ok(())
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get(&self, key: &str) -> SettingsResult<Option<Value>> {
        let conn = self.open()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|source| SettingsError::Value {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn set(&self, key: &str, value: &Value) -> SettingsResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value.to_string()],
        )?;
        Ok(())
    }
}

/// Settings snapshot taken once per job or request.
#[derive(Debug, Clone, Serialize)]
pub struct DerivativeSettings {
    pub enabled: Vec<DerivativeType>,
    pub max_size_live: u64,
    #[serde(skip)]
    pub converters: ConvertersSection,
    pub thumbnail_percentage: i64,
}

impl DerivativeSettings {
    /// Configuration defaults overridden by stored settings.
    pub fn load(store: &dyn SettingsStore, config: &DerivmediaConfig) -> SettingsResult<Self> {
        let enabled: Vec<String> = setting_or(store, ENABLE_KEY, config.derivatives.enable.clone())?;
        let enabled = enabled
            .iter()
            .filter_map(|tag| match tag.parse::<DerivativeType>() {
                Ok(kind) => Some(kind),
                Err(err) => {
                    warn!(error = %err, "ignoring enabled derivative type");
                    None
                }
            })
            .collect();
        let mut converters = ConvertersSection::default();
        for family in RuleFamily::ALL {
            let entries: Vec<ConverterEntry> = setting_or(
                store,
                &converters_key(family),
                family.entries(&config.converters).to_vec(),
            )?;
            match family {
                RuleFamily::Audio => converters.audio = entries,
                RuleFamily::Video => converters.video = entries,
                RuleFamily::Pdf => converters.pdf = entries,
            }
        }
        Ok(Self {
            enabled,
            max_size_live: setting_or(store, MAX_SIZE_LIVE_KEY, config.derivatives.max_size_live)?,
            converters,
            thumbnail_percentage: setting_or(
                store,
                THUMBNAIL_PERCENTAGE_KEY,
                config.thumbnails.percentage,
            )?,
        })
    }

    pub fn is_enabled(&self, kind: DerivativeType) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn enabled_item_types(&self) -> impl Iterator<Item = DerivativeType> + '_ {
        self.enabled.iter().copied().filter(|kind| kind.is_item_level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture() -> DerivmediaConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/derivmedia.toml");
        load_config(path).unwrap()
    }

    #[test]
    fn stored_values_override_config() {
        let dir = TempDir::new().unwrap();
        let store = SqliteSettingsStore::new(dir.path().join("settings.sqlite")).unwrap();
        store.initialize().unwrap();
        let config = fixture();

        let defaults = DerivativeSettings::load(&store, &config).unwrap();
        assert_eq!(defaults.max_size_live, 30);
        assert_eq!(defaults.converters.audio.len(), 2);
        assert!(defaults.is_enabled(DerivativeType::Zipm));

        store.set(MAX_SIZE_LIVE_KEY, &json!(5)).unwrap();
        store.set(ENABLE_KEY, &json!(["txt", "alto"])).unwrap();
        store
            .set(
                &converters_key(RuleFamily::Audio),
                &json!([{"pattern": "m4a/{filename}.m4a", "command": "-vn"}]),
            )
            .unwrap();
        let settings = DerivativeSettings::load(&store, &config).unwrap();
        assert_eq!(settings.max_size_live, 5);
        assert_eq!(settings.enabled, vec![DerivativeType::Txt]);
        assert_eq!(settings.converters.audio[0].pattern, "m4a/{filename}.m4a");
        assert_eq!(settings.converters.video.len(), 2);
    }

    #[test]
    fn malformed_value_names_the_key() {
        let dir = TempDir::new().unwrap();
        let store = SqliteSettingsStore::new(dir.path().join("settings.sqlite")).unwrap();
        store.initialize().unwrap();
        store.set(MAX_SIZE_LIVE_KEY, &json!("many")).unwrap();
        let err = DerivativeSettings::load(&store, &fixture()).unwrap_err();
        assert!(matches!(err, SettingsError::Value { key, .. } if key == MAX_SIZE_LIVE_KEY));
    }
}
