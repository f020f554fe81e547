//! Derivative records persisted in the media attribute blob.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::derivative::primary_type;
use crate::resource::MediaRecord;

/// Renderer of media backed by an uploaded file.
pub const FILE_RENDERER: &str = "file";

/// Output folder a record is keyed by (`mp3`, `webm`, `pdfs`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivativeFolder(String);

impl DerivativeFolder {
    pub fn new(folder: impl Into<String>) -> Self {
        Self(folder.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DerivativeFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DerivativeFolder {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeRecord {
    pub filename: String,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl DerivativeRecord {
    pub fn new(filename: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            media_type: media_type.into(),
            size: None,
            sha256: None,
        }
    }

    pub fn with_digest(mut self, digest: FileDigest) -> Self {
        self.size = Some(digest.size);
        self.sha256 = Some(digest.sha256);
        self
    }
}

/// Typed view of the attribute blob. Keys other than `derivative` are kept
/// untouched on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivativeData {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derivative: BTreeMap<DerivativeFolder, DerivativeRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DerivativeData {
    pub fn from_json(raw: Option<&str>) -> serde_json::Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(raw) => serde_json::from_str(raw),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn record(&self, folder: &str) -> Option<&DerivativeRecord> {
        self.derivative.get(&DerivativeFolder::from(folder))
    }

    pub fn records(&self) -> impl Iterator<Item = (&DerivativeFolder, &DerivativeRecord)> {
        self.derivative.iter()
    }

    /// Upserts the folder's record, or removes it when either value is
    /// missing. Returns whether the data changed.
    pub fn set_record(
        &mut self,
        folder: &str,
        filename: Option<&str>,
        media_type: Option<&str>,
    ) -> bool {
        match (filename, media_type) {
            (Some(filename), Some(media_type)) => {
                self.upsert(folder, DerivativeRecord::new(filename, media_type))
            }
            _ => self.remove(folder),
        }
    }

    pub fn upsert(&mut self, folder: &str, record: DerivativeRecord) -> bool {
        let previous = self
            .derivative
            .insert(DerivativeFolder::from(folder), record.clone());
        previous.as_ref() != Some(&record)
    }

    pub fn remove(&mut self, folder: &str) -> bool {
        self.derivative
            .remove(&DerivativeFolder::from(folder))
            .is_some()
    }
}

/// Whether derivatives are produced for this media at all.
pub fn is_managed(media: &MediaRecord) -> bool {
    let Some(media_type) = media.media_type.as_deref() else {
        return false;
    };
    if !media.has_original || media.renderer != FILE_RENDERER {
        return false;
    }
    matches!(primary_type(media_type), "audio" | "video") || media_type == "application/pdf"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

pub async fn file_digest(path: &Path) -> io::Result<FileDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok(FileDigest {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}
