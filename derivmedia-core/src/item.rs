//! Item-level derivatives built from all eligible media of one item.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::derivative::{primary_type, DerivativeType};
use crate::engine::remove_if_exists;
use crate::lease::LeaseStore;
use crate::paths::{temp_file_path, PathResolver};
use crate::resource::MediaRecord;
use crate::store::set_file_mode;
use crate::tools::{ToolError, ToolInvoker, ToolKind};

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("{tool} exited with {exit_code:?}")]
    ToolFailed {
        tool: ToolKind,
        exit_code: Option<i32>,
    },
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("{0} is not an item derivative")]
    NotItemLevel(DerivativeType),
    #[error("{kind} accepts a single source, got {count}")]
    TooManySources { kind: DerivativeType, count: usize },
    #[error("{0} produced no output")]
    EmptyOutput(DerivativeType),
    #[error("background task failed: {0}")]
    Task(String),
}

pub type ItemResult<T> = Result<T, ItemError>;

/// One input of an item derivative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub media_id: i64,
    pub name: String,
    pub media_type: String,
    pub size: u64,
    /// Original file; absent for extracted-text sources.
    pub path: Option<PathBuf>,
    pub content: Option<String>,
}

/// Media of an item usable for `kind`, in item order.
pub fn data_media(resolver: &PathResolver, media: &[MediaRecord], kind: DerivativeType) -> Vec<SourceFile> {
    media
        .iter()
        .filter_map(|record| source_for(resolver, record, kind))
        .collect()
}

fn source_for(resolver: &PathResolver, media: &MediaRecord, kind: DerivativeType) -> Option<SourceFile> {
    if kind == DerivativeType::Text {
        let content = media
            .extracted_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())?;
        return Some(SourceFile {
            media_id: media.id,
            name: media.display_name(),
            media_type: "text/plain".to_string(),
            size: content.len() as u64,
            path: None,
            content: Some(content.to_string()),
        });
    }
    let media_type = media.media_type.clone()?;
    if !media.has_original {
        return None;
    }
    let accepted = match kind {
        DerivativeType::Pdf => primary_type(&media_type) == "image",
        DerivativeType::Pdf2Xml => media_type == "application/pdf",
        DerivativeType::Txt => media_type == "text/plain",
        DerivativeType::Zipm => matches!(primary_type(&media_type), "image" | "audio" | "video"),
        DerivativeType::Zipo => !matches!(primary_type(&media_type), "image" | "audio" | "video"),
        DerivativeType::Zip => true,
        _ => false,
    };
    if !accepted {
        return None;
    }
    let path = resolver.original_path(media.storage_id.as_deref()?, &media.extension);
    let size = std::fs::metadata(&path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .filter(|size| *size > 0)?;
    File::open(&path).ok()?;
    Some(SourceFile {
        media_id: media.id,
        name: media.display_name(),
        media_type,
        size,
        path: Some(path),
        content: None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ItemOutcome {
    Created { path: PathBuf, size: u64 },
    /// A lease on the output is held by another worker.
    InProgress,
    /// Nothing in the item can feed this derivative.
    NoSource,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ItemBuilder {
    resolver: PathResolver,
    invoker: ToolInvoker,
    leases: LeaseStore,
    archive_comment: String,
}

impl ItemBuilder {
    pub fn new(
        resolver: PathResolver,
        invoker: ToolInvoker,
        leases: LeaseStore,
        archive_comment: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            invoker,
            leases,
            archive_comment: archive_comment.into(),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Whether another worker is currently producing this derivative. Only a
    /// live lease counts; a temp file left without one is an orphan that the
    /// next build overwrites.
    pub fn in_progress(&self, item_id: i64, kind: DerivativeType) -> bool {
        match self.leases.is_held(&lease_key(kind, item_id)) {
            Ok(true) => true,
            Ok(false) => {
                let temp = temp_file_path(&self.resolver.item_path(kind, item_id));
                if temp.is_file() {
                    debug!(item_id, kind = %kind, path = %temp.display(), "ignoring orphaned temp file");
                }
                false
            }
            Err(err) => {
                warn!(item_id, kind = %kind, error = %err, "unable to read lease");
                false
            }
        }
    }

    pub async fn build(&self, item_id: i64, kind: DerivativeType, sources: &[SourceFile]) -> ItemOutcome {
        if sources.is_empty() {
            return ItemOutcome::NoSource;
        }
        let key = lease_key(kind, item_id);
        let guard = match self.leases.guard(item_id, &key) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(item_id, kind = %kind, "item derivative already in progress");
                return ItemOutcome::InProgress;
            }
            Err(err) => {
                error!(item_id, kind = %kind, error = %err, "unable to take lease");
                return ItemOutcome::Failed {
                    reason: "lease unavailable".to_string(),
                };
            }
        };
        let path = self.resolver.item_path(kind, item_id);
        let temp = temp_file_path(&path);
        let result = self.write(kind, sources, &path, &temp).await;
        drop(guard);
        match result {
            Ok(size) => {
                info!(item_id, kind = %kind, size, "item derivative created");
                ItemOutcome::Created { path, size }
            }
            Err(err) => {
                remove_if_exists(&temp).await;
                error!(item_id, kind = %kind, error = %err, "item derivative failed");
                ItemOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn write(
        &self,
        kind: DerivativeType,
        sources: &[SourceFile],
        path: &Path,
        temp: &Path,
    ) -> ItemResult<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ItemError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        remove_if_exists(temp).await;
        match kind {
            DerivativeType::Pdf => self.write_pdf(sources, temp).await?,
            DerivativeType::Pdf2Xml => self.write_pdf2xml(sources, temp).await?,
            DerivativeType::Txt | DerivativeType::Text => write_text(sources, temp).await?,
            DerivativeType::Zip | DerivativeType::Zipm | DerivativeType::Zipo => {
                let sources = sources.to_vec();
                let output = temp.to_path_buf();
                let comment = self.archive_comment.clone();
                tokio::task::spawn_blocking(move || write_zip(&sources, &output, &comment))
                    .await
                    .map_err(|err| ItemError::Task(err.to_string()))??;
            }
            other => return Err(ItemError::NotItemLevel(other)),
        }
        let size = tokio::fs::metadata(temp)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size == 0 {
            return Err(ItemError::EmptyOutput(kind));
        }
        tokio::fs::rename(temp, path)
            .await
            .map_err(|source| ItemError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        if let Err(err) = set_file_mode(path).await {
            warn!(path = %path.display(), error = %err, "unable to set derivative permissions");
        }
        Ok(size)
    }

    async fn write_pdf(&self, sources: &[SourceFile], temp: &Path) -> ItemResult<()> {
        let mut args: Vec<String> = sources
            .iter()
            .filter_map(|source| source.path.as_ref())
            .map(|path| path.display().to_string())
            .collect();
        args.push("-quality".to_string());
        args.push("100".to_string());
        args.push(temp.display().to_string());
        self.run(ToolKind::Convert, &args).await
    }

    async fn write_pdf2xml(&self, sources: &[SourceFile], temp: &Path) -> ItemResult<()> {
        let [source] = sources else {
            return Err(ItemError::TooManySources {
                kind: DerivativeType::Pdf2Xml,
                count: sources.len(),
            });
        };
        let input = source
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let args = [
            "-i", "-c", "-hidden", "-nodrm", "-enc", "UTF-8", "-xml",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .chain([input, temp.display().to_string()])
        .collect::<Vec<_>>();
        self.run(ToolKind::Pdftohtml, &args).await
    }

    async fn run(&self, tool: ToolKind, args: &[String]) -> ItemResult<()> {
        let output = self.invoker.invoke(tool, args).await?;
        if output.success() {
            Ok(())
        } else {
            error!(command = %output.command, output = %output.output, "item derivative tool failed");
            Err(ItemError::ToolFailed {
                tool,
                exit_code: output.exit_code,
            })
        }
    }
}

/// Lease key of an item derivative, its path relative to the storage root.
pub fn lease_key(kind: DerivativeType, item_id: i64) -> String {
    let descriptor = kind.descriptor();
    format!("{}/{item_id}.{}", descriptor.dir, descriptor.extension)
}

async fn write_text(sources: &[SourceFile], temp: &Path) -> ItemResult<()> {
    let mut parts = Vec::with_capacity(sources.len());
    for source in sources {
        let content = match (&source.content, &source.path) {
            (Some(content), _) => content.clone(),
            (None, Some(path)) => {
                let bytes = tokio::fs::read(path).await.map_err(|err| ItemError::Io {
                    source: err,
                    path: path.clone(),
                })?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            (None, None) => String::new(),
        };
        parts.push(content);
    }
    tokio::fs::write(temp, paged_text(&parts))
        .await
        .map_err(|source| ItemError::Io {
            source,
            path: temp.to_path_buf(),
        })
}

/// Joins parts behind a page banner and normalizes line endings to CRLF.
pub fn paged_text(parts: &[String]) -> String {
    let total = parts.len();
    let mut text = String::new();
    for (index, part) in parts.iter().enumerate() {
        text.push_str(&format!(
            "==============\nPage {}/{}\n==============\n\n\n",
            index + 1,
            total
        ));
        text.push_str(part.trim());
        text.push_str("\n\n\n");
    }
    text.trim()
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\n', "\r\n")
}

fn write_zip(sources: &[SourceFile], output: &Path, comment: &str) -> ItemResult<()> {
    let file = File::create(output).map_err(|source| ItemError::Io {
        source,
        path: output.to_path_buf(),
    })?;
    let mut zip = ZipWriter::new(file);
    if !comment.is_empty() {
        zip.set_comment(comment.to_string());
    }
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(1));
    let mut names = HashSet::new();
    for source in sources {
        let Some(path) = source.path.as_ref() else {
            continue;
        };
        let name = unique_entry_name(&source.name, &mut names);
        let compressible = source.media_type.starts_with("text/") || source.media_type.contains("xml");
        zip.start_file(name, if compressible { deflated } else { stored })?;
        let mut input = File::open(path).map_err(|err| ItemError::Io {
            source: err,
            path: path.clone(),
        })?;
        io::copy(&mut input, &mut zip).map_err(|err| ItemError::Io {
            source: err,
            path: path.clone(),
        })?;
    }
    zip.finish()?;
    Ok(())
}

/// `a.jpg`, then `a.1.jpg`, `a.2.jpg` for repeated names.
fn unique_entry_name(name: &str, taken: &mut HashSet<String>) -> String {
    let (stem, extension) = match name.rfind('.') {
        Some(index) if index > 0 => (&name[..index], Some(&name[index + 1..])),
        _ => (name, None),
    };
    let mut candidate = name.to_string();
    let mut counter = 0;
    while taken.contains(&candidate) {
        counter += 1;
        candidate = match extension {
            Some(extension) => format!("{stem}.{counter}.{extension}"),
            None => format!("{stem}.{counter}"),
        };
    }
    taken.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MediaRecord;
    use std::io::Read;
    use tempfile::TempDir;

    fn media(id: i64, storage_id: &str, extension: &str, media_type: &str) -> MediaRecord {
        MediaRecord {
            id,
            storage_id: Some(storage_id.to_string()),
            extension: extension.to_string(),
            source: Some(format!("{storage_id}.{extension}")),
            media_type: Some(media_type.to_string()),
            renderer: "file".to_string(),
            has_original: true,
            ..MediaRecord::default()
        }
    }

    #[test]
    fn data_media_filters_per_type() {
        let dir = TempDir::new().unwrap();
        let resolver = PathResolver::new(dir.path());
        std::fs::create_dir_all(dir.path().join("original")).unwrap();
        for name in ["a.jpg", "b.mp3", "c.pdf", "d.txt"] {
            std::fs::write(dir.path().join("original").join(name), b"data").unwrap();
        }
        std::fs::write(dir.path().join("original/e.png"), b"").unwrap();
        let records = vec![
            media(1, "a", "jpg", "image/jpeg"),
            media(2, "b", "mp3", "audio/mpeg"),
            media(3, "c", "pdf", "application/pdf"),
            media(4, "d", "txt", "text/plain"),
            media(5, "e", "png", "image/png"),
        ];
        let ids = |kind| {
            data_media(&resolver, &records, kind)
                .iter()
                .map(|source| source.media_id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(DerivativeType::Pdf), vec![1]);
        assert_eq!(ids(DerivativeType::Pdf2Xml), vec![3]);
        assert_eq!(ids(DerivativeType::Txt), vec![4]);
        assert_eq!(ids(DerivativeType::Zipm), vec![1, 2]);
        assert_eq!(ids(DerivativeType::Zipo), vec![3, 4]);
        assert_eq!(ids(DerivativeType::Zip), vec![1, 2, 3, 4]);
        assert!(ids(DerivativeType::Text).is_empty());
    }

    #[test]
    fn pages_are_bannered_with_crlf() {
        let text = paged_text(&["first\n".to_string(), "second\r\nline".to_string()]);
        assert_eq!(
            text,
            "==============\r\nPage 1/2\r\n==============\r\n\r\n\r\nfirst\r\n\r\n\r\n\
             ==============\r\nPage 2/2\r\n==============\r\n\r\n\r\nsecond\r\nline"
        );
    }

    #[test]
    fn duplicate_entry_names_get_counters() {
        let mut taken = HashSet::new();
        assert_eq!(unique_entry_name("a.jpg", &mut taken), "a.jpg");
        assert_eq!(unique_entry_name("a.jpg", &mut taken), "a.1.jpg");
        assert_eq!(unique_entry_name("a.jpg", &mut taken), "a.2.jpg");
        assert_eq!(unique_entry_name("README", &mut taken), "README");
        assert_eq!(unique_entry_name("README", &mut taken), "README.1");
    }

    #[test]
    fn zip_stores_media_and_deflates_text() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("one.jpg");
        let second = dir.path().join("two.txt");
        std::fs::write(&first, b"jpeg bytes").unwrap();
        std::fs::write(&second, b"plain text plain text plain text").unwrap();
        let sources = vec![
            SourceFile {
                media_id: 1,
                name: "photo.jpg".into(),
                media_type: "image/jpeg".into(),
                size: 10,
                path: Some(first),
                content: None,
            },
            SourceFile {
                media_id: 2,
                name: "photo.jpg".into(),
                media_type: "text/plain".into(),
                size: 32,
                path: Some(second),
                content: None,
            },
        ];
        let output = dir.path().join("out.zip");
        write_zip(&sources, &output, "Derivative media archive").unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&output).unwrap()).unwrap();
        assert_eq!(archive.comment(), b"Derivative media archive");
        let mut entry = archive.by_name("photo.jpg").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Stored);
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "jpeg bytes");
        drop(entry);
        let entry = archive.by_name("photo.1.jpg").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
    }
}
