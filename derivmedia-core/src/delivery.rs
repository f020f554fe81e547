//! Request-time decision for item derivatives: send the file, build it now,
//! or hand it to a background job.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tracing::{error, info};

use crate::derivative::{DerivativeType, GenerationMode};
use crate::item::{data_media, ItemBuilder, ItemOutcome};
use crate::jobs::{JobArgs, JobDispatcher, JobKind};
use crate::resource::{ResourceKind, ResourceRepository};
use crate::settings::DerivativeSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub id: i64,
    /// Rebuild even when a file is present.
    pub force: bool,
    /// Only start preparation, never send or build inline.
    pub prepare: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeFile {
    pub path: PathBuf,
    pub media_type: &'static str,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    File(DerivativeFile),
    Unsupported,
    Unavailable,
    NotFound,
    NotAnItem,
    /// `prepare` was requested for a file that already exists.
    ReadyReload,
    NotReady,
    CannotPrepare,
    BuildFailed,
    /// Building in the background; `job_id` is absent when another worker
    /// already holds the output.
    Deferred { job_id: Option<i64> },
    Internal,
}

impl DeliveryOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryOutcome::File(_) => 200,
            DeliveryOutcome::Unsupported | DeliveryOutcome::Unavailable | DeliveryOutcome::NotAnItem => 400,
            DeliveryOutcome::NotFound => 404,
            DeliveryOutcome::ReadyReload
            | DeliveryOutcome::NotReady
            | DeliveryOutcome::CannotPrepare
            | DeliveryOutcome::BuildFailed
            | DeliveryOutcome::Deferred { .. }
            | DeliveryOutcome::Internal => 500,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DeliveryOutcome::File(_) => "",
            DeliveryOutcome::Unsupported => "This type is not supported.",
            DeliveryOutcome::Unavailable => "This type is not available.",
            DeliveryOutcome::NotFound => "Resource not found.",
            DeliveryOutcome::NotAnItem => "Resource is not an item.",
            DeliveryOutcome::ReadyReload => "This derivative is ready. Reload the page.",
            DeliveryOutcome::NotReady => "This derivative is not ready. Ask the webmaster for it.",
            DeliveryOutcome::CannotPrepare => {
                "This type of derivative file cannot be prepared for this item."
            }
            DeliveryOutcome::BuildFailed => "This derivative files of this item cannot be prepared.",
            DeliveryOutcome::Deferred { .. } => "This derivative is being created. Come back later.",
            DeliveryOutcome::Internal => "An internal error occurred.",
        }
    }

    /// `fail` for states the caller can wait out, `error` otherwise.
    pub fn is_fail(&self) -> bool {
        matches!(self, DeliveryOutcome::ReadyReload | DeliveryOutcome::Deferred { .. })
    }

    /// JSON body of a non-file outcome. Never carries paths or tool output.
    pub fn body(&self) -> Value {
        if self.is_fail() {
            json!({"status": "fail", "data": {"id": self.message()}})
        } else {
            json!({"status": "error", "message": self.message()})
        }
    }
}

pub struct DeliveryRouter {
    repository: Arc<dyn ResourceRepository>,
    builder: ItemBuilder,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl DeliveryRouter {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        builder: ItemBuilder,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            repository,
            builder,
            dispatcher,
        }
    }

    pub async fn route(
        &self,
        settings: &DerivativeSettings,
        kind: &str,
        request: DeliveryRequest,
    ) -> DeliveryOutcome {
        let kind = match kind.parse::<DerivativeType>() {
            Ok(kind) if kind.is_item_level() => kind,
            _ => return DeliveryOutcome::Unsupported,
        };
        if !settings.is_enabled(kind) {
            return DeliveryOutcome::Unavailable;
        }
        let item_id = request.id;
        match self.repository.resource_kind(item_id) {
            Ok(Some(ResourceKind::Item)) => {}
            Ok(Some(ResourceKind::Media)) => return DeliveryOutcome::NotAnItem,
            Ok(None) => return DeliveryOutcome::NotFound,
            Err(err) => {
                error!(item_id, error = %err, "unable to read resource");
                return DeliveryOutcome::Internal;
            }
        }

        let descriptor = kind.descriptor();
        let path = self.builder.resolver().item_path(kind, item_id);
        let mut ready = !request.force && ready_size(&path).await.is_some();

        if request.prepare && ready {
            return DeliveryOutcome::ReadyReload;
        }

        if !ready {
            if descriptor.mode == GenerationMode::Static {
                return DeliveryOutcome::NotReady;
            }
            let media = match self.repository.item_media(item_id) {
                Ok(media) => media,
                Err(err) => {
                    error!(item_id, error = %err, "unable to list item media");
                    return DeliveryOutcome::Internal;
                }
            };
            let sources = data_media(self.builder.resolver(), &media, kind);
            if sources.is_empty() {
                return DeliveryOutcome::CannotPrepare;
            }

            if !request.prepare && builds_live(descriptor.mode, descriptor.size, settings.max_size_live) {
                match self.builder.build(item_id, kind, &sources).await {
                    ItemOutcome::Created { .. } => ready = true,
                    ItemOutcome::InProgress => return DeliveryOutcome::Deferred { job_id: None },
                    ItemOutcome::NoSource => return DeliveryOutcome::CannotPrepare,
                    ItemOutcome::Failed { .. } => return DeliveryOutcome::BuildFailed,
                }
            } else {
                if self.builder.in_progress(item_id, kind) {
                    return DeliveryOutcome::Deferred { job_id: None };
                }
                let args = JobArgs::new()
                    .with("item_id", item_id)
                    .with("type", kind.as_str())
                    .with(
                        "data_media",
                        sources.iter().map(|source| source.media_id).collect::<Vec<_>>(),
                    );
                return match self.dispatcher.dispatch(JobKind::CreateDerivatives, args) {
                    Ok(handle) => {
                        info!(item_id, kind = %kind, job_id = handle.id, "derivative deferred to job");
                        DeliveryOutcome::Deferred {
                            job_id: Some(handle.id),
                        }
                    }
                    Err(err) => {
                        error!(item_id, kind = %kind, error = %err, "unable to dispatch job");
                        DeliveryOutcome::CannotPrepare
                    }
                };
            }
        }

        match (ready, ready_size(&path).await) {
            (true, Some(size)) => DeliveryOutcome::File(DerivativeFile {
                filename: format!("{item_id}.{}", descriptor.extension),
                path,
                media_type: descriptor.media_type,
                size,
            }),
            _ => DeliveryOutcome::BuildFailed,
        }
    }
}

/// `live` types always build inline; `dynamic_live` ones only when their
/// cost unit is below the live threshold.
pub fn builds_live(mode: GenerationMode, size: Option<u64>, max_size_live: u64) -> bool {
    match mode {
        GenerationMode::Live => true,
        GenerationMode::DynamicLive => size.map(|size| size < max_size_live).unwrap_or(false),
        GenerationMode::Static | GenerationMode::Dynamic => false,
    }
}

/// Size of a present, readable, non-empty file.
pub(crate) async fn ready_size(path: &Path) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() == 0 {
        return None;
    }
    File::open(path).await.ok()?;
    Some(meta.len())
}

/// Inclusive byte bounds of a partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Parses a `Range` header against a file of `size` bytes. Ranges that
    /// do not fit, or that cover the whole file, yield `None`.
    pub fn parse(header: &str, size: u64) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern =
            PATTERN.get_or_init(|| Regex::new(r"(?i)bytes=[ \t]*(\d+)-(\d*)").expect("valid regex"));
        let mut start = 0;
        let mut end = size.checked_sub(1)?;
        if let Some(captures) = pattern.captures(header) {
            start = captures.get(1)?.as_str().parse().ok()?;
            let raw_end = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
            if !raw_end.is_empty() {
                end = raw_end.parse().ok()?;
            }
        }
        let valid = start < size && end < size && start < end && (start > 0 || end < size - 1);
        valid.then_some(Self { start, end })
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }
}

/// Response headers of a file download.
pub fn file_headers(
    file: &DerivativeFile,
    range: Option<ByteRange>,
    cache_max_age_days: u32,
) -> Vec<(&'static str, String)> {
    let max_age = u64::from(cache_max_age_days) * 24 * 60 * 60;
    let expires = Utc::now() + Duration::days(i64::from(cache_max_age_days));
    let mut headers = vec![
        ("Content-Type", file.media_type.to_string()),
        (
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", file.filename),
        ),
        ("Content-Transfer-Encoding", "binary".to_string()),
        (
            "Cache-Control",
            format!("private, max-age={max_age}, post-check={max_age}, pre-check={max_age}"),
        ),
        ("Expires", expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
        ("Accept-Ranges", "bytes".to_string()),
    ];
    match range {
        Some(range) => {
            headers.push(("Content-Length", range.len().to_string()));
            headers.push(("Content-Range", range.content_range(file.size)));
        }
        None => headers.push(("Content-Length", file.size.to_string())),
    }
    headers
}

/// Reader over the whole file or over one range of it.
pub async fn open_body(path: &Path, range: Option<ByteRange>) -> io::Result<Take<File>> {
    let mut file = File::open(path).await?;
    let len = match range {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            range.len()
        }
        None => file.metadata().await?.len(),
    };
    Ok(file.take(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_inside_the_file() {
        let range = ByteRange::parse("bytes=100-199", 1000).unwrap();
        assert_eq!(range, ByteRange { start: 100, end: 199 });
        assert_eq!(range.len(), 100);
        assert_eq!(range.content_range(1000), "bytes 100-199/1000");
    }

    #[test]
    fn open_ended_range_runs_to_the_end() {
        let range = ByteRange::parse("BYTES= 500-", 1000).unwrap();
        assert_eq!(range.end, 999);
    }

    #[test]
    fn invalid_ranges_fall_back_to_full_content() {
        assert_eq!(ByteRange::parse("bytes=1000-1001", 1000), None);
        assert_eq!(ByteRange::parse("bytes=0-999", 1000), None);
        assert_eq!(ByteRange::parse("bytes=0-", 1000), None);
        assert_eq!(ByteRange::parse("bytes=300-200", 1000), None);
        assert_eq!(ByteRange::parse("items=1-2", 1000), None);
        assert_eq!(ByteRange::parse("bytes=1-2", 0), None);
    }

    #[test]
    fn live_threshold_uses_cost_unit() {
        assert!(builds_live(GenerationMode::Live, None, 30));
        assert!(builds_live(GenerationMode::DynamicLive, Some(10), 30));
        assert!(!builds_live(GenerationMode::DynamicLive, Some(10), 10));
        assert!(!builds_live(GenerationMode::Dynamic, Some(1), 30));
    }

    #[test]
    fn bodies_hide_details() {
        assert_eq!(
            DeliveryOutcome::Deferred { job_id: Some(3) }.body(),
            json!({"status": "fail", "data": {"id": "This derivative is being created. Come back later."}})
        );
        assert_eq!(
            DeliveryOutcome::Unsupported.body(),
            json!({"status": "error", "message": "This type is not supported."})
        );
        assert_eq!(DeliveryOutcome::NotAnItem.status_code(), 400);
        assert_eq!(DeliveryOutcome::ReadyReload.status_code(), 500);
    }

    #[test]
    fn headers_for_partial_content() {
        let file = DerivativeFile {
            path: PathBuf::from("/tmp/zip/7.zip"),
            media_type: "application/zip",
            filename: "7.zip".to_string(),
            size: 1000,
        };
        let headers = file_headers(&file, ByteRange::parse("bytes=100-199", 1000), 30);
        let get = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("Content-Length"), Some("100"));
        assert_eq!(get("Content-Range"), Some("bytes 100-199/1000"));
        assert_eq!(get("Content-Disposition"), Some("attachment; filename=\"7.zip\""));
        assert_eq!(
            get("Cache-Control"),
            Some("private, max-age=2592000, post-check=2592000, pre-check=2592000")
        );
        assert_eq!(get("Accept-Ranges"), Some("bytes"));
    }
}
