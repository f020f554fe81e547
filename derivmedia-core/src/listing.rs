//! What derivatives a resource has, could have, or is waiting for.

use std::path::Path;

use serde::Serialize;

use crate::delivery::ready_size;
use crate::derivative::{DerivativeType, GenerationMode};
use crate::item::{data_media, ItemBuilder};
use crate::resource::{MediaRecord, RepositoryResult, ResourceKind, ResourceRepository};
use crate::settings::DerivativeSettings;
use crate::store::FileStore;

const MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivativeEntry {
    /// Type tag for items, output folder for media.
    pub name: String,
    pub mode: GenerationMode,
    pub feasible: bool,
    pub in_progress: bool,
    pub ready: bool,
    pub media_type: String,
    pub extension: String,
    /// Real size when ready, summed source size as an estimate otherwise.
    pub size: Option<u64>,
    /// Path relative to the storage root.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "level", content = "derivatives")]
pub enum Listing {
    Item(Vec<DerivativeEntry>),
    Media(Vec<DerivativeEntry>),
}

/// Listing of whatever resource `id` is; `None` when it does not exist.
pub async fn list_derivatives(
    repository: &dyn ResourceRepository,
    store: &dyn FileStore,
    builder: &ItemBuilder,
    settings: &DerivativeSettings,
    id: i64,
) -> RepositoryResult<Option<Listing>> {
    match repository.resource_kind(id)? {
        Some(ResourceKind::Item) => Ok(Some(Listing::Item(
            list_item_derivatives(repository, builder, settings, id).await?,
        ))),
        Some(ResourceKind::Media) => {
            let media = repository.read_media(id)?;
            Ok(Some(Listing::Media(
                list_media_derivatives(store, &media).await,
            )))
        }
        None => Ok(None),
    }
}

/// One entry per enabled item-level type, checked on disk.
pub async fn list_item_derivatives(
    repository: &dyn ResourceRepository,
    builder: &ItemBuilder,
    settings: &DerivativeSettings,
    item_id: i64,
) -> RepositoryResult<Vec<DerivativeEntry>> {
    let media = repository.item_media(item_id)?;
    let resolver = builder.resolver();
    let mut entries = Vec::new();
    for kind in settings.enabled_item_types() {
        let descriptor = kind.descriptor();
        let path = resolver.item_path(kind, item_id);
        let mut size = ready_size(&path).await;
        let ready = size.is_some();
        let in_progress = !ready && builder.in_progress(item_id, kind);
        let mut feasible = ready || in_progress;
        if !feasible {
            let sources = data_media(resolver, &media, kind);
            feasible = !sources.is_empty();
            size = descriptor
                .size
                .map(|_| sources.iter().map(|source| source.size).sum());
        }
        entries.push(DerivativeEntry {
            name: kind.as_str().to_string(),
            mode: effective_mode(kind, size, settings.max_size_live),
            feasible,
            in_progress,
            ready,
            media_type: descriptor.media_type.to_string(),
            extension: descriptor.extension.to_string(),
            size,
            file: relative(resolver.root(), &path),
        });
    }
    Ok(entries)
}

/// Records of the media's attribute blob; always static, ready when the store
/// still holds the file.
pub async fn list_media_derivatives(store: &dyn FileStore, media: &MediaRecord) -> Vec<DerivativeEntry> {
    let mut entries = Vec::new();
    for (folder, record) in media.data.records() {
        let file = format!("{folder}/{}", record.filename);
        let ready = store.exists(&file).await;
        let size = match (record.size, store.local_path(&file)) {
            (Some(size), _) => Some(size),
            (None, Ok(path)) if ready => ready_size(&path).await,
            _ => None,
        };
        entries.push(DerivativeEntry {
            name: folder.to_string(),
            mode: GenerationMode::Static,
            feasible: true,
            in_progress: false,
            ready,
            media_type: record.media_type.clone(),
            extension: Path::new(&record.filename)
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size,
            file,
        });
    }
    entries
}

/// `dynamic_live` resolves to `live` only for a known size under the threshold.
pub fn effective_mode(kind: DerivativeType, size: Option<u64>, max_size_live: u64) -> GenerationMode {
    let mode = kind.descriptor().mode;
    if mode != GenerationMode::DynamicLive {
        return mode;
    }
    match size {
        Some(size) if size > 0 && size < max_size_live.saturating_mul(MEGABYTE) => GenerationMode::Live,
        _ => GenerationMode::Dynamic,
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
