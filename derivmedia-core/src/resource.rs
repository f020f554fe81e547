use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

use crate::batch::range::IdRange;
use crate::metadata::DerivativeData;
use crate::sqlite::{open_connection, open_flags};

const RESOURCES_SCHEMA: &str = include_str!("../../sql/resources.sql");

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("failed to open resource database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on resource database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("resource database path not configured")]
    MissingStore,
    #[error("resource not found: {0}")]
    NotFound(i64),
    #[error("invalid attribute blob for media {id}: {source}")]
    Data {
        id: i64,
        source: serde_json::Error,
    },
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Item,
    Media,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ItemRecord {
    pub id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaRecord {
    pub id: i64,
    pub item_id: i64,
    pub position: i64,
    /// Basename of the stored original, without extension.
    pub storage_id: Option<String>,
    pub extension: String,
    /// Name of the file as uploaded.
    pub source: Option<String>,
    pub media_type: Option<String>,
    pub renderer: String,
    pub ingester: String,
    pub has_original: bool,
    pub size: Option<u64>,
    pub extracted_text: Option<String>,
    pub data: DerivativeData,
}

impl MediaRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let id: i64 = row.get("id")?;
        let raw: Option<String> = row.get("data")?;
        let data = DerivativeData::from_json(raw.as_deref()).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        Ok(Self {
            id,
            item_id: row.get("item_id")?,
            position: row.get("position")?,
            storage_id: row.get("storage_id")?,
            extension: row.get("extension")?,
            source: row.get("source")?,
            media_type: row.get("media_type")?,
            renderer: row.get("renderer")?,
            ingester: row.get("ingester")?,
            has_original: row.get::<_, i64>("has_original")? != 0,
            size: row.get::<_, Option<i64>>("size")?.map(|size| size.max(0) as u64),
            extracted_text: row.get("extracted_text")?,
            data,
        })
    }

    /// Stored original name, `{storage_id}.{extension}`.
    pub fn filename(&self) -> Option<String> {
        let storage_id = self.storage_id.as_deref()?;
        Some(if self.extension.is_empty() {
            storage_id.to_string()
        } else {
            format!("{storage_id}.{}", self.extension)
        })
    }

    /// Name used inside archives: the uploaded name, else the stored one.
    pub fn display_name(&self) -> String {
        self.source
            .clone()
            .filter(|source| !source.trim().is_empty())
            .or_else(|| self.filename())
            .unwrap_or_else(|| format!("media-{}", self.id))
    }
}

/// Selection of media for batch runs. Empty fields do not filter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaFilter {
    pub item_set_ids: Vec<i64>,
    pub item_ids: Vec<i64>,
    pub query: Option<String>,
    pub ingesters: Vec<String>,
    pub renderers: Vec<String>,
    /// Exact types (`video/mp4`) or primary types (`video`).
    pub media_types: Vec<String>,
    pub id_ranges: Vec<IdRange>,
    pub has_original: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ItemFilter {
    pub item_set_ids: Vec<i64>,
    pub query: Option<String>,
    pub id_ranges: Vec<IdRange>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMedia {
    pub item_id: i64,
    pub storage_id: Option<String>,
    pub extension: String,
    pub source: Option<String>,
    pub media_type: Option<String>,
    pub renderer: String,
    pub ingester: String,
    pub has_original: bool,
    pub size: Option<u64>,
    pub extracted_text: Option<String>,
}

impl NewMedia {
    /// An uploaded file handled by the plain file renderer.
    pub fn upload(item_id: i64, storage_id: &str, extension: &str, media_type: &str) -> Self {
        Self {
            item_id,
            storage_id: Some(storage_id.to_string()),
            extension: extension.to_string(),
            source: Some(format!("{storage_id}.{extension}")),
            media_type: Some(media_type.to_string()),
            renderer: "file".to_string(),
            ingester: "upload".to_string(),
            has_original: true,
            size: None,
            extracted_text: None,
        }
    }
}

/// Host-side access to items and media.
pub trait ResourceRepository: Send + Sync {
    fn count_media(&self, filter: &MediaFilter) -> RepositoryResult<u64>;
    /// Ids in ascending order.
    fn search_media_ids(
        &self,
        filter: &MediaFilter,
        offset: u64,
        limit: u64,
    ) -> RepositoryResult<Vec<i64>>;
    fn read_media(&self, id: i64) -> RepositoryResult<MediaRecord>;
    fn read_item(&self, id: i64) -> RepositoryResult<ItemRecord>;
    fn item_media(&self, item_id: i64) -> RepositoryResult<Vec<MediaRecord>>;
    fn search_item_ids(&self, filter: &ItemFilter) -> RepositoryResult<Vec<i64>>;
    /// Persists the attribute blob of one media in its own transaction.
    fn save_media_data(&self, id: i64, data: &DerivativeData) -> RepositoryResult<()>;
    fn resource_kind(&self, id: i64) -> RepositoryResult<Option<ResourceKind>>;
}

#[derive(Debug, Clone)]
pub struct SqliteResourceStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteResourceStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteResourceStoreBuilder {
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

    pub fn build(self) -> RepositoryResult<SqliteResourceStore> {
        let path = self.path.ok_or(RepositoryError::MissingStore)?;
        Ok(SqliteResourceStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteResourceStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteResourceStore {
    pub fn builder() -> SqliteResourceStoreBuilder {
        SqliteResourceStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> RepositoryResult<Self> {
        SqliteResourceStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> RepositoryResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| RepositoryError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> RepositoryResult<()> {
        let conn = self.open()?;
        conn.execute_batch(RESOURCES_SCHEMA)?;
        Ok(())
    }

    pub fn insert_item(&self, title: Option<&str>, item_set_ids: &[i64]) -> RepositoryResult<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute("INSERT INTO resources (resource_type) VALUES ('item')", [])?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO items (id, title) VALUES (?1, ?2)",
            params![id, title],
        )?;
        for set_id in item_set_ids {
            tx.execute(
                "INSERT OR IGNORE INTO item_item_sets (item_id, item_set_id) VALUES (?1, ?2)",
                params![id, set_id],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn insert_media(&self, media: &NewMedia) -> RepositoryResult<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute("INSERT INTO resources (resource_type) VALUES ('media')", [])?;
        let id = tx.last_insert_rowid();
        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM media WHERE item_id = ?1",
            [media.item_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO media (
                id, item_id, position, storage_id, extension, source, media_type,
                renderer, ingester, has_original, size, extracted_text
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                media.item_id,
                position,
                &media.storage_id,
                &media.extension,
                &media.source,
                &media.media_type,
                &media.renderer,
                &media.ingester,
                media.has_original as i64,
                media.size.map(|size| size as i64),
                &media.extracted_text,
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }
}

impl ResourceRepository for SqliteResourceStore {
    fn count_media(&self, filter: &MediaFilter) -> RepositoryResult<u64> {
        let conn = self.open()?;
        let (clause, values) = media_where(filter);
        let query = format!("SELECT COUNT(*) FROM media{clause}");
        let count: i64 = conn.query_row(
            &query,
            rusqlite::params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn search_media_ids(
        &self,
        filter: &MediaFilter,
        offset: u64,
        limit: u64,
    ) -> RepositoryResult<Vec<i64>> {
        let conn = self.open()?;
        let (clause, mut values) = media_where(filter);
        let query = format!("SELECT id FROM media{clause} ORDER BY id ASC LIMIT ? OFFSET ?");
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));
        let mut stmt = conn.prepare(&query)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn read_media(&self, id: i64) -> RepositoryResult<MediaRecord> {
        let conn = self.open()?;
        conn.query_row("SELECT * FROM media WHERE id = ?1", [id], |row| {
            MediaRecord::from_row(row)
        })
        .optional()
        .map_err(|err| data_error(id, err))?
        .ok_or(RepositoryError::NotFound(id))
    }

    fn read_item(&self, id: i64) -> RepositoryResult<ItemRecord> {
        let conn = self.open()?;
        conn.query_row("SELECT id, title FROM items WHERE id = ?1", [id], |row| {
            Ok(ItemRecord {
                id: row.get(0)?,
                title: row.get(1)?,
            })
        })
        .optional()?
        .ok_or(RepositoryError::NotFound(id))
    }

    fn item_media(&self, item_id: i64) -> RepositoryResult<Vec<MediaRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM media WHERE item_id = ?1 ORDER BY position ASC, id ASC")?;
        let mut rows = stmt.query([item_id])?;
        let mut media = Vec::new();
        while let Some(row) = rows.next()? {
            media.push(MediaRecord::from_row(row)?);
        }
        Ok(media)
    }

    fn search_item_ids(&self, filter: &ItemFilter) -> RepositoryResult<Vec<i64>> {
        let conn = self.open()?;
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if !filter.item_set_ids.is_empty() {
            clauses.push(format!(
                "id IN (SELECT item_id FROM item_item_sets WHERE item_set_id IN ({}))",
                placeholders(filter.item_set_ids.len())
            ));
            values.extend(filter.item_set_ids.iter().map(|id| Value::Integer(*id)));
        }
        if let Some(query) = filter.query.as_deref().filter(|q| !q.trim().is_empty()) {
            clauses.push("title LIKE ?".to_string());
            values.push(Value::Text(format!("%{}%", query.trim())));
        }
        push_ranges(&filter.id_ranges, &mut clauses, &mut values);
        let query = format!("SELECT id FROM items{} ORDER BY id ASC", join_where(&clauses));
        let mut stmt = conn.prepare(&query)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn save_media_data(&self, id: i64, data: &DerivativeData) -> RepositoryResult<()> {
        let payload = data
            .to_json()
            .map_err(|source| RepositoryError::Data { id, source })?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE media SET data = ?1 WHERE id = ?2",
            params![payload, id],
        )?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        tx.commit()?;
        Ok(())
    }

    fn resource_kind(&self, id: i64) -> RepositoryResult<Option<ResourceKind>> {
        let conn = self.open()?;
        let kind: Option<String> = conn
            .query_row(
                "SELECT resource_type FROM resources WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(kind.map(|kind| match kind.as_str() {
            "item" => ResourceKind::Item,
            _ => ResourceKind::Media,
        }))
    }
}

fn data_error(id: i64, err: rusqlite::Error) -> RepositoryError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(_, _, source) => {
            match source.downcast::<serde_json::Error>() {
                Ok(source) => RepositoryError::Data {
                    id,
                    source: *source,
                },
                Err(source) => RepositoryError::Execute(
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        source,
                    ),
                ),
            }
        }
        other => RepositoryError::Execute(other),
    }
}

fn media_where(filter: &MediaFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if !filter.item_set_ids.is_empty() {
        clauses.push(format!(
            "item_id IN (SELECT item_id FROM item_item_sets WHERE item_set_id IN ({}))",
            placeholders(filter.item_set_ids.len())
        ));
        values.extend(filter.item_set_ids.iter().map(|id| Value::Integer(*id)));
    }
    if !filter.item_ids.is_empty() {
        clauses.push(format!("item_id IN ({})", placeholders(filter.item_ids.len())));
        values.extend(filter.item_ids.iter().map(|id| Value::Integer(*id)));
    }
    if let Some(query) = filter.query.as_deref().filter(|q| !q.trim().is_empty()) {
        clauses.push("(source LIKE ? OR extracted_text LIKE ?)".to_string());
        let pattern = format!("%{}%", query.trim());
        values.push(Value::Text(pattern.clone()));
        values.push(Value::Text(pattern));
    }
    if !filter.ingesters.is_empty() {
        clauses.push(format!("ingester IN ({})", placeholders(filter.ingesters.len())));
        values.extend(filter.ingesters.iter().cloned().map(Value::Text));
    }
    if !filter.renderers.is_empty() {
        clauses.push(format!("renderer IN ({})", placeholders(filter.renderers.len())));
        values.extend(filter.renderers.iter().cloned().map(Value::Text));
    }
    if !filter.media_types.is_empty() {
        let mut alternatives = Vec::new();
        for media_type in &filter.media_types {
            if media_type.contains('/') {
                alternatives.push("media_type = ?");
                values.push(Value::Text(media_type.clone()));
            } else {
                alternatives.push("media_type LIKE ?");
                values.push(Value::Text(format!("{media_type}/%")));
            }
        }
        clauses.push(format!("({})", alternatives.join(" OR ")));
    }
    if let Some(has_original) = filter.has_original {
        clauses.push("has_original = ?".to_string());
        values.push(Value::Integer(i64::from(has_original)));
    }
    push_ranges(&filter.id_ranges, &mut clauses, &mut values);
    (join_where(&clauses), values)
}

fn push_ranges(ranges: &[IdRange], clauses: &mut Vec<String>, values: &mut Vec<Value>) {
    if ranges.is_empty() {
        return;
    }
    let mut alternatives = Vec::new();
    for range in ranges {
        match (range.start, range.end) {
            (Some(start), Some(end)) => {
                alternatives.push("(id BETWEEN ? AND ?)");
                values.push(Value::Integer(start));
                values.push(Value::Integer(end));
            }
            (Some(start), None) => {
                alternatives.push("id >= ?");
                values.push(Value::Integer(start));
            }
            (None, Some(end)) => {
                alternatives.push("id <= ?");
                values.push(Value::Integer(end));
            }
            (None, None) => alternatives.push("1 = 1"),
        }
    }
    clauses.push(format!("({})", alternatives.join(" OR ")));
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn join_where(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SqliteResourceStore {
        let store = SqliteResourceStore::new(dir.path().join("resources.sqlite")).unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn filters_combine_with_and() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let item = store.insert_item(Some("Concert"), &[3]).unwrap();
        let other = store.insert_item(Some("Lecture"), &[]).unwrap();
        let audio = store
            .insert_media(&NewMedia::upload(item, "aaa", "wav", "audio/x-wav"))
            .unwrap();
        let video = store
            .insert_media(&NewMedia::upload(item, "bbb", "mp4", "video/mp4"))
            .unwrap();
        let pdf = store
            .insert_media(&NewMedia::upload(other, "ccc", "pdf", "application/pdf"))
            .unwrap();

        let all = MediaFilter::default();
        assert_eq!(store.count_media(&all).unwrap(), 3);
        assert_eq!(
            store.search_media_ids(&all, 0, 25).unwrap(),
            vec![audio, video, pdf]
        );
        assert_eq!(store.search_media_ids(&all, 1, 1).unwrap(), vec![video]);

        let in_set = MediaFilter {
            item_set_ids: vec![3],
            media_types: vec!["video".into()],
            ..MediaFilter::default()
        };
        assert_eq!(store.search_media_ids(&in_set, 0, 25).unwrap(), vec![video]);

        let ranged = MediaFilter {
            id_ranges: vec![IdRange::new(None, Some(audio)), IdRange::new(Some(pdf), None)],
            ..MediaFilter::default()
        };
        assert_eq!(
            store.search_media_ids(&ranged, 0, 25).unwrap(),
            vec![audio, pdf]
        );
    }

    #[test]
    fn data_round_trips_and_missing_media_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let item = store.insert_item(None, &[]).unwrap();
        let media = store
            .insert_media(&NewMedia::upload(item, "aaa", "wav", "audio/x-wav"))
            .unwrap();
        let mut data = store.read_media(media).unwrap().data;
        data.set_record("mp3", Some("aaa.mp3"), Some("audio/mpeg"));
        store.save_media_data(media, &data).unwrap();
        let reread = store.read_media(media).unwrap();
        assert_eq!(reread.data, data);
        assert_eq!(reread.filename().as_deref(), Some("aaa.wav"));

        assert!(matches!(
            store.read_media(9999),
            Err(RepositoryError::NotFound(9999))
        ));
        assert!(matches!(
            store.save_media_data(9999, &data),
            Err(RepositoryError::NotFound(9999))
        ));
        assert_eq!(store.resource_kind(item).unwrap(), Some(ResourceKind::Item));
        assert_eq!(store.resource_kind(media).unwrap(), Some(ResourceKind::Media));
        assert_eq!(store.resource_kind(9999).unwrap(), None);
    }

    #[test]
    fn item_search_by_title_and_set() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = store.insert_item(Some("Field recordings"), &[1]).unwrap();
        let _second = store.insert_item(Some("Scans"), &[2]).unwrap();
        let filter = ItemFilter {
            query: Some("field".into()),
            ..ItemFilter::default()
        };
        assert_eq!(store.search_item_ids(&filter).unwrap(), vec![first]);
        let filter = ItemFilter {
            item_set_ids: vec![1, 2],
            ..ItemFilter::default()
        };
        assert_eq!(store.search_item_ids(&filter).unwrap().len(), 2);
    }
}
