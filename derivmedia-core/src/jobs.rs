use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sqlite::{open_connection, open_flags};

const JOBS_SCHEMA: &str = include_str!("../../sql/jobs.sql");

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to open job database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on job database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("job database path not configured")]
    MissingStore,
    #[error("invalid job status: {0}")]
    InvalidStatus(String),
    #[error("unknown job kind: {0}")]
    UnknownKind(String),
    #[error("job not found: {0}")]
    NotFound(i64),
    #[error("invalid arguments for job {id}: {source}")]
    Args { id: i64, source: serde_json::Error },
    #[error("missing argument {0}")]
    MissingArg(&'static str),
}

pub type JobResult<T> = Result<T, JobError>;

/// Job argument value. Only plain values cross the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobArg {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<JobArg>),
}

impl From<bool> for JobArg {
    fn from(value: bool) -> Self {
        JobArg::Bool(value)
    }
}

impl From<i64> for JobArg {
    fn from(value: i64) -> Self {
        JobArg::Int(value)
    }
}

impl From<&str> for JobArg {
    fn from(value: &str) -> Self {
        JobArg::Str(value.to_string())
    }
}

impl From<String> for JobArg {
    fn from(value: String) -> Self {
        JobArg::Str(value)
    }
}

impl<T: Into<JobArg>> From<Vec<T>> for JobArg {
    fn from(values: Vec<T>) -> Self {
        JobArg::List(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArgs(BTreeMap<String, JobArg>);

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<JobArg>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobArg> {
        self.0.get(key)
    }

    /// Integers are also accepted in their string form.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            JobArg::Int(value) => Some(*value),
            JobArg::Str(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            JobArg::Str(value) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    /// Truthy values: `true`, non-zero integers, non-empty strings other than `0`.
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(JobArg::Bool(value)) => *value,
            Some(JobArg::Int(value)) => *value != 0,
            Some(JobArg::Str(value)) => !value.is_empty() && value != "0",
            Some(JobArg::List(values)) => !values.is_empty(),
            None => false,
        }
    }

    pub fn ints(&self, key: &str) -> Vec<i64> {
        match self.0.get(key) {
            Some(JobArg::List(values)) => values
                .iter()
                .filter_map(|value| match value {
                    JobArg::Int(value) => Some(*value),
                    JobArg::Str(value) => value.trim().parse().ok(),
                    _ => None,
                })
                .collect(),
            Some(JobArg::Int(value)) => vec![*value],
            _ => Vec::new(),
        }
    }

    /// Non-empty strings of a list argument. A single string counts as a list of one.
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(JobArg::List(values)) => values
                .iter()
                .filter_map(|value| match value {
                    JobArg::Str(value) if !value.is_empty() => Some(value.clone()),
                    _ => None,
                })
                .collect(),
            Some(JobArg::Str(value)) if !value.is_empty() => vec![value.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Derivatives of one media.
    DerivativeMedia,
    /// Derivatives of every media of one item.
    DerivativeItem,
    /// Batch creation over a media selection.
    DerivativeMediaFile,
    /// Batch reconciliation of records with existing files.
    DerivativeMediaMetadata,
    GenerateVideoThumbnails,
    /// Item-level derivatives.
    CreateDerivatives,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::DerivativeMedia,
        JobKind::DerivativeItem,
        JobKind::DerivativeMediaFile,
        JobKind::DerivativeMediaMetadata,
        JobKind::GenerateVideoThumbnails,
        JobKind::CreateDerivatives,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DerivativeMedia => "derivative_media",
            JobKind::DerivativeItem => "derivative_item",
            JobKind::DerivativeMediaFile => "derivative_media_file",
            JobKind::DerivativeMediaMetadata => "derivative_media_metadata",
            JobKind::GenerateVideoThumbnails => "generate_video_thumbnails",
            JobKind::CreateDerivatives => "create_derivatives",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| JobError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(JobError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub kind: JobKind,
    pub args: JobArgs,
    pub status: JobStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl JobRecord {
    fn from_row(row: &Row<'_>) -> JobResult<Self> {
        let id: i64 = row.get("id")?;
        let raw_args: String = row.get("args")?;
        let args = serde_json::from_str(&raw_args).map_err(|source| JobError::Args { id, source })?;
        Ok(Self {
            id,
            kind: row.get::<_, String>("kind")?.parse()?,
            args,
            status: row.get::<_, String>("status")?.parse()?,
            created_at: timestamp(row.get("created_at")?),
            started_at: timestamp(row.get("started_at")?),
            finished_at: timestamp(row.get("finished_at")?),
            failure_reason: row.get("failure_reason")?,
        })
    }
}

fn timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

/// Hands work to a background worker. Completion is never awaited.
pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, kind: JobKind, args: JobArgs) -> JobResult<JobHandle>;
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SqliteJobQueueBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteJobQueueBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteJobQueueBuilder {
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

    pub fn build(self) -> JobResult<SqliteJobQueue> {
        let path = self.path.ok_or(JobError::MissingStore)?;
        Ok(SqliteJobQueue {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteJobQueue {
    pub fn builder() -> SqliteJobQueueBuilder {
        SqliteJobQueueBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> JobResult<Self> {
        SqliteJobQueueBuilder::new().path(path).build()
    }

    fn open(&self) -> JobResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| JobError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> JobResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> JobResult<JobRecord> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => JobRecord::from_row(row),
            None => Err(JobError::NotFound(id)),
        }
    }

    pub fn list(&self, filter: &JobFilter) -> JobResult<Vec<JobRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM jobs");
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(JobRecord::from_row(row)?);
        }
        Ok(records)
    }

    /// Moves the oldest queued job to `running` and returns it.
    pub fn claim_next(&self) -> JobResult<Option<JobRecord>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM jobs WHERE status = 'queued' ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE jobs SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![Utc::now().naive_utc(), id],
        )?;
        tx.commit()?;
        self.get(id).map(Some)
    }

    pub fn finish(&self, id: i64, status: JobStatus, failure_reason: Option<&str>) -> JobResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE jobs SET status = ?1, finished_at = ?2, failure_reason = ?3 WHERE id = ?4",
            params![status.as_str(), Utc::now().naive_utc(), failure_reason, id],
        )?;
        if affected == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    /// Queued jobs stop immediately; running ones at their next check.
    pub fn request_stop(&self, id: i64) -> JobResult<JobStatus> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE jobs SET stop_requested = 1 WHERE id = ?1 AND status IN ('queued', 'running')",
            [id],
        )?;
        if affected == 0 {
            return Ok(self.get(id)?.status);
        }
        conn.execute(
            "UPDATE jobs SET status = 'stopped', finished_at = ?1 WHERE id = ?2 AND status = 'queued'",
            params![Utc::now().naive_utc(), id],
        )?;
        Ok(self.get(id)?.status)
    }

    pub fn stop_requested(&self, id: i64) -> JobResult<bool> {
        let conn = self.open()?;
        let requested: Option<i64> = conn
            .query_row("SELECT stop_requested FROM jobs WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        requested
            .map(|requested| requested != 0)
            .ok_or(JobError::NotFound(id))
    }
}

impl JobDispatcher for SqliteJobQueue {
    fn dispatch(&self, kind: JobKind, args: JobArgs) -> JobResult<JobHandle> {
        let conn = self.open()?;
        let raw = serde_json::to_string(&args).map_err(|source| JobError::Args { id: 0, source })?;
        conn.execute(
            "INSERT INTO jobs (kind, args, status) VALUES (?1, ?2, 'queued')",
            params![kind.as_str(), raw],
        )?;
        Ok(JobHandle {
            id: conn.last_insert_rowid(),
        })
    }
}
