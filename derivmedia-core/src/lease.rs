//! Expiring work leases on derivative outputs and the janitor that clears
//! what crashed workers leave behind.

use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::paths::is_temp_file_name;
use crate::sqlite::{open_connection, open_flags};

const LEASES_SCHEMA: &str = include_str!("../../sql/leases.sql");

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("failed to open lease database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on lease database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("lease database path not configured")]
    MissingStore,
    #[error("janitor failed on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type LeaseResult<T> = Result<T, LeaseError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    /// Storage-relative path of the derivative being produced.
    pub key: String,
    pub resource_id: i64,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaseStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    ttl: Duration,
}

impl Default for LeaseStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            ttl: Duration::hours(2),
        }
    }
}

impl LeaseStoreBuilder {
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

    pub fn ttl_seconds(mut self, seconds: i64) -> Self {
        self.ttl = Duration::seconds(seconds.max(1));
        self
    }

    pub fn build(self) -> LeaseResult<LeaseStore> {
        let path = self.path.ok_or(LeaseError::MissingStore)?;
        Ok(LeaseStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
            ttl: self.ttl,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeaseStore {
    path: PathBuf,
    flags: OpenFlags,
    ttl: Duration,
}

impl LeaseStore {
    pub fn builder() -> LeaseStoreBuilder {
        LeaseStoreBuilder::new()
    }

    fn open(&self) -> LeaseResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| LeaseError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> LeaseResult<()> {
        let conn = self.open()?;
        conn.execute_batch(LEASES_SCHEMA)?;
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Takes the lease on `key` unless a live one is held by someone else.
    pub fn acquire(&self, resource_id: i64, key: &str) -> LeaseResult<Option<Lease>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "DELETE FROM derivative_leases WHERE derivative_key = ?1 AND expires_at <= ?2",
            params![key, now.naive_utc()],
        )?;
        let lease = Lease {
            key: key.to_string(),
            resource_id,
            owner: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO derivative_leases (
                derivative_key, resource_id, owner, acquired_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &lease.key,
                lease.resource_id,
                &lease.owner,
                lease.acquired_at.naive_utc(),
                lease.expires_at.naive_utc()
            ],
        )?;
        tx.commit()?;
        Ok((inserted == 1).then_some(lease))
    }

    /// Deletes the lease only when `lease` still owns it.
    pub fn release(&self, lease: &Lease) -> LeaseResult<bool> {
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM derivative_leases WHERE derivative_key = ?1 AND owner = ?2",
            params![&lease.key, &lease.owner],
        )?;
        Ok(deleted == 1)
    }

    pub fn is_held(&self, key: &str) -> LeaseResult<bool> {
        let conn = self.open()?;
        let expires: Option<NaiveDateTime> = conn
            .query_row(
                "SELECT expires_at FROM derivative_leases WHERE derivative_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires
            .map(|expires| expires > Utc::now().naive_utc())
            .unwrap_or(false))
    }

    pub fn reclaim_expired(&self) -> LeaseResult<usize> {
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM derivative_leases WHERE expires_at <= ?1",
            [Utc::now().naive_utc()],
        )?;
        Ok(deleted)
    }

    /// Acquires and wraps the lease in a guard that releases on drop.
    pub fn guard(&self, resource_id: i64, key: &str) -> LeaseResult<Option<LeaseGuard>> {
        Ok(self.acquire(resource_id, key)?.map(|lease| LeaseGuard {
            store: self.clone(),
            lease: Some(lease),
        }))
    }
}

pub struct LeaseGuard {
    store: LeaseStore,
    lease: Option<Lease>,
}

impl LeaseGuard {
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn release(mut self) -> LeaseResult<()> {
        if let Some(lease) = self.lease.take() {
            self.store.release(&lease)?;
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.store.release(&lease) {
                warn!(key = %lease.key, error = %err, "failed to release derivative lease");
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JanitorReport {
    pub removed_files: Vec<PathBuf>,
    pub expired_leases: usize,
}

/// Removes temp markers older than the lease ttl that nobody holds a live
/// lease for, then drops expired lease rows.
pub fn run_janitor(root: &Path, leases: &LeaseStore) -> LeaseResult<JanitorReport> {
    let max_age = StdDuration::from_secs(leases.ttl().num_seconds().max(0) as u64);
    let now = SystemTime::now();
    let mut report = JanitorReport::default();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_temp_file_name(&name) {
            continue;
        }
        let age = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        let Some(key) = lease_key_for_temp(root, entry.path()) else {
            continue;
        };
        if leases.is_held(&key)? {
            continue;
        }
        std::fs::remove_file(entry.path()).map_err(|source| LeaseError::Io {
            source,
            path: entry.path().to_path_buf(),
        })?;
        info!(path = %entry.path().display(), "removed orphaned temp file");
        report.removed_files.push(entry.path().to_path_buf());
    }
    report.expired_leases = leases.reclaim_expired()?;
    Ok(report)
}

/// Storage-relative final path a temp marker stands for.
pub fn lease_key_for_temp(root: &Path, temp: &Path) -> Option<String> {
    let relative = temp.strip_prefix(root).ok()?;
    let name = relative.file_name()?.to_string_lossy();
    let final_name = match name.find(".tmp.") {
        Some(index) => format!("{}{}", &name[..index], &name[index + 4..]),
        None => name.strip_suffix(".tmp")?.to_string(),
    };
    let key = relative.with_file_name(final_name);
    Some(key.to_string_lossy().replace('\\', "/"))
}
