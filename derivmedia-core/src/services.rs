//! Wiring of the stores and pipelines from one configuration.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::batch::BatchRunner;
use crate::config::DerivmediaConfig;
use crate::delivery::DeliveryRouter;
use crate::engine::{CancellationFlag, DerivationEngine, EngineMode, JobContext};
use crate::item::ItemBuilder;
use crate::jobs::{JobError, SqliteJobQueue};
use crate::lease::{LeaseError, LeaseStore};
use crate::paths::{PathResolver, ORIGINAL_FOLDER};
use crate::resource::{RepositoryError, SqliteResourceStore};
use crate::settings::{DerivativeSettings, SettingsError, SqliteSettingsStore};
use crate::store::LocalFileStore;
use crate::thumbnail::ThumbnailGenerator;
use crate::tools::ToolInvoker;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("failed to create directory {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Clone)]
pub struct Services {
    pub config: DerivmediaConfig,
    pub repository: Arc<SqliteResourceStore>,
    pub settings: Arc<SqliteSettingsStore>,
    pub jobs: Arc<SqliteJobQueue>,
    pub leases: LeaseStore,
    pub store: Arc<LocalFileStore>,
    pub resolver: PathResolver,
    pub invoker: ToolInvoker,
    pub engine: DerivationEngine,
    pub thumbnails: Arc<ThumbnailGenerator>,
    pub items: ItemBuilder,
}

impl Services {
    pub fn open(config: DerivmediaConfig) -> ServiceResult<Self> {
        let invoker = ToolInvoker::new(config.tools.clone());
        Self::with_invoker(config, invoker)
    }

    /// Same wiring around a caller-provided invoker.
    pub fn with_invoker(config: DerivmediaConfig, invoker: ToolInvoker) -> ServiceResult<Self> {
        let database = config.database_path();
        let root = config.storage_root();
        let repository = Arc::new(SqliteResourceStore::new(&database)?);
        let settings = Arc::new(SqliteSettingsStore::new(&database)?);
        let jobs = Arc::new(SqliteJobQueue::new(&database)?);
        let leases = LeaseStore::builder()
            .path(&database)
            .ttl_seconds(config.leases.ttl_seconds)
            .build()?;
        let store = Arc::new(LocalFileStore::new(&root));
        let resolver = PathResolver::new(&root);
        let engine = DerivationEngine::new(
            repository.clone(),
            store.clone(),
            invoker.clone(),
            resolver.clone(),
            leases.clone(),
        );
        let thumbnails = Arc::new(ThumbnailGenerator::new(
            repository.clone(),
            store.clone(),
            invoker.clone(),
            resolver.clone(),
            config.thumbnails.fallback_timestamp_seconds,
        ));
        let items = ItemBuilder::new(
            resolver.clone(),
            invoker.clone(),
            leases.clone(),
            config.delivery.archive_comment.clone(),
        );
        Ok(Self {
            config,
            repository,
            settings,
            jobs,
            leases,
            store,
            resolver,
            invoker,
            engine,
            thumbnails,
            items,
        })
    }

    /// Creates the storage layout and every schema.
    pub fn initialize(&self) -> ServiceResult<()> {
        for dir in [
            self.config.data_dir(),
            self.config.storage_root().join(ORIGINAL_FOLDER),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| ServiceError::Io { source, path: dir })?;
        }
        self.repository.initialize()?;
        self.settings.initialize()?;
        self.jobs.initialize()?;
        self.leases.initialize()?;
        Ok(())
    }

    /// Settings snapshot for one job or request.
    pub fn derivative_settings(&self) -> ServiceResult<DerivativeSettings> {
        Ok(DerivativeSettings::load(self.settings.as_ref(), &self.config)?)
    }

    pub fn job_context(
        &self,
        settings: &DerivativeSettings,
        mode: EngineMode,
        cancel: CancellationFlag,
    ) -> JobContext {
        JobContext::prepare(settings, &self.invoker, mode, cancel)
    }

    pub fn batch_runner(&self) -> BatchRunner {
        BatchRunner::new(self.repository.clone(), self.engine.clone(), self.thumbnails.clone())
            .with_page_size(self.config.batch.page_size as u64)
            .with_workers(self.config.batch.workers)
    }

    pub fn router(&self) -> DeliveryRouter {
        DeliveryRouter::new(self.repository.clone(), self.items.clone(), self.jobs.clone())
    }
}
