pub mod batch;
pub mod config;
pub mod delivery;
pub mod derivative;
pub mod engine;
pub mod error;
pub mod item;
pub mod jobs;
pub mod lease;
pub mod listing;
pub mod metadata;
pub mod paths;
pub mod resource;
pub mod services;
pub mod settings;
pub mod sqlite;
pub mod store;
pub mod thumbnail;
pub mod tools;
pub mod validator;
pub mod worker;

pub use batch::{parse_id_ranges, range_tokens, BatchRunner, BatchSummary, BatchTask, IdRange};
pub use config::{load_config, ConverterEntry, DerivmediaConfig};
pub use delivery::{
    file_headers, open_body, ByteRange, DeliveryOutcome, DeliveryRequest, DeliveryRouter,
    DerivativeFile,
};
pub use derivative::{DerivativeLevel, DerivativeType, GenerationMode};
pub use engine::{
    CancellationFlag, DerivationEngine, EngineMode, JobContext, MediaOutcome, MediaReport,
    RuleOutcome, SkipReason,
};
pub use error::{ConfigError, Result};
pub use item::{data_media, lease_key, ItemBuilder, ItemError, ItemOutcome, SourceFile};
pub use jobs::{
    JobArg, JobArgs, JobDispatcher, JobError, JobFilter, JobHandle, JobKind, JobRecord, JobResult,
    JobStatus, SqliteJobQueue, SqliteJobQueueBuilder,
};
pub use lease::{run_janitor, JanitorReport, Lease, LeaseError, LeaseGuard, LeaseStore};
pub use listing::{list_derivatives, list_item_derivatives, list_media_derivatives, Listing};
pub use metadata::{is_managed, DerivativeData, DerivativeRecord};
pub use paths::{temp_file_path, PathError, PathResolver};
pub use resource::{
    ItemFilter, MediaFilter, MediaRecord, NewMedia, RepositoryError, ResourceKind,
    ResourceRepository, SqliteResourceStore,
};
pub use services::{ServiceError, ServiceResult, Services};
pub use settings::{DerivativeSettings, SettingsError, SettingsStore, SqliteSettingsStore};
pub use store::{FileStore, LocalFileStore, StoreError};
pub use thumbnail::{
    Percentage, ThumbnailGenerator, ThumbnailOptions, ThumbnailOutcome, ThumbnailReport,
    ThumbnailSize,
};
pub use tools::{CommandExecutor, MediaProbe, ToolError, ToolInvoker, ToolKind, ToolOutput};
pub use validator::{validate, ConverterRule, RuleFamily, RuleSet, ValidationError};
pub use worker::{on_media_saved, JobRun, JobRunner};
