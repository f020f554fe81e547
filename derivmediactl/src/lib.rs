pub mod serve;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use derivmedia_core::engine::RuleOutcome;
use derivmedia_core::settings::SettingsStore;
use derivmedia_core::thumbnail::ThumbnailOutcome;
use derivmedia_core::{
    data_media, list_derivatives, load_config, on_media_saved, parse_id_ranges, run_janitor,
    validate, BatchSummary, BatchTask, CancellationFlag, DerivativeType, EngineMode, ItemFilter,
    ItemOutcome, JanitorReport, JobArgs, JobDispatcher, JobFilter, JobKind, JobRecord, JobRun,
    JobRunner, JobStatus, Listing, MediaFilter, MediaOutcome, MediaReport, Percentage,
    ResourceRepository, RuleFamily, Services, ThumbnailOptions, ThumbnailReport,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] derivmedia_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Service(#[from] derivmedia_core::ServiceError),
    #[error(transparent)]
    Repository(#[from] derivmedia_core::RepositoryError),
    #[error(transparent)]
    Settings(#[from] derivmedia_core::SettingsError),
    #[error(transparent)]
    Job(#[from] derivmedia_core::JobError),
    #[error(transparent)]
    Lease(#[from] derivmedia_core::LeaseError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Derivative media command-line interface", long_about = None)]
pub struct Cli {
    /// Path of derivmedia.toml
    #[arg(long, default_value = "configs/derivmedia.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the storage layout and database schemas
    Init,
    /// Check the configured converter rules
    Validate,
    /// Run over a filtered media collection
    #[command(subcommand)]
    Batch(BatchCommands),
    /// Derivatives of a single media
    #[command(subcommand)]
    Media(MediaCommands),
    /// Derivatives of a single item
    #[command(subcommand)]
    Item(ItemCommands),
    /// Generate thumbnails of one video
    Thumbnail(ThumbnailArgs),
    /// List the derivatives of an item or media
    Derivatives(IdArgs),
    /// Background job queue
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Stored settings
    #[command(subcommand)]
    Settings(SettingsCommands),
    /// Remove orphaned temp files and expired leases
    Janitor,
    /// Serve derivative files over HTTP
    Serve(ServeArgs),
    /// Print shell completions
    Completions(CompletionArgs),
}

#[derive(Subcommand, Debug)]
pub enum BatchCommands {
    /// Create or verify media derivatives
    Derive(BatchDeriveArgs),
    /// Generate video thumbnails
    Thumbnails(BatchThumbnailArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    /// Restrict to items of these item sets
    #[arg(long = "item-set")]
    pub item_sets: Vec<i64>,
    /// Restrict to items matching this text
    #[arg(long)]
    pub query: Option<String>,
    #[arg(long = "ingester")]
    pub ingesters: Vec<String>,
    #[arg(long = "renderer")]
    pub renderers: Vec<String>,
    /// Full (`video/mp4`) or primary (`video`) media types
    #[arg(long = "media-type")]
    pub media_types: Vec<String>,
    /// Media id ranges, e.g. "2-6 8 38-52 80-"
    #[arg(long)]
    pub media_ids: Option<String>,
}

#[derive(Args, Debug)]
pub struct BatchDeriveArgs {
    #[command(flatten)]
    pub filter: FilterArgs,
    /// Only reconcile records with the files on disk
    #[arg(long, default_value_t = false)]
    pub verify: bool,
}

#[derive(Args, Debug)]
pub struct BatchThumbnailArgs {
    #[command(flatten)]
    pub filter: FilterArgs,
    /// Capture position in percent of the duration
    #[arg(long)]
    pub percentage: Option<i64>,
    /// Replace existing thumbnails
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum MediaCommands {
    /// Run every converter rule of the media
    Derive(IdArgs),
    /// Reconcile the media records with the files on disk
    Verify(IdArgs),
    /// Queue the jobs a saved media triggers
    Saved(IdArgs),
}

#[derive(Subcommand, Debug)]
pub enum ItemCommands {
    /// Run the converter rules of every media of the item
    Derive(IdArgs),
    /// Build one item-level derivative now
    Build(ItemBuildArgs),
}

#[derive(Args, Debug)]
pub struct IdArgs {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ItemBuildArgs {
    pub id: i64,
    /// Item derivative type, e.g. zipm or txt
    #[arg(long = "type")]
    pub kind: String,
}

#[derive(Args, Debug)]
pub struct ThumbnailArgs {
    pub id: i64,
    #[arg(long)]
    pub percentage: Option<i64>,
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Execute queued jobs
    Run(JobRunArgs),
    /// List jobs
    List(JobListArgs),
    /// Queue a job
    Dispatch(JobDispatchArgs),
    /// Ask a job to stop
    Stop(IdArgs),
}

#[derive(Args, Debug)]
pub struct JobRunArgs {
    /// Exit when the queue is empty
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Seconds to wait between polls of an empty queue
    #[arg(long, default_value_t = 5)]
    pub idle: u64,
}

#[derive(Args, Debug)]
pub struct JobListArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum number of rows
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct JobDispatchArgs {
    /// Job kind, e.g. derivative_media
    pub kind: String,
    /// Job arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    Get(SettingsGetArgs),
    /// Store a JSON value
    Set(SettingsSetArgs),
}

#[derive(Args, Debug)]
pub struct SettingsGetArgs {
    pub key: String,
}

#[derive(Args, Debug)]
pub struct SettingsSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address; defaults to delivery.bind
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "derivmediactl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Init => render(&context.init()?, cli.format)?,
        Commands::Validate => {
            let report = context.validate()?;
            render(&report, cli.format)?;
            if report.iter().any(|entry| entry.error.is_some()) {
                return Err(AppError::Failed("one or more converter rules are invalid".to_string()));
            }
        }
        Commands::Batch(BatchCommands::Derive(args)) => {
            let summary = context.batch_derive(args).await?;
            render(&summary, cli.format)?;
        }
        Commands::Batch(BatchCommands::Thumbnails(args)) => {
            let summary = context.batch_thumbnails(args).await?;
            render(&summary, cli.format)?;
        }
        Commands::Media(MediaCommands::Derive(args)) => {
            let report = context.media_derive(args.id, EngineMode::Create).await?;
            render(&report, cli.format)?;
        }
        Commands::Media(MediaCommands::Verify(args)) => {
            let report = context.media_derive(args.id, EngineMode::VerifyOnly).await?;
            render(&report, cli.format)?;
        }
        Commands::Media(MediaCommands::Saved(args)) => {
            let handles = context.media_saved(args.id)?;
            render(&handles, cli.format)?;
        }
        Commands::Item(ItemCommands::Derive(args)) => {
            let reports = context.item_derive(args.id).await?;
            render(&reports, cli.format)?;
        }
        Commands::Item(ItemCommands::Build(args)) => {
            let outcome = context.item_build(args).await?;
            render(&outcome, cli.format)?;
            if let ItemOutcome::Failed { reason } = outcome.outcome {
                return Err(AppError::Failed(reason));
            }
        }
        Commands::Thumbnail(args) => {
            let report = context.thumbnail(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Derivatives(args) => {
            let listing = context.derivatives(args.id).await?;
            render(&listing, cli.format)?;
        }
        Commands::Jobs(JobCommands::Run(args)) => {
            let runs = context.jobs_run(args).await?;
            render(&runs, cli.format)?;
        }
        Commands::Jobs(JobCommands::List(args)) => {
            let jobs = context.jobs_list(args)?;
            render(&jobs, cli.format)?;
        }
        Commands::Jobs(JobCommands::Dispatch(args)) => {
            let job = context.jobs_dispatch(args)?;
            render(&job, cli.format)?;
        }
        Commands::Jobs(JobCommands::Stop(args)) => {
            let status = context.jobs_stop(args.id)?;
            render(&status, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Get(args)) => {
            let value = context.settings_get(&args.key)?;
            render(&value, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Set(args)) => {
            let value = context.settings_set(&args.key, &args.value)?;
            render(&value, cli.format)?;
        }
        Commands::Janitor => render(&context.janitor()?, cli.format)?,
        Commands::Serve(args) => {
            let bind = args
                .bind
                .clone()
                .unwrap_or_else(|| context.services.config.delivery.bind.clone());
            serve::serve(context.services.clone(), &bind).await?;
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl<T: DisplayFallback> DisplayFallback for Vec<T> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "(none)".to_string();
        }
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct AppContext {
    services: Services,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)?;
        let services = Services::open(config)?;
        Ok(Self { services })
    }

    fn init(&self) -> Result<InitReport> {
        self.services.initialize()?;
        Ok(InitReport {
            database: self.services.config.database_path(),
            storage_root: self.services.config.storage_root(),
        })
    }

    fn validate(&self) -> Result<Vec<RuleCheck>> {
        let settings = self.services.derivative_settings()?;
        let mut report = Vec::new();
        for family in RuleFamily::ALL {
            for entry in family.entries(&settings.converters) {
                report.push(RuleCheck {
                    family,
                    pattern: entry.pattern.clone(),
                    command: entry.command.clone(),
                    error: validate(&entry.pattern, &entry.command)
                        .err()
                        .map(|err| err.to_string()),
                });
            }
        }
        Ok(report)
    }

    /// `None` when the item query matched nothing.
    fn media_filter(&self, args: &FilterArgs) -> Result<Option<MediaFilter>> {
        let mut filter = MediaFilter {
            item_set_ids: args.item_sets.clone(),
            ingesters: args.ingesters.clone(),
            renderers: args.renderers.clone(),
            media_types: args.media_types.clone(),
            id_ranges: args
                .media_ids
                .as_deref()
                .map(parse_id_ranges)
                .unwrap_or_default(),
            ..MediaFilter::default()
        };
        if let Some(query) = args.query.as_deref().filter(|query| !query.trim().is_empty()) {
            let item_ids = self.services.repository.search_item_ids(&ItemFilter {
                query: Some(query.to_string()),
                ..ItemFilter::default()
            })?;
            if item_ids.is_empty() {
                warn!(query, "the item query matched no items");
                return Ok(None);
            }
            filter.item_ids = item_ids;
        }
        Ok(Some(filter))
    }

    async fn batch_derive(&self, args: &BatchDeriveArgs) -> Result<BatchSummary> {
        let Some(filter) = self.media_filter(&args.filter)? else {
            return Ok(BatchSummary::default());
        };
        let mode = if args.verify {
            EngineMode::VerifyOnly
        } else {
            EngineMode::Create
        };
        let settings = self.services.derivative_settings()?;
        let ctx = self
            .services
            .job_context(&settings, mode, CancellationFlag::new());
        Ok(self
            .services
            .batch_runner()
            .run(&filter, BatchTask::Derive(&ctx))
            .await?)
    }

    async fn batch_thumbnails(&self, args: &BatchThumbnailArgs) -> Result<BatchSummary> {
        let Some(mut filter) = self.media_filter(&args.filter)? else {
            return Ok(BatchSummary::default());
        };
        if filter.media_types.is_empty() {
            filter.media_types = vec!["video".to_string()];
        }
        let settings = self.services.derivative_settings()?;
        let options = ThumbnailOptions {
            percentage: Percentage::clamped(args.percentage.unwrap_or(settings.thumbnail_percentage)),
            force: args.force,
            bulk: true,
        };
        let cancel = CancellationFlag::new();
        Ok(self
            .services
            .batch_runner()
            .run(
                &filter,
                BatchTask::Thumbnails {
                    options,
                    cancel: &cancel,
                },
            )
            .await?)
    }

    async fn media_derive(&self, id: i64, mode: EngineMode) -> Result<MediaReport> {
        let settings = self.services.derivative_settings()?;
        let ctx = self
            .services
            .job_context(&settings, mode, CancellationFlag::new());
        Ok(self.services.engine.process_media(&ctx, id).await)
    }

    fn media_saved(&self, id: i64) -> Result<Vec<JobSummary>> {
        let media = self.services.repository.read_media(id)?;
        let settings = self.services.derivative_settings()?;
        let handles = on_media_saved(self.services.jobs.as_ref(), &settings, &media)?;
        handles
            .into_iter()
            .map(|handle| Ok(JobSummary::from(&self.services.jobs.get(handle.id)?)))
            .collect()
    }

    async fn item_derive(&self, id: i64) -> Result<Vec<MediaReport>> {
        let settings = self.services.derivative_settings()?;
        let ctx = self
            .services
            .job_context(&settings, EngineMode::Create, CancellationFlag::new());
        Ok(self.services.engine.process_item(&ctx, id).await)
    }

    async fn item_build(&self, args: &ItemBuildArgs) -> Result<ItemBuild> {
        let kind = args
            .kind
            .parse::<DerivativeType>()
            .ok()
            .filter(DerivativeType::is_item_level)
            .ok_or_else(|| AppError::InvalidArgument(format!("{} is not an item derivative", args.kind)))?;
        let media = self.services.repository.item_media(args.id)?;
        let sources = data_media(&self.services.resolver, &media, kind);
        let outcome = self.services.items.build(args.id, kind, &sources).await;
        Ok(ItemBuild {
            item_id: args.id,
            kind,
            outcome,
        })
    }

    async fn thumbnail(&self, args: &ThumbnailArgs) -> Result<ThumbnailReport> {
        let settings = self.services.derivative_settings()?;
        let options = ThumbnailOptions {
            percentage: Percentage::clamped(args.percentage.unwrap_or(settings.thumbnail_percentage)),
            force: args.force,
            bulk: false,
        };
        Ok(self.services.thumbnails.process_media(args.id, options).await)
    }

    async fn derivatives(&self, id: i64) -> Result<Listing> {
        let settings = self.services.derivative_settings()?;
        list_derivatives(
            self.services.repository.as_ref(),
            self.services.store.as_ref(),
            &self.services.items,
            &settings,
            id,
        )
        .await?
        .ok_or_else(|| AppError::MissingResource(format!("resource #{id}")))
    }

    async fn jobs_run(&self, args: &JobRunArgs) -> Result<Vec<JobRun>> {
        let runner = JobRunner::new(self.services.clone());
        let shutdown = CancellationFlag::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.cancel();
            }
        });
        Ok(runner
            .run(args.once, Duration::from_secs(args.idle.max(1)), &shutdown)
            .await?)
    }

    fn jobs_list(&self, args: &JobListArgs) -> Result<Vec<JobSummary>> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()?;
        let jobs = self.services.jobs.list(&JobFilter {
            status,
            limit: Some(args.limit),
        })?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    fn jobs_dispatch(&self, args: &JobDispatchArgs) -> Result<JobSummary> {
        let kind: JobKind = args.kind.parse()?;
        let job_args: JobArgs = serde_json::from_str(&args.args)?;
        let handle = self.services.jobs.dispatch(kind, job_args)?;
        Ok(JobSummary::from(&self.services.jobs.get(handle.id)?))
    }

    fn jobs_stop(&self, id: i64) -> Result<JobSummary> {
        self.services.jobs.request_stop(id)?;
        Ok(JobSummary::from(&self.services.jobs.get(id)?))
    }

    fn settings_get(&self, key: &str) -> Result<SettingValue> {
        let value = self
            .services
            .settings
            .get(key)?
            .ok_or_else(|| AppError::MissingResource(format!("setting {key}")))?;
        Ok(SettingValue {
            key: key.to_string(),
            value,
        })
    }

    fn settings_set(&self, key: &str, raw: &str) -> Result<SettingValue> {
        let value: Value = serde_json::from_str(raw)?;
        self.services.settings.set(key, &value)?;
        Ok(SettingValue {
            key: key.to_string(),
            value,
        })
    }

    fn janitor(&self) -> Result<JanitorReport> {
        Ok(run_janitor(
            &self.services.config.storage_root(),
            &self.services.leases,
        )?)
    }
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub database: PathBuf,
    pub storage_root: PathBuf,
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        format!(
            "database: {}\nstorage root: {}",
            self.database.display(),
            self.storage_root.display()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct RuleCheck {
    pub family: RuleFamily,
    pub pattern: String,
    pub command: String,
    pub error: Option<String>,
}

impl DisplayFallback for RuleCheck {
    fn display(&self) -> String {
        match &self.error {
            None => format!("[OK] {} {} = {}", self.family, self.pattern, self.command),
            Some(error) => format!("[ERROR] {} {}: {}", self.family, self.pattern, error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ItemBuild {
    pub item_id: i64,
    pub kind: DerivativeType,
    pub outcome: ItemOutcome,
}

impl DisplayFallback for ItemBuild {
    fn display(&self) -> String {
        let outcome = match &self.outcome {
            ItemOutcome::Created { path, size } => format!("created {} ({size} bytes)", path.display()),
            ItemOutcome::InProgress => "already in progress".to_string(),
            ItemOutcome::NoSource => "no media can feed this derivative".to_string(),
            ItemOutcome::Failed { reason } => format!("failed: {reason}"),
        };
        format!("item #{} {}: {outcome}", self.item_id, self.kind)
    }
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub args: JobArgs,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&JobRecord> for JobSummary {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            args: job.args.clone(),
            created_at: job.created_at.map(|at| at.to_rfc3339()),
            finished_at: job.finished_at.map(|at| at.to_rfc3339()),
            failure_reason: job.failure_reason.clone(),
        }
    }
}

impl DisplayFallback for JobSummary {
    fn display(&self) -> String {
        let mut line = format!("#{} {} [{}]", self.id, self.kind, self.status);
        if let Some(reason) = &self.failure_reason {
            line.push_str(&format!(" {reason}"));
        }
        line
    }
}

impl DisplayFallback for JobRun {
    fn display(&self) -> String {
        match &self.failure_reason {
            Some(reason) => format!("#{} {} [{}] {reason}", self.id, self.kind, self.status),
            None => format!("#{} {} [{}]", self.id, self.kind, self.status),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettingValue {
    pub key: String,
    pub value: Value,
}

impl DisplayFallback for SettingValue {
    fn display(&self) -> String {
        format!("{} = {}", self.key, self.value)
    }
}

impl DisplayFallback for BatchSummary {
    fn display(&self) -> String {
        let mut line = format!(
            "{}/{} processed, {} skipped, {} succeeded, {} failed",
            self.processed, self.total, self.skipped, self.succeeded, self.failed
        );
        if self.stopped {
            line.push_str(" (stopped)");
        }
        line
    }
}

impl DisplayFallback for MediaReport {
    fn display(&self) -> String {
        let outcome = match &self.outcome {
            MediaOutcome::Succeeded => "succeeded".to_string(),
            MediaOutcome::Failed => "failed".to_string(),
            MediaOutcome::Skipped { reason } => format!("skipped ({reason:?})"),
            MediaOutcome::InProgress => "in progress".to_string(),
            MediaOutcome::Stopped => "stopped".to_string(),
        };
        let mut lines = vec![format!("media #{}: {outcome}", self.media_id)];
        for rule in &self.rules {
            let detail = match &rule.outcome {
                RuleOutcome::Stored { filename, media_type } => format!("stored {filename} ({media_type})"),
                RuleOutcome::Removed => "record removed".to_string(),
                RuleOutcome::Unchanged => "unchanged".to_string(),
                RuleOutcome::InProgress => "in progress".to_string(),
                RuleOutcome::Failed { reason } => format!("failed: {reason}"),
            };
            lines.push(format!("  {}: {detail}", rule.folder));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ThumbnailReport {
    fn display(&self) -> String {
        let outcome = match &self.outcome {
            ThumbnailOutcome::Generated => "generated".to_string(),
            ThumbnailOutcome::Partial => "partially generated".to_string(),
            ThumbnailOutcome::Skipped { reason } => format!("skipped ({reason:?})"),
            ThumbnailOutcome::Failed { reason } => format!("failed: {reason}"),
        };
        let mut lines = vec![format!("media #{}: {outcome}", self.media_id)];
        for size in &self.sizes {
            let tier = size
                .attempts
                .last()
                .map(|attempt| attempt.tier)
                .unwrap_or("-");
            lines.push(format!(
                "  {}: {} via {tier}",
                size.size,
                if size.stored { "stored" } else { "missing" }
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Listing {
    fn display(&self) -> String {
        let (level, entries) = match self {
            Listing::Item(entries) => ("item", entries),
            Listing::Media(entries) => ("media", entries),
        };
        let mut lines = vec![format!("{level} derivatives:")];
        for entry in entries {
            let state = if entry.ready {
                "ready"
            } else if entry.in_progress {
                "in progress"
            } else if entry.feasible {
                "available"
            } else {
                "unavailable"
            };
            let size = entry
                .size
                .map(|size| format!(" {size} bytes"))
                .unwrap_or_default();
            lines.push(format!(
                "  {} [{}] {state}{size} {}",
                entry.name, entry.mode, entry.file
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for JanitorReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} temp files removed, {} expired leases dropped",
            self.removed_files.len(),
            self.expired_leases
        )];
        lines.extend(
            self.removed_files
                .iter()
                .map(|path| format!("  {}", path.display())),
        );
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let template = fs::read_to_string("../configs/derivmedia.toml").unwrap();
        let config = template.replace(
            "base_dir = \"/var/lib/derivmedia\"",
            &format!("base_dir = {:?}", temp.path().display().to_string()),
        );
        let config_path = temp.path().join("derivmedia.toml");
        fs::write(&config_path, config).unwrap();

        let cli = Cli {
            config: config_path,
            format: OutputFormat::Json,
            command: Commands::Init,
        };
        let context = AppContext::new(&cli).unwrap();
        context.init().unwrap();
        (temp, context)
    }

    #[test]
    fn init_creates_database_under_base_dir() {
        let (temp, context) = prepare_test_context();
        let report = context.init().unwrap();
        assert!(report.database.starts_with(temp.path()));
        assert!(report.database.is_file());
        assert!(temp.path().join("files/original").is_dir());
    }

    #[test]
    fn shipped_converter_rules_are_valid() {
        let (_temp, context) = prepare_test_context();
        let report = context.validate().unwrap();
        assert_eq!(report.len(), 6);
        assert!(report.iter().all(|entry| entry.error.is_none()));
    }

    #[test]
    fn settings_round_trip_as_json() {
        let (_temp, context) = prepare_test_context();
        assert!(matches!(
            context.settings_get("derivativemedia_max_size_live"),
            Err(AppError::MissingResource(_))
        ));
        context
            .settings_set("derivativemedia_max_size_live", "12")
            .unwrap();
        let stored = context.settings_get("derivativemedia_max_size_live").unwrap();
        assert_eq!(stored.value, serde_json::json!(12));
        assert_eq!(context.services.derivative_settings().unwrap().max_size_live, 12);
        assert!(matches!(
            context.settings_set("derivativemedia_max_size_live", "not json"),
            Err(AppError::Serialize(_))
        ));
    }

    #[test]
    fn dispatched_job_is_listed_and_stopped() {
        let (_temp, context) = prepare_test_context();
        let job = context
            .jobs_dispatch(&JobDispatchArgs {
                kind: "derivative_media".to_string(),
                args: r#"{"media_id": 3}"#.to_string(),
            })
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.args.int("media_id"), Some(3));

        let listed = context
            .jobs_list(&JobListArgs {
                status: Some("queued".to_string()),
                limit: 5,
            })
            .unwrap();
        assert_eq!(listed.len(), 1);

        let stopped = context.jobs_stop(job.id).unwrap();
        assert_eq!(stopped.status, JobStatus::Stopped);
        assert!(matches!(
            context.jobs_dispatch(&JobDispatchArgs {
                kind: "render_everything".to_string(),
                args: "{}".to_string(),
            }),
            Err(AppError::Job(_))
        ));
    }

    #[tokio::test]
    async fn unknown_resource_has_no_listing() {
        let (_temp, context) = prepare_test_context();
        assert!(matches!(
            context.derivatives(404).await,
            Err(AppError::MissingResource(_))
        ));
    }

    #[test]
    fn batch_summary_text_matches_log_line() {
        let summary = BatchSummary {
            total: 10,
            processed: 7,
            succeeded: 6,
            failed: 1,
            skipped: 3,
            stopped: false,
        };
        assert_eq!(
            summary.display(),
            "7/10 processed, 3 skipped, 6 succeeded, 1 failed"
        );
    }
}
