//! Background execution of dispatched jobs.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::{parse_id_ranges, BatchSummary, BatchTask};
use crate::derivative::DerivativeType;
use crate::engine::{CancellationFlag, EngineMode, MediaOutcome};
use crate::item::{data_media, ItemOutcome};
use crate::jobs::{
    JobArgs, JobDispatcher, JobHandle, JobKind, JobRecord, JobResult, JobStatus, SqliteJobQueue,
};
use crate::metadata::is_managed;
use crate::resource::{ItemFilter, MediaFilter, MediaRecord, ResourceRepository};
use crate::services::Services;
use crate::settings::DerivativeSettings;
use crate::thumbnail::{is_supported_video, Percentage, ThumbnailOptions, ThumbnailOutcome};

const STOP_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
}

pub struct JobRunner {
    services: Services,
    queue: SqliteJobQueue,
}

impl JobRunner {
    pub fn new(services: Services) -> Self {
        let queue = services.jobs.as_ref().clone();
        Self { services, queue }
    }

    /// Claims and runs the oldest queued job.
    pub async fn run_next(&self) -> JobResult<Option<JobRun>> {
        let Some(job) = self.queue.claim_next()? else {
            return Ok(None);
        };
        info!(job_id = job.id, kind = %job.kind, "job started");
        let cancel = CancellationFlag::new();
        let watcher = tokio::spawn(watch_stop(self.queue.clone(), job.id, cancel.clone()));
        let result = self.execute(&job, &cancel).await;
        watcher.abort();

        let (status, reason) = match result {
            Ok(()) if cancel.is_cancelled() => (JobStatus::Stopped, None),
            Ok(()) => (JobStatus::Completed, None),
            Err(reason) => (JobStatus::Failed, Some(reason)),
        };
        self.queue.finish(job.id, status, reason.as_deref())?;
        match status {
            JobStatus::Failed => error!(job_id = job.id, kind = %job.kind, reason = ?reason, "job failed"),
            JobStatus::Stopped => warn!(job_id = job.id, kind = %job.kind, "job stopped"),
            _ => info!(job_id = job.id, kind = %job.kind, "job completed"),
        }
        Ok(Some(JobRun {
            id: job.id,
            kind: job.kind,
            status,
            failure_reason: reason,
        }))
    }

    /// Runs jobs until the queue is empty (`once`) or `shutdown` is raised.
    pub async fn run(&self, once: bool, idle: Duration, shutdown: &CancellationFlag) -> JobResult<Vec<JobRun>> {
        let mut runs = Vec::new();
        while !shutdown.is_cancelled() {
            match self.run_next().await? {
                Some(run) => runs.push(run),
                None if once => break,
                None => tokio::time::sleep(idle).await,
            }
        }
        Ok(runs)
    }

    /// Failure reasons are short and never include tool output.
    pub async fn execute(&self, job: &JobRecord, cancel: &CancellationFlag) -> Result<(), String> {
        let settings = self
            .services
            .derivative_settings()
            .map_err(|err| err.to_string())?;
        let args = &job.args;
        match job.kind {
            JobKind::DerivativeMedia => {
                let media_id = args.int("media_id").ok_or("missing media_id")?;
                let ctx = self
                    .services
                    .job_context(&settings, EngineMode::Create, cancel.clone());
                match self.services.engine.process_media(&ctx, media_id).await.outcome {
                    MediaOutcome::Failed => Err(format!("derivation of media #{media_id} failed")),
                    _ => Ok(()),
                }
            }
            JobKind::DerivativeItem => {
                let item_id = args.int("item_id").ok_or("missing item_id")?;
                let ctx = self
                    .services
                    .job_context(&settings, EngineMode::Create, cancel.clone());
                let reports = self.services.engine.process_item(&ctx, item_id).await;
                let failed = reports
                    .iter()
                    .filter(|report| report.outcome == MediaOutcome::Failed)
                    .count();
                if failed > 0 {
                    Err(format!("{failed} media of item #{item_id} failed"))
                } else {
                    Ok(())
                }
            }
            JobKind::DerivativeMediaFile | JobKind::DerivativeMediaMetadata => {
                let mode = if job.kind == JobKind::DerivativeMediaFile {
                    EngineMode::Create
                } else {
                    EngineMode::VerifyOnly
                };
                let Some(filter) = self.media_filter(args)? else {
                    return Ok(());
                };
                let ctx = self.services.job_context(&settings, mode, cancel.clone());
                let summary = self
                    .services
                    .batch_runner()
                    .run(&filter, BatchTask::Derive(&ctx))
                    .await
                    .map_err(|err| err.to_string())?;
                batch_result(&summary)
            }
            JobKind::GenerateVideoThumbnails => self.thumbnails(args, &settings, cancel).await,
            JobKind::CreateDerivatives => self.item_derivatives(args, &settings, cancel).await,
        }
    }

    /// `None` when an item restriction matched nothing.
    fn media_filter(&self, args: &JobArgs) -> Result<Option<MediaFilter>, String> {
        let mut filter = MediaFilter {
            item_set_ids: args.ints("item_sets"),
            query: args.string("query").map(str::to_string),
            ingesters: args.strings("ingesters"),
            renderers: args.strings("renderers"),
            media_types: args.strings("media_types"),
            id_ranges: args
                .string("media_ids")
                .map(parse_id_ranges)
                .unwrap_or_default(),
            ..MediaFilter::default()
        };
        if let Some(query) = args.string("query_items") {
            let item_ids = self
                .services
                .repository
                .search_item_ids(&ItemFilter {
                    query: Some(query.to_string()),
                    ..ItemFilter::default()
                })
                .map_err(|err| err.to_string())?;
            if item_ids.is_empty() {
                warn!(query, "the item query matched no items");
                return Ok(None);
            }
            filter.item_ids = item_ids;
        }
        Ok(Some(filter))
    }

    async fn thumbnails(
        &self,
        args: &JobArgs,
        settings: &DerivativeSettings,
        cancel: &CancellationFlag,
    ) -> Result<(), String> {
        let percentage = Percentage::clamped(
            args.int("percentage")
                .unwrap_or(settings.thumbnail_percentage),
        );
        let force = args.flag("force_regenerate");
        if let Some(media_id) = args.int("media_id") {
            let options = ThumbnailOptions {
                percentage,
                force,
                bulk: false,
            };
            return match self.services.thumbnails.process_media(media_id, options).await.outcome {
                ThumbnailOutcome::Failed { reason } => Err(reason),
                _ => Ok(()),
            };
        }
        let Some(mut filter) = self.media_filter(args)? else {
            return Ok(());
        };
        if filter.media_types.is_empty() {
            filter.media_types = vec!["video".to_string()];
        }
        let options = ThumbnailOptions {
            percentage,
            force,
            bulk: true,
        };
        let summary = self
            .services
            .batch_runner()
            .run(&filter, BatchTask::Thumbnails { options, cancel })
            .await
            .map_err(|err| err.to_string())?;
        batch_result(&summary)
    }

    async fn item_derivatives(
        &self,
        args: &JobArgs,
        settings: &DerivativeSettings,
        cancel: &CancellationFlag,
    ) -> Result<(), String> {
        let repository = self.services.repository.as_ref();
        let item_ids = match args.int("item_id") {
            Some(item_id) => vec![item_id],
            None => repository
                .search_item_ids(&ItemFilter {
                    query: args.string("query").map(str::to_string),
                    item_set_ids: args.ints("item_sets"),
                    id_ranges: args
                        .string("item_ids")
                        .map(parse_id_ranges)
                        .unwrap_or_default(),
                })
                .map_err(|err| err.to_string())?,
        };
        let requested = args.strings("type");
        let kinds: Vec<DerivativeType> = if requested.is_empty() {
            settings.enabled_item_types().collect()
        } else {
            requested
                .iter()
                .filter_map(|tag| tag.parse::<DerivativeType>().ok())
                .filter(|kind| kind.is_item_level() && settings.is_enabled(*kind))
                .collect()
        };
        if kinds.is_empty() {
            warn!("no enabled item derivative type requested");
            return Ok(());
        }
        let selection = args.ints("data_media");
        let single = item_ids.len() == 1;

        let mut failed = 0;
        for item_id in item_ids {
            let media = match repository.item_media(item_id) {
                Ok(media) => media,
                Err(err) => {
                    error!(item_id, error = %err, "unable to list item media");
                    failed += 1;
                    continue;
                }
            };
            for kind in &kinds {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let mut sources = data_media(&self.services.resolver, &media, *kind);
                if single && !selection.is_empty() {
                    sources.retain(|source| selection.contains(&source.media_id));
                }
                match self.services.items.build(item_id, *kind, &sources).await {
                    ItemOutcome::Failed { .. } => failed += 1,
                    ItemOutcome::NoSource => {
                        info!(item_id, kind = %kind, "no media can feed this derivative");
                    }
                    ItemOutcome::Created { .. } | ItemOutcome::InProgress => {}
                }
            }
        }
        if failed > 0 {
            Err(format!("{failed} item derivatives failed"))
        } else {
            Ok(())
        }
    }
}

fn batch_result(summary: &BatchSummary) -> Result<(), String> {
    if summary.failed > 0 {
        Err(format!(
            "{} of {} media failed",
            summary.failed, summary.total
        ))
    } else {
        Ok(())
    }
}

async fn watch_stop(queue: SqliteJobQueue, job_id: i64, cancel: CancellationFlag) {
    loop {
        tokio::time::sleep(STOP_POLL).await;
        match queue.stop_requested(job_id) {
            Ok(true) => {
                cancel.cancel();
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(job_id, error = %err, "unable to poll stop request");
                return;
            }
        }
    }
}

/// Jobs queued when a media is saved.
pub fn on_media_saved(
    dispatcher: &dyn JobDispatcher,
    settings: &DerivativeSettings,
    media: &MediaRecord,
) -> JobResult<Vec<JobHandle>> {
    let mut handles = Vec::new();
    if is_managed(media) {
        handles.push(dispatcher.dispatch(
            JobKind::DerivativeMedia,
            JobArgs::new().with("media_id", media.id),
        )?);
    }
    let video = media
        .media_type
        .as_deref()
        .map(|media_type| is_supported_video(media_type, false))
        .unwrap_or(false);
    if video && media.has_original {
        handles.push(dispatcher.dispatch(
            JobKind::GenerateVideoThumbnails,
            JobArgs::new()
                .with("media_id", media.id)
                .with("percentage", settings.thumbnail_percentage),
        )?);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        jobs: Mutex<Vec<(JobKind, JobArgs)>>,
    }

    impl JobDispatcher for RecordingDispatcher {
        fn dispatch(&self, kind: JobKind, args: JobArgs) -> JobResult<JobHandle> {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.push((kind, args));
            Ok(JobHandle {
                id: jobs.len() as i64,
            })
        }
    }

    fn settings() -> DerivativeSettings {
        DerivativeSettings {
            enabled: vec![DerivativeType::Audio, DerivativeType::Video],
            max_size_live: 30,
            converters: Default::default(),
            thumbnail_percentage: 40,
        }
    }

    fn media(media_type: &str, renderer: &str) -> MediaRecord {
        MediaRecord {
            id: 9,
            storage_id: Some("abc".into()),
            extension: "mp4".into(),
            media_type: Some(media_type.into()),
            renderer: renderer.into(),
            has_original: true,
            ..MediaRecord::default()
        }
    }

    #[test]
    fn saved_video_gets_derivatives_and_thumbnails() {
        let dispatcher = RecordingDispatcher::default();
        let handles = on_media_saved(&dispatcher, &settings(), &media("video/mp4", "file")).unwrap();
        assert_eq!(handles.len(), 2);
        let jobs = dispatcher.jobs.lock().unwrap();
        assert_eq!(jobs[0].0, JobKind::DerivativeMedia);
        assert_eq!(jobs[1].0, JobKind::GenerateVideoThumbnails);
        assert_eq!(jobs[1].1.int("percentage"), Some(40));
    }

    #[test]
    fn unmanaged_media_get_nothing() {
        let dispatcher = RecordingDispatcher::default();
        let handles = on_media_saved(&dispatcher, &settings(), &media("image/png", "file")).unwrap();
        assert!(handles.is_empty());
        let handles = on_media_saved(&dispatcher, &settings(), &media("audio/mpeg", "youtube")).unwrap();
        assert!(handles.is_empty());
    }
}
