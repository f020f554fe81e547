//! Paginated scan over a filtered media collection.

pub mod range;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{CancellationFlag, DerivationEngine, JobContext, MediaOutcome};
use crate::resource::{MediaFilter, RepositoryResult, ResourceRepository};
use crate::thumbnail::{ThumbnailGenerator, ThumbnailOptions, ThumbnailOutcome, ThumbnailSkip};

pub use range::{parse_id_ranges, range_tokens, IdRange};

pub const DEFAULT_PAGE_SIZE: u64 = 25;

/// What to apply to every media of the scan.
#[derive(Debug, Clone, Copy)]
pub enum BatchTask<'a> {
    Derive(&'a JobContext),
    Thumbnails {
        options: ThumbnailOptions,
        cancel: &'a CancellationFlag,
    },
}

impl BatchTask<'_> {
    fn is_cancelled(&self) -> bool {
        match self {
            BatchTask::Derive(ctx) => ctx.is_cancelled(),
            BatchTask::Thumbnails { cancel, .. } => cancel.is_cancelled(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BatchTask::Derive(_) => "derivative media",
            BatchTask::Thumbnails { .. } => "video thumbnails",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Succeeded,
    Failed,
    Skipped,
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    stopped: AtomicBool,
}

impl Counters {
    fn record(&self, tally: Tally) {
        let counter = match tally {
            Tally::Succeeded => &self.succeeded,
            Tally::Failed => &self.failed,
            Tally::Skipped => &self.skipped,
            Tally::Stopped => {
                self.stopped.store(true, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if tally != Tally::Skipped {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn summary(&self, total: u64) -> BatchSummary {
        BatchSummary {
            total,
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            stopped: self.stopped.load(Ordering::SeqCst),
        }
    }
}

/// Totals of one scan. `processed` counts media that reached a converter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub stopped: bool,
}

pub struct BatchRunner {
    repository: Arc<dyn ResourceRepository>,
    engine: DerivationEngine,
    thumbnails: Arc<ThumbnailGenerator>,
    page_size: u64,
    workers: usize,
}

impl BatchRunner {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        engine: DerivationEngine,
        thumbnails: Arc<ThumbnailGenerator>,
    ) -> Self {
        Self {
            repository,
            engine,
            thumbnails,
            page_size: DEFAULT_PAGE_SIZE,
            workers: 1,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Walks the selection page by page in ascending id order.
    pub async fn run(&self, filter: &MediaFilter, task: BatchTask<'_>) -> RepositoryResult<BatchSummary> {
        let mut filter = filter.clone();
        filter.has_original = Some(true);
        let total = self.repository.count_media(&filter)?;
        if total == 0 {
            info!(task = task.label(), "no media to process, check the query");
            return Ok(BatchSummary::default());
        }
        info!(task = task.label(), total, "processing media");

        let counters = Counters::default();
        let mut offset = 0;
        while offset < total {
            if task.is_cancelled() {
                counters.record(Tally::Stopped);
                break;
            }
            let ids = self
                .repository
                .search_media_ids(&filter, offset, self.page_size)?;
            if ids.is_empty() {
                break;
            }
            let position = offset;
            stream::iter(ids.into_iter().enumerate())
                .map(|(index, media_id)| {
                    let counters = &counters;
                    async move {
                        if task.is_cancelled() {
                            counters.record(Tally::Stopped);
                            return;
                        }
                        info!(
                            media_id,
                            count = position + index as u64 + 1,
                            total,
                            "processing media"
                        );
                        counters.record(self.apply(media_id, task).await);
                    }
                })
                .buffer_unordered(self.workers)
                .collect::<Vec<_>>()
                .await;
            offset += self.page_size;
        }

        let summary = counters.summary(total);
        if summary.stopped {
            warn!(
                task = task.label(),
                processed = summary.processed,
                total,
                skipped = summary.skipped,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "job stopped: {}/{} processed",
                summary.processed,
                total
            );
        }
        info!(
            task = task.label(),
            "{}/{} processed, {} skipped, {} succeeded, {} failed",
            summary.processed,
            total,
            summary.skipped,
            summary.succeeded,
            summary.failed
        );
        Ok(summary)
    }

    async fn apply(&self, media_id: i64, task: BatchTask<'_>) -> Tally {
        match task {
            BatchTask::Derive(ctx) => match self.engine.process_media(ctx, media_id).await.outcome {
                MediaOutcome::Succeeded => Tally::Succeeded,
                MediaOutcome::Failed => Tally::Failed,
                MediaOutcome::Skipped { .. } | MediaOutcome::InProgress => Tally::Skipped,
                MediaOutcome::Stopped => Tally::Stopped,
            },
            BatchTask::Thumbnails { options, .. } => {
                match self.thumbnails.process_media(media_id, options).await.outcome {
                    ThumbnailOutcome::Generated | ThumbnailOutcome::Partial => Tally::Succeeded,
                    ThumbnailOutcome::Skipped {
                        reason: ThumbnailSkip::AlreadyExists,
                    } => Tally::Succeeded,
                    ThumbnailOutcome::Skipped { .. } => Tally::Skipped,
                    ThumbnailOutcome::Failed { .. } => Tally::Failed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_media_are_not_processed() {
        let counters = Counters::default();
        counters.record(Tally::Succeeded);
        counters.record(Tally::Failed);
        counters.record(Tally::Skipped);
        counters.record(Tally::Skipped);
        let summary = counters.summary(5);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 2);
        assert!(!summary.stopped);
    }

    #[test]
    fn stop_is_sticky() {
        let counters = Counters::default();
        counters.record(Tally::Stopped);
        counters.record(Tally::Succeeded);
        let summary = counters.summary(2);
        assert!(summary.stopped);
        assert_eq!(summary.succeeded, 1);
    }
}
