mod common;

use std::time::Duration;

use common::Fixture;

use derivmedia_core::resource::NewMedia;
use derivmedia_core::{
    parse_id_ranges, BatchTask, CancellationFlag, EngineMode, JobArgs, JobDispatcher, JobKind,
    JobRunner, JobStatus, MediaFilter, Percentage, ResourceRepository, ThumbnailOptions,
};

const WAV: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt original audio";

#[tokio::test]
async fn batch_counts_processed_and_skipped_media() {
    let fixture = Fixture::new();
    let (item_id, first) = fixture.upload("one", "wav", "audio/x-wav", WAV);
    let second = fixture.attach(item_id, "two", "wav", "audio/x-wav", WAV);
    let missing = fixture.attach(item_id, "three", "wav", "audio/x-wav", WAV);
    std::fs::remove_file(fixture.root().join("original/three.wav")).unwrap();
    fixture.attach(item_id, "notes", "txt", "text/plain", b"plain text");
    // Media without an original never enter the scan.
    fixture
        .services
        .repository
        .insert_media(&NewMedia {
            has_original: false,
            ..NewMedia::upload(item_id, "remote", "mp3", "audio/mpeg")
        })
        .unwrap();

    let settings = fixture.services.derivative_settings().unwrap();
    let ctx = fixture
        .services
        .job_context(&settings, EngineMode::Create, CancellationFlag::new());
    let summary = fixture
        .services
        .batch_runner()
        .with_page_size(2)
        .run(&MediaFilter::default(), BatchTask::Derive(&ctx))
        .await
        .unwrap();

    assert_eq!(summary.total, 4);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 2);
    assert!(!summary.stopped);
    for media_id in [first, second] {
        let media = fixture.services.repository.read_media(media_id).unwrap();
        assert!(media.data.record("mp3").is_some());
    }
    let media = fixture.services.repository.read_media(missing).unwrap();
    assert!(media.data.record("mp3").is_none());
}

#[tokio::test]
async fn id_ranges_narrow_the_scan() {
    let fixture = Fixture::new();
    let (item_id, first) = fixture.upload("a", "wav", "audio/x-wav", WAV);
    let second = fixture.attach(item_id, "b", "wav", "audio/x-wav", WAV);
    let third = fixture.attach(item_id, "c", "wav", "audio/x-wav", WAV);

    let settings = fixture.services.derivative_settings().unwrap();
    let ctx = fixture
        .services
        .job_context(&settings, EngineMode::Create, CancellationFlag::new());
    let filter = MediaFilter {
        id_ranges: parse_id_ranges(&format!("{first} {third}-")),
        ..MediaFilter::default()
    };
    let summary = fixture
        .services
        .batch_runner()
        .run(&filter, BatchTask::Derive(&ctx))
        .await
        .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    let skipped = fixture.services.repository.read_media(second).unwrap();
    assert!(skipped.data.record("mp3").is_none());
}

#[tokio::test]
async fn cancelled_batch_stops_before_the_first_media() {
    let fixture = Fixture::new();
    fixture.upload("late", "wav", "audio/x-wav", WAV);
    let settings = fixture.services.derivative_settings().unwrap();
    let cancel = CancellationFlag::new();
    cancel.cancel();
    let ctx = fixture
        .services
        .job_context(&settings, EngineMode::Create, cancel);

    let summary = fixture
        .services
        .batch_runner()
        .run(&MediaFilter::default(), BatchTask::Derive(&ctx))
        .await
        .unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.total, 1);
    assert_eq!(summary.processed, 0);
    assert!(fixture.calls_to("ffmpeg").is_empty());
}

#[tokio::test]
async fn thumbnail_batch_only_scans_videos() {
    let fixture = Fixture::new();
    let (item_id, _) = fixture.upload("movie", "mp4", "video/mp4", b"\x00\x00\x00\x20ftypisom");
    fixture.attach(item_id, "song", "wav", "audio/x-wav", WAV);
    let cancel = CancellationFlag::new();

    let summary = fixture
        .services
        .batch_runner()
        .run(
            &MediaFilter {
                media_types: vec!["video".to_string()],
                ..MediaFilter::default()
            },
            BatchTask::Thumbnails {
                options: ThumbnailOptions {
                    percentage: Percentage::clamped(150),
                    force: false,
                    bulk: true,
                },
                cancel: &cancel,
            },
        )
        .await
        .unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(fixture.root().join("square/movie.jpg").is_file());
}

#[tokio::test]
async fn dispatched_jobs_run_to_completion() {
    let fixture = Fixture::new();
    let (item_id, media_id) = fixture.upload("queued", "wav", "audio/x-wav", WAV);
    let jobs = fixture.services.jobs.clone();
    let media_job = jobs
        .dispatch(JobKind::DerivativeMedia, JobArgs::new().with("media_id", media_id))
        .unwrap();
    let verify_job = jobs
        .dispatch(
            JobKind::DerivativeMediaMetadata,
            JobArgs::new().with("media_ids", format!("{media_id}")),
        )
        .unwrap();
    let missing_job = jobs.dispatch(JobKind::DerivativeItem, JobArgs::new()).unwrap();

    let runner = JobRunner::new(fixture.services.clone());
    let runs = runner
        .run(true, Duration::from_millis(10), &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(jobs.get(media_job.id).unwrap().status, JobStatus::Completed);
    assert_eq!(jobs.get(verify_job.id).unwrap().status, JobStatus::Completed);
    let failed = jobs.get(missing_job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("missing item_id"));

    let media = fixture.services.repository.read_media(media_id).unwrap();
    assert_eq!(media.data.record("mp3").unwrap().filename, "queued.mp3");
    assert_eq!(fixture.services.repository.item_media(item_id).unwrap().len(), 1);
}

#[tokio::test]
async fn stop_request_on_a_queued_job_prevents_it_from_running() {
    let fixture = Fixture::new();
    let (_, media_id) = fixture.upload("never", "wav", "audio/x-wav", WAV);
    let jobs = fixture.services.jobs.clone();
    let handle = jobs
        .dispatch(JobKind::DerivativeMedia, JobArgs::new().with("media_id", media_id))
        .unwrap();

    assert_eq!(jobs.request_stop(handle.id).unwrap(), JobStatus::Stopped);
    let runner = JobRunner::new(fixture.services.clone());
    assert!(runner.run_next().await.unwrap().is_none());
    assert!(fixture.calls_to("ffmpeg").is_empty());
}

#[tokio::test]
async fn media_query_narrows_a_dispatched_batch() {
    let fixture = Fixture::new();
    let (item_id, wanted) = fixture.upload("interview", "wav", "audio/x-wav", WAV);
    let other = fixture.attach(item_id, "soundtrack", "wav", "audio/x-wav", WAV);
    let jobs = fixture.services.jobs.clone();
    let handle = jobs
        .dispatch(
            JobKind::DerivativeMediaFile,
            JobArgs::new().with("query", "interview"),
        )
        .unwrap();

    let runner = JobRunner::new(fixture.services.clone());
    runner.run_next().await.unwrap().unwrap();
    assert_eq!(jobs.get(handle.id).unwrap().status, JobStatus::Completed);

    let media = fixture.services.repository.read_media(wanted).unwrap();
    assert!(media.data.record("mp3").is_some());
    let media = fixture.services.repository.read_media(other).unwrap();
    assert!(media.data.record("mp3").is_none());
    assert_eq!(fixture.calls_to("ffmpeg").len(), 2);
}
