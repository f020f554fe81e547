mod common;

use common::{Fixture, Script};

use derivmedia_core::thumbnail::ThumbnailSkip;
use derivmedia_core::{Percentage, ThumbnailOptions, ThumbnailOutcome};

const MP4: &[u8] = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00video";

fn options(force: bool) -> ThumbnailOptions {
    ThumbnailOptions {
        percentage: Percentage::clamped(25),
        force,
        bulk: false,
    }
}

#[tokio::test]
async fn frame_is_captured_at_the_percentage_and_stored_in_every_size() {
    let fixture = Fixture::new();
    let (_, media_id) = fixture.upload("clip", "mp4", "video/mp4", MP4);

    let report = fixture
        .services
        .thumbnails
        .process_media(media_id, options(false))
        .await;
    assert_eq!(report.outcome, ThumbnailOutcome::Generated);
    assert_eq!(report.duration, Some(120.0));
    assert_eq!(report.timestamp, Some(30.0));

    let capture = &fixture.calls_to("ffmpeg")[0];
    assert_eq!(capture[capture.iter().position(|arg| arg == "-ss").unwrap() + 1], "30.000");
    for size in ["large", "medium", "square"] {
        let stored = fixture.root().join(format!("{size}/clip.jpg"));
        let bytes = std::fs::read(&stored).unwrap();
        assert!(bytes.starts_with(&[0xFF, 0xD8, 0xFF]), "{size} is not a jpeg");
    }
    assert!(report
        .sizes
        .iter()
        .all(|size| size.attempts.len() == 1 && size.attempts[0].tier == "primary"));
}

#[tokio::test]
async fn raster_resize_takes_over_when_convert_fails() {
    let fixture = Fixture::with_script(Script {
        convert_exit: 1,
        ..Script::default()
    });
    let (_, media_id) = fixture.upload("stubborn", "mp4", "video/mp4", MP4);

    let report = fixture
        .services
        .thumbnails
        .process_media(media_id, options(false))
        .await;
    assert_eq!(report.outcome, ThumbnailOutcome::Generated);
    for size in &report.sizes {
        let tiers: Vec<_> = size.attempts.iter().map(|attempt| attempt.tier).collect();
        assert_eq!(tiers, vec!["primary", "simplified", "forced_format", "raster"]);
        assert!(size.stored);
    }
    assert_eq!(fixture.calls_to("convert").len(), 9);

    let square = image::open(fixture.root().join("square/stubborn.jpg")).unwrap();
    assert_eq!((square.width(), square.height()), (200, 200));
    let medium = image::open(fixture.root().join("medium/stubborn.jpg")).unwrap();
    assert_eq!(medium.width(), 400);
}

#[tokio::test]
async fn unknown_duration_uses_the_fallback_timestamp() {
    let fixture = Fixture::with_script(Script {
        duration: None,
        ..Script::default()
    });
    let (_, media_id) = fixture.upload("unprobed", "mp4", "video/mp4", MP4);

    let report = fixture
        .services
        .thumbnails
        .process_media(media_id, options(false))
        .await;
    assert_eq!(report.duration, None);
    assert_eq!(report.timestamp, Some(10.0));
    assert_eq!(report.outcome, ThumbnailOutcome::Generated);
}

#[tokio::test]
async fn existing_thumbnails_are_kept_unless_forced() {
    let fixture = Fixture::new();
    let (_, media_id) = fixture.upload("twice", "mp4", "video/mp4", MP4);
    let thumbnails = &fixture.services.thumbnails;

    thumbnails.process_media(media_id, options(false)).await;
    let again = thumbnails.process_media(media_id, options(false)).await;
    assert_eq!(
        again.outcome,
        ThumbnailOutcome::Skipped {
            reason: ThumbnailSkip::AlreadyExists
        }
    );
    assert_eq!(fixture.calls_to("ffmpeg").len(), 1);

    let forced = thumbnails.process_media(media_id, options(true)).await;
    assert_eq!(forced.outcome, ThumbnailOutcome::Generated);
    assert_eq!(fixture.calls_to("ffmpeg").len(), 2);
}

#[tokio::test]
async fn bulk_only_types_need_the_bulk_flag() {
    let fixture = Fixture::new();
    let (_, media_id) = fixture.upload("legacy", "wmv", "video/x-ms-wmv", MP4);
    let thumbnails = &fixture.services.thumbnails;

    let single = thumbnails.process_media(media_id, options(false)).await;
    assert_eq!(
        single.outcome,
        ThumbnailOutcome::Skipped {
            reason: ThumbnailSkip::UnsupportedType
        }
    );
    let bulk = thumbnails
        .process_media(
            media_id,
            ThumbnailOptions {
                bulk: true,
                ..options(false)
            },
        )
        .await;
    assert_eq!(bulk.outcome, ThumbnailOutcome::Generated);
}
