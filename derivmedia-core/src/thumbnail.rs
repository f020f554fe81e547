//! Video thumbnails: one frame captured at a percentage of the duration,
//! resized to the fixed thumbnail sizes.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::paths::{sanitize_storage_id, PathResolver};
use crate::resource::{MediaRecord, RepositoryError, ResourceRepository};
use crate::store::FileStore;
use crate::tools::{display_command, ToolInvoker, ToolKind};

const MIN_FRAME_BYTES: u64 = 100;
const FRAME_WIDTH: u32 = 800;

/// Types handled when a single media is saved.
const SUPPORTED_TYPES: [&str; 5] = [
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/avi",
    "video/mov",
];

/// Extra types accepted by bulk runs.
const BULK_EXTRA_TYPES: [&str; 3] = ["video/x-ms-wmv", "video/x-matroska", "video/x-msvideo"];

pub fn is_supported_video(media_type: &str, bulk: bool) -> bool {
    SUPPORTED_TYPES.contains(&media_type) || (bulk && BULK_EXTRA_TYPES.contains(&media_type))
}

/// Capture position in percent of the duration, always within 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentage(u8);

impl Percentage {
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn of(&self, duration: f64) -> f64 {
        duration * f64::from(self.0) / 100.0
    }
}

impl Default for Percentage {
    fn default() -> Self {
        Self(25)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSize {
    Large,
    Medium,
    Square,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 3] = [
        ThumbnailSize::Large,
        ThumbnailSize::Medium,
        ThumbnailSize::Square,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailSize::Large => "large",
            ThumbnailSize::Medium => "medium",
            ThumbnailSize::Square => "square",
        }
    }

    pub fn dimension(&self) -> u32 {
        match self {
            ThumbnailSize::Large => 800,
            ThumbnailSize::Medium => 400,
            ThumbnailSize::Square => 200,
        }
    }

    pub fn storage_name(&self, storage_id: &str) -> String {
        format!("{}/{storage_id}.jpg", self.as_str())
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailOptions {
    pub percentage: Percentage,
    pub force: bool,
    /// Accept the wider set of video types of bulk runs.
    pub bulk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSkip {
    NotFound,
    UnsupportedType,
    MissingOriginal,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ThumbnailOutcome {
    Generated,
    /// At least one size failed while another succeeded.
    Partial,
    Skipped { reason: ThumbnailSkip },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ResizeAttempt {
    pub tier: &'static str,
    pub command: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeReport {
    pub size: ThumbnailSize,
    pub stored: bool,
    pub attempts: Vec<ResizeAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThumbnailReport {
    pub media_id: i64,
    pub outcome: ThumbnailOutcome,
    pub duration: Option<f64>,
    pub timestamp: Option<f64>,
    pub sizes: Vec<SizeReport>,
}

impl ThumbnailReport {
    fn skipped(media_id: i64, reason: ThumbnailSkip) -> Self {
        Self {
            media_id,
            outcome: ThumbnailOutcome::Skipped { reason },
            duration: None,
            timestamp: None,
            sizes: Vec::new(),
        }
    }

    fn failed(media_id: i64, reason: impl Into<String>) -> Self {
        Self {
            media_id,
            outcome: ThumbnailOutcome::Failed {
                reason: reason.into(),
            },
            duration: None,
            timestamp: None,
            sizes: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ThumbnailGenerator {
    repository: Arc<dyn ResourceRepository>,
    store: Arc<dyn FileStore>,
    invoker: ToolInvoker,
    resolver: PathResolver,
    fallback_timestamp: f64,
}

impl ThumbnailGenerator {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        store: Arc<dyn FileStore>,
        invoker: ToolInvoker,
        resolver: PathResolver,
        fallback_timestamp: f64,
    ) -> Self {
        Self {
            repository,
            store,
            invoker,
            resolver,
            fallback_timestamp,
        }
    }

    pub async fn process_media(&self, media_id: i64, options: ThumbnailOptions) -> ThumbnailReport {
        match self.repository.read_media(media_id) {
            Ok(media) => self.generate(&media, options).await,
            Err(RepositoryError::NotFound(_)) => {
                warn!(media_id, "media not found");
                ThumbnailReport::skipped(media_id, ThumbnailSkip::NotFound)
            }
            Err(err) => {
                error!(media_id, error = %err, "unable to read media");
                ThumbnailReport::failed(media_id, "unable to read media")
            }
        }
    }

    pub async fn generate(&self, media: &MediaRecord, options: ThumbnailOptions) -> ThumbnailReport {
        let media_id = media.id;
        let supported = media
            .media_type
            .as_deref()
            .map(|media_type| is_supported_video(media_type, options.bulk))
            .unwrap_or(false);
        if !supported {
            return ThumbnailReport::skipped(media_id, ThumbnailSkip::UnsupportedType);
        }
        let storage_id = match media.storage_id.as_deref().map(sanitize_storage_id) {
            Some(Ok(storage_id)) if media.has_original => storage_id,
            _ => return ThumbnailReport::skipped(media_id, ThumbnailSkip::MissingOriginal),
        };
        let source = self.resolver.original_path(&storage_id, &media.extension);
        if !source.is_file() {
            warn!(media_id, path = %source.display(), "original video missing");
            return ThumbnailReport::skipped(media_id, ThumbnailSkip::MissingOriginal);
        }
        if !options.force {
            for size in ThumbnailSize::ALL {
                if self.store.exists(&size.storage_name(&storage_id)).await {
                    info!(media_id, "thumbnails already exist, skipping");
                    return ThumbnailReport::skipped(media_id, ThumbnailSkip::AlreadyExists);
                }
            }
        }

        let duration = self.invoker.probe_duration(&source).await;
        let timestamp = match duration {
            Some(duration) => capture_position(duration, options.percentage),
            None => {
                warn!(
                    media_id,
                    fallback = self.fallback_timestamp,
                    "duration unknown, using fallback timestamp"
                );
                self.fallback_timestamp
            }
        };

        let workdir = match TempDir::new() {
            Ok(dir) => dir,
            Err(err) => {
                error!(media_id, error = %err, "unable to create work directory");
                return ThumbnailReport::failed(media_id, "unable to create work directory");
            }
        };
        let frame = workdir.path().join("frame.jpg");
        if let Err(reason) = self.capture_frame(media_id, &source, timestamp, &frame).await {
            return ThumbnailReport {
                duration,
                timestamp: Some(timestamp),
                ..ThumbnailReport::failed(media_id, reason)
            };
        }

        let mut sizes = Vec::with_capacity(ThumbnailSize::ALL.len());
        for size in ThumbnailSize::ALL {
            let output = workdir.path().join(format!("{}.jpg", size.as_str()));
            let attempts = self.resize(media_id, &frame, &output, size).await;
            let mut stored = attempts.iter().any(|attempt| attempt.success);
            if stored {
                stored = self.store_size(media_id, &output, size, &storage_id).await;
            } else {
                error!(media_id, size = %size, attempts = attempts.len(), "every resize attempt failed");
            }
            sizes.push(SizeReport {
                size,
                stored,
                attempts,
            });
        }

        let stored = sizes.iter().filter(|report| report.stored).count();
        let outcome = if stored == sizes.len() {
            ThumbnailOutcome::Generated
        } else if stored > 0 {
            ThumbnailOutcome::Partial
        } else {
            ThumbnailOutcome::Failed {
                reason: "no thumbnail size could be generated".to_string(),
            }
        };
        info!(media_id, stored, timestamp, "thumbnail generation finished");
        ThumbnailReport {
            media_id,
            outcome,
            duration,
            timestamp: Some(timestamp),
            sizes,
        }
    }

    async fn capture_frame(
        &self,
        media_id: i64,
        source: &Path,
        timestamp: f64,
        frame: &Path,
    ) -> Result<(), String> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            source.display().to_string(),
            "-ss".to_string(),
            format!("{timestamp:.3}"),
            "-vframes".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!("scale={FRAME_WIDTH}:-1"),
            "-f".to_string(),
            "image2".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            frame.display().to_string(),
        ];
        let output = self
            .invoker
            .invoke(ToolKind::Ffmpeg, &args)
            .await
            .map_err(|err| {
                error!(media_id, error = %err, "frame capture could not run");
                "frame capture could not run".to_string()
            })?;
        if !output.success() {
            error!(
                media_id,
                command = %output.command,
                output = %output.output,
                "frame capture failed"
            );
            return Err("frame capture failed".to_string());
        }
        let bytes = tokio::fs::read(frame).await.map_err(|err| {
            error!(media_id, error = %err, "captured frame missing");
            "captured frame missing".to_string()
        })?;
        validate_jpeg(&bytes).map_err(|reason| {
            error!(media_id, reason = %reason, "captured frame rejected");
            reason
        })
    }

    async fn resize(
        &self,
        media_id: i64,
        frame: &Path,
        output: &Path,
        size: ThumbnailSize,
    ) -> Vec<ResizeAttempt> {
        let mut attempts = Vec::new();
        for (tier, args) in convert_tiers(frame, output, size) {
            let attempt = match self.invoker.invoke(ToolKind::Convert, &args).await {
                Ok(result) => ResizeAttempt {
                    tier,
                    command: result.command.clone(),
                    success: result.success() && non_empty(output).await,
                    output: result.output,
                },
                Err(err) => ResizeAttempt {
                    tier,
                    command: display_command(self.invoker.program(ToolKind::Convert), &args),
                    success: false,
                    output: err.to_string(),
                },
            };
            log_attempt(media_id, size, &attempt);
            let success = attempt.success;
            attempts.push(attempt);
            if success {
                return attempts;
            }
            crate::engine::remove_if_exists(output).await;
        }

        let frame_path = frame.to_path_buf();
        let output_path = output.to_path_buf();
        let result = tokio::task::spawn_blocking(move || raster_resize(&frame_path, &output_path, size))
            .await
            .map_err(|err| err.to_string())
            .and_then(|inner| inner);
        let attempt = ResizeAttempt {
            tier: "raster",
            command: format!("image resize {}x{}", size.dimension(), size.dimension()),
            success: result.is_ok(),
            output: result.err().unwrap_or_default(),
        };
        log_attempt(media_id, size, &attempt);
        attempts.push(attempt);
        attempts
    }

    async fn store_size(
        &self,
        media_id: i64,
        output: &Path,
        size: ThumbnailSize,
        storage_id: &str,
    ) -> bool {
        let name = size.storage_name(storage_id);
        // Delete first so the stored file's mtime is that of this run.
        if let Err(err) = self.store.delete(&name).await {
            warn!(media_id, size = %size, error = %err, "unable to delete previous thumbnail");
        }
        match self.store.put(output, &name).await {
            Ok(()) => true,
            Err(err) => {
                error!(media_id, size = %size, error = %err, "unable to store thumbnail");
                false
            }
        }
    }
}

fn capture_position(duration: f64, percentage: Percentage) -> f64 {
    let position = percentage.of(duration);
    if position >= duration {
        (duration - 0.5).max(0.0)
    } else {
        position
    }
}

fn log_attempt(media_id: i64, size: ThumbnailSize, attempt: &ResizeAttempt) {
    if attempt.success {
        info!(
            media_id,
            size = %size,
            tier = attempt.tier,
            command = %attempt.command,
            "thumbnail resize succeeded"
        );
    } else {
        warn!(
            media_id,
            size = %size,
            tier = attempt.tier,
            command = %attempt.command,
            output = %attempt.output,
            "thumbnail resize attempt failed"
        );
    }
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false)
}

/// Size, `FF D8 FF` header and decodability of a captured frame.
pub fn validate_jpeg(bytes: &[u8]) -> Result<(), String> {
    if (bytes.len() as u64) < MIN_FRAME_BYTES {
        return Err(format!("frame too small ({} bytes)", bytes.len()));
    }
    if !bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Err("frame is not a jpeg".to_string());
    }
    image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .map(|_| ())
        .map_err(|err| format!("frame does not decode: {err}"))
}

fn convert_tiers(frame: &Path, output: &Path, size: ThumbnailSize) -> Vec<(&'static str, Vec<String>)> {
    let frame = frame.display().to_string();
    let output = output.display().to_string();
    let n = size.dimension();
    let fit = format!("{n}x{n}>");

    let primary = if size == ThumbnailSize::Square {
        let fill = format!("{n}x{n}^");
        let crop = format!("{n}x{n}+0+0");
        owned(&[
            frame.as_str(),
            "-auto-orient",
            "-background",
            "white",
            "+repage",
            "-resize",
            fill.as_str(),
            "-gravity",
            "center",
            "-crop",
            crop.as_str(),
            "+repage",
            output.as_str(),
        ])
    } else {
        owned(&[
            frame.as_str(),
            "-auto-orient",
            "-background",
            "white",
            "+repage",
            "-resize",
            fit.as_str(),
            output.as_str(),
        ])
    };
    let simplified = owned(&[frame.as_str(), "-resize", fit.as_str(), output.as_str()]);
    let forced_frame = format!("jpeg:{frame}");
    let forced_output = format!("jpeg:{output}");
    let forced = owned(&[
        forced_frame.as_str(),
        "-resize",
        fit.as_str(),
        forced_output.as_str(),
    ]);
    vec![
        ("primary", primary),
        ("simplified", simplified),
        ("forced_format", forced),
    ]
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn raster_resize(frame: &Path, output: &Path, size: ThumbnailSize) -> Result<(), String> {
    let image = image::open(frame).map_err(|err| err.to_string())?;
    let n = size.dimension();
    let resized = if size == ThumbnailSize::Square {
        image.resize_to_fill(n, n, FilterType::Lanczos3)
    } else {
        let (width, height) = image.dimensions();
        if width <= n && height <= n {
            image
        } else {
            image.resize(n, n, FilterType::Lanczos3)
        }
    };
    DynamicImage::ImageRgb8(resized.to_rgb8())
        .save_with_format(output, ImageFormat::Jpeg)
        .map_err(|err| err.to_string())
}
