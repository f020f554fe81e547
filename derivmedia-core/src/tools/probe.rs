use std::path::Path;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::warn;

use super::{ToolError, ToolInvoker, ToolKind, ToolResult};

const SNIFF_LENGTH: usize = 64;

/// What ffprobe reports about a file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub duration: Option<f64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub format_name: Option<String>,
}

impl MediaProbe {
    fn media_type(&self) -> Option<String> {
        let format = self.format_name.as_deref().unwrap_or_default();
        let subtype = if format.contains("webm") {
            "webm"
        } else if format.contains("mp4") || format.contains("mov") {
            "mp4"
        } else if format.contains("ogg") {
            "ogg"
        } else if format.contains("avi") {
            "x-msvideo"
        } else if format.contains("mp3") {
            "mpeg"
        } else if format.contains("wav") {
            "x-wav"
        } else {
            "octet-stream"
        };
        if self.has_video {
            Some(format!("video/{subtype}"))
        } else if self.has_audio {
            Some(format!("audio/{subtype}"))
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

impl ToolInvoker {
    pub async fn probe(&self, path: &Path) -> ToolResult<MediaProbe> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            path.display().to_string(),
        ];
        let output = self.invoke(ToolKind::Ffprobe, &args).await?;
        if !output.success() {
            return Err(ToolError::Parse(format!(
                "ffprobe exited with {:?}",
                output.exit_code
            )));
        }
        let parsed: FfprobeOutput = serde_json::from_str(&output.output)
            .map_err(|err| ToolError::Parse(err.to_string()))?;
        let codec = |kind: &str| {
            parsed
                .streams
                .iter()
                .any(|stream| stream.codec_type.as_deref() == Some(kind))
        };
        Ok(MediaProbe {
            duration: parsed
                .format
                .duration
                .as_deref()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value > 0.0),
            has_video: codec("video"),
            has_audio: codec("audio"),
            format_name: parsed.format.format_name.clone(),
        })
    }

    /// Duration in seconds, or `None` when ffprobe cannot tell.
    pub async fn probe_duration(&self, path: &Path) -> Option<f64> {
        match self.probe(path).await {
            Ok(probe) => probe.duration,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unable to probe duration");
                None
            }
        }
    }

    /// Media type of a produced file: magic bytes first, ffprobe streams
    /// second, `application/octet-stream` when neither tells.
    pub async fn detect_media_type(&self, path: &Path) -> ToolResult<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|source| ToolError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        let mut head = vec![0u8; SNIFF_LENGTH];
        let mut filled = 0;
        while filled < head.len() {
            let read = file
                .read(&mut head[filled..])
                .await
                .map_err(|source| ToolError::Io {
                    source,
                    path: path.to_path_buf(),
                })?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        head.truncate(filled);
        if let Some(media_type) = sniff_media_type(&head) {
            return Ok(media_type.to_string());
        }
        match self.probe(path).await {
            Ok(probe) => Ok(probe
                .media_type()
                .unwrap_or_else(|| "application/octet-stream".to_string())),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ffprobe could not identify file");
                Ok("application/octet-stream".to_string())
            }
        }
    }
}

/// Identifies common formats from their leading bytes.
pub fn sniff_media_type(head: &[u8]) -> Option<&'static str> {
    let starts = |magic: &[u8]| head.starts_with(magic);
    if starts(b"%PDF") {
        Some("application/pdf")
    } else if starts(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if starts(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if starts(b"GIF8") {
        Some("image/gif")
    } else if starts(b"PK\x03\x04") {
        Some("application/zip")
    } else if starts(b"ID3") || (head.len() > 1 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0) {
        Some("audio/mpeg")
    } else if starts(b"OggS") {
        Some("audio/ogg")
    } else if starts(b"fLaC") {
        Some("audio/flac")
    } else if starts(b"RIFF") && head.len() >= 12 {
        match &head[8..12] {
            b"WAVE" => Some("audio/x-wav"),
            b"AVI " => Some("video/x-msvideo"),
            b"WEBP" => Some("image/webp"),
            _ => None,
        }
    } else if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        if head.windows(4).any(|window| window == b"webm") {
            Some("video/webm")
        } else {
            Some("video/x-matroska")
        }
    } else if head.len() >= 12 && &head[4..8] == b"ftyp" {
        match &head[8..12] {
            b"qt  " => Some("video/quicktime"),
            b"M4A " => Some("audio/mp4"),
            _ => Some("video/mp4"),
        }
    } else {
        None
    }
}
