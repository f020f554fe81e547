use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown derivative type: {0}")]
pub struct UnknownDerivativeType(pub String);

/// How a derivative file comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Built ahead of time by a batch job; never built on request.
    Static,
    /// Built synchronously within the request.
    Live,
    /// Built by a background job.
    Dynamic,
    /// Live when the estimated size is below the live threshold, otherwise dynamic.
    DynamicLive,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Static => "static",
            GenerationMode::Live => "live",
            GenerationMode::Dynamic => "dynamic",
            GenerationMode::DynamicLive => "dynamic_live",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where existence of a derivative is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeLevel {
    /// File system probe at `{dir}/{item_id}.{ext}`.
    Item,
    /// Structured attribute on the media record.
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivativeDescriptor {
    pub dir: &'static str,
    pub extension: &'static str,
    pub media_type: &'static str,
    pub mode: GenerationMode,
    pub level: DerivativeLevel,
    /// Approximate cost unit compared with `max_size_live` for `dynamic_live` types.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeType {
    Audio,
    Video,
    PdfMedia,
    Pdf,
    Pdf2Xml,
    Txt,
    Text,
    Zip,
    Zipm,
    Zipo,
}

impl DerivativeType {
    pub const ALL: [DerivativeType; 10] = [
        DerivativeType::Audio,
        DerivativeType::Video,
        DerivativeType::PdfMedia,
        DerivativeType::Pdf,
        DerivativeType::Pdf2Xml,
        DerivativeType::Txt,
        DerivativeType::Text,
        DerivativeType::Zip,
        DerivativeType::Zipm,
        DerivativeType::Zipo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivativeType::Audio => "audio",
            DerivativeType::Video => "video",
            DerivativeType::PdfMedia => "pdf_media",
            DerivativeType::Pdf => "pdf",
            DerivativeType::Pdf2Xml => "pdf2xml",
            DerivativeType::Txt => "txt",
            DerivativeType::Text => "text",
            DerivativeType::Zip => "zip",
            DerivativeType::Zipm => "zipm",
            DerivativeType::Zipo => "zipo",
        }
    }

    pub fn descriptor(&self) -> DerivativeDescriptor {
        use DerivativeLevel::{Item, Media};
        use GenerationMode::{Dynamic, DynamicLive, Static};
        let (dir, extension, media_type, mode, level, size) = match self {
            DerivativeType::Audio => ("", "", "audio", Static, Media, None),
            DerivativeType::Video => ("", "", "video", Static, Media, None),
            DerivativeType::PdfMedia => ("", "", "application/pdf", Static, Media, None),
            DerivativeType::Pdf => ("pdf", "pdf", "application/pdf", Dynamic, Item, None),
            DerivativeType::Pdf2Xml => (
                "pdf2xml",
                "xml",
                "application/vnd.pdf2xml+xml",
                DynamicLive,
                Item,
                Some(10),
            ),
            DerivativeType::Txt => ("txt", "txt", "text/plain", DynamicLive, Item, Some(1)),
            DerivativeType::Text => ("text", "txt", "text/plain", DynamicLive, Item, Some(1)),
            DerivativeType::Zip => ("zip", "zip", "application/zip", Dynamic, Item, None),
            DerivativeType::Zipm => ("zipm", "zip", "application/zip", Dynamic, Item, None),
            DerivativeType::Zipo => ("zipo", "zip", "application/zip", Dynamic, Item, None),
        };
        DerivativeDescriptor {
            dir,
            extension,
            media_type,
            mode,
            level,
            size,
        }
    }

    pub fn is_item_level(&self) -> bool {
        self.descriptor().level == DerivativeLevel::Item
    }

    pub fn item_types() -> impl Iterator<Item = DerivativeType> {
        Self::ALL.into_iter().filter(|kind| kind.is_item_level())
    }
}

impl fmt::Display for DerivativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DerivativeType {
    type Err = UnknownDerivativeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DerivativeType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownDerivativeType(s.to_string()))
    }
}

/// Primary type of a MIME string (`video` for `video/mp4`).
pub fn primary_type(media_type: &str) -> &str {
    media_type.split('/').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_round_trips_through_its_tag() {
        for kind in DerivativeType::ALL {
            assert_eq!(kind.as_str().parse::<DerivativeType>().unwrap(), kind);
        }
        assert!("alto".parse::<DerivativeType>().is_err());
    }

    #[test]
    fn only_dynamic_live_types_carry_a_size() {
        for kind in DerivativeType::ALL {
            let descriptor = kind.descriptor();
            assert_eq!(
                descriptor.size.is_some(),
                descriptor.mode == GenerationMode::DynamicLive,
                "{kind}"
            );
        }
    }

    #[test]
    fn item_types_exclude_media_level() {
        let tags: Vec<_> = DerivativeType::item_types().map(|k| k.as_str()).collect();
        assert_eq!(
            tags,
            vec!["pdf", "pdf2xml", "txt", "text", "zip", "zipm", "zipo"]
        );
    }

    #[test]
    fn primary_type_splits_on_slash() {
        assert_eq!(primary_type("video/mp4"), "video");
        assert_eq!(primary_type("application/pdf"), "application");
        assert_eq!(primary_type(""), "");
    }
}
