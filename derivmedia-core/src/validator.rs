//! Static vetting of admin-configured converter rules.
//!
//! This is a deny-list, not a sandbox. Converter commands are trusted admin
//! input; the checks only catch shell metacharacters and path escapes before
//! anything is executed. Commands are later tokenized and passed as an
//! argument array, never through a shell.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::{ConverterEntry, ConvertersSection};
use crate::derivative::primary_type;

const FORBIDDEN_COMMAND_TOKENS: [&str; 11] =
    ["sudo", "$", "<", ">", ";", "&", "|", "%", "\"", "\\", ".."];

const FILENAME_MARKER: &str = "/{filename}.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("converter command for {pattern} is empty")]
    EmptyCommand { pattern: String },
    #[error("converter command \"{command}\" contains forbidden token {token:?}")]
    ForbiddenCommand { command: String, token: &'static str },
    #[error("converter pattern \"{pattern}\" does not create a real path: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Media family a converter rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFamily {
    Audio,
    Video,
    Pdf,
}

impl RuleFamily {
    pub const ALL: [RuleFamily; 3] = [RuleFamily::Audio, RuleFamily::Video, RuleFamily::Pdf];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleFamily::Audio => "audio",
            RuleFamily::Video => "video",
            RuleFamily::Pdf => "pdf",
        }
    }

    /// Family of a source media type, if any converter family handles it.
    pub fn for_media_type(media_type: &str) -> Option<Self> {
        match primary_type(media_type) {
            "audio" => Some(RuleFamily::Audio),
            "video" => Some(RuleFamily::Video),
            _ if media_type == "application/pdf" => Some(RuleFamily::Pdf),
            _ => None,
        }
    }

    /// Whether a produced file's media type is acceptable for this family.
    pub fn accepts_output(&self, media_type: &str) -> bool {
        match self {
            RuleFamily::Audio | RuleFamily::Video => {
                matches!(primary_type(media_type), "audio" | "video")
            }
            RuleFamily::Pdf => media_type == "application/pdf",
        }
    }

    pub fn entries<'a>(&self, converters: &'a ConvertersSection) -> &'a [ConverterEntry] {
        match self {
            RuleFamily::Audio => &converters.audio,
            RuleFamily::Video => &converters.video,
            RuleFamily::Pdf => &converters.pdf,
        }
    }
}

impl fmt::Display for RuleFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated converter rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConverterRule {
    pattern: String,
    command: String,
}

impl ConverterRule {
    pub fn new(pattern: &str, command: &str) -> ValidationResult<Self> {
        let pattern = pattern.trim();
        let command = command.trim();
        validate(pattern, command)?;
        Ok(Self {
            pattern: pattern.to_string(),
            command: command.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Output folder, i.e. everything before `/{filename}.`.
    pub fn folder(&self) -> &str {
        match self.pattern.find(FILENAME_MARKER) {
            Some(index) => &self.pattern[..index],
            None => &self.pattern,
        }
    }

    /// Stored file name with `{filename}` replaced by the storage id.
    pub fn basename(&self, storage_id: &str) -> String {
        let rest = match self.pattern.find(FILENAME_MARKER) {
            Some(index) => &self.pattern[index + 1..],
            None => "",
        };
        rest.replace("{filename}", storage_id)
    }

    /// Storage-relative path `folder/basename`.
    pub fn storage_name(&self, storage_id: &str) -> String {
        format!("{}/{}", self.folder(), self.basename(storage_id))
    }
}

pub fn validate(pattern: &str, command: &str) -> ValidationResult<()> {
    let pattern = pattern.trim();
    let command = command.trim();
    if command.is_empty() {
        return Err(ValidationError::EmptyCommand {
            pattern: pattern.to_string(),
        });
    }
    if let Some(token) = FORBIDDEN_COMMAND_TOKENS
        .iter()
        .find(|token| command.contains(*token))
    {
        return Err(ValidationError::ForbiddenCommand {
            command: command.to_string(),
            token,
        });
    }
    let reason = if pattern.is_empty() {
        Some("empty pattern")
    } else if !pattern.contains(FILENAME_MARKER) {
        Some("missing /{filename}.")
    } else if pattern.starts_with('/') {
        Some("absolute pattern")
    } else if pattern.contains("..") {
        Some("parent directory reference")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Drops commented (`#` prefix) or empty entries.
pub fn active_entries(entries: &[ConverterEntry]) -> Vec<&ConverterEntry> {
    entries
        .iter()
        .filter(|entry| {
            let pattern = entry.pattern.trim();
            !pattern.is_empty() && !pattern.starts_with('#') && !entry.command.trim().is_empty()
        })
        .collect()
}

/// The validated rules of one family. A single invalid rule rejects the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    pub family: RuleFamily,
    pub rules: Vec<ConverterRule>,
}

impl RuleSet {
    pub fn from_entries(family: RuleFamily, entries: &[ConverterEntry]) -> ValidationResult<Self> {
        let rules = active_entries(entries)
            .into_iter()
            .map(|entry| ConverterRule::new(&entry.pattern, &entry.command))
            .collect::<ValidationResult<Vec<_>>>()?;
        Ok(Self { family, rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_commands_are_accepted() {
        let defaults = [
            ("mp3/{filename}.mp3", "-c copy -c:a libmp3lame -qscale:a 2"),
            ("ogg/{filename}.ogg", "-c copy -vn -c:a libopus"),
            (
                "mp4/{filename}.mp4",
                "-c copy -c:v libx264 -movflags +faststart -filter:v crop='floor(in_w/2)*2:floor(in_h/2)*2' -crf 22",
            ),
            ("pdfs/{filename}.pdf", "-dCompatibilityLevel=1.7 -dPDFSETTINGS=/screen"),
        ];
        for (pattern, command) in defaults {
            assert_eq!(validate(pattern, command), Ok(()), "{command}");
        }
    }

    #[test]
    fn metacharacters_are_rejected() {
        for bad in ["$", ";", "|", "&", ">", "<", "\"", "\\", "..", "%", "sudo"] {
            let command = format!("-c copy {bad} -vn");
            assert!(
                matches!(
                    validate("mp3/{filename}.mp3", &command),
                    Err(ValidationError::ForbiddenCommand { .. })
                ),
                "{bad}"
            );
        }
        assert!(matches!(
            validate("mp3/{filename}.mp3", "   "),
            Err(ValidationError::EmptyCommand { .. })
        ));
    }

    #[test]
    fn patterns_must_stay_relative() {
        let command = "-c copy";
        for pattern in ["", "mp3/file.mp3", "/mp3/{filename}.mp3", "../mp3/{filename}.mp3"] {
            assert!(
                matches!(
                    validate(pattern, command),
                    Err(ValidationError::InvalidPattern { .. })
                ),
                "{pattern}"
            );
        }
    }

    #[test]
    fn rule_splits_folder_and_basename() {
        let rule = ConverterRule::new("audio/mp3/{filename}.mp3", "-vn").unwrap();
        assert_eq!(rule.folder(), "audio/mp3");
        assert_eq!(rule.basename("abc123"), "abc123.mp3");
        assert_eq!(rule.storage_name("abc123"), "audio/mp3/abc123.mp3");
    }

    #[test]
    fn commented_entries_are_ignored_and_one_bad_rule_rejects_the_family() {
        let entries = vec![
            ConverterEntry::new("# mp3/{filename}.mp3", "-c copy"),
            ConverterEntry::new("ogg/{filename}.ogg", ""),
            ConverterEntry::new("mp3/{filename}.mp3", "-c copy"),
        ];
        let set = RuleSet::from_entries(RuleFamily::Audio, &entries).unwrap();
        assert_eq!(set.rules.len(), 1);

        let mut broken = entries.clone();
        broken.push(ConverterEntry::new("wav/{filename}.wav", "-vn; rm -rf"));
        assert!(RuleSet::from_entries(RuleFamily::Audio, &broken).is_err());
    }

    #[test]
    fn family_follows_media_type() {
        assert_eq!(RuleFamily::for_media_type("audio/x-wav"), Some(RuleFamily::Audio));
        assert_eq!(RuleFamily::for_media_type("video/mp4"), Some(RuleFamily::Video));
        assert_eq!(RuleFamily::for_media_type("application/pdf"), Some(RuleFamily::Pdf));
        assert_eq!(RuleFamily::for_media_type("image/png"), None);
        assert!(RuleFamily::Audio.accepts_output("video/webm"));
        assert!(!RuleFamily::Pdf.accepts_output("application/x-pdf"));
    }
}
