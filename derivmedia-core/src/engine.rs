//! Derivation of one media at a time: rule by rule, through a temp file,
//! into the file store, then into the media's attribute blob.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::derivative::DerivativeType;
use crate::lease::LeaseStore;
use crate::metadata::{file_digest, is_managed, DerivativeRecord};
use crate::paths::{sanitize_storage_id, temp_file_path, PathError, PathResolver, ResolvedPath};
use crate::resource::{MediaRecord, RepositoryError, ResourceRepository};
use crate::settings::DerivativeSettings;
use crate::store::FileStore;
use crate::tools::{tokenize, ToolInvoker, ToolKind};
use crate::validator::{ConverterRule, RuleFamily, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Run converters and store their output.
    Create,
    /// Only reconcile records with the files already on disk.
    VerifyOnly,
}

/// Cooperative stop request shared by a job and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
enum FamilyRules {
    Ready(RuleSet),
    Disabled,
    Unavailable(String),
}

/// State of one job: validated rules, tool checks and warn-once flags.
#[derive(Debug)]
pub struct JobContext {
    mode: EngineMode,
    families: HashMap<RuleFamily, FamilyRules>,
    cancel: CancellationFlag,
    warned: Mutex<HashSet<RuleFamily>>,
}

impl JobContext {
    /// Validates every family once. Invalid rules or a missing tool disable
    /// the family for the whole job.
    pub fn prepare(
        settings: &DerivativeSettings,
        invoker: &ToolInvoker,
        mode: EngineMode,
        cancel: CancellationFlag,
    ) -> Self {
        let mut families = HashMap::new();
        for family in RuleFamily::ALL {
            let state = if !settings.is_enabled(family_type(family)) {
                FamilyRules::Disabled
            } else {
                match RuleSet::from_entries(family, family.entries(&settings.converters)) {
                    Err(err) => {
                        error!(family = %family, error = %err, "converter rules rejected");
                        FamilyRules::Unavailable(err.to_string())
                    }
                    Ok(rules) => match (mode, invoker.check_available(family_tool(family))) {
                        (EngineMode::Create, Err(err)) => {
                            error!(family = %family, error = %err, "converter tool unavailable");
                            FamilyRules::Unavailable(err.to_string())
                        }
                        _ => FamilyRules::Ready(rules),
                    },
                }
            };
            families.insert(family, state);
        }
        Self {
            mode,
            families,
            cancel,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn rules(&self, family: RuleFamily) -> Option<&RuleSet> {
        match self.families.get(&family) {
            Some(FamilyRules::Ready(rules)) => Some(rules),
            _ => None,
        }
    }

    fn warn_once(&self, family: RuleFamily, reason: &str) {
        let first = self
            .warned
            .lock()
            .map(|mut warned| warned.insert(family))
            .unwrap_or(false);
        if first {
            warn!(family = %family, reason = %reason, "skipping media of unavailable family");
        }
    }
}

fn family_type(family: RuleFamily) -> DerivativeType {
    match family {
        RuleFamily::Audio => DerivativeType::Audio,
        RuleFamily::Video => DerivativeType::Video,
        RuleFamily::Pdf => DerivativeType::PdfMedia,
    }
}

fn family_tool(family: RuleFamily) -> ToolKind {
    match family {
        RuleFamily::Audio | RuleFamily::Video => ToolKind::Ffmpeg,
        RuleFamily::Pdf => ToolKind::Ghostscript,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    Unmanaged,
    FamilyDisabled,
    FamilyUnavailable,
    NoRules,
    MissingOriginal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum MediaOutcome {
    Succeeded,
    Failed,
    Skipped { reason: SkipReason },
    /// Another worker holds at least one of the outputs.
    InProgress,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RuleOutcome {
    Stored { filename: String, media_type: String },
    Removed,
    Unchanged,
    InProgress,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub folder: String,
    pub outcome: RuleOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaReport {
    pub media_id: i64,
    pub outcome: MediaOutcome,
    pub rules: Vec<RuleReport>,
}

impl MediaReport {
    fn skipped(media_id: i64, reason: SkipReason) -> Self {
        Self {
            media_id,
            outcome: MediaOutcome::Skipped { reason },
            rules: Vec::new(),
        }
    }
}

/// Failure of one rule; `abort` stops the remaining rules of the media.
struct RuleFailure {
    reason: String,
    abort: bool,
}

impl RuleFailure {
    fn soft(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            abort: false,
        }
    }

    fn hard(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            abort: true,
        }
    }
}

#[derive(Clone)]
pub struct DerivationEngine {
    repository: Arc<dyn ResourceRepository>,
    store: Arc<dyn FileStore>,
    invoker: ToolInvoker,
    resolver: PathResolver,
    leases: LeaseStore,
}

impl DerivationEngine {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        store: Arc<dyn FileStore>,
        invoker: ToolInvoker,
        resolver: PathResolver,
        leases: LeaseStore,
    ) -> Self {
        Self {
            repository,
            store,
            invoker,
            resolver,
            leases,
        }
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    pub async fn process_media(&self, ctx: &JobContext, media_id: i64) -> MediaReport {
        match self.repository.read_media(media_id) {
            Ok(media) => self.process_record(ctx, media).await,
            Err(RepositoryError::NotFound(_)) => {
                warn!(media_id, "media not found");
                MediaReport::skipped(media_id, SkipReason::NotFound)
            }
            Err(err) => {
                error!(media_id, error = %err, "unable to read media");
                MediaReport {
                    media_id,
                    outcome: MediaOutcome::Failed,
                    rules: Vec::new(),
                }
            }
        }
    }

    /// Every media of an item, in position order.
    pub async fn process_item(&self, ctx: &JobContext, item_id: i64) -> Vec<MediaReport> {
        let media = match self.repository.item_media(item_id) {
            Ok(media) => media,
            Err(err) => {
                error!(item_id, error = %err, "unable to list item media");
                return Vec::new();
            }
        };
        let mut reports = Vec::with_capacity(media.len());
        for record in media {
            if ctx.is_cancelled() {
                break;
            }
            reports.push(self.process_record(ctx, record).await);
        }
        reports
    }

    pub async fn process_record(&self, ctx: &JobContext, mut media: MediaRecord) -> MediaReport {
        let media_id = media.id;
        if !is_managed(&media) {
            info!(media_id, "media is not managed, skipping");
            return MediaReport::skipped(media_id, SkipReason::Unmanaged);
        }
        let Some(family) = media.media_type.as_deref().and_then(RuleFamily::for_media_type) else {
            return MediaReport::skipped(media_id, SkipReason::Unmanaged);
        };
        let rules = match ctx.families.get(&family) {
            Some(FamilyRules::Ready(rules)) if rules.is_empty() => {
                return MediaReport::skipped(media_id, SkipReason::NoRules)
            }
            Some(FamilyRules::Ready(rules)) => rules.clone(),
            Some(FamilyRules::Unavailable(reason)) => {
                ctx.warn_once(family, reason);
                return MediaReport::skipped(media_id, SkipReason::FamilyUnavailable);
            }
            Some(FamilyRules::Disabled) | None => {
                return MediaReport::skipped(media_id, SkipReason::FamilyDisabled)
            }
        };
        let storage_id = match media.storage_id.as_deref().map(sanitize_storage_id) {
            Some(Ok(storage_id)) => storage_id,
            _ => {
                warn!(media_id, "media has no usable storage id");
                return MediaReport::skipped(media_id, SkipReason::MissingOriginal);
            }
        };
        let source = self.resolver.original_path(&storage_id, &media.extension);
        if ctx.mode == EngineMode::Create && !is_readable_file(&source).await {
            warn!(media_id, path = %source.display(), "original file missing or unreadable");
            return MediaReport::skipped(media_id, SkipReason::MissingOriginal);
        }

        let mut reports = Vec::with_capacity(rules.rules.len());
        let mut stopped = false;
        for rule in &rules.rules {
            if ctx.is_cancelled() {
                stopped = true;
                break;
            }
            let folder = rule.folder().to_string();
            let result = match ctx.mode {
                EngineMode::Create => {
                    self.create_rule(&mut media, family, rule, &storage_id, &source)
                        .await
                }
                EngineMode::VerifyOnly => self.verify_rule(&mut media, family, rule, &storage_id).await,
            };
            match result {
                Ok(outcome) => reports.push(RuleReport { folder, outcome }),
                Err(failure) => {
                    error!(media_id, folder = %folder, reason = %failure.reason, "derivative failed");
                    reports.push(RuleReport {
                        folder,
                        outcome: RuleOutcome::Failed {
                            reason: failure.reason,
                        },
                    });
                    if failure.abort {
                        break;
                    }
                }
            }
        }

        let outcome = if reports
            .iter()
            .any(|report| matches!(report.outcome, RuleOutcome::Failed { .. }))
        {
            MediaOutcome::Failed
        } else if stopped {
            MediaOutcome::Stopped
        } else if reports
            .iter()
            .any(|report| report.outcome == RuleOutcome::InProgress)
        {
            MediaOutcome::InProgress
        } else {
            MediaOutcome::Succeeded
        };
        MediaReport {
            media_id,
            outcome,
            rules: reports,
        }
    }

    async fn create_rule(
        &self,
        media: &mut MediaRecord,
        family: RuleFamily,
        rule: &ConverterRule,
        storage_id: &str,
        source: &Path,
    ) -> Result<RuleOutcome, RuleFailure> {
        let resolved = self.resolve(rule, storage_id)?;
        let Some(guard) = self
            .leases
            .guard(media.id, &resolved.storage_name)
            .map_err(|err| RuleFailure::soft(format!("lease unavailable: {err}")))?
        else {
            info!(media_id = media.id, folder = %resolved.folder, "derivative already in progress");
            return Ok(RuleOutcome::InProgress);
        };
        let temp = temp_file_path(&resolved.absolute);
        // Without a live lease an existing temp file is a crash leftover.
        remove_if_exists(&temp).await;

        self.store
            .delete(&resolved.storage_name)
            .await
            .map_err(|err| RuleFailure::soft(err.to_string()))?;
        if media.data.remove(&resolved.folder) {
            self.save(media)?;
        }

        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                RuleFailure::soft(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let result = self
            .convert(media.id, family, rule, source, &temp, &resolved)
            .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                remove_if_exists(&temp).await;
                return Err(failure);
            }
        };
        let (record, outcome) = outcome;
        media.data.upsert(&resolved.folder, record);
        if let Err(failure) = self.save(media) {
            // The stored file must not outlive a record that was never written.
            media.data.remove(&resolved.folder);
            if let Err(err) = self.store.delete(&resolved.storage_name).await {
                error!(media_id = media.id, folder = %resolved.folder, error = %err, "unable to remove unrecorded derivative");
            }
            return Err(failure);
        }
        if let Err(err) = guard.release() {
            warn!(media_id = media.id, error = %err, "failed to release derivative lease");
        }
        Ok(outcome)
    }

    async fn convert(
        &self,
        media_id: i64,
        family: RuleFamily,
        rule: &ConverterRule,
        source: &Path,
        temp: &Path,
        resolved: &ResolvedPath,
    ) -> Result<(DerivativeRecord, RuleOutcome), RuleFailure> {
        let (tool, args) = converter_args(family, rule, source, temp);
        let output = self
            .invoker
            .invoke(tool, &args)
            .await
            .map_err(|err| RuleFailure::soft(err.to_string()))?;
        if !output.success() {
            error!(
                media_id,
                command = %output.command,
                output = %output.output,
                exit_code = ?output.exit_code,
                "converter exited with failure"
            );
            return Err(RuleFailure::soft(format!(
                "converter exited with {:?}",
                output.exit_code
            )));
        }
        let size = tokio::fs::metadata(temp)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size == 0 {
            error!(media_id, command = %output.command, output = %output.output, "converter produced no output");
            return Err(RuleFailure::soft("converter produced an empty file"));
        }
        let media_type = self
            .invoker
            .detect_media_type(temp)
            .await
            .map_err(|err| RuleFailure::soft(err.to_string()))?;
        if !family.accepts_output(&media_type) {
            error!(
                media_id,
                command = %output.command,
                media_type = %media_type,
                "converter produced an unexpected media type"
            );
            return Err(RuleFailure::hard(format!(
                "unexpected output type {media_type} for {family} converter"
            )));
        }
        let digest = file_digest(temp)
            .await
            .map_err(|err| RuleFailure::soft(err.to_string()))?;
        self.store
            .put(temp, &resolved.storage_name)
            .await
            .map_err(|err| RuleFailure::soft(err.to_string()))?;
        info!(media_id, folder = %resolved.folder, filename = %resolved.basename, "derivative stored");
        let record = DerivativeRecord::new(&resolved.basename, &media_type).with_digest(digest);
        Ok((
            record,
            RuleOutcome::Stored {
                filename: resolved.basename.clone(),
                media_type,
            },
        ))
    }

    async fn verify_rule(
        &self,
        media: &mut MediaRecord,
        family: RuleFamily,
        rule: &ConverterRule,
        storage_id: &str,
    ) -> Result<RuleOutcome, RuleFailure> {
        let resolved = self.resolve(rule, storage_id)?;
        let present = self.store.exists(&resolved.storage_name).await
            && is_readable_file(&resolved.absolute).await;
        let media_type = if present {
            self.invoker
                .detect_media_type(&resolved.absolute)
                .await
                .ok()
                .filter(|media_type| family.accepts_output(media_type))
        } else {
            None
        };
        let Some(media_type) = media_type else {
            if media.data.remove(&resolved.folder) {
                info!(media_id = media.id, folder = %resolved.folder, "removed record of missing derivative");
                self.save(media)?;
                return Ok(RuleOutcome::Removed);
            }
            return Ok(RuleOutcome::Unchanged);
        };
        let digest = file_digest(&resolved.absolute)
            .await
            .map_err(|err| RuleFailure::soft(err.to_string()))?;
        let record = DerivativeRecord::new(&resolved.basename, &media_type).with_digest(digest);
        if media.data.upsert(&resolved.folder, record) {
            self.save(media)?;
            Ok(RuleOutcome::Stored {
                filename: resolved.basename,
                media_type,
            })
        } else {
            Ok(RuleOutcome::Unchanged)
        }
    }

    fn resolve(&self, rule: &ConverterRule, storage_id: &str) -> Result<ResolvedPath, RuleFailure> {
        self.resolver.resolve(rule, storage_id).map_err(|err| match err {
            PathError::OriginalFolder | PathError::Escape(_) => RuleFailure::hard(err.to_string()),
            other => RuleFailure::soft(other.to_string()),
        })
    }

    fn save(&self, media: &MediaRecord) -> Result<(), RuleFailure> {
        self.repository
            .save_media_data(media.id, &media.data)
            .map_err(|err| RuleFailure::soft(format!("cannot save media metadata: {err}")))
    }
}

/// Tool and argument array for one converter rule.
pub fn converter_args(
    family: RuleFamily,
    rule: &ConverterRule,
    source: &Path,
    output: &Path,
) -> (ToolKind, Vec<String>) {
    let source = source.display().to_string();
    let output = output.display().to_string();
    let tokens = tokenize(rule.command());
    match family {
        RuleFamily::Audio | RuleFamily::Video => {
            let mut args = vec!["-i".to_string(), source];
            args.extend(tokens);
            args.push(output);
            (ToolKind::Ffmpeg, args)
        }
        RuleFamily::Pdf => {
            let mut args = vec![
                "-sDEVICE=pdfwrite".to_string(),
                "-dNOPAUSE".to_string(),
                "-dQUIET".to_string(),
                "-dBATCH".to_string(),
            ];
            args.extend(tokens);
            args.push("-o".to_string());
            args.push(output);
            args.push(source);
            (ToolKind::Ghostscript, args)
        }
    }
}

pub(crate) async fn is_readable_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => tokio::fs::File::open(path).await.is_ok(),
        _ => false,
    }
}

pub(crate) async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_arguments_wrap_the_template() {
        let rule = ConverterRule::new("mp3/{filename}.mp3", "-c copy -qscale:a 2").unwrap();
        let (tool, args) = converter_args(
            RuleFamily::Audio,
            &rule,
            Path::new("/s/original/a.wav"),
            Path::new("/s/mp3/a.tmp.mp3"),
        );
        assert_eq!(tool, ToolKind::Ffmpeg);
        assert_eq!(
            args,
            vec!["-i", "/s/original/a.wav", "-c", "copy", "-qscale:a", "2", "/s/mp3/a.tmp.mp3"]
        );
    }

    #[test]
    fn ghostscript_arguments_end_with_source() {
        let rule = ConverterRule::new("pdfs/{filename}.pdf", "-dPDFSETTINGS=/screen").unwrap();
        let (tool, args) = converter_args(
            RuleFamily::Pdf,
            &rule,
            Path::new("/s/original/a.pdf"),
            Path::new("/s/pdfs/a.tmp.pdf"),
        );
        assert_eq!(tool, ToolKind::Ghostscript);
        assert_eq!(args.first().map(String::as_str), Some("-sDEVICE=pdfwrite"));
        assert_eq!(
            &args[args.len() - 3..],
            &["-o".to_string(), "/s/pdfs/a.tmp.pdf".to_string(), "/s/original/a.pdf".to_string()]
        );
    }

    #[test]
    fn cancellation_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
