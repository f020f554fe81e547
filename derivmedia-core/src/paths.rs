use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::derivative::DerivativeType;
use crate::validator::ConverterRule;

/// Folder holding the uploaded source files.
pub const ORIGINAL_FOLDER: &str = "original";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("derivative path {0} escapes the storage root")]
    Escape(String),
    #[error("derivative folder cannot be the original files folder")]
    OriginalFolder,
    #[error("storage id is empty after sanitizing")]
    EmptyStorageId,
    #[error("failed to inspect {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type PathResult<T> = Result<T, PathError>;

/// Output location of one converter rule for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub folder: String,
    pub basename: String,
    /// `folder/basename`, relative to the storage root.
    pub storage_name: String,
    pub absolute: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rule: &ConverterRule, storage_id: &str) -> PathResult<ResolvedPath> {
        let folder = rule.folder().trim_matches('/').to_string();
        if folder == ORIGINAL_FOLDER {
            return Err(PathError::OriginalFolder);
        }
        let basename = rule.basename(storage_id);
        let storage_name = format!("{folder}/{basename}");
        let absolute = self.resolve_relative(&storage_name)?;
        Ok(ResolvedPath {
            folder,
            basename,
            storage_name,
            absolute,
        })
    }

    /// Joins a storage-relative name to the root, refusing anything that
    /// would land outside of it once symlinks are followed.
    pub fn resolve_relative(&self, relative: &str) -> PathResult<PathBuf> {
        let relative_path = Path::new(relative);
        let lexically_clean = relative_path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if relative.is_empty() || !lexically_clean {
            return Err(PathError::Escape(relative.to_string()));
        }
        let candidate = self.root.join(relative_path);
        let root = canonical_root(&self.root)?;
        let anchor = nearest_existing_ancestor(&candidate);
        let anchor = anchor.canonicalize().map_err(|source| PathError::Io {
            source,
            path: anchor.clone(),
        })?;
        if !anchor.starts_with(&root) {
            return Err(PathError::Escape(relative.to_string()));
        }
        Ok(candidate)
    }

    pub fn original_path(&self, storage_id: &str, extension: &str) -> PathBuf {
        self.root
            .join(ORIGINAL_FOLDER)
            .join(file_name(storage_id, extension))
    }

    /// `{root}/{dir}/{item_id}.{ext}` for item-level derivatives.
    pub fn item_path(&self, kind: DerivativeType, item_id: i64) -> PathBuf {
        let descriptor = kind.descriptor();
        self.root
            .join(descriptor.dir)
            .join(file_name(&item_id.to_string(), descriptor.extension))
    }
}

fn file_name(stem: &str, extension: &str) -> String {
    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{extension}")
    }
}

fn canonical_root(root: &Path) -> PathResult<PathBuf> {
    root.canonicalize().map_err(|source| PathError::Io {
        source,
        path: root.to_path_buf(),
    })
}

fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return current.to_path_buf(),
        }
    }
}

/// Temp sibling of a derivative path: `x.mp3` becomes `x.tmp.mp3`.
///
/// The extension is kept because convert and ffmpeg pick the output format
/// from it. The file doubles as the in-progress marker of the derivative.
pub fn temp_file_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.tmp.{}", ext.to_string_lossy()),
        None => format!("{stem}.tmp"),
    };
    path.with_file_name(name)
}

/// Whether a file name follows the temp marker convention.
pub fn is_temp_file_name(name: &str) -> bool {
    name.ends_with(".tmp") || name.contains(".tmp.")
}

/// Keeps word characters, dash, dot and slash.
pub fn sanitize_storage_id(storage_id: &str) -> PathResult<String> {
    let cleaned: String = storage_id
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
        .collect();
    if cleaned.is_empty() {
        Err(PathError::EmptyStorageId)
    } else {
        Ok(cleaned)
    }
}
