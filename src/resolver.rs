//! Maps request paths onto the content root

use crate::error::GatewayError;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Prefix of the explicit file-serving endpoint
pub const FILES_PREFIX: &str = "/files/";

/// What a resolved path points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Directory,
    RegularFile,
    Missing,
}

/// A request path mapped onto the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Absolute path inside the content root
    pub path: PathBuf,
    /// Path relative to the content root, using `/` separators
    pub relative: String,
    pub kind: TargetKind,
}

impl ResolvedTarget {
    pub fn is_directory(&self) -> bool {
        self.kind == TargetKind::Directory
    }

    pub fn exists(&self) -> bool {
        self.kind != TargetKind::Missing
    }

    /// True for regular files with a `.php` extension
    pub fn is_php(&self) -> bool {
        self.kind == TargetKind::RegularFile && has_php_extension(&self.path)
    }
}

pub fn has_php_extension(path: &Path) -> bool {
    path.extension().map(|ext| ext == "php").unwrap_or(false)
}

/// Strip `/files/` from a request path. Returns `None` for other paths.
pub fn strip_files_prefix(path: &str) -> Option<&str> {
    path.strip_prefix(FILES_PREFIX)
}

/// Strip the leading `/` of a browse path
pub fn strip_listing_prefix(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Build a path below `root` from an untrusted relative path.
///
/// The relative path is percent-decoded first; `..`, absolute components and
/// NUL bytes are rejected.
pub fn join_within(root: &Path, relative: &str) -> Result<PathBuf, GatewayError> {
    let decoded: Cow<'_, str> = urlencoding::decode(relative)
        .map_err(|_| GatewayError::PathTraversal(relative.to_string()))?;

    if decoded.contains('\0') {
        warn!(path = %relative, "Path contains a NUL byte");
        return Err(GatewayError::PathTraversal(relative.to_string()));
    }

    let mut result = root.to_path_buf();
    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(name) => result.push(name),
            Component::CurDir => continue,
            Component::ParentDir => {
                warn!(path = %relative, "Path traversal attempt: parent directory reference");
                return Err(GatewayError::PathTraversal(relative.to_string()));
            }
            Component::RootDir | Component::Prefix(_) => {
                // A leading slash survives prefix stripping on `//x`
                if result == root {
                    continue;
                }
                warn!(path = %relative, "Absolute path component in request path");
                return Err(GatewayError::PathTraversal(relative.to_string()));
            }
        }
    }

    Ok(result)
}

/// Resolve `relative` against `root` and stat it.
///
/// `root` must already be canonical. Existing targets are canonicalized and
/// must stay inside the root, so symlinks cannot point outside it.
pub async fn resolve(root: &Path, relative: &str) -> Result<ResolvedTarget, GatewayError> {
    let joined = join_within(root, relative)?;
    let relative = joined
        .strip_prefix(root)
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();

    classify(root, joined, relative).await
}

/// Resolve a named child of an already resolved directory.
///
/// `name` is a literal file name and is not percent-decoded.
pub async fn resolve_child(
    root: &Path,
    parent: &ResolvedTarget,
    name: &str,
) -> Result<ResolvedTarget, GatewayError> {
    let relative = if parent.relative.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.relative, name)
    };
    classify(root, parent.path.join(name), relative).await
}

async fn classify(
    root: &Path,
    joined: PathBuf,
    relative: String,
) -> Result<ResolvedTarget, GatewayError> {
    let metadata = match tokio::fs::metadata(&joined).await {
        Ok(metadata) => metadata,
        Err(_) => {
            return Ok(ResolvedTarget {
                path: joined,
                relative,
                kind: TargetKind::Missing,
            })
        }
    };

    let canonical = tokio::fs::canonicalize(&joined)
        .await
        .map_err(|source| GatewayError::Io {
            path: joined.clone(),
            source,
        })?;
    if !canonical.starts_with(root) {
        warn!(
            path = %joined.display(),
            resolved = %canonical.display(),
            "Symlink escapes the content root"
        );
        return Err(GatewayError::PathTraversal(relative));
    }

    let kind = if metadata.is_dir() {
        TargetKind::Directory
    } else {
        TargetKind::RegularFile
    };

    Ok(ResolvedTarget {
        path: joined,
        relative,
        kind,
    })
}
