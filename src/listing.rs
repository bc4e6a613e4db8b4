//! One-level directory enumeration

use crate::error::GatewayError;
use crate::resolver::{ResolvedTarget, TargetKind};
use std::path::Path;
use tracing::debug;

/// A single child of a listed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub is_directory: bool,
}

/// Children of one directory, in enumeration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryListing {
    /// Browse path relative to the content root, empty or ending in `/`
    pub current_relative_path: String,
    pub entries: Vec<ListingEntry>,
}

impl DirectoryListing {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

/// List the immediate children of a resolved directory.
///
/// A target that vanished before this call is a server-side fault, as the
/// dispatcher only lists paths it has just seen.
pub async fn list_directory(
    target: &ResolvedTarget,
    current_relative_path: &str,
) -> Result<DirectoryListing, GatewayError> {
    if target.kind == TargetKind::Missing {
        return Err(GatewayError::DirectoryVanished(target.path.clone()));
    }

    let entries = read_entries(&target.path).await?;
    debug!(path = %target.path.display(), count = entries.len(), "Directory enumerated");

    Ok(DirectoryListing {
        current_relative_path: current_relative_path.to_string(),
        entries,
    })
}

async fn read_entries(dir: &Path) -> Result<Vec<ListingEntry>, GatewayError> {
    let enumeration_error = |source| GatewayError::Enumeration {
        path: dir.to_path_buf(),
        source,
    };

    let mut reader = tokio::fs::read_dir(dir).await.map_err(enumeration_error)?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await.map_err(enumeration_error)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        // metadata() follows symlinks, file_type() would not
        let is_directory = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        entries.push(ListingEntry { name, is_directory });
    }

    Ok(entries)
}

/// True if the top level of `dir` holds at least one `.php` file
pub async fn contains_php_file(dir: &Path) -> std::io::Result<bool> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        if crate::resolver::has_php_extension(&entry.path()) {
            return Ok(true);
        }
    }
    Ok(false)
}
