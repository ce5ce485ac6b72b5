//! Shared-directory catalog.
//!
//! A server exposes exactly one directory; its immediate regular-file
//! children are the catalog. Hidden entries and subdirectories are skipped.
//! Refreshing stats and hashes every file, so it only happens on demand when
//! answering a `Discover`, never on a hot path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::file::{prepare_file_for_transfer, FileMetadata};

/// The catalog of files shared from one directory.
#[derive(Debug)]
pub struct SharedCatalog {
    dir: PathBuf,
    files: Vec<FileMetadata>,
    paths: HashMap<Uuid, PathBuf>,
}

impl SharedCatalog {
    /// Create an empty catalog over `dir`. Call [`refresh`](Self::refresh)
    /// to populate it.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files: Vec::new(),
            paths: HashMap::new(),
        }
    }

    /// The shared directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-enumerate the shared directory.
    ///
    /// Walks only the immediate children, skipping hidden entries and
    /// anything that is not a regular file, and builds fresh metadata
    /// (including handles) for each file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if the shared directory is missing.
    pub async fn refresh(&mut self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(Error::FileNotFound(self.dir.display().to_string()));
        }

        let mut files = Vec::new();
        let mut paths = HashMap::new();

        let walker = walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker.into_iter().filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.'))
            {
                continue;
            }

            let path = entry.path().to_path_buf();
            let meta = prepare_file_for_transfer(&path).await?;
            paths.insert(meta.id, path);
            files.push(meta);
        }

        self.files = files;
        self.paths = paths;
        tracing::debug!(
            dir = %self.dir.display(),
            count = self.files.len(),
            "Refreshed shared catalog"
        );
        Ok(())
    }

    /// The current catalog entries.
    #[must_use]
    pub fn files(&self) -> &[FileMetadata] {
        &self.files
    }

    /// Sum of all catalog file sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Metadata and on-disk path for a handle, if it is in the catalog.
    #[must_use]
    pub fn lookup(&self, id: Uuid) -> Option<(&FileMetadata, &Path)> {
        let meta = self.files.iter().find(|f| f.id == id)?;
        let path = self.paths.get(&id)?;
        Some((meta, path.as_path()))
    }

    /// Find a catalog entry by file name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&FileMetadata> {
        self.files.iter().find(|f| f.path == name)
    }
}
