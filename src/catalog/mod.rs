//! Image catalog
//!
//! Scans a directory tree for packaged image definitions (Dockerfiles named
//! `<tag>.<extension>`), packs each definition's directory into a flat tar
//! archive next to it and indexes the result by tag.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Extension appended to a definition path to form its archive path
pub const ARCHIVE_EXTENSION: &str = "tar";

/// Permission bits recorded for every archive entry
const ENTRY_MODE: u32 = 0o755;

/// Catalog scan failures
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write archive {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A packaged image definition ready for a local build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Flat tar archive submitted as the build context
    pub archive_path: PathBuf,
    /// The definition file itself
    pub source_path: PathBuf,
    /// File name of the definition, used as the build root inside the archive
    pub definition_name: String,
    /// Tag the built image is published under
    pub tag: String,
}

/// Tag-indexed set of locally buildable images
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    extension: String,
    images: HashMap<String, ImageDescriptor>,
}

impl ImageCatalog {
    /// Create an empty catalog matching files with the given extension
    /// (with or without the leading dot)
    pub fn new(extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            images: HashMap::new(),
        }
    }

    /// Walk `root` and record every definition found beneath it.
    ///
    /// The first walk or archive error aborts the scan; entries recorded
    /// before the failure stay in the catalog.
    pub fn scan(&mut self, root: &Path) -> Result<(), CatalogError> {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|source| CatalogError::Walk {
                path: root.to_path_buf(),
                source,
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(tag) = self.tag_for(path) else {
                continue;
            };

            let archive_path = archive_path_for(path);
            build_archive(path, &archive_path)?;

            let definition_name = entry.file_name().to_string_lossy().to_string();
            debug!(tag = %tag, archive = %archive_path.display(), "Packaged image definition");

            self.images.insert(
                tag.clone(),
                ImageDescriptor {
                    archive_path,
                    source_path: path.to_path_buf(),
                    definition_name,
                    tag,
                },
            );
        }

        info!(root = %root.display(), images = self.images.len(), "Image catalog scanned");
        Ok(())
    }

    /// Find the descriptor published under `tag`
    pub fn lookup(&self, tag: &str) -> Option<&ImageDescriptor> {
        self.images.get(tag)
    }

    /// Sorted list of known tags
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.images.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn tag_for(&self, path: &Path) -> Option<String> {
        let extension = path.extension()?.to_str()?;
        if extension != self.extension {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        if stem.is_empty() {
            return None;
        }
        Some(stem.to_string())
    }
}

fn archive_path_for(definition: &Path) -> PathBuf {
    let mut name = definition.as_os_str().to_os_string();
    name.push(".");
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

/// Pack every regular file in the definition's directory tree into a flat
/// tar archive at `archive`.
///
/// Entry names are relative to the definition's directory. Archives produced
/// by earlier scans are never packed.
pub fn build_archive(definition: &Path, archive: &Path) -> Result<(), CatalogError> {
    let root = definition
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let file = File::create(archive).map_err(|source| CatalogError::Write {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|source| CatalogError::Walk {
            path: root.to_path_buf(),
            source,
        })?;

        if !entry.file_type().is_file() || is_archive(entry.path()) {
            continue;
        }

        let path = entry.path();
        let name = path.strip_prefix(root).unwrap_or(path);
        let contents = std::fs::read(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        // append_data sets the path and checksum, emitting a GNU long-name
        // record when the name does not fit the header
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(ENTRY_MODE);
        builder
            .append_data(&mut header, name, contents.as_slice())
            .map_err(|source| CatalogError::Write {
                path: archive.to_path_buf(),
                source,
            })?;
    }

    builder
        .into_inner()
        .and_then(|mut writer| std::io::Write::flush(&mut writer))
        .map_err(|source| CatalogError::Write {
            path: archive.to_path_buf(),
            source,
        })
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == ARCHIVE_EXTENSION)
        .unwrap_or(false)
}
