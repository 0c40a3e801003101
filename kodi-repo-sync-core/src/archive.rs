//! Release archive handling: integrity check, descriptor lookup, extraction.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::descriptor::{self, AddonDescriptor};

pub const DESCRIPTOR_FILE: &str = "addon.xml";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a readable zip archive: {source}")]
    Corrupt {
        #[source]
        source: ZipError,
    },
    #[error("zip entry '{name}' is damaged: {source}")]
    DamagedEntry {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("no addon.xml for '{addon_id}' found in archive")]
    MissingDescriptor { addon_id: String },
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<ZipError> for ArchiveError {
    fn from(source: ZipError) -> Self {
        ArchiveError::Corrupt { source }
    }
}

fn open(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>, ArchiveError> {
    Ok(ZipArchive::new(Cursor::new(bytes))?)
}

fn is_descriptor_entry(name: &str) -> bool {
    name == DESCRIPTOR_FILE || name.ends_with("/addon.xml")
}

/// Verifies that `bytes` is an intact zip (every entry decompresses and
/// passes its CRC check) and returns the descriptor for `addon_id` found in it.
pub fn inspect(bytes: &[u8], addon_id: &str) -> Result<AddonDescriptor, ArchiveError> {
    let mut archive = open(bytes)?;
    let mut found = None;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/");
        if found.is_none() && is_descriptor_entry(&name) {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|source| ArchiveError::DamagedEntry {
                    name: name.clone(),
                    source,
                })?;
            match descriptor::parse(&text) {
                Ok(parsed) if parsed.id == addon_id => found = Some(parsed),
                Ok(parsed) => debug!(entry = %name, id = %parsed.id, "Skipping descriptor of another add-on"),
                Err(e) => warn!(entry = %name, error = %e, "Skipping unreadable addon.xml in archive"),
            }
        } else {
            io::copy(&mut entry, &mut io::sink())
                .map_err(|source| ArchiveError::DamagedEntry { name, source })?;
        }
    }
    found.ok_or_else(|| ArchiveError::MissingDescriptor {
        addon_id: addon_id.to_string(),
    })
}

/// Maps a zip entry name to a safe relative path under the mirror directory.
/// Most Kodi zips wrap their content in a top-level `<addon_id>/` folder,
/// which is dropped.
fn entry_path(name: &str, addon_id: &str) -> Option<PathBuf> {
    let normalised = name.replace('\\', "/");
    let mut parts: Vec<&str> = normalised.split('/').filter(|p| !p.is_empty()).collect();
    if parts
        .iter()
        .any(|p| *p == "." || *p == ".." || p.contains(':'))
    {
        return None;
    }
    if parts.first() == Some(&addon_id) {
        parts.remove(0);
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

/// Writes every file entry of the archive below `dest`. Returns the relative
/// paths written, in archive order.
pub fn extract(bytes: &[u8], addon_id: &str, dest: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut archive = open(bytes)?;
    let mut written = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry_path(entry.name(), addon_id) else {
            debug!(entry = entry.name(), "Skipping unsafe or empty zip entry");
            continue;
        };
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut out = File::create(&target).map_err(|source| ArchiveError::Io {
            path: target.clone(),
            source,
        })?;
        io::copy(&mut entry, &mut out).map_err(|source| ArchiveError::Io {
            path: target.clone(),
            source,
        })?;
        written.push(relative);
    }
    Ok(written)
}
