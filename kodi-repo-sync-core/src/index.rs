//! The merged repository index (`addons.xml`) and its checksum file.
//!
//! The index is regenerated from disk on every run: each non-hidden folder of
//! the repository directory that contains an `addon.xml` contributes exactly
//! one entry, in folder-name order, so the output only changes when a folder
//! changes. Writes go through a temporary file in the same directory followed
//! by a rename; nothing is written when the content on disk already matches.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use thiserror::Error;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::archive::DESCRIPTOR_FILE;
use crate::descriptor::{self, AddonDescriptor, DescriptorError};

pub const INDEX_FILE: &str = "addons.xml";
pub const CHECKSUM_FILE: &str = "addons.xml.md5";
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("cannot list repository directory {path}: {source}")]
    RepoDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid add-on descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },
    #[error("addon '{addon_id}' is provided by both {first} and {second}")]
    DuplicateAddon {
        addon_id: String,
        first: String,
        second: String,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch: addons.xml.md5 has '{recorded}', addons.xml hashes to '{actual}'")]
    ChecksumMismatch { recorded: String, actual: String },
}

/// One indexed add-on folder.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub folder: String,
    pub descriptor: AddonDescriptor,
}

/// A rendered index, not yet written.
#[derive(Debug, Clone)]
pub struct RepositoryIndex {
    pub entries: Vec<IndexEntry>,
    pub xml: String,
    pub md5: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub addons: usize,
    pub md5: String,
    /// Whether either file was (re)written.
    pub changed: bool,
}

/// Lowercase hex MD5 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Concatenates descriptor bodies into an `addons.xml` document.
pub fn render<'a>(bodies: impl IntoIterator<Item = &'a str>) -> String {
    let mut xml = String::new();
    xml.push_str(XML_DECLARATION);
    xml.push_str("\n<addons>\n");
    for body in bodies {
        xml.push_str(descriptor::strip_declaration(body));
        xml.push('\n');
    }
    xml.push_str("</addons>\n");
    xml
}

fn addon_folders(repo_dir: &Path) -> Result<Vec<(String, PathBuf)>, IndexError> {
    let repo_err = |source| IndexError::RepoDir {
        path: repo_dir.to_path_buf(),
        source,
    };
    let mut folders = Vec::new();
    for entry in fs::read_dir(repo_dir).map_err(repo_err)? {
        let entry = entry.map_err(repo_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if name.starts_with('.') || !path.is_dir() {
            continue;
        }
        let descriptor = path.join(DESCRIPTOR_FILE);
        if descriptor.is_file() {
            folders.push((name, descriptor));
        } else {
            debug!(folder = %name, "Skipping folder without addon.xml");
        }
    }
    folders.sort();
    Ok(folders)
}

/// Reads every add-on folder and renders the index. Fails on the first
/// unreadable or invalid descriptor and on duplicate add-on ids.
pub fn build(repo_dir: &Path) -> Result<RepositoryIndex, IndexError> {
    let mut entries = Vec::new();
    let mut bodies = Vec::new();
    let mut owners: HashMap<String, String> = HashMap::new();

    for (folder, path) in addon_folders(repo_dir)? {
        let text = fs::read_to_string(&path).map_err(|source| IndexError::Read {
            path: path.clone(),
            source,
        })?;
        let parsed = descriptor::parse(&text).map_err(|source| IndexError::Descriptor {
            path: path.clone(),
            source,
        })?;
        if let Some(first) = owners.insert(parsed.id.clone(), folder.clone()) {
            return Err(IndexError::DuplicateAddon {
                addon_id: parsed.id,
                first,
                second: folder,
            });
        }
        if parsed.id != folder {
            warn!(folder = %folder, addon_id = %parsed.id, "Folder name differs from add-on id");
        }
        bodies.push(text);
        entries.push(IndexEntry {
            folder,
            descriptor: parsed,
        });
    }

    let xml = render(bodies.iter().map(String::as_str));
    let md5 = checksum(xml.as_bytes());
    Ok(RepositoryIndex { entries, xml, md5 })
}

fn checksum_line(md5: &str) -> String {
    format!("{md5}\n")
}

fn write_err(path: &Path) -> impl Fn(io::Error) -> IndexError + '_ {
    move |source| IndexError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `bytes` to a synced temporary file in `dir`, ready to be renamed
/// over `path`.
fn stage(dir: &Path, path: &Path, bytes: &[u8]) -> Result<NamedTempFile, IndexError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".addons-")
        .tempfile_in(dir)
        .map_err(write_err(path))?;
    tmp.write_all(bytes).map_err(write_err(path))?;
    tmp.as_file().sync_all().map_err(write_err(path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
            .map_err(write_err(path))?;
    }
    Ok(tmp)
}

fn commit(tmp: NamedTempFile, path: &Path) -> Result<(), IndexError> {
    tmp.persist(path).map_err(|e| write_err(path)(e.error))?;
    Ok(())
}

/// Puts the previous `addons.xml` back after a failed checksum rename.
fn restore(dir: &Path, path: &Path, previous: Option<&[u8]>) {
    let restored = match previous {
        Some(bytes) => stage(dir, path, bytes).and_then(|tmp| commit(tmp, path)),
        None => fs::remove_file(path).map_err(write_err(path)),
    };
    match restored {
        Ok(()) => warn!(path = %path.display(), "[INDEX] Restored previous addons.xml"),
        Err(e) => error!(path = %path.display(), error = %e, "[INDEX][ERROR] Failed to restore previous addons.xml"),
    }
}

/// Regenerates `addons.xml` and `addons.xml.md5` in `repo_dir`.
///
/// Both files are staged before either is renamed into place. If the checksum
/// rename fails after `addons.xml` was replaced, the previous `addons.xml` is
/// put back so the pair on disk stays consistent.
pub fn write(repo_dir: &Path) -> Result<IndexOutcome, IndexError> {
    let index = build(repo_dir)?;
    let index_path = repo_dir.join(INDEX_FILE);
    let checksum_path = repo_dir.join(CHECKSUM_FILE);
    let line = checksum_line(&index.md5);

    let previous_index = fs::read(&index_path).ok();
    let index_changed = previous_index.as_deref() != Some(index.xml.as_bytes());
    let checksum_changed = fs::read(&checksum_path)
        .map(|current| current != line.as_bytes())
        .unwrap_or(true);

    let staged_index = if index_changed {
        Some(stage(repo_dir, &index_path, index.xml.as_bytes())?)
    } else {
        None
    };
    let staged_checksum = if checksum_changed {
        Some(stage(repo_dir, &checksum_path, line.as_bytes())?)
    } else {
        None
    };

    if let Some(tmp) = staged_index {
        commit(tmp, &index_path)?;
    }
    if let Some(tmp) = staged_checksum {
        if let Err(e) = commit(tmp, &checksum_path) {
            if index_changed {
                restore(repo_dir, &index_path, previous_index.as_deref());
            }
            return Err(e);
        }
    }

    let changed = index_changed || checksum_changed;
    if changed {
        info!(addons = index.entries.len(), md5 = %index.md5, "[INDEX] Wrote addons.xml and addons.xml.md5");
    } else {
        info!(addons = index.entries.len(), md5 = %index.md5, "[INDEX] addons.xml already up to date");
    }
    Ok(IndexOutcome {
        addons: index.entries.len(),
        md5: index.md5,
        changed,
    })
}

/// Checks that the checksum file matches the index on disk. Returns the hash.
pub fn verify(repo_dir: &Path) -> Result<String, IndexError> {
    let index_path = repo_dir.join(INDEX_FILE);
    let checksum_path = repo_dir.join(CHECKSUM_FILE);
    let bytes = fs::read(&index_path).map_err(|source| IndexError::Read {
        path: index_path,
        source,
    })?;
    let recorded = fs::read_to_string(&checksum_path).map_err(|source| IndexError::Read {
        path: checksum_path,
        source,
    })?;
    let actual = checksum(&bytes);
    let recorded = recorded.trim().to_ascii_lowercase();
    if recorded != actual {
        return Err(IndexError::ChecksumMismatch { recorded, actual });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::addon_xml;

    fn add_folder(repo: &Path, folder: &str, xml: &str) {
        let dir = repo.join(folder);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DESCRIPTOR_FILE), xml).unwrap();
    }

    #[test]
    fn checksum_is_lowercase_hex_md5() {
        assert_eq!(checksum(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(checksum(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn renders_sorted_entries_without_declarations() {
        let repo = tempfile::tempdir().unwrap();
        add_folder(repo.path(), "plugin.video.b", &addon_xml("plugin.video.b", "2.0"));
        add_folder(repo.path(), "plugin.audio.a", &addon_xml("plugin.audio.a", "1.0"));
        fs::create_dir_all(repo.path().join("assets")).unwrap();
        add_folder(repo.path(), ".staging-x", &addon_xml("ignored", "1.0"));

        let index = build(repo.path()).unwrap();

        let folders: Vec<_> = index.entries.iter().map(|e| e.folder.as_str()).collect();
        assert_eq!(folders, vec!["plugin.audio.a", "plugin.video.b"]);
        assert!(index.xml.starts_with(XML_DECLARATION));
        assert_eq!(index.xml.matches("<?xml").count(), 1);
        assert!(index.xml.find("plugin.audio.a").unwrap() < index.xml.find("plugin.video.b").unwrap());
        assert!(index.xml.ends_with("</addons>\n"));
        descriptor::find_in_index(&index.xml, "plugin.video.b")
            .unwrap()
            .expect("merged index is well-formed and lists the add-on");
    }

    #[test]
    fn write_is_idempotent_and_checksum_matches() {
        let repo = tempfile::tempdir().unwrap();
        add_folder(repo.path(), "plugin.audio.a", &addon_xml("plugin.audio.a", "1.0"));

        let first = write(repo.path()).unwrap();
        assert!(first.changed);
        let bytes = fs::read(repo.path().join(INDEX_FILE)).unwrap();
        let md5 = fs::read_to_string(repo.path().join(CHECKSUM_FILE)).unwrap();
        assert_eq!(md5, format!("{}\n", checksum(&bytes)));
        assert_eq!(verify(repo.path()).unwrap(), first.md5);

        let second = write(repo.path()).unwrap();
        assert!(!second.changed);
        assert_eq!(second.md5, first.md5);
        assert_eq!(fs::read(repo.path().join(INDEX_FILE)).unwrap(), bytes);
    }

    #[test]
    fn invalid_descriptor_keeps_previous_index() {
        let repo = tempfile::tempdir().unwrap();
        add_folder(repo.path(), "plugin.audio.a", &addon_xml("plugin.audio.a", "1.0"));
        write(repo.path()).unwrap();
        let before = fs::read(repo.path().join(INDEX_FILE)).unwrap();

        add_folder(repo.path(), "plugin.broken", "<addon id=\"plugin.broken\"");
        let err = write(repo.path()).unwrap_err();

        assert!(matches!(err, IndexError::Descriptor { .. }));
        assert_eq!(fs::read(repo.path().join(INDEX_FILE)).unwrap(), before);
        verify(repo.path()).unwrap();
    }

    #[test]
    fn failed_checksum_rename_keeps_previous_index() {
        let repo = tempfile::tempdir().unwrap();
        add_folder(repo.path(), "plugin.audio.a", &addon_xml("plugin.audio.a", "1.0"));
        write(repo.path()).unwrap();
        let before = fs::read(repo.path().join(INDEX_FILE)).unwrap();

        add_folder(repo.path(), "plugin.video.b", &addon_xml("plugin.video.b", "2.0"));
        let md5_path = repo.path().join(CHECKSUM_FILE);
        fs::remove_file(&md5_path).unwrap();
        fs::create_dir(&md5_path).unwrap();
        fs::write(md5_path.join("occupied"), "x").unwrap();

        let err = write(repo.path()).unwrap_err();

        assert!(matches!(err, IndexError::Write { .. }), "got {err:?}");
        assert_eq!(fs::read(repo.path().join(INDEX_FILE)).unwrap(), before);
        let leftovers: Vec<_> = fs::read_dir(repo.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".addons-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let repo = tempfile::tempdir().unwrap();
        add_folder(repo.path(), "a", &addon_xml("plugin.same", "1.0"));
        add_folder(repo.path(), "b", &addon_xml("plugin.same", "1.1"));
        assert!(matches!(
            build(repo.path()),
            Err(IndexError::DuplicateAddon { .. })
        ));
    }

    #[test]
    fn verify_detects_tampering() {
        let repo = tempfile::tempdir().unwrap();
        add_folder(repo.path(), "plugin.audio.a", &addon_xml("plugin.audio.a", "1.0"));
        write(repo.path()).unwrap();
        fs::write(repo.path().join(CHECKSUM_FILE), "0000\n").unwrap();
        assert!(matches!(
            verify(repo.path()),
            Err(IndexError::ChecksumMismatch { .. })
        ));
    }
}
