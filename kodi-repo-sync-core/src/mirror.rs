//! Per-addon mirror directories under the repository root.
//!
//! A mirror is `repo/<addon_id>/` holding exactly one `<addon_id>-<version>.zip`
//! plus the extracted archive content and, optionally, an `index.html`.
//! A new mirror is always assembled in a hidden staging directory next to the
//! old one and swapped in with renames, so a failure part-way leaves the
//! previous mirror as it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::archive::{self, ArchiveError, DESCRIPTOR_FILE};
use crate::index_page;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("archive for '{addon_id}' has no top-level addon.xml once extracted")]
    MissingDescriptor { addon_id: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MirrorError + '_ {
    move |source| MirrorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorState {
    /// The mirror already holds exactly this release, fully extracted.
    Current,
    /// The mirror needs rebuilding. `local_archive` is set when the wanted
    /// zip is already on disk and need not be downloaded again.
    Stale { local_archive: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct MirrorUpdate {
    pub archive: PathBuf,
    /// File names of superseded zips that were deleted.
    pub removed: Vec<String>,
    /// Number of files extracted from the archive.
    pub extracted: usize,
}

pub fn mirror_dir(repo_dir: &Path, addon_id: &str) -> PathBuf {
    repo_dir.join(addon_id)
}

pub fn archive_name(addon_id: &str, version: &str) -> String {
    format!("{addon_id}-{version}.zip")
}

/// Returns the version part of `<addon_id>-<version>.zip`, if `name` is one.
pub fn archive_version<'a>(name: &'a str, addon_id: &str) -> Option<&'a str> {
    let version = name
        .strip_prefix(addon_id)?
        .strip_prefix('-')?
        .strip_suffix(".zip")?;
    // Guards against `repository.foo-bar-1.0.zip` matching `repository.foo`.
    version
        .starts_with(|c: char| c.is_ascii_digit())
        .then_some(version)
}

/// File names of every `<addon_id>-<version>.zip` directly inside `dir`,
/// sorted. A missing directory has none.
pub fn archives_in(dir: &Path, addon_id: &str) -> Result<Vec<String>, MirrorError> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut names = Vec::new();
    for entry in read {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if archive_version(&name, addon_id).is_some() && entry.path().is_file() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Versions of the zips currently in the addon's mirror directory.
pub fn local_versions(repo_dir: &Path, addon_id: &str) -> Result<Vec<String>, MirrorError> {
    Ok(archives_in(&mirror_dir(repo_dir, addon_id), addon_id)?
        .iter()
        .filter_map(|name| archive_version(name, addon_id).map(str::to_string))
        .collect())
}

pub fn inspect(repo_dir: &Path, addon_id: &str, version: &str) -> Result<MirrorState, MirrorError> {
    let dir = mirror_dir(repo_dir, addon_id);
    let wanted = archive_name(addon_id, version);
    let wanted_path = dir.join(&wanted);
    if !wanted_path.is_file() {
        return Ok(MirrorState::Stale {
            local_archive: None,
        });
    }
    let superseded = archives_in(&dir, addon_id)?.iter().any(|name| *name != wanted);
    let legacy = !archives_in(repo_dir, addon_id)?.is_empty();
    let extracted = dir.join(DESCRIPTOR_FILE).is_file();
    debug!(addon_id, version, superseded, legacy, extracted, "Inspected mirror");
    if !superseded && !legacy && extracted {
        Ok(MirrorState::Current)
    } else {
        Ok(MirrorState::Stale {
            local_archive: Some(wanted_path),
        })
    }
}

/// Replaces the addon's mirror with the content of `bytes` (a verified zip of
/// `addon_id` at `version`) and deletes superseded zips, including legacy
/// copies at the repository root.
pub fn rebuild(
    repo_dir: &Path,
    addon_id: &str,
    version: &str,
    bytes: &[u8],
    index_pages: bool,
) -> Result<MirrorUpdate, MirrorError> {
    fs::create_dir_all(repo_dir).map_err(io_err(repo_dir))?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(repo_dir)
        .map_err(io_err(repo_dir))?;
    let staged = staging.path().join(addon_id);
    fs::create_dir(&staged).map_err(io_err(&staged))?;

    let name = archive_name(addon_id, version);
    let staged_archive = staged.join(&name);
    fs::write(&staged_archive, bytes).map_err(io_err(&staged_archive))?;

    let extracted = archive::extract(bytes, addon_id, &staged)?;
    if !staged.join(DESCRIPTOR_FILE).is_file() {
        return Err(MirrorError::MissingDescriptor {
            addon_id: addon_id.to_string(),
        });
    }
    if index_pages {
        index_page::write(&staged, addon_id).map_err(io_err(&staged))?;
    }

    let target = mirror_dir(repo_dir, addon_id);
    let mut removed: Vec<String> = archives_in(&target, addon_id)?
        .into_iter()
        .filter(|old| *old != name)
        .collect();
    swap(repo_dir, &staged, &target)?;

    for legacy in archives_in(repo_dir, addon_id)? {
        let path = repo_dir.join(&legacy);
        fs::remove_file(&path).map_err(io_err(&path))?;
        info!(addon_id, file = %legacy, "[SYNC] Removed legacy root zip");
        removed.push(legacy);
    }
    for old in &removed {
        info!(addon_id, file = %old, "[SYNC] Removed stale zip");
    }

    Ok(MirrorUpdate {
        archive: target.join(name),
        removed,
        extracted: extracted.len(),
    })
}

/// Moves `staged` to `target`, restoring the previous `target` on failure.
fn swap(repo_dir: &Path, staged: &Path, target: &Path) -> Result<(), MirrorError> {
    if !target.exists() {
        return fs::rename(staged, target).map_err(io_err(target));
    }
    let backup_root = tempfile::Builder::new()
        .prefix(".previous-")
        .tempdir_in(repo_dir)
        .map_err(io_err(repo_dir))?;
    let backup = backup_root.path().join("mirror");
    fs::rename(target, &backup).map_err(io_err(target))?;
    if let Err(source) = fs::rename(staged, target) {
        if let Err(restore) = fs::rename(&backup, target) {
            error!(
                path = %target.display(),
                backup = %backup.display(),
                error = %restore,
                "Failed to restore previous mirror"
            );
        }
        return Err(MirrorError::Io {
            path: target.to_path_buf(),
            source,
        });
    }
    // Dropping `backup_root` deletes the previous mirror.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::addon_zip;

    const ID: &str = "repository.foo";

    #[test]
    fn archive_version_parsing() {
        assert_eq!(archive_version("repository.foo-1.2.zip", ID), Some("1.2"));
        assert_eq!(archive_version("repository.foo-bar-1.2.zip", ID), None);
        assert_eq!(archive_version("repository.foo.zip", ID), None);
        assert_eq!(archive_version("repository.foo-1.2.tar", ID), None);
    }

    #[test]
    fn rebuild_replaces_old_version_and_legacy_zip() {
        let repo = tempfile::tempdir().unwrap();
        rebuild(repo.path(), ID, "1.0", &addon_zip(ID, "1.0"), true).unwrap();
        fs::write(repo.path().join("repository.foo-0.9.zip"), b"legacy").unwrap();
        fs::write(mirror_dir(repo.path(), ID).join("leftover.txt"), b"x").unwrap();

        let update = rebuild(repo.path(), ID, "1.2", &addon_zip(ID, "1.2"), true).unwrap();

        let dir = mirror_dir(repo.path(), ID);
        assert_eq!(archives_in(&dir, ID).unwrap(), vec!["repository.foo-1.2.zip"]);
        assert!(archives_in(repo.path(), ID).unwrap().is_empty());
        assert!(!dir.join("leftover.txt").exists());
        assert!(dir.join("icon.png").is_file());
        assert!(dir.join("resources").join("fanart.jpg").is_file());
        assert!(dir.join("index.html").is_file());
        let xml = fs::read_to_string(dir.join("addon.xml")).unwrap();
        assert!(xml.contains("version=\"1.2\""));
        assert_eq!(
            update.removed,
            vec!["repository.foo-1.0.zip", "repository.foo-0.9.zip"]
        );
        assert_eq!(update.extracted, 3);

        // No staging or backup directories are left behind.
        let hidden: Vec<_> = fs::read_dir(repo.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(hidden.is_empty());
    }

    #[test]
    fn rebuild_without_descriptor_keeps_previous_mirror() {
        let repo = tempfile::tempdir().unwrap();
        rebuild(repo.path(), ID, "1.0", &addon_zip(ID, "1.0"), false).unwrap();
        let broken = crate::archive::test_support::build_zip(&[("docs/readme.txt", b"hi".as_slice())]);

        let err = rebuild(repo.path(), ID, "1.2", &broken, false).unwrap_err();

        assert!(matches!(err, MirrorError::MissingDescriptor { .. }));
        let dir = mirror_dir(repo.path(), ID);
        assert_eq!(archives_in(&dir, ID).unwrap(), vec!["repository.foo-1.0.zip"]);
        assert!(dir.join("addon.xml").is_file());
    }

    #[test]
    fn inspect_reports_current_and_stale_states() {
        let repo = tempfile::tempdir().unwrap();
        assert_eq!(
            inspect(repo.path(), ID, "1.0").unwrap(),
            MirrorState::Stale {
                local_archive: None
            }
        );

        rebuild(repo.path(), ID, "1.0", &addon_zip(ID, "1.0"), false).unwrap();
        assert_eq!(inspect(repo.path(), ID, "1.0").unwrap(), MirrorState::Current);
        assert_eq!(
            inspect(repo.path(), ID, "1.2").unwrap(),
            MirrorState::Stale {
                local_archive: None
            }
        );

        let dir = mirror_dir(repo.path(), ID);
        fs::remove_file(dir.join("addon.xml")).unwrap();
        assert_eq!(
            inspect(repo.path(), ID, "1.0").unwrap(),
            MirrorState::Stale {
                local_archive: Some(dir.join("repository.foo-1.0.zip"))
            }
        );
    }

    #[test]
    fn local_versions_lists_zip_versions() {
        let repo = tempfile::tempdir().unwrap();
        let dir = mirror_dir(repo.path(), ID);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("repository.foo-1.0.zip"), b"").unwrap();
        fs::write(dir.join("repository.foo-2.0.zip"), b"").unwrap();
        fs::write(dir.join("icon.png"), b"").unwrap();
        assert_eq!(local_versions(repo.path(), ID).unwrap(), vec!["1.0", "2.0"]);
    }
}
