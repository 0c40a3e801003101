//! High-level pipeline: resolve → download → verify → mirror for every
//! configured external source, then regenerate the repository index.
//!
//! # Responsibilities
//! - Sources are independent: a failure (network, bad archive, IO) is recorded
//!   in that source's [`SourceReport`] and never touches another mirror.
//! - Up to [`SyncConfig::concurrency`] sources run at once; the report keeps
//!   the order of the config file.
//! - The index step runs once, after every source has settled. It is the only
//!   step whose failure fails the whole run.
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]
//! - Index only: [`reindex`]

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, info_span, warn, Instrument};

use crate::archive::{self, ArchiveError};
use crate::config::{ConfigError, ExternalSource, SyncConfig};
use crate::contract::{FetchError, Fetcher};
use crate::download::{resolve_release, Release, ResolveError};
use crate::index::{self, IndexError, IndexOutcome};
use crate::mirror::{self, MirrorError, MirrorState};
use crate::version;

/// Why one source could not be mirrored.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("archive from {url} rejected: {source}")]
    Archive {
        url: String,
        #[source]
        source: ArchiveError,
    },
    #[error(
        "archive from {url} declares version {found} in addon.xml but the release was resolved as {expected}; \
         if the version came from a file name, adjust filename_regex to capture the full version"
    )]
    VersionMismatch {
        url: String,
        expected: String,
        found: String,
    },
    #[error("cannot read local archive {path}: {source}")]
    LocalArchive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Debug, Error)]
pub enum SynchroniseError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown source '{addon_id}' requested")]
    UnknownSource { addon_id: String },
    #[error("cannot create repository directory {path}: {source}")]
    RepoDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("index generation failed: {0}")]
    Index(#[from] IndexError),
    #[error("index task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Debug)]
pub enum SourceOutcome {
    /// The mirror already holds the latest release (or something newer).
    Unchanged { version: String },
    /// The mirror was rebuilt for `version`.
    Updated {
        version: String,
        previous: Option<String>,
        removed: Vec<String>,
    },
    Failed { error: SourceError },
}

#[derive(Debug)]
pub struct SourceReport {
    pub addon_id: String,
    pub outcome: SourceOutcome,
}

#[derive(Debug)]
pub struct SynchroniseReport {
    pub sources: Vec<SourceReport>,
    pub index: IndexOutcome,
}

impl SynchroniseReport {
    pub fn failed(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|s| matches!(s.outcome, SourceOutcome::Failed { .. }))
    }

    pub fn updated(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|s| matches!(s.outcome, SourceOutcome::Updated { .. }))
    }
}

impl fmt::Display for SourceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOutcome::Unchanged { version } => write!(f, "unchanged at {version}"),
            SourceOutcome::Updated {
                version,
                previous: Some(previous),
                ..
            } if previous == version => write!(f, "repaired {version}"),
            SourceOutcome::Updated {
                version,
                previous: Some(previous),
                ..
            } => write!(f, "updated {previous} -> {version}"),
            SourceOutcome::Updated { version, .. } => write!(f, "added {version}"),
            SourceOutcome::Failed { error } => write!(f, "FAILED: {error}"),
        }
    }
}

impl fmt::Display for SynchroniseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for source in &self.sources {
            writeln!(f, "{}: {}", source.addon_id, source.outcome)?;
        }
        write!(
            f,
            "addons.xml: {} add-ons, md5 {}{}",
            self.index.addons,
            self.index.md5,
            if self.index.changed { "" } else { " (unchanged)" }
        )
    }
}

/// Runs `f` on the blocking thread pool.
async fn blocking<T, F>(f: F) -> Result<T, SourceError>
where
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn select<'a>(
    sources: &'a [ExternalSource],
    only: &[String],
) -> Result<Vec<&'a ExternalSource>, SynchroniseError> {
    if only.is_empty() {
        return Ok(sources.iter().collect());
    }
    let known: HashSet<&str> = sources.iter().map(|s| s.addon_id.as_str()).collect();
    if let Some(unknown) = only.iter().find(|id| !known.contains(id.as_str())) {
        return Err(SynchroniseError::UnknownSource {
            addon_id: unknown.clone(),
        });
    }
    Ok(sources
        .iter()
        .filter(|s| only.iter().any(|id| *id == s.addon_id))
        .collect())
}

/// Mirrors every selected source, then rewrites `addons.xml`. `only` limits
/// the run to the given add-on ids; an empty slice selects every source.
pub async fn synchronise<F>(
    config: &SyncConfig,
    fetcher: &F,
    only: &[String],
) -> Result<SynchroniseReport, SynchroniseError>
where
    F: Fetcher + ?Sized,
{
    config.validate()?;
    let selected = select(&config.sources, only)?;
    info!(
        repo_dir = %config.repo_dir.display(),
        sources = selected.len(),
        concurrency = config.concurrency,
        "[SYNC] Starting external repository synchronisation"
    );
    fs::create_dir_all(&config.repo_dir).map_err(|source| SynchroniseError::RepoDir {
        path: config.repo_dir.clone(),
        source,
    })?;

    let sources: Vec<SourceReport> = stream::iter(selected)
        .map(|source| {
            let span = info_span!("source", addon_id = %source.addon_id);
            async move {
                let outcome =
                    match sync_source(fetcher, &config.repo_dir, source, config.index_pages).await {
                        Ok(outcome) => outcome,
                        Err(error) => {
                            error!(url = source.location.entry_url(), error = %error, "[SYNC][ERROR] Source failed");
                            SourceOutcome::Failed { error }
                        }
                    };
                SourceReport {
                    addon_id: source.addon_id.clone(),
                    outcome,
                }
            }
            .instrument(span)
        })
        .buffered(config.concurrency)
        .collect()
        .await;

    let index = reindex(&config.repo_dir).await?;
    let report = SynchroniseReport { sources, index };
    info!(
        updated = report.updated().count(),
        failed = report.failed().count(),
        "[SYNC] Synchronisation finished"
    );
    Ok(report)
}

/// Regenerates `addons.xml` and its checksum from the mirrors on disk.
pub async fn reindex(repo_dir: &Path) -> Result<IndexOutcome, SynchroniseError> {
    let repo_dir = repo_dir.to_path_buf();
    let outcome = tokio::task::spawn_blocking(move || index::write(&repo_dir)).await?;
    match outcome {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            error!(error = %e, "[INDEX][ERROR] Index generation failed, previous index kept");
            Err(e.into())
        }
    }
}

/// Rejects archives that are damaged, lack the add-on's descriptor or carry
/// another version than the one resolved upstream.
fn check_archive(bytes: &[u8], addon_id: &str, version: &str, origin: &str) -> Result<(), SourceError> {
    let found = archive::inspect(bytes, addon_id).map_err(|source| SourceError::Archive {
        url: origin.to_string(),
        source,
    })?;
    if version::compare(&found.version, version).is_ne() {
        return Err(SourceError::VersionMismatch {
            url: origin.to_string(),
            expected: version.to_string(),
            found: found.version,
        });
    }
    Ok(())
}

async fn sync_source<F>(
    fetcher: &F,
    repo_dir: &Path,
    source: &ExternalSource,
    index_pages: bool,
) -> Result<SourceOutcome, SourceError>
where
    F: Fetcher + ?Sized,
{
    let release = resolve_release(fetcher, source).await?;
    let Release {
        addon_id,
        version,
        zip_url,
        archive: fetched,
    } = release;

    let (state, local) = {
        let (repo, id, v) = (repo_dir.to_path_buf(), addon_id.clone(), version.clone());
        blocking(move || {
            let state = mirror::inspect(&repo, &id, &v)?;
            let local = mirror::local_versions(&repo, &id)?;
            Ok((state, local))
        })
        .await?
    };
    let previous = version::latest(local, |v| v.as_str());

    if state == MirrorState::Current {
        info!(version = %version, "[SYNC] Mirror already up to date");
        return Ok(SourceOutcome::Unchanged { version });
    }
    if let Some(previous) = &previous {
        if version::compare(previous, &version).is_gt() {
            warn!(
                local = %previous,
                upstream = %version,
                "[SYNC] Local mirror is newer than upstream, keeping it"
            );
            return Ok(SourceOutcome::Unchanged {
                version: previous.clone(),
            });
        }
    }

    let bytes = match (fetched, state) {
        (Some(bytes), _) => bytes,
        (
            None,
            MirrorState::Stale {
                local_archive: Some(path),
            },
        ) => {
            let (id, v) = (addon_id.clone(), version.clone());
            let local = blocking(move || {
                let bytes = fs::read(&path).map_err(|source| SourceError::LocalArchive {
                    path: path.clone(),
                    source,
                })?;
                check_archive(&bytes, &id, &v, &path.display().to_string())?;
                Ok((path, bytes))
            })
            .await;
            match local {
                Ok((path, bytes)) => {
                    info!(path = %path.display(), "[SYNC] Reusing archive already on disk");
                    bytes
                }
                Err(error) => {
                    warn!(error = %error, url = %zip_url, "[SYNC] Archive on disk is unusable, downloading it again");
                    fetcher.fetch_bytes(&zip_url).await?
                }
            }
        }
        (None, _) => {
            info!(url = %zip_url, "[SYNC] Downloading release");
            fetcher.fetch_bytes(&zip_url).await?
        }
    };

    let update = {
        let (repo, id, v) = (repo_dir.to_path_buf(), addon_id.clone(), version.clone());
        let url = zip_url.clone();
        blocking(move || {
            check_archive(&bytes, &id, &v, &url)?;
            Ok(mirror::rebuild(&repo, &id, &v, &bytes, index_pages)?)
        })
        .await?
    };

    info!(
        version = %version,
        previous = previous.as_deref().unwrap_or("-"),
        extracted = update.extracted,
        removed = update.removed.len(),
        "[SYNC] Mirror updated"
    );
    Ok(SourceOutcome::Updated {
        version,
        previous,
        removed: update.removed,
    })
}
