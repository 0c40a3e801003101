use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kodi_repo_sync_core::download::HttpFetcher;
use kodi_repo_sync_core::index;
use kodi_repo_sync_core::synchronise::{reindex, synchronise};

use crate::load_config::load_config;

/// CLI for kodi-repo-sync: mirror external repository add-ons and rebuild addons.xml.
#[derive(Parser)]
#[clap(
    name = "kodi-repo-sync",
    version,
    about = "Mirror external Kodi repository add-ons and regenerate addons.xml"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Update every configured external repository add-on, then rebuild the index
    Sync {
        /// Path to the YAML config file
        #[clap(long, env = "KODI_REPO_SYNC_CONFIG")]
        config: PathBuf,
        /// Only synchronise these add-on ids (repeatable)
        #[clap(long = "source")]
        sources: Vec<String>,
        /// Repository directory, overriding the config file
        #[clap(long)]
        repo_dir: Option<PathBuf>,
    },
    /// Regenerate addons.xml and addons.xml.md5 from the add-on folders on disk
    Index {
        /// Repository directory holding the add-on folders
        #[clap(long, env = "KODI_REPO_SYNC_REPO_DIR", default_value = "repo")]
        repo_dir: PathBuf,
        /// Check the existing checksum instead of writing
        #[clap(long)]
        verify: bool,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let result = match cli.command {
        Commands::Sync {
            config,
            sources,
            repo_dir,
        } => {
            let mut config = load_config(config)?;
            if let Some(repo_dir) = repo_dir {
                config.repo_dir = repo_dir;
            }
            let fetcher = HttpFetcher::new(&config.http).context("Failed to build HTTP client")?;
            println!("Synchronise starting...");
            match synchronise(&config, &fetcher, &sources).await {
                Ok(report) => {
                    println!("Synchronise complete.\nReport:");
                    println!("{report}");
                    for failed in report.failed() {
                        tracing::warn!(addon_id = %failed.addon_id, "Source was not updated");
                    }
                    Ok(())
                }
                Err(e) => {
                    eprintln!("[ERROR] Synchronisation failed: {e}");
                    Err(anyhow::Error::new(e))
                }
            }
        }
        Commands::Index { repo_dir, verify } => {
            if verify {
                let md5 = index::verify(&repo_dir)
                    .with_context(|| format!("Index verification failed in {}", repo_dir.display()))?;
                println!("addons.xml.md5 matches addons.xml ({md5})");
            } else {
                let outcome = reindex(&repo_dir)
                    .await
                    .with_context(|| format!("Index generation failed in {}", repo_dir.display()))?;
                println!(
                    "addons.xml: {} add-ons, md5 {}{}",
                    outcome.addons,
                    outcome.md5,
                    if outcome.changed { "" } else { " (unchanged)" }
                );
            }
            Ok(())
        }
    };

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(success = result.is_ok(), "kodi-repo-sync finished");
    });

    result
}
