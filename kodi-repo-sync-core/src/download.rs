//! Release discovery and HTTP fetching.
//!
//! [`resolve_release`] turns an [`ExternalSource`] into the concrete
//! [`Release`] to mirror, following the source's [`SourceLocation`] policy.
//! [`HttpFetcher`] is the production [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::{self, ArchiveError};
use crate::config::{self, ConfigError, ExternalSource, HttpSettings, SourceLocation};
use crate::contract::{FetchError, Fetcher};
use crate::descriptor::{self, DescriptorError};
use crate::version;

/// The latest upstream release of one external add-on.
#[derive(Debug, Clone)]
pub struct Release {
    pub addon_id: String,
    pub version: String,
    pub zip_url: String,
    /// Archive bytes, when resolution already had to download them.
    pub archive: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid metadata at {url}: {source}")]
    Metadata {
        url: String,
        #[source]
        source: DescriptorError,
    },
    #[error("addon '{addon_id}' not listed in {url}")]
    AddonNotFound { addon_id: String, url: String },
    #[error("no file names matching the pattern found at {url}")]
    NoCandidates { url: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("archive from {url} rejected: {source}")]
    Archive {
        url: String,
        #[source]
        source: ArchiveError,
    },
    #[error("version {version:?} from {url} cannot be used in a file name")]
    UnsafeVersion { version: String, url: String },
}

/// Versions end up in `<addon_id>-<version>.zip` under the mirror directory.
fn is_safe_version(version: &str) -> bool {
    !version.is_empty()
        && !version.contains(['/', '\\'])
        && !version.contains("..")
        && !version.chars().any(char::is_control)
}

/// Production [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    text_timeout: Duration,
    download_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Client {
                source: Box::new(e),
            })?;
        Ok(Self {
            client,
            text_timeout: Duration::from_secs(settings.text_timeout_secs),
            download_timeout: Duration::from_secs(settings.download_timeout_secs),
        })
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, FetchError> {
        debug!(url, timeout_secs = timeout.as_secs(), "HTTP GET");
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            source: Box::new(error),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url, self.text_timeout).await?;
        response.text().await.map_err(|e| map_reqwest_error(url, e))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url, self.download_timeout).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;
        Ok(bytes.to_vec())
    }
}

/// Determines the latest release for a configured source.
pub async fn resolve_release<F>(fetcher: &F, source: &ExternalSource) -> Result<Release, ResolveError>
where
    F: Fetcher + ?Sized,
{
    let addon_id = source.addon_id.as_str();
    let release = match &source.location {
        SourceLocation::Zip { zip_url } => {
            let bytes = fetcher.fetch_bytes(zip_url).await?;
            let found = archive::inspect(&bytes, addon_id).map_err(|source| {
                ResolveError::Archive {
                    url: zip_url.clone(),
                    source,
                }
            })?;
            Release {
                addon_id: addon_id.to_string(),
                version: found.version,
                zip_url: zip_url.clone(),
                archive: Some(bytes),
            }
        }
        SourceLocation::AddonsXml {
            addons_xml_url,
            zip_url_template,
        } => {
            let xml = fetcher.fetch_text(addons_xml_url).await?;
            let found = descriptor::find_in_index(&xml, addon_id)
                .map_err(|source| ResolveError::Metadata {
                    url: addons_xml_url.clone(),
                    source,
                })?
                .ok_or_else(|| ResolveError::AddonNotFound {
                    addon_id: addon_id.to_string(),
                    url: addons_xml_url.clone(),
                })?;
            let zip_url = zip_url_template
                .replace("{addon_id}", addon_id)
                .replace("{version}", &found.version);
            Release {
                addon_id: addon_id.to_string(),
                version: found.version,
                zip_url,
                archive: None,
            }
        }
        SourceLocation::Index {
            index_url,
            filename_regex,
            zip_url_template,
        } => {
            let regex = config::compile_filename_regex(addon_id, filename_regex)?;
            let listing = fetcher.fetch_text(index_url).await?;
            let candidates = regex.captures_iter(&listing).filter_map(|caps| {
                let filename = caps.get(0)?.as_str();
                let version = caps.name("version")?.as_str();
                Some((filename, version))
            });
            let (filename, version) = version::latest(candidates, |c| c.1).ok_or_else(|| {
                ResolveError::NoCandidates {
                    url: index_url.clone(),
                }
            })?;
            let zip_url = match zip_url_template {
                Some(template) => template.replace("{filename}", filename),
                None if index_url.ends_with('/') => format!("{index_url}{filename}"),
                None => format!("{index_url}/{filename}"),
            };
            Release {
                addon_id: addon_id.to_string(),
                version: version.to_string(),
                zip_url,
                archive: None,
            }
        }
    };
    if !is_safe_version(&release.version) {
        return Err(ResolveError::UnsafeVersion {
            version: release.version,
            url: source.location.entry_url().to_string(),
        });
    }
    info!(
        addon_id = %release.addon_id,
        version = %release.version,
        zip_url = %release.zip_url,
        "[SYNC] Resolved latest release"
    );
    Ok(release)
}
