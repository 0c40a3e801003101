//! Job configuration: where the repository lives and which external
//! repository add-ons are mirrored into it.
//!
//! The types deserialize straight from the YAML config file (see the CLI
//! crate's `load_config`). [`SyncConfig::validate`] must run before the config
//! is handed to [`crate::synchronise::synchronise`].

use std::collections::HashSet;
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_REPO_DIR: &str = "repo";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_USER_AGENT: &str = concat!("kodi-repo-sync/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TEXT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    #[serde(default)]
    pub sources: Vec<ExternalSource>,
    #[serde(default)]
    pub http: HttpSettings,
    /// Write an `index.html` browsing page into every rebuilt mirror.
    #[serde(default = "default_true")]
    pub index_pages: bool,
    /// Maximum number of sources processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Timeout for metadata requests (addons.xml, directory listings).
    #[serde(default = "default_text_timeout")]
    pub text_timeout_secs: u64,
    /// Timeout for zip downloads.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            text_timeout_secs: DEFAULT_TEXT_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

/// One external repository add-on to mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSource {
    pub addon_id: String,
    #[serde(flatten)]
    pub location: SourceLocation,
}

/// Where the latest release of an external add-on is discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLocation {
    /// A fixed URL that always serves the latest zip.
    Zip { zip_url: String },
    /// The upstream repository's own addons.xml plus a zip URL template
    /// using `{addon_id}` and `{version}`.
    AddonsXml {
        addons_xml_url: String,
        zip_url_template: String,
    },
    /// An HTML directory listing scanned with a regex that captures `version`.
    Index {
        index_url: String,
        filename_regex: String,
        #[serde(default)]
        zip_url_template: Option<String>,
    },
}

impl SourceLocation {
    /// The URL that is contacted first for this location.
    pub fn entry_url(&self) -> &str {
        match self {
            SourceLocation::Zip { zip_url } => zip_url,
            SourceLocation::AddonsXml { addons_xml_url, .. } => addons_xml_url,
            SourceLocation::Index { index_url, .. } => index_url,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source entry has an empty addon_id")]
    EmptyAddonId,
    #[error("addon '{addon_id}' is configured more than once")]
    DuplicateAddon { addon_id: String },
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("addon '{addon_id}': filename_regex does not compile: {source}")]
    InvalidRegex {
        addon_id: String,
        #[source]
        source: regex::Error,
    },
    #[error("addon '{addon_id}': filename_regex must contain a named capture group 'version'")]
    MissingVersionGroup { addon_id: String },
    #[error("addon '{addon_id}': zip_url_template must contain '{placeholder}'")]
    MissingPlaceholder {
        addon_id: String,
        placeholder: &'static str,
    },
}

impl SyncConfig {
    /// A config with defaults for everything but the repository directory.
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            sources: Vec::new(),
            http: HttpSettings::default(),
            index_pages: true,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            let addon_id = source.addon_id.trim();
            if addon_id.is_empty() {
                return Err(ConfigError::EmptyAddonId);
            }
            if !seen.insert(addon_id) {
                return Err(ConfigError::DuplicateAddon {
                    addon_id: addon_id.to_string(),
                });
            }
            source.validate()?;
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            repo_dir = %self.repo_dir.display(),
            sources_count = self.sources.len(),
            concurrency = self.concurrency,
            "Loaded SyncConfig"
        );
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}

impl ExternalSource {
    fn validate(&self) -> Result<(), ConfigError> {
        match &self.location {
            SourceLocation::Zip { .. } => Ok(()),
            SourceLocation::AddonsXml {
                zip_url_template, ..
            } => {
                if zip_url_template.contains("{version}") {
                    Ok(())
                } else {
                    Err(ConfigError::MissingPlaceholder {
                        addon_id: self.addon_id.clone(),
                        placeholder: "{version}",
                    })
                }
            }
            SourceLocation::Index {
                filename_regex,
                zip_url_template,
                ..
            } => {
                compile_filename_regex(&self.addon_id, filename_regex)?;
                match zip_url_template {
                    Some(template) if !template.contains("{filename}") => {
                        Err(ConfigError::MissingPlaceholder {
                            addon_id: self.addon_id.clone(),
                            placeholder: "{filename}",
                        })
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Compiles an index-scan regex and checks it captures `version`.
pub fn compile_filename_regex(addon_id: &str, pattern: &str) -> Result<Regex, ConfigError> {
    let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
        addon_id: addon_id.to_string(),
        source,
    })?;
    if !regex.capture_names().flatten().any(|name| name == "version") {
        return Err(ConfigError::MissingVersionGroup {
            addon_id: addon_id.to_string(),
        });
    }
    Ok(regex)
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from(DEFAULT_REPO_DIR)
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_text_timeout() -> u64 {
    DEFAULT_TEXT_TIMEOUT_SECS
}

fn default_download_timeout() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_source(regex: &str, template: Option<&str>) -> ExternalSource {
        ExternalSource {
            addon_id: "repository.foo".into(),
            location: SourceLocation::Index {
                index_url: "https://example.org/foo/".into(),
                filename_regex: regex.into(),
                zip_url_template: template.map(str::to_string),
            },
        }
    }

    #[test]
    fn deserializes_all_source_types_with_defaults() {
        let yaml = r#"
sources:
  - addon_id: repository.a
    type: zip
    zip_url: https://example.org/a.zip
  - addon_id: repository.b
    type: addons_xml
    addons_xml_url: https://example.org/addons.xml
    zip_url_template: "https://example.org/{addon_id}-{version}.zip"
  - addon_id: repository.c
    type: index
    index_url: https://example.org/c/
    filename_regex: 'repository\.c-(?P<version>[0-9.]+)\.zip'
"#;
        let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.repo_dir, PathBuf::from("repo"));
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.index_pages);
        assert_eq!(config.http.text_timeout_secs, 30);
        assert_eq!(config.sources.len(), 3);
        assert_eq!(
            config.sources[0].location,
            SourceLocation::Zip {
                zip_url: "https://example.org/a.zip".into()
            }
        );
        assert!(matches!(
            config.sources[2].location,
            SourceLocation::Index {
                zip_url_template: None,
                ..
            }
        ));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_addon_ids() {
        let mut config = SyncConfig::new("repo");
        config.sources.push(index_source(r"(?P<version>\d+)", None));
        config.sources.push(index_source(r"(?P<version>\d+)", None));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateAddon { .. })
        ));
    }

    #[test]
    fn rejects_regex_without_version_group() {
        let mut config = SyncConfig::new("repo");
        config.sources.push(index_source(r"foo-[0-9.]+\.zip", None));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVersionGroup { .. })
        ));
    }

    #[test]
    fn rejects_index_template_without_filename() {
        let mut config = SyncConfig::new("repo");
        config.sources.push(index_source(
            r"(?P<version>\d+)",
            Some("https://cdn.example.org/latest.zip"),
        ));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPlaceholder {
                placeholder: "{filename}",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = SyncConfig::new("repo");
        config.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroConcurrency)
        ));
    }
}
