#![doc = "kodi-repo-sync-core: core logic library for kodi-repo-sync."]

//! This crate contains the release resolution, mirroring and index generation
//! logic behind the `kodi-repo-sync` binary. The CLI crate only parses
//! arguments, loads the config file and prints the report.
//!
//! # Usage
//! Build a [`config::SyncConfig`], pick a [`contract::Fetcher`] (normally
//! [`download::HttpFetcher`]) and call [`synchronise::synchronise`].

pub mod archive;
pub mod config;
pub mod contract;
pub mod descriptor;
pub mod download;
pub mod index;
pub mod index_page;
pub mod mirror;
pub mod synchronise;
pub mod version;
