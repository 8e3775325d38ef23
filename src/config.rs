//! Read-only configuration snapshot.
//!
//! The settings document is owned and persisted by the surrounding
//! application; the filter only ever deserializes it.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde::Deserialize;

/// Errors from loading a configuration snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("cannot parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a configured item contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum ItemState {
    /// Names are added to the blocked set.
    Deny,
    /// Names are removed from the blocked set; upstream servers are used.
    Allow,
    /// Item is skipped entirely.
    Ignore,
}

impl TryFrom<u8> for ItemState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ItemState::Deny),
            1 => Ok(ItemState::Allow),
            2 => Ok(ItemState::Ignore),
            other => Err(format!("invalid item state {other}")),
        }
    }
}

/// A rule source or an upstream server override.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub title: String,
    pub location: String,
    pub state: ItemState,
}

impl Item {
    pub fn new(title: impl Into<String>, location: impl Into<String>, state: ItemState) -> Self {
        Self {
            title: title.into(),
            location: location.into(),
            state,
        }
    }

    /// Whether the location names remote content that is cached locally.
    pub fn is_downloadable(&self) -> bool {
        self.location.starts_with("https://") || self.location.starts_with("http://")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Hosts {
    pub enabled: bool,
    pub automatic_refresh: bool,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsServers {
    pub enabled: bool,
    pub items: Vec<Item>,
}

/// Immutable view of the user's settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    pub auto_start: bool,
    pub hosts: Hosts,
    pub dns_servers: DnsServers,
    #[serde(rename = "ipV6Support")]
    pub ipv6_support: bool,
    pub watch_dog: bool,
    pub show_notification: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            auto_start: false,
            hosts: Hosts::default(),
            dns_servers: DnsServers::default(),
            ipv6_support: true,
            watch_dog: false,
            show_notification: true,
        }
    }
}

impl Configuration {
    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Upstream server overrides the user enabled, in configured order.
    pub fn allowed_dns_servers(&self) -> impl Iterator<Item = &Item> {
        self.dns_servers
            .items
            .iter()
            .filter(move |item| self.dns_servers.enabled && item.state == ItemState::Allow)
    }
}
