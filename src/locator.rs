//! Finds the directory addresses to contact, in priority order.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use log::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Result, SvcDirError};
use crate::types::{AddressSource, DirectoryAddress};

/// Which strategies the locator evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocateStrategy {
    /// Every strategy, in fixed priority order.
    #[default]
    Chain,
    /// A single strategy.
    Only(AddressSource),
}

impl LocateStrategy {
    fn includes(&self, source: AddressSource) -> bool {
        match self {
            LocateStrategy::Chain => true,
            LocateStrategy::Only(only) => *only == source,
        }
    }
}

/// Local directory configuration file contents.
#[derive(Debug, Default, Deserialize)]
struct LocalDirectoryFile {
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    directories: Vec<String>,
}

/// Produces the ordered list of directory addresses for one operation.
#[derive(Debug, Clone)]
pub struct EndpointLocator {
    config: ClientConfig,
}

impl EndpointLocator {
    pub fn new(config: ClientConfig) -> Self {
        EndpointLocator { config }
    }

    /// Evaluates the locator strategies.
    ///
    /// Order is explicit override, local configuration file, well-known address, then
    /// addresses derived from the role/domain files. A failing strategy contributes
    /// nothing. Duplicates are kept.
    pub fn resolve_directory_addresses(
        &self,
        strategy: LocateStrategy,
        explicit_override: Option<&str>,
    ) -> Vec<DirectoryAddress> {
        let mut addresses = Vec::new();

        // Explicit override: per-call value or configured one
        if strategy.includes(AddressSource::Explicit) {
            if let Some(explicit) = explicit_override.map(str::trim).filter(|s| !s.is_empty()) {
                addresses.push(DirectoryAddress::new(
                    self.with_port(explicit),
                    AddressSource::Explicit,
                ));
            }
        }

        // Local configuration file
        if strategy.includes(AddressSource::Config) {
            match self.from_local_config(&self.config.local_config_path) {
                Ok(found) => addresses.extend(found),
                Err(e) => debug!(
                    "No directory from {}: {}",
                    self.config.local_config_path.display(),
                    e
                ),
            }
        }

        // Well-known address
        if strategy.includes(AddressSource::WellKnown) {
            let well_known = self.config.well_known_address.trim();
            if !well_known.is_empty() {
                addresses.push(DirectoryAddress::new(
                    self.with_port(well_known),
                    AddressSource::WellKnown,
                ));
            }
        }

        // Role/domain derived names
        if strategy.includes(AddressSource::Derived) {
            match self.derived() {
                Ok(found) => addresses.extend(found),
                Err(e) => debug!("No derived directory address: {}", e),
            }
        }

        if addresses.is_empty() {
            warn!("No directory address could be located ({:?})", strategy);
        } else {
            debug!(
                "Located directories: {}",
                addresses
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        addresses
    }

    fn from_local_config(&self, path: &Path) -> Result<Vec<DirectoryAddress>> {
        let content = fs::read_to_string(path)?;
        let file: LocalDirectoryFile = serde_json::from_str(&content)?;

        Ok(file
            .directory
            .into_iter()
            .chain(file.directories)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .map(|d| DirectoryAddress::new(self.with_port(&d), AddressSource::Config))
            .collect())
    }

    fn derived(&self) -> Result<Vec<DirectoryAddress>> {
        let domain = read_token(&self.config.domain_file)?.ok_or_else(|| {
            SvcDirError::ConfigError(format!(
                "{} is empty",
                self.config.domain_file.display()
            ))
        })?;
        // The role is optional; without it only the domain-wide directory is derived.
        let role = match read_token(&self.config.role_file) {
            Ok(role) => role,
            Err(e) => {
                debug!("Ignoring role file: {}", e);
                None
            }
        };

        let port = self.config.directory_port;
        let mut addresses = Vec::with_capacity(2);
        if let Some(role) = role {
            addresses.push(DirectoryAddress::new(
                format!("{}-directory.{}:{}", role, domain, port),
                AddressSource::Derived,
            ));
        }
        addresses.push(DirectoryAddress::new(
            format!("directory.{}:{}", domain, port),
            AddressSource::Derived,
        ));
        Ok(addresses)
    }

    /// Normalizes an address to `host:port`. A leading `http://` or `https://` and a
    /// trailing `/` are dropped.
    fn with_port(&self, address: &str) -> String {
        let address = address
            .strip_prefix("http://")
            .or_else(|| address.strip_prefix("https://"))
            .unwrap_or(address)
            .trim_end_matches('/');
        if has_port(address) {
            address.to_string()
        } else if address.contains(':') && !address.starts_with('[') {
            format!("[{}]:{}", address, self.config.directory_port)
        } else {
            format!("{}:{}", address, self.config.directory_port)
        }
    }
}

fn has_port(address: &str) -> bool {
    if let Some(rest) = address.strip_prefix('[') {
        return rest
            .split_once("]:")
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Reads a one-token metadata file. An empty file yields `None`.
fn read_token(path: &Path) -> Result<Option<String>> {
    let content = fs::read_to_string(path)?;
    let token = content.trim();
    if token.is_empty() {
        return Ok(None);
    }
    let valid = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && !token.starts_with('.')
        && !token.ends_with('.');
    if !valid {
        return Err(SvcDirError::ConfigError(format!(
            "malformed token {:?} in {}",
            token,
            path.display()
        )));
    }
    Ok(Some(token.to_ascii_lowercase()))
}
