use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Host name that asks the client to announce its own address.
pub const SELF_HOST: &str = "0.0.0.0";

/// Which locator strategy produced a directory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSource {
    /// Supplied by the caller or the `directory_override` setting.
    Explicit,
    /// Read from the local directory configuration file.
    Config,
    /// The fixed local address every host is expected to serve.
    WellKnown,
    /// Built from the deployment role/domain files.
    Derived,
}

/// A directory endpoint to contact, in `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectoryAddress {
    /// `host:port` of the directory.
    pub address: String,
    /// Strategy that produced this address. Diagnostics only.
    pub source: AddressSource,
}

impl DirectoryAddress {
    pub fn new(address: impl Into<String>, source: AddressSource) -> Self {
        DirectoryAddress {
            address: address.into(),
            source,
        }
    }
}

impl fmt::Display for DirectoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.address, self.source)
    }
}

/// One live instance of a service, as listed by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Candidate {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Everything needed to announce one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub service: String,
    pub version: String,
    /// Host to announce. [`SELF_HOST`] takes the host from the healthcheck URL.
    #[serde(default = "default_announce_host")]
    pub host: String,
    pub port: u16,
    /// URL the directory polls to decide whether the instance is alive.
    pub healthcheck: String,
    /// Extra key/value pairs forwarded to the directory.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_announce_host() -> String {
    SELF_HOST.to_string()
}

impl AnnounceRequest {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        healthcheck: impl Into<String>,
    ) -> Self {
        AnnounceRequest {
            service: service.into(),
            version: version.into(),
            host: host.into(),
            port,
            healthcheck: healthcheck.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds one metadata pair.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Identity of an announced instance. The host is the resolved IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnouncementKey {
    pub service: String,
    pub version: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for AnnouncementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} on {}:{}",
            self.service, self.version, self.host, self.port
        )
    }
}

/// A successful announcement remembered by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub key: AnnouncementKey,
    /// Host name the IP was resolved from; part of the IP cache key.
    pub hostname: String,
    /// Host exactly as the caller passed it (may be [`SELF_HOST`]).
    pub requested_host: String,
    /// Healthcheck URL as sent, after host rewriting.
    pub healthcheck: String,
    pub metadata: BTreeMap<String, String>,
    /// `host:port` of the directory instance that acknowledged the announce.
    pub served_by: String,
    /// Seconds since UNIX_EPOCH at announce time.
    pub announced_at: u64,
}

/// Default-version configuration the directory keeps for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVersionConfig {
    pub name: String,
    /// `None` when no version is configured.
    pub current_version: Option<String>,
    pub previous_version: Option<String>,
}

/// Per-call overrides for directory selection and routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Directory `host:port` tried before every other locator strategy.
    pub directory: Option<String>,
    /// Request-scoped routing override; takes precedence over client and configured ones.
    pub route: Option<String>,
}

impl RequestOptions {
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

/// Events published by the discovery client.
#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    /// An instance was announced, or an existing announcement was replaced.
    Announced(AnnouncementRecord),
    /// An instance was deannounced.
    Deannounced(AnnouncementKey),
    /// No directory could be reached on first use; the client now fails fast.
    DirectoryDisabled,
    /// The disabled state was cleared by the caller.
    DirectoryReenabled,
}

/// Current reachability status of the directory as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// No network operation has completed yet.
    Unknown,
    /// At least one directory answered.
    Available,
    /// The first attempt found no working directory. Calls fail with `Disabled`.
    Disabled,
}
