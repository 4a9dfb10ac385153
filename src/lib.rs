pub mod cache;
pub mod classify;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod iterator;
pub mod locator;
pub mod registry;
pub mod resolver;
pub mod transport;
pub mod types;

pub use client::{DirectoryClient, DirectoryClientBuilder};
pub use config::ClientConfig;
pub use error::{Result, ResultCode, SvcDirError};
pub use iterator::{CandidateIterator, IteratorState, ServiceIterator};
pub use locator::{EndpointLocator, LocateStrategy};
pub use resolver::{Clock, HostResolver, SystemClock, SystemResolver};
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, Method, Transport, TransportError,
    TransportErrorKind,
};
pub use types::{
    AddressSource, AnnounceRequest, AnnouncementKey, AnnouncementRecord, Candidate, ClientStatus,
    DirectoryAddress, DiscoveryEvent, RequestOptions, SELF_HOST, ServiceVersionConfig,
};

use std::sync::Arc;
use tokio::sync::broadcast;

/// Discovery Client Trait.
///
/// Defines the operations a process uses to find service instances and to register itself
/// with the directory.
pub trait DiscoveryClient: Sync + Send {
    /// Registers a server instance with the directory.
    ///
    /// Announcing the same `(service, version, host, port)` again replaces the earlier
    /// announcement.
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnouncementRecord>;

    /// Announces using the `announce` section of the client configuration.
    fn announce_from_config(&self) -> Result<AnnouncementRecord>;

    /// Unregisters a server instance.
    ///
    /// Uses the IP the matching announce resolved, so both calls name the same instance.
    fn deannounce(&self, service: &str, version: &str, host: &str, port: u16) -> Result<()>;

    /// Unregisters every instance this client announced.
    ///
    /// A failure on one instance does not stop the others; each outcome is returned.
    fn deannounce_all(&self) -> Vec<(AnnouncementKey, Result<()>)>;

    /// Opens an iterator over the live candidates of `service`.
    fn open(&self, service: &str) -> Result<CandidateIterator>;

    /// Like [`open`](Self::open), with a per-call directory or routing override.
    fn open_with(&self, service: &str, options: RequestOptions) -> Result<CandidateIterator>;

    /// Reads the default version the directory keeps for `service`.
    fn get_default_version(&self, service: &str) -> Result<ServiceVersionConfig>;

    /// Sets the default version and returns the directory's confirmation.
    fn set_default_version(&self, service: &str, version: &str) -> Result<ServiceVersionConfig>;

    /// Removes the default version of `service`.
    fn delete_default_version(&self, service: &str) -> Result<()>;

    /// Instances currently announced by this client.
    fn announcements(&self) -> Vec<AnnouncementRecord>;

    /// Subscribes to discovery events.
    ///
    /// Returns a `broadcast::Receiver` to receive announce, deannounce and availability events.
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// Gets the directory reachability status as seen by this client.
    fn status(&self) -> ClientStatus;

    /// Leaves the disabled state; the next call contacts the directories again.
    fn reset_disabled(&self);
}

/// Creates a discovery client using the system transport, resolver and clock.
///
/// # Arguments
/// * `config` - Client configuration. `SVCDIR_DIRECTORY` overrides its directory.
///
/// # Returns
/// A `Result` containing an `Arc` to a component that implements the `DiscoveryClient` trait,
/// or an `SvcDirError` if the configuration is invalid or the transport cannot be created.
pub fn create_discovery_client(config: ClientConfig) -> Result<Arc<dyn DiscoveryClient>> {
    let client = DirectoryClient::new(config.with_env_overrides())?;
    Ok(Arc::new(client))
}
