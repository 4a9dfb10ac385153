use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use url::Url;

use crate::cache::{IpCache, IpCacheKey};
use crate::classify::{self, Verdict};
use crate::codec;
use crate::config::ClientConfig;
use crate::error::{Result, SvcDirError};
use crate::iterator::CandidateIterator;
use crate::locator::EndpointLocator;
use crate::registry::AnnouncementRegistry;
use crate::resolver::{Clock, HostResolver, SystemClock, SystemResolver};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
use crate::types::{
    AnnounceRequest, AnnouncementKey, AnnouncementRecord, Candidate, ClientStatus,
    DirectoryAddress, DiscoveryEvent, RequestOptions, SELF_HOST, ServiceVersionConfig,
};
use crate::DiscoveryClient;

/// State shared between a client and the iterators it opened.
pub(crate) struct ClientInner {
    config: ClientConfig,
    locator: EndpointLocator,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn HostResolver>,
    clock: Arc<dyn Clock>,
    registry: AnnouncementRegistry,
    ip_cache: IpCache,
    status: RwLock<ClientStatus>,
    sender: broadcast::Sender<DiscoveryEvent>,
    /// Caller-supplied routing override, between request-scoped and configured ones.
    route_override: Option<String>,
}

impl ClientInner {
    fn status(&self) -> ClientStatus {
        match self.status.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_status(&self, status: ClientStatus) -> ClientStatus {
        let mut guard = match self.status.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, status)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.status() == ClientStatus::Disabled {
            debug!("Discovery disabled, failing fast");
            return Err(SvcDirError::Disabled);
        }
        Ok(())
    }

    fn mark_available(&self) {
        if self.status() != ClientStatus::Available {
            self.set_status(ClientStatus::Available);
        }
    }

    /// Disables the client when no directory has ever answered.
    fn mark_unreachable(&self) {
        let mut guard = match self.status.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard == ClientStatus::Unknown {
            *guard = ClientStatus::Disabled;
            drop(guard);
            error!("No working directory found on first use, disabling discovery");
            self.publish(DiscoveryEvent::DirectoryDisabled);
        }
    }

    fn publish(&self, event: DiscoveryEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.sender.send(event) {
            warn!("Failed to send discovery event: {}", e);
        }
    }

    fn locate(&self, options: &RequestOptions) -> Vec<DirectoryAddress> {
        let explicit = options
            .directory
            .as_deref()
            .or(self.config.directory_override.as_deref());
        self.locator
            .resolve_directory_addresses(self.config.locate_strategy, explicit)
    }

    /// Runs one logical operation against the located directories, in order, until one
    /// gives a final answer.
    fn exchange<T, E, C>(
        &self,
        operation: &str,
        options: &RequestOptions,
        encode: E,
        judge: C,
    ) -> Result<T>
    where
        E: Fn(&DirectoryAddress) -> Result<HttpRequest>,
        C: Fn(&HttpResponse) -> Verdict<T>,
    {
        self.ensure_enabled()?;

        // Locate directories and merge routing overrides
        let addresses = self.locate(options);
        let route = codec::merge_route_overrides(
            options.route.as_deref(),
            self.route_override.as_deref(),
            self.config.routing_override.as_deref(),
        );

        let mut last_failure = String::from("no directory address located");
        let mut fallback: Option<SvcDirError> = None;
        for directory in &addresses {
            let mut request = match encode(directory) {
                Ok(request) => request.with_timeout(self.config.request_timeout()),
                Err(e) => {
                    warn!("Cannot build {} request for {}: {}", operation, directory, e);
                    last_failure = e.to_string();
                    continue;
                }
            };
            if let Some(route) = &route {
                request = request.with_header(codec::ROUTE_HEADER, route.as_str());
            }

            // Try each directory in order; the first final answer wins
            let verdict = match self.transport.execute(&request) {
                Ok(response) => judge(&response),
                Err(e) => classify::transport_failure(&e),
            };
            match verdict {
                Verdict::Accept(value) => {
                    debug!("{} answered by {}", operation, directory);
                    self.mark_available();
                    return Ok(value);
                }
                Verdict::Reject(e) => {
                    debug!("{} rejected by {}: {}", operation, directory, e);
                    self.mark_available();
                    return Err(e);
                }
                Verdict::TryNext(reason) => {
                    warn!("{} via {} failed: {}", operation, directory, reason);
                    last_failure = format!("{}: {}", directory.address, reason);
                }
                Verdict::Fallback(e) => {
                    debug!("{} via {} gave {}, trying next", operation, directory, e);
                    last_failure = format!("{}: {}", directory.address, e);
                    if fallback.is_none() {
                        fallback = Some(e);
                    }
                }
            }
        }

        // Some directory answered, so this is not an outage
        if let Some(e) = fallback {
            self.mark_available();
            return Err(e);
        }

        self.mark_unreachable();
        Err(SvcDirError::NoDirectoryAvailable(format!(
            "{} failed on {} address(es), last: {}",
            operation,
            addresses.len(),
            last_failure
        )))
    }

    pub(crate) fn fetch_members(
        &self,
        service: &str,
        options: &RequestOptions,
    ) -> Result<Vec<Candidate>> {
        self.exchange(
            "resolve",
            options,
            |directory| codec::encode_member_list(directory, service),
            classify::member_list,
        )
    }

    fn resolve_ip(&self, host: &str) -> Result<String> {
        self.resolver
            .resolve(host)
            .map(|ip| ip.to_string())
            .map_err(|reason| SvcDirError::DnsResolve {
                host: host.to_string(),
                reason,
            })
    }

    fn announce(&self, request: &AnnounceRequest) -> Result<AnnouncementRecord> {
        validate_announce(request)?;
        let check_url = Url::parse(&request.healthcheck).map_err(|e| {
            SvcDirError::InvalidArgs(format!("healthcheck '{}': {}", request.healthcheck, e))
        })?;
        let hostname = if is_self_host(&request.host) {
            url_host(&check_url).ok_or_else(|| {
                SvcDirError::InvalidArgs(format!(
                    "no host in healthcheck '{}'",
                    request.healthcheck
                ))
            })?
        } else {
            request.host.clone()
        };

        self.ensure_enabled()?;

        // Resolve through the cache so the matching deannounce reuses this IP
        let cache_key =
            IpCacheKey::new(&request.service, &hostname, &request.version, request.port);
        let cached = self
            .ip_cache
            .get_or_resolve(&cache_key, |host| self.resolve_ip(host))?;
        let ip = cached.ip;
        // Point the healthcheck at the resolved IP
        let healthcheck = rewrite_healthcheck(&check_url, &hostname, &ip)
            .unwrap_or_else(|| request.healthcheck.clone());
        let key = AnnouncementKey {
            service: request.service.clone(),
            version: request.version.clone(),
            host: ip.clone(),
            port: request.port,
        };

        info!("Announcing {} (check {})", key, healthcheck);
        let outcome = self.exchange(
            "announce",
            &RequestOptions::default(),
            |directory| {
                codec::encode_announce(
                    directory,
                    &request.service,
                    &request.version,
                    &ip,
                    request.port,
                    &healthcheck,
                    &request.metadata,
                )
            },
            classify::announce,
        );

        match outcome {
            Ok(served_by) => {
                let record = AnnouncementRecord {
                    key,
                    hostname,
                    requested_host: request.host.clone(),
                    healthcheck,
                    metadata: request.metadata.clone(),
                    served_by,
                    announced_at: self.clock.now_secs(),
                };
                self.ip_cache.commit(&cache_key, &record.key.host);
                self.registry.upsert(record.clone());
                info!("Announced {} via {}", record.key, record.served_by);
                self.publish(DiscoveryEvent::Announced(record.clone()));
                Ok(record)
            }
            Err(e) => {
                self.ip_cache.release(&cache_key);
                warn!("Announce of {} failed: {}", key, e);
                Err(e)
            }
        }
    }

    fn deannounce(&self, service: &str, version: &str, host: &str, port: u16) -> Result<()> {
        validate_identity(service, version, port)?;
        self.ensure_enabled()?;

        // An unnamed host means the instance this client announced, else this machine
        let mut local = false;
        let hostname = if is_self_host(host) {
            match self.registry.find_requested(service, version, host, port) {
                Some(record) => record.hostname,
                None => {
                    local = true;
                    self.resolver.local_hostname().ok_or_else(|| {
                        SvcDirError::InvalidArgs("local host name cannot be determined".into())
                    })?
                }
            }
        } else {
            host.to_string()
        };

        let cache_key = IpCacheKey::new(service, &hostname, version, port);
        let ip = match self.ip_cache.get(&cache_key) {
            Some(ip) => ip,
            None if local => self.resolve_ip(&hostname)?,
            None => hostname.clone(),
        };
        let key = AnnouncementKey {
            service: service.to_string(),
            version: version.to_string(),
            host: ip,
            port,
        };

        info!("Deannouncing {}", key);
        self.exchange(
            "deannounce",
            &RequestOptions::default(),
            |directory| codec::encode_deannounce(directory, service, version, &key.host, port),
            classify::deannounce,
        )?;

        self.registry.remove(&key);
        self.ip_cache.remove(&cache_key);
        self.publish(DiscoveryEvent::Deannounced(key));
        Ok(())
    }

    fn deannounce_all(&self) -> Vec<(AnnouncementKey, Result<()>)> {
        let records = self.registry.snapshot();
        info!("Deannouncing {} announcement(s)", records.len());
        records
            .into_iter()
            .map(|record| {
                let outcome = self.deannounce(
                    &record.key.service,
                    &record.key.version,
                    &record.hostname,
                    record.key.port,
                );
                if let Err(e) = &outcome {
                    warn!("Deannounce of {} failed: {}", record.key, e);
                }
                (record.key, outcome)
            })
            .collect()
    }

    fn get_default_version(&self, service: &str) -> Result<ServiceVersionConfig> {
        require("service", service)?;
        self.exchange(
            "get default version",
            &RequestOptions::default(),
            |directory| codec::encode_version_get(directory, service),
            classify::version_read,
        )
    }

    fn set_default_version(&self, service: &str, version: &str) -> Result<ServiceVersionConfig> {
        require("service", service)?;
        require("version", version)?;
        let config = self.exchange(
            "set default version",
            &RequestOptions::default(),
            |directory| codec::encode_version_set(directory, service, version),
            |response| classify::version_write(response, version),
        )?;
        info!("Default version of {} is now {}", service, version);
        Ok(config)
    }

    fn delete_default_version(&self, service: &str) -> Result<()> {
        require("service", service)?;
        self.exchange(
            "delete default version",
            &RequestOptions::default(),
            |directory| codec::encode_version_delete(directory, service),
            classify::version_delete,
        )
    }
}

fn is_self_host(host: &str) -> bool {
    host.is_empty() || host == SELF_HOST
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SvcDirError::InvalidArgs(format!("{} cannot be empty", name)));
    }
    Ok(())
}

fn validate_identity(service: &str, version: &str, port: u16) -> Result<()> {
    require("service", service)?;
    require("version", version)?;
    if port == 0 {
        return Err(SvcDirError::InvalidArgs(
            "port must be in 1..=65535".into(),
        ));
    }
    Ok(())
}

fn validate_announce(request: &AnnounceRequest) -> Result<()> {
    validate_identity(&request.service, &request.version, request.port)?;
    let check = request.healthcheck.trim();
    if !(check.starts_with("http://") || check.starts_with("https://")) {
        return Err(SvcDirError::InvalidArgs(format!(
            "healthcheck must be an http:// or https:// URL, got '{}'",
            request.healthcheck
        )));
    }
    for key in request.metadata.keys() {
        if key.is_empty() || codec::RESERVED_PARAMS.contains(&key.as_str()) {
            return Err(SvcDirError::InvalidArgs(format!(
                "invalid metadata key '{}'",
                key
            )));
        }
    }
    Ok(())
}

/// Host of a URL without IPv6 brackets.
fn url_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

/// Points the healthcheck at `ip` when it names the announced host.
fn rewrite_healthcheck(check: &Url, hostname: &str, ip: &str) -> Option<String> {
    let host = url_host(check)?;
    if !host.eq_ignore_ascii_case(hostname) || host == ip {
        return None;
    }
    let mut rewritten = check.clone();
    let new_host = if ip.contains(':') {
        format!("[{}]", ip)
    } else {
        ip.to_string()
    };
    rewritten.set_host(Some(&new_host)).ok()?;
    Some(rewritten.to_string())
}

/// Builds a [`DirectoryClient`] with substitutable capabilities.
pub struct DirectoryClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn HostResolver>>,
    clock: Option<Arc<dyn Clock>>,
    route_override: Option<String>,
}

impl DirectoryClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Routing override applied to every request of this client.
    pub fn route_override(mut self, route: impl Into<String>) -> Self {
        self.route_override = Some(route.into());
        self
    }

    pub fn build(self) -> Result<DirectoryClient> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new().map_err(|e| SvcDirError::ConfigError(e.to_string()))?,
            ),
        };
        let (sender, _) = broadcast::channel(100);

        let inner = ClientInner {
            locator: EndpointLocator::new(self.config.clone()),
            config: self.config,
            transport,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(SystemResolver)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            registry: AnnouncementRegistry::new(),
            ip_cache: IpCache::new(),
            status: RwLock::new(ClientStatus::Unknown),
            sender,
            route_override: self.route_override,
        };
        Ok(DirectoryClient {
            inner: Arc::new(inner),
        })
    }
}

/// Discovery client talking to directory servers over a [`Transport`].
///
/// Each client owns its announcement registry and IP cache; independent clients share
/// nothing.
pub struct DirectoryClient {
    inner: Arc<ClientInner>,
}

impl DirectoryClient {
    /// Creates a client using the system transport, resolver and clock.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> DirectoryClientBuilder {
        DirectoryClientBuilder {
            config,
            transport: None,
            resolver: None,
            clock: None,
            route_override: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Directory addresses the next operation would try, in order.
    pub fn directories(&self) -> Vec<DirectoryAddress> {
        self.inner.locate(&RequestOptions::default())
    }

    /// Cached IP for an announced identity, if any.
    pub fn cached_ip(&self, service: &str, hostname: &str, version: &str, port: u16) -> Option<String> {
        self.inner
            .ip_cache
            .get(&IpCacheKey::new(service, hostname, version, port))
    }
}

impl DiscoveryClient for DirectoryClient {
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnouncementRecord> {
        self.inner.announce(request)
    }

    fn announce_from_config(&self) -> Result<AnnouncementRecord> {
        let request = self.inner.config.announce.as_ref().ok_or_else(|| {
            SvcDirError::InvalidArgs("configuration has no announce section".into())
        })?;
        self.inner.announce(request)
    }

    fn deannounce(&self, service: &str, version: &str, host: &str, port: u16) -> Result<()> {
        self.inner.deannounce(service, version, host, port)
    }

    fn deannounce_all(&self) -> Vec<(AnnouncementKey, Result<()>)> {
        self.inner.deannounce_all()
    }

    fn open(&self, service: &str) -> Result<CandidateIterator> {
        self.open_with(service, RequestOptions::default())
    }

    fn open_with(&self, service: &str, options: RequestOptions) -> Result<CandidateIterator> {
        require("service", service)?;
        Ok(CandidateIterator::new(
            Arc::clone(&self.inner),
            service.to_string(),
            options,
        ))
    }

    fn get_default_version(&self, service: &str) -> Result<ServiceVersionConfig> {
        self.inner.get_default_version(service)
    }

    fn set_default_version(&self, service: &str, version: &str) -> Result<ServiceVersionConfig> {
        self.inner.set_default_version(service, version)
    }

    fn delete_default_version(&self, service: &str) -> Result<()> {
        self.inner.delete_default_version(service)
    }

    fn announcements(&self) -> Vec<AnnouncementRecord> {
        self.inner.registry.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.sender.subscribe()
    }

    fn status(&self) -> ClientStatus {
        self.inner.status()
    }

    fn reset_disabled(&self) {
        if self.inner.set_status(ClientStatus::Unknown) == ClientStatus::Disabled {
            info!("Discovery re-enabled");
            self.inner.publish(DiscoveryEvent::DirectoryReenabled);
        }
    }
}

impl Drop for DirectoryClient {
    fn drop(&mut self) {
        if !self.inner.config.deannounce_on_drop || self.inner.registry.is_empty() {
            return;
        }
        info!("DirectoryClient is being dropped. Deannouncing remaining instances.");
        for (key, outcome) in self.inner.deannounce_all() {
            if let Err(e) = outcome {
                error!("Error deannouncing {} during drop: {}", key, e);
            }
        }
    }
}
