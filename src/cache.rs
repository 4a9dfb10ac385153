use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::error::Result;

/// Identity under which a resolved IP is remembered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpCacheKey {
    pub service: String,
    pub hostname: String,
    pub version: String,
    pub port: u16,
}

impl IpCacheKey {
    pub fn new(service: &str, hostname: &str, version: &str, port: u16) -> Self {
        IpCacheKey {
            service: service.to_string(),
            hostname: hostname.to_string(),
            version: version.to_string(),
            port,
        }
    }
}

/// Result of a resolve-through lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIp {
    pub ip: String,
    /// True when this lookup created the entry.
    pub inserted: bool,
}

/// One remembered resolution.
#[derive(Debug)]
struct CacheEntry {
    ip: String,
    /// Announces holding this entry that have not settled yet.
    in_flight: usize,
    /// Set once an announce using this entry succeeded.
    committed: bool,
}

/// Hostname to IP memory shared by announce and deannounce.
///
/// An announce resolves a host once; later announces and the matching deannounce reuse the
/// stored IP so both sides of the registration use the same identity.
///
/// Every successful [`get_or_resolve`](Self::get_or_resolve) must be settled by exactly one
/// [`commit`](Self::commit) or [`release`](Self::release). An entry that no announce ever
/// committed is dropped when its last holder releases it.
#[derive(Debug, Default)]
pub struct IpCache {
    entries: Mutex<HashMap<IpCacheKey, CacheEntry>>,
}

impl IpCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpCacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &IpCacheKey) -> Option<String> {
        self.lock().get(key).map(|entry| entry.ip.clone())
    }

    /// Returns the cached IP, calling `resolve` only on a miss, and holds the entry.
    ///
    /// Resolution runs without the lock held. If another thread stored an IP for the same key
    /// meanwhile, that value wins and is returned.
    pub fn get_or_resolve<F>(&self, key: &IpCacheKey, resolve: F) -> Result<CachedIp>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        if let Some(ip) = self.hold(key) {
            debug!("IP cache hit for {}: {}", key.hostname, ip);
            return Ok(CachedIp { ip, inserted: false });
        }

        let resolved = resolve(&key.hostname)?;

        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.in_flight += 1;
            return Ok(CachedIp {
                ip: entry.ip.clone(),
                inserted: false,
            });
        }
        entries.insert(
            key.clone(),
            CacheEntry {
                ip: resolved.clone(),
                in_flight: 1,
                committed: false,
            },
        );
        debug!("IP cache stored {} -> {}", key.hostname, resolved);
        Ok(CachedIp {
            ip: resolved,
            inserted: true,
        })
    }

    fn hold(&self, key: &IpCacheKey) -> Option<String> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        entry.in_flight += 1;
        Some(entry.ip.clone())
    }

    /// Settles a hold after a successful announce. The entry is kept until removed.
    ///
    /// Re-creates the entry if a concurrent deannounce removed it meanwhile.
    pub fn commit(&self, key: &IpCacheKey, ip: &str) {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            ip: ip.to_string(),
            in_flight: 1,
            committed: false,
        });
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.committed = true;
    }

    /// Settles a hold after a failed announce.
    pub fn release(&self, key: &IpCacheKey) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.in_flight == 0 && !entry.committed {
            entries.remove(key);
            debug!("IP cache dropped unused entry for {}", key.hostname);
        }
    }

    pub fn remove(&self, key: &IpCacheKey) -> Option<String> {
        self.lock().remove(key).map(|entry| entry.ip)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
