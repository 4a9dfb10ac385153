//! Host name resolution and time, injected so tests can count and pin them.

use std::net::{IpAddr, ToSocketAddrs};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

/// Forward DNS resolution and local host lookup.
pub trait HostResolver: Send + Sync {
    /// Resolves `host` to a single IP address.
    fn resolve(&self, host: &str) -> Result<IpAddr, String>;

    /// Name of the machine the client runs on, if it can be determined.
    fn local_hostname(&self) -> Option<String>;
}

/// Uses the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|e| e.to_string())?
            .map(|addr| addr.ip())
            .collect();

        // Prefer IPv4.
        let chosen = addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| format!("no addresses for {}", host))?;
        debug!("Resolved {} to {}", host, chosen);
        Ok(chosen)
    }

    fn local_hostname(&self) -> Option<String> {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Seconds since UNIX_EPOCH.
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}
