//! Whitelist resolution
//!
//! Addresses, CIDR blocks and resolved domain names exempt from
//! tracking. Domains are resolved on `resolve()` and folded into the
//! allow-set; membership queries never touch DNS.

use ipnetwork::IpNetwork;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::config::WhitelistConfig;

/// Resolves a domain name to addresses
pub trait NameResolver: Send + Sync {
    fn resolve(&self, domain: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the platform's name resolution
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn resolve(&self, domain: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = (domain, 0).to_socket_addrs()?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Allow-set of exact addresses and networks
///
/// Clones share the name resolver.
#[derive(Clone)]
pub struct WhitelistResolver {
    addresses: Vec<IpAddr>,
    networks: Vec<IpNetwork>,
    domains: Vec<String>,
    resolver: Arc<dyn NameResolver>,
}

impl WhitelistResolver {
    /// Build a whitelist using the system resolver for domains
    pub fn new(config: &WhitelistConfig) -> Self {
        Self::with_resolver(config, Box::new(SystemResolver))
    }

    pub fn with_resolver(config: &WhitelistConfig, resolver: Box<dyn NameResolver>) -> Self {
        let mut whitelist = WhitelistResolver {
            addresses: Vec::new(),
            networks: Vec::new(),
            domains: Vec::new(),
            resolver: Arc::from(resolver),
        };
        whitelist.reload(config);
        whitelist
    }

    /// Replace all rules with the ones in `config`
    ///
    /// Resolved domain addresses are dropped too; they come back on the
    /// next `resolve()`.
    pub fn reload(&mut self, config: &WhitelistConfig) {
        self.addresses.clear();
        self.networks.clear();

        for entry in &config.ips {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                self.add_address(ip);
            } else if let Ok(network) = entry.parse::<IpNetwork>() {
                if !self.networks.contains(&network) {
                    self.networks.push(network);
                }
            } else {
                log::warn!("Ignoring invalid whitelist entry '{}'", entry);
            }
        }

        self.domains = config
            .domains
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        log::debug!(
            "Whitelist loaded: {} addresses, {} networks, {} domains",
            self.addresses.len(),
            self.networks.len(),
            self.domains.len()
        );
    }

    /// Resolve the configured domains, adding any new address
    ///
    /// Resolution failures are logged and skipped. Returns the number of
    /// addresses added.
    pub fn resolve(&mut self) -> usize {
        let mut added = 0;
        let domains = self.domains.clone();

        for domain in &domains {
            match self.resolver.resolve(domain) {
                Ok(ips) => {
                    for ip in ips {
                        if self.add_address(ip) {
                            log::info!(
                                "Domain '{}' resolved to '{}' and added to the whitelist",
                                domain,
                                ip
                            );
                            added += 1;
                        }
                    }
                }
                Err(e) => {
                    log::error!("Error resolving domain '{}': {}", domain, e);
                }
            }
        }

        added
    }

    /// Check whether a raw address string is exempt
    ///
    /// Strings that do not parse as an address (such as `-`) are treated
    /// as whitelisted so they are never written to the ledger.
    pub fn is_whitelisted(&self, address: &str) -> bool {
        match address.trim().parse::<IpAddr>() {
            Ok(ip) => self.contains(ip),
            Err(_) => {
                log::debug!("Treating unparseable address '{}' as whitelisted", address);
                true
            }
        }
    }

    /// Check whether a parsed address is exempt
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.addresses.contains(&ip) || self.networks.iter().any(|n| n.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.addresses.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_address(&mut self, ip: IpAddr) -> bool {
        if self.addresses.contains(&ip) {
            return false;
        }
        self.addresses.push(ip);
        true
    }
}
