//! DNSBL screening of connecting clients.
//!
//! The `--dnsbl` spec names the resolver to ask, a per-query timeout,
//! a threshold and the blocklist zones:
//! `resolver:port,timeout_ms,threshold,zone1,zone2,...`. A connecting
//! IPv4 address is reversed into each zone; at or above `threshold`
//! hits the connection is dropped before the greeting.

use std::{
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::Context;
use tracing::{debug, info};

pub struct Dnsbl {
    resolver: async_std_resolver::AsyncStdResolver,
    threshold: u32,
    zones: Vec<String>,
    enabled: AtomicBool,
}

impl Dnsbl {
    pub async fn from_spec(spec: &str) -> anyhow::Result<Dnsbl> {
        let fields: Vec<&str> = spec.split(',').map(str::trim).collect();
        anyhow::ensure!(
            fields.len() >= 4,
            "dnsbl spec needs resolver:port,timeout_ms,threshold,zone,..."
        );
        let dns: SocketAddr = fields[0]
            .parse()
            .with_context(|| format!("Bad dnsbl resolver address ‘{}’", fields[0]))?;
        let timeout_ms: u64 = fields[1]
            .parse()
            .with_context(|| format!("Bad dnsbl timeout ‘{}’", fields[1]))?;
        let threshold: u32 = fields[2]
            .parse()
            .with_context(|| format!("Bad dnsbl threshold ‘{}’", fields[2]))?;
        let zones: Vec<String> = fields[3..].iter().map(|z| z.to_string()).collect();

        let mut config = trust_dns_resolver::config::ResolverConfig::new();
        config.add_name_server(trust_dns_resolver::config::NameServerConfig {
            socket_addr: dns,
            protocol: trust_dns_resolver::config::Protocol::Udp,
            tls_dns_name: None,
            trust_nx_responses: true,
            bind_addr: None,
        });
        let mut opts = trust_dns_resolver::config::ResolverOpts::default();
        opts.timeout = Duration::from_millis(timeout_ms);
        let resolver = async_std_resolver::resolver(config, opts)
            .await
            .context("Configuring the dnsbl resolver")?;

        Ok(Dnsbl {
            resolver,
            threshold,
            zones,
            enabled: AtomicBool::new(true),
        })
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// True iff the peer should be turned away.
    pub async fn deny(&self, peer: IpAddr) -> bool {
        if !self.enabled() || self.threshold == 0 {
            return false;
        }
        let v4 = match peer {
            IpAddr::V4(v4) => v4,
            // Only IPv4 blocklists are queried
            IpAddr::V6(_) => return false,
        };
        let o = v4.octets();
        let mut hits = 0u32;
        for zone in &self.zones {
            let query = format!("{}.{}.{}.{}.{}.", o[3], o[2], o[1], o[0], zone);
            match self.resolver.lookup_ip(query.as_str()).await {
                Ok(lookup) if lookup.iter().next().is_some() => {
                    debug!(zone = zone.as_str(), peer = %peer, "dnsbl hit");
                    hits += 1;
                    if hits >= self.threshold {
                        info!(peer = %peer, hits = hits, "dnsbl deny");
                        return true;
                    }
                }
                _ => (),
            }
        }
        false
    }
}
