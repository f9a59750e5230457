//! Bootstrap module
//!
//! Parsing and resolution of the configured bootstrap endpoints, which
//! receive HELLOs in addition to the LAN broadcast address.

use std::net::SocketAddr;
use tokio::net::lookup_host;
use tracing::{debug, warn};

/// Split a `host:port,host:port` list into trimmed, non-empty entries.
///
/// Entries without a numeric port are dropped with a warning.
pub fn split_bootstrap(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter(|entry| match entry.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => true,
            _ => {
                warn!("Ignoring bootstrap entry without host:port: {}", entry);
                false
            }
        })
        .map(str::to_string)
        .collect()
}

/// Resolve bootstrap entries through the system resolver.
///
/// Unresolvable entries are skipped; the first address of each resolved
/// entry is used.
pub async fn resolve_bootstrap(entries: &[String]) -> Vec<SocketAddr> {
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        match lookup_host(entry.as_str()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    debug!("Bootstrap {} resolved to {}", entry, addr);
                    if !resolved.contains(&addr) {
                        resolved.push(addr);
                    }
                }
                None => warn!("Bootstrap {} resolved to no addresses", entry),
            },
            Err(e) => warn!("Failed to resolve bootstrap {}: {}", entry, e),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_bootstrap() {
        let entries = split_bootstrap(" 10.0.0.2:40000, host.local:40001 ,,bad, :5, x:notaport");
        assert_eq!(entries, vec!["10.0.0.2:40000", "host.local:40001"]);
        assert!(split_bootstrap("").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let entries = vec![
            "127.0.0.1:40000".to_string(),
            "127.0.0.1:40000".to_string(),
            "127.0.0.1:40001".to_string(),
        ];
        let resolved = resolve_bootstrap(&entries).await;
        assert_eq!(
            resolved,
            vec![
                "127.0.0.1:40000".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:40001".parse::<SocketAddr>().unwrap(),
            ]
        );
    }
}
