//! DNS resolution for host tokens that are not IP literals.
//!
//! Lookups are single-shot and synchronous; callers run them off the async
//! executor (the filter processes lines inside `spawn_blocking`).

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::WardenError;
use crate::net::{search, Address};

/// How a jail treats host tokens that are names rather than addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseDns {
    /// Never resolve; such matches are dropped.
    No,
    /// Resolve, but log a warning each time a resolved address is used.
    #[default]
    Warn,
    /// Resolve silently.
    Yes,
}

impl FromStr for UseDns {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "no" | "off" | "false" | "0" => Ok(UseDns::No),
            "warn" => Ok(UseDns::Warn),
            "yes" | "on" | "true" | "1" => Ok(UseDns::Yes),
            other => Err(WardenError::Config(format!(
                "usedns must be one of yes, warn, no (got '{}')",
                other
            ))),
        }
    }
}

impl fmt::Display for UseDns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UseDns::No => "no",
            UseDns::Warn => "warn",
            UseDns::Yes => "yes",
        };
        f.write_str(s)
    }
}

/// Resolve `name` to its addresses.
///
/// Returns an empty list when `mode` is [`UseDns::No`] or the lookup fails;
/// a failure is logged once.
pub fn resolve(name: &str, mode: UseDns) -> Vec<Address> {
    if mode == UseDns::No || name.is_empty() {
        return Vec::new();
    }
    match dns_lookup::lookup_host(name) {
        Ok(ips) => {
            let mut out: Vec<Address> = Vec::with_capacity(ips.len());
            for ip in ips {
                let addr = Address::from_ip(ip);
                // getaddrinfo returns one entry per socket type
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
            if mode == UseDns::Warn && !out.is_empty() {
                let list: Vec<String> = out.iter().map(|a| a.to_string()).collect();
                warn!("Determined IP using DNS lookup: {} = [{}]", name, list.join(", "));
            }
            out
        }
        Err(e) => {
            warn!("Unable to find a corresponding IP address for {}: {}", name, e);
            Vec::new()
        }
    }
}

/// Turn a captured host token into addresses. An IP literal is returned
/// directly, then an address embedded in the token (`1.2.3.4:22`), and only
/// then does the token go through [`resolve`].
pub fn text_to_addresses(text: &str, mode: UseDns) -> Vec<Address> {
    let addr = Address::parse(text);
    if addr.is_valid() {
        return vec![addr];
    }
    if let Some(found) = search(text) {
        return vec![found];
    }
    resolve(text, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usedns_parse() {
        assert_eq!("yes".parse::<UseDns>().unwrap(), UseDns::Yes);
        assert_eq!("ON".parse::<UseDns>().unwrap(), UseDns::Yes);
        assert_eq!("warn".parse::<UseDns>().unwrap(), UseDns::Warn);
        assert_eq!("off".parse::<UseDns>().unwrap(), UseDns::No);
        assert!("maybe".parse::<UseDns>().is_err());
    }

    #[test]
    fn test_usedns_display_roundtrip() {
        for mode in [UseDns::No, UseDns::Warn, UseDns::Yes] {
            assert_eq!(mode.to_string().parse::<UseDns>().unwrap(), mode);
        }
    }

    #[test]
    fn test_resolve_disabled() {
        assert!(resolve("localhost", UseDns::No).is_empty());
    }

    #[test]
    fn test_text_to_addresses_literal() {
        let addrs = text_to_addresses("192.0.2.7", UseDns::No);
        assert_eq!(addrs, vec![Address::parse("192.0.2.7")]);
    }

    #[test]
    fn test_text_to_addresses_embedded_literal() {
        assert_eq!(
            text_to_addresses("1.2.3.4:22", UseDns::No),
            vec![Address::parse("1.2.3.4")]
        );
        assert_eq!(
            text_to_addresses("[2001:db8::1]", UseDns::No),
            vec![Address::parse("2001:db8::1")]
        );
    }

    #[test]
    fn test_text_to_addresses_name_without_dns() {
        assert!(text_to_addresses("attacker.example", UseDns::No).is_empty());
    }

    #[test]
    fn test_resolve_localhost() {
        // localhost comes from /etc/hosts; skip quietly on hosts without it
        let addrs = resolve("localhost", UseDns::Yes);
        if !addrs.is_empty() {
            assert!(addrs.iter().all(|a| a.is_valid()));
        }
    }
}
