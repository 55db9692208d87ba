//! Address parsing, normalization and CIDR containment.
//!
//! An [`Address`] is a value type: IPv4 or IPv6 with a prefix length, or the
//! raw text of something that did not parse (typically a hostname). Parsing
//! never fails; callers check [`Address::is_valid`].

use ipnet::IpNet;
use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use crate::dns::{self, UseDns};

/// Address family of a valid [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// A parsed IP address or network, or the raw text of an invalid entry.
#[derive(Debug, Clone)]
pub struct Address {
    net: Option<IpNet>,
    raw: String,
}

impl Address {
    /// Parse `text` as IPv4 dotted quad, then IPv6 (IPv4-mapped forms are
    /// folded to IPv4). A `/prefix` suffix and `[...]` brackets are accepted.
    pub fn parse(text: &str) -> Self {
        let raw = text.trim().to_string();
        let net = parse_net(&raw);
        Self { net, raw }
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        let ip = fold_mapped(ip);
        Self {
            net: Some(IpNet::from(ip)),
            raw: ip.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.net.is_some()
    }

    pub fn family(&self) -> Option<Family> {
        match self.net {
            Some(IpNet::V4(_)) => Some(Family::V4),
            Some(IpNet::V6(_)) => Some(Family::V6),
            None => None,
        }
    }

    /// Integer form of the (masked) address.
    pub fn as_u128(&self) -> Option<u128> {
        self.net.map(|n| match n.network() {
            IpAddr::V4(v4) => u32::from(v4) as u128,
            IpAddr::V6(v6) => u128::from(v6),
        })
    }

    pub fn prefix_len(&self) -> Option<u8> {
        self.net.map(|n| n.prefix_len())
    }

    /// True when the address carries a full-length prefix (a single host).
    pub fn is_host(&self) -> bool {
        self.net
            .map(|n| n.prefix_len() == n.max_prefix_len())
            .unwrap_or(false)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.net.map(|n| n.network())
    }

    pub fn net(&self) -> Option<IpNet> {
        self.net
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn fold_mapped(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn parse_net(text: &str) -> Option<IpNet> {
    if text.is_empty() {
        return None;
    }
    let (host, prefix) = match text.split_once('/') {
        Some((h, p)) => (h, Some(p.parse::<u8>().ok()?)),
        None => (text, None),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let ip: IpAddr = if let Ok(v4) = host.parse::<Ipv4Addr>() {
        IpAddr::V4(v4)
    } else {
        IpAddr::V6(host.parse::<Ipv6Addr>().ok()?)
    };

    let (ip, prefix) = match (ip, fold_mapped(ip)) {
        (IpAddr::V6(_), IpAddr::V4(v4)) => {
            // ::ffff:a.b.c.d/120 -> a.b.c.d/24
            let p = match prefix {
                Some(p) if p >= 96 => Some(p - 96),
                Some(_) => return IpNet::new(ip, prefix?).ok().map(|n| n.trunc()),
                None => None,
            };
            (IpAddr::V4(v4), p)
        }
        (orig, _) => (orig, prefix),
    };

    match prefix {
        Some(p) => IpNet::new(ip, p).ok().map(|n| n.trunc()),
        None => Some(IpNet::from(ip)),
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        match (&self.net, &other.net) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.raw == other.raw,
            _ => false,
        }
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.net {
            Some(n) => {
                self.family().hash(state);
                self.as_u128().hash(state);
                n.prefix_len().hash(state);
            }
            None => self.raw.hash(state),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.net {
            Some(n) if n.prefix_len() == n.max_prefix_len() => write!(f, "{}", n.network()),
            Some(n) => write!(f, "{}", n),
            None => f.write_str(&self.raw),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

/// True when `addr` lies inside `net`. Families must match; both sides are
/// masked to the prefix of `net` before comparison.
pub fn contains(net: &Address, addr: &Address) -> bool {
    let (Some(n), Some(a)) = (net.net, addr.net) else {
        return false;
    };
    if net.family() != addr.family() {
        return false;
    }
    match IpNet::new(a.network(), n.prefix_len()) {
        Ok(masked) => masked.trunc() == n.trunc(),
        Err(_) => false,
    }
}

fn ipv4_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9.])((?:[0-9]{1,3}\.){3}[0-9]{1,3})(?:$|[^0-9.])").ok()
    })
    .as_ref()
}

fn ipv6_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{0,4}(?::[0-9a-fA-F]{0,4}){2,7}(?:[0-9]{1,3}(?:\.[0-9]{1,3}){3})?")
            .ok()
    })
    .as_ref()
}

/// Find the first literal IP address embedded in `text`. IPv4 literals are
/// preferred over IPv6 ones.
pub fn search(text: &str) -> Option<Address> {
    for caps in ipv4_pattern()?.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            if let Ok(v4) = m.as_str().parse::<Ipv4Addr>() {
                return Some(Address::from_ip(IpAddr::V4(v4)));
            }
        }
    }
    ipv6_pattern()?
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<Ipv6Addr>().ok())
        .map(|v6| Address::from_ip(IpAddr::V6(v6)))
        .next()
}

/// One entry of a jail's ignore set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreEntry {
    /// An IP or CIDR network.
    Net(Address),
    /// A hostname, resolved each time it is consulted.
    Host(String),
}

impl IgnoreEntry {
    pub fn parse(text: &str) -> Self {
        let addr = Address::parse(text);
        if addr.is_valid() {
            IgnoreEntry::Net(addr)
        } else {
            IgnoreEntry::Host(text.trim().to_string())
        }
    }

    pub fn text(&self) -> String {
        match self {
            IgnoreEntry::Net(a) => a.to_string(),
            IgnoreEntry::Host(h) => h.clone(),
        }
    }
}

/// Ordered set of addresses, networks and hostnames that never get banned.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    entries: Vec<IgnoreEntry>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; returns false if an equal entry is already present.
    pub fn add(&mut self, text: &str) -> bool {
        let entry = IgnoreEntry::parse(text);
        if self.entries.contains(&entry) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Remove an entry; returns false if it was not present.
    pub fn remove(&mut self, text: &str) -> bool {
        let entry = IgnoreEntry::parse(text);
        let before = self.entries.len();
        self.entries.retain(|e| *e != entry);
        before != self.entries.len()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().map(IgnoreEntry::text).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `addr` is covered by any network entry or equals an address a
    /// hostname entry currently resolves to.
    pub fn is_ignored(&self, addr: &Address) -> bool {
        self.entries.iter().any(|entry| match entry {
            IgnoreEntry::Net(net) => contains(net, addr),
            IgnoreEntry::Host(name) => dns::resolve(name, UseDns::Yes)
                .iter()
                .any(|resolved| resolved == addr),
        })
    }
}
