//! URL decomposition and hostname broadening helpers.
//!
//! These are deliberately coarse: the matching hot path only needs the
//! hostname, the origin, and the registrable domain, not a full URL parse.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::psl::PublicSuffixList;

// Cheap extraction for the common network schemes; userinfo and port are
// discarded, bracketed IPv6 literals are kept whole.
static RE_HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z][a-z0-9.+-]*://(?:[^/?#@\s]*@)?(\[[0-9a-fA-F:.]+\]|[^\s/?#:]+)")
        .unwrap()
});

static RE_ORIGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z][a-z0-9.+-]*://[^/?#\s]*").unwrap()
});

static RE_SCHEMA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([a-z][a-z0-9.+-]*):").unwrap()
});

static RE_IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+\.\d+$").unwrap());

/// The hostname part of `uri`, lowercased. `None` when the URI carries no
/// authority.
pub fn hostname_from_uri(uri: &str) -> Option<String> {
    let caps = RE_HOSTNAME.captures(uri)?;
    let hostname = caps.get(1)?.as_str();
    if hostname.is_empty() {
        return None;
    }
    Some(hostname.to_ascii_lowercase())
}

/// The `scheme://authority` prefix of `uri`, lowercased, or `""`.
pub fn origin_from_uri(uri: &str) -> String {
    match RE_ORIGIN.find(uri) {
        Some(m) => m.as_str().to_ascii_lowercase(),
        None => String::new(),
    }
}

/// The scheme of `uri`, lowercased, or `""`.
pub fn schema_of_uri(uri: &str) -> String {
    match RE_SCHEMA.captures(uri).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Coarse check, good enough to decide broadening behavior: dotted-quad or
/// bracketed IPv6 literal.
pub fn is_ip_address(hostname: &str) -> bool {
    hostname.starts_with('[') || RE_IPV4.is_match(hostname)
}

/// The registrable domain of `hostname`. IP addresses are their own
/// "domain"; hostnames without a registrable domain fall back to
/// themselves, so callers always have something to compare parties with.
pub fn domain_from_hostname<'a>(hostname: &'a str, psl: &PublicSuffixList) -> Cow<'a, str> {
    if is_ip_address(hostname) {
        return Cow::Borrowed(hostname);
    }
    let domain = psl.get_domain(hostname);
    if domain.is_empty() {
        Cow::Borrowed(hostname)
    } else {
        domain
    }
}

/// Label-boundary-safe suffix equality: `example.com` matches
/// `sub.example.com` but not `notanexample.com`.
pub fn is_first_party(domain: &str, hostname: &str) -> bool {
    if domain.is_empty() || !hostname.ends_with(domain) {
        return false;
    }
    let boundary = hostname.len() - domain.len();
    boundary == 0 || hostname.as_bytes()[boundary - 1] == b'.'
}

/// One broadening step: drop the leftmost label, then `*`, then nothing.
/// An IP address broadens directly to `*`.
pub fn to_broader_hostname(hostname: &str) -> Option<&str> {
    if hostname == "*" || hostname.is_empty() {
        return None;
    }
    if is_ip_address(hostname) {
        return Some("*");
    }
    match hostname.find('.') {
        Some(pos) => Some(&hostname[pos + 1..]),
        None => Some("*"),
    }
}

/// Self-inclusive broadening sequence:
/// `a.b.example.com`, `b.example.com`, `example.com`, `com`, `*`.
pub fn hostname_chain(hostname: &str) -> HostnameChain<'_> {
    HostnameChain {
        next: if hostname.is_empty() { None } else { Some(hostname) },
    }
}

pub struct HostnameChain<'a> {
    next: Option<&'a str>,
}

impl<'a> Iterator for HostnameChain<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.next?;
        self.next = to_broader_hostname(current);
        Some(current)
    }
}
