//! Relay URL normalization and validation.
//!
//! A NIP-65 document is arbitrary user-published input: the same relay can
//! appear with trailing slashes or mixed case, and nothing stops a document
//! from listing endpoints a reconciler must never dial. Normalizing once up
//! front keys the pool and the sighting index consistently; validation
//! refuses anything that does not look like a public websocket endpoint.
//!
//! Refused outright: non-websocket schemes, localhost and mDNS `.local`
//! names, and any literal IP that is not publicly routable (loopback,
//! RFC 1918, link-local, unspecified, and their IPv6 equivalents, including
//! IPv4 addresses smuggled in as mapped IPv6).

use nostr::RelayUrl;
use std::net::{IpAddr, Ipv4Addr};

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL points somewhere a relay list must not send us.
    Blocked(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL.
///
/// # Examples
///
/// ```
/// use roost_core::url::normalize_relay_url;
///
/// let normalized = normalize_relay_url("wss://Relay.Example.com/").ok();
/// assert_eq!(normalized.as_deref(), Some("wss://relay.example.com"));
///
/// assert!(!normalize_relay_url("ws://127.0.0.1:7777").is_ok());
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    let trimmed = url.trim();

    if let Some((scheme, _)) = trimmed.split_once("://")
        && scheme != "ws"
        && scheme != "wss"
    {
        return NormalizeResult::Invalid(format!(
            "unsupported scheme {}: relays speak ws:// or wss://",
            scheme
        ));
    }

    let parsed = match RelayUrl::parse(trimmed) {
        Ok(url) => url,
        Err(e) => return NormalizeResult::Invalid(format!("unparseable relay URL: {}", e)),
    };

    // The parser canonicalizes case; a root path collapses to no path.
    let normalized = parsed.to_string().trim_end_matches('/').to_string();

    match refusal_reason(&normalized) {
        Some(reason) => NormalizeResult::Blocked(reason),
        None => NormalizeResult::Ok(normalized),
    }
}

/// Why a syntactically valid relay URL must not be dialed, if any.
fn refusal_reason(url: &str) -> Option<String> {
    let authority = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = authority.split(['/', '?']).next().unwrap_or(authority);

    // Bracketed IPv6 literal, else strip an optional port
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split(']').next().unwrap_or(v6)
    } else {
        authority.rsplit_once(':').map_or(authority, |(h, _)| h)
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip_refusal(ip)
            .map(|class| format!("{} address {} is not a public relay", class, host));
    }

    let name = host.to_ascii_lowercase();
    if name == "localhost" || name.ends_with(".localhost") {
        return Some("localhost is not a public relay".to_string());
    }
    if name.ends_with(".local") {
        return Some(format!("mDNS name {} is not a public relay", host));
    }

    None
}

/// Classify a literal IP that has no business in a relay list.
fn ip_refusal(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => v4_refusal(v4),
        IpAddr::V6(v6) => {
            // An IPv4-mapped address answers for its embedded IPv4
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return v4_refusal(mapped);
            }
            if v6.is_loopback() {
                return Some("loopback");
            }
            if v6.is_unspecified() {
                return Some("unspecified");
            }
            let prefix = v6.segments()[0];
            if prefix & 0xffc0 == 0xfe80 {
                return Some("link-local");
            }
            if prefix & 0xfe00 == 0xfc00 {
                return Some("unique-local");
            }
            None
        }
    }
}

fn v4_refusal(ip: Ipv4Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        Some("loopback")
    } else if ip.is_private() {
        Some("private")
    } else if ip.is_link_local() {
        Some("link-local")
    } else if ip.is_unspecified() {
        Some("unspecified")
    } else {
        None
    }
}
