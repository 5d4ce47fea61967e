//! NIP-65 relay list parsing.
//!
//! A kind:10002 event enumerates the relays a user has designated for the
//! outbox model: each `r` tag carries a relay URL and an optional `read` or
//! `write` marker. No marker means the relay serves both roles.
//!
//! The role is derived once here and never mutates during a sync run.

use crate::url::{NormalizeResult, normalize_relay_url};
use nostr::{Event, Kind, RelayUrl};
use std::collections::HashSet;

/// Which category of events a relay is designated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    /// Events mentioning the user are expected here.
    Read,
    /// Events authored by the user are expected here.
    Write,
    /// Both roles (no marker on the `r` tag).
    ReadWrite,
}

impl RelayRole {
    /// True if events authored by the user belong on this relay.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// True if events mentioning the user belong on this relay.
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }
}

/// A normalized relay URL plus its declared role.
#[derive(Debug, Clone)]
pub struct RelayDescriptor {
    pub url: RelayUrl,
    pub role: RelayRole,
}

/// Parse relay descriptors from a kind:10002 relay list event.
///
/// Invalid or blocked URLs are dropped with a debug log. Duplicate URLs
/// keep the first marker seen. Returns an empty list for any other kind.
pub fn parse_relay_list(event: &Event) -> Vec<RelayDescriptor> {
    if event.kind != Kind::RelayList {
        return Vec::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut descriptors = Vec::new();

    for tag in event.tags.iter() {
        let tag_vec: Vec<&str> = tag.as_slice().iter().map(|s| s.as_str()).collect();

        if tag_vec.first() != Some(&"r") || tag_vec.len() < 2 {
            continue;
        }

        let normalized = match normalize_relay_url(tag_vec[1]) {
            NormalizeResult::Ok(u) => u,
            NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
                tracing::debug!("Dropping relay list entry {}: {}", tag_vec[1], reason);
                continue;
            }
        };

        if !seen.insert(normalized.clone()) {
            continue;
        }

        let url = match RelayUrl::parse(&normalized) {
            Ok(u) => u,
            Err(e) => {
                tracing::debug!("Dropping relay list entry {}: {}", normalized, e);
                continue;
            }
        };

        let role = match tag_vec.get(2).copied() {
            Some("read") => RelayRole::Read,
            Some("write") => RelayRole::Write,
            _ => RelayRole::ReadWrite,
        };

        descriptors.push(RelayDescriptor { url, role });
    }

    descriptors
}

/// Relays designated for events authored by the user.
pub fn write_relays(descriptors: &[RelayDescriptor]) -> Vec<RelayUrl> {
    descriptors
        .iter()
        .filter(|d| d.role.is_write())
        .map(|d| d.url.clone())
        .collect()
}

/// Relays designated for events mentioning the user.
pub fn read_relays(descriptors: &[RelayDescriptor]) -> Vec<RelayUrl> {
    descriptors
        .iter()
        .filter(|d| d.role.is_read())
        .map(|d| d.url.clone())
        .collect()
}
