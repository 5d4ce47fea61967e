//! Core types, collaborator interfaces, and shared utilities for roost.
//!
//! This crate provides the leaves shared by the sync engine and the CLI:
//! - Relay URL normalization and validation
//! - NIP-65 relay list parsing (relay descriptors with role markers)
//! - The identity-resolver and signer-delegate collaborator interfaces
//! - Prometheus metrics helpers
//! - Shared error types

mod error;

pub mod identity;
pub mod metrics;
pub mod nip65;
pub mod signer;
pub mod url;

pub use error::{Error, Result};
pub use identity::{Bech32Resolver, IdentityResolver, ResolvedIdentity};
pub use nip65::{RelayDescriptor, RelayRole, parse_relay_list, read_relays, write_relays};
pub use signer::{AuthPolicy, KeysSigner, SignerDelegate, auth_always, auth_never};
pub use url::{NormalizeResult, normalize_relay_url};
