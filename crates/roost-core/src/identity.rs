//! Textual identity resolution.
//!
//! The sync engine consumes a 32-byte pubkey and never parses the textual
//! identifier itself; this module is the collaborator that does. Accepted
//! forms: `npub1…`, `nprofile1…` (which also carries hint relays), or a
//! 64-character hex pubkey.

use crate::error::{Error, Result};
use nostr::nips::nip19::{FromBech32, Nip19Profile};
use nostr::{PublicKey, RelayUrl};

/// A resolved identity: the pubkey plus any relay hints the identifier
/// carried (nprofile only).
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub pubkey: PublicKey,
    pub hint_relays: Vec<RelayUrl>,
}

/// Resolves a textual identifier to a pubkey.
pub trait IdentityResolver {
    fn resolve(&self, input: &str) -> Result<ResolvedIdentity>;
}

/// Default resolver for bech32 (NIP-19) and hex identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bech32Resolver;

impl IdentityResolver for Bech32Resolver {
    fn resolve(&self, input: &str) -> Result<ResolvedIdentity> {
        let input = input.trim();

        if let Ok(profile) = Nip19Profile::from_bech32(input) {
            return Ok(ResolvedIdentity {
                pubkey: profile.public_key,
                hint_relays: profile.relays,
            });
        }

        if let Ok(pubkey) = PublicKey::from_bech32(input) {
            return Ok(ResolvedIdentity {
                pubkey,
                hint_relays: Vec::new(),
            });
        }

        if let Ok(pubkey) = PublicKey::from_hex(input) {
            return Ok(ResolvedIdentity {
                pubkey,
                hint_relays: Vec::new(),
            });
        }

        Err(Error::InvalidIdentity(format!(
            "not an npub, nprofile, or hex pubkey: {}",
            input
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;
    use nostr::nips::nip19::ToBech32;

    #[test]
    fn test_resolves_npub() {
        let keys = Keys::generate();
        let npub = keys.public_key().to_bech32().unwrap();

        let resolved = Bech32Resolver.resolve(&npub).unwrap();
        assert_eq!(resolved.pubkey, keys.public_key());
        assert!(resolved.hint_relays.is_empty());
    }

    #[test]
    fn test_resolves_hex() {
        let keys = Keys::generate();
        let hex = keys.public_key().to_hex();

        let resolved = Bech32Resolver.resolve(&hex).unwrap();
        assert_eq!(resolved.pubkey, keys.public_key());
    }

    #[test]
    fn test_resolves_nprofile_with_hints() {
        let keys = Keys::generate();
        let relay = RelayUrl::parse("wss://relay.example.com").unwrap();
        let profile = Nip19Profile {
            public_key: keys.public_key(),
            relays: vec![relay.clone()],
        };
        let encoded = profile.to_bech32().unwrap();

        let resolved = Bech32Resolver.resolve(&encoded).unwrap();
        assert_eq!(resolved.pubkey, keys.public_key());
        assert_eq!(resolved.hint_relays, vec![relay]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Bech32Resolver.resolve("hello world").is_err());
        assert!(Bech32Resolver.resolve("nsec1qqqqqqqq").is_err());
    }

    #[test]
    fn test_trims_whitespace() {
        let keys = Keys::generate();
        let npub = format!("  {}  ", keys.public_key().to_bech32().unwrap());
        assert!(Bech32Resolver.resolve(&npub).is_ok());
    }
}
