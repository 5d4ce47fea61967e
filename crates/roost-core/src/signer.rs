//! Event signing collaborators.
//!
//! The sync engine never holds key material. When a relay issues a NIP-42
//! authentication challenge, the transport consults an [`AuthPolicy`]
//! predicate and, if it approves, hands an unsigned kind:22242 event to the
//! configured [`SignerDelegate`].

use crate::error::{Error, Result};
use nostr::{Event, Keys, PublicKey, RelayUrl, UnsignedEvent};
use std::sync::Arc;

/// Signs event templates on behalf of the engine.
pub trait SignerDelegate: Send + Sync {
    /// The pubkey events will be signed under.
    fn public_key(&self) -> PublicKey;

    /// Sign an unsigned event template.
    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// In-process signer backed by a plain keypair.
pub struct KeysSigner {
    keys: Keys,
}

impl KeysSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    /// Ephemeral signer for relay auth when no user key is configured.
    pub fn ephemeral() -> Self {
        Self::new(Keys::generate())
    }
}

impl SignerDelegate for KeysSigner {
    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        unsigned
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Signer(e.to_string()))
    }
}

/// Predicate consulted when a relay issues an authentication challenge:
/// `(relay_url, challenge) -> respond?`.
pub type AuthPolicy = Arc<dyn Fn(&RelayUrl, &str) -> bool + Send + Sync>;

/// Policy that never responds to challenges.
pub fn auth_never() -> AuthPolicy {
    Arc::new(|_, _| false)
}

/// Policy that responds to every challenge.
pub fn auth_always() -> AuthPolicy {
    Arc::new(|_, _| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Kind};

    #[test]
    fn test_keys_signer_signs_template() {
        let signer = KeysSigner::ephemeral();
        let unsigned =
            EventBuilder::new(Kind::TextNote, "hello").build(signer.public_key());

        let event = signer.sign(unsigned).unwrap();
        assert_eq!(event.pubkey, signer.public_key());
        assert!(event.verify().is_ok());
    }

    #[test]
    fn test_policies() {
        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        assert!(!auth_never()(&url, "challenge"));
        assert!(auth_always()(&url, "challenge"));
    }
}
