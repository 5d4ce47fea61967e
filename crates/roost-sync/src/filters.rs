//! The two canonical engine filters.
//!
//! Write sync covers events authored by the user; read sync covers events
//! that mention the user via a `p` tag. Kind selection mirrors what relay
//! operators actually retain: notes, reposts, long-form articles on the
//! write side, plus reactions and zap receipts on the read side.

use nostr::{Filter, Kind, PublicKey};

/// Events authored by the user: kinds 1, 6, 30023.
pub fn write_filter(pubkey: PublicKey) -> Filter {
    Filter::new().author(pubkey).kinds([
        Kind::TextNote,
        Kind::Repost,
        Kind::Custom(30023), // long-form content
    ])
}

/// Events mentioning the user (`#p`): kinds 1, 6, 7, 9735.
pub fn read_filter(pubkey: PublicKey) -> Filter {
    Filter::new().pubkey(pubkey).kinds([
        Kind::TextNote,
        Kind::Repost,
        Kind::Reaction,
        Kind::Custom(9735), // zap receipt
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn test_write_filter_shape() {
        let keys = Keys::generate();
        let filter = write_filter(keys.public_key());
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(json["authors"][0], keys.public_key().to_hex());
        let kinds: Vec<u64> = json["kinds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k.as_u64().unwrap())
            .collect();
        assert!(kinds.contains(&1));
        assert!(kinds.contains(&6));
        assert!(kinds.contains(&30023));
        assert!(json.get("#p").is_none());
    }

    #[test]
    fn test_read_filter_shape() {
        let keys = Keys::generate();
        let filter = read_filter(keys.public_key());
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(json["#p"][0], keys.public_key().to_hex());
        let kinds: Vec<u64> = json["kinds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k.as_u64().unwrap())
            .collect();
        assert!(kinds.contains(&1));
        assert!(kinds.contains(&6));
        assert!(kinds.contains(&7));
        assert!(kinds.contains(&9735));
        assert!(json.get("authors").is_none());
    }
}
