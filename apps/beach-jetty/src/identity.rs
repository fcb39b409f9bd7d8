use std::net::SocketAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex characters kept from the digest.
pub const IDENTITY_LEN: usize = 16;

/// Derive a peer identity from its announced label, the address of the
/// connection it was matched to, and the registration instant.
///
/// Deterministic for identical inputs. Truncation keeps a small collision
/// probability; the engine treats a colliding identity as a re-registration.
pub fn assign_identity(label: &str, address: SocketAddr, at: DateTime<Utc>) -> String {
    let material = format!(
        "{}_{}_{}_{}",
        label,
        address.ip(),
        address.port(),
        at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..IDENTITY_LEN].to_string()
}

/// Short throwaway label for a connection that has not registered yet.
pub fn temporary_label() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub fn is_identity(candidate: &str) -> bool {
    candidate.len() == IDENTITY_LEN && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn addr() -> SocketAddr {
        "10.0.0.7:50123".parse().unwrap()
    }

    #[test_timeout::timeout]
    fn identical_inputs_yield_identical_identity() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let first = assign_identity("PC1", addr(), at);
        let second = assign_identity("PC1", addr(), at);
        assert_eq!(first, second);
        assert_eq!(first.len(), IDENTITY_LEN);
        assert!(is_identity(&first));
    }

    #[test_timeout::timeout]
    fn timestamp_label_and_address_all_feed_the_hash() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = at + chrono::Duration::nanoseconds(1);
        let base = assign_identity("PC1", addr(), at);

        assert_ne!(base, assign_identity("PC1", addr(), later));
        assert_ne!(base, assign_identity("PC2", addr(), at));
        assert_ne!(
            base,
            assign_identity("PC1", "10.0.0.7:50124".parse().unwrap(), at)
        );
    }

    #[test_timeout::timeout]
    fn temporary_labels_are_short_and_distinct() {
        let a = temporary_label();
        let b = temporary_label();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
