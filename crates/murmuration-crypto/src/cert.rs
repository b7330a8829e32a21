//! Client certificate fingerprinting. Mumble identifies registered users by
//! the SHA1 hash of their self-signed TLS client certificate rather than by
//! any server-held credential, so authentication is "whoever holds this key
//! pair" rather than a username/password scheme (passwords remain supported
//! as a fallback for unregistered/guest connections).

use sha1::{Digest, Sha1};

/// The SHA1 fingerprint of a DER-encoded certificate, formatted the way
/// Mumble clients display it: lowercase hex, grouped with colons.
pub fn fingerprint(der_cert: &[u8]) -> String {
    let digest = Sha1::digest(der_cert);
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_the_same_bytes() {
        let cert = b"not a real certificate, just some bytes";
        assert_eq!(fingerprint(cert), fingerprint(cert));
    }

    #[test]
    fn fingerprint_changes_with_the_input() {
        assert_ne!(fingerprint(b"cert-a"), fingerprint(b"cert-b"));
    }

    #[test]
    fn fingerprint_is_colon_grouped_hex() {
        let fp = fingerprint(b"cert");
        assert_eq!(fp.len(), 20 * 2 + 19);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));
    }
}
