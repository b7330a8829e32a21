//! Registered-user password storage: PBKDF2-HMAC-SHA256 with a random salt
//! per password, iteration count baked into the stored string so it can be
//! raised later without invalidating existing hashes.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const ITERATIONS: u32 = 210_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Hash `password` for storage in `registered_users.password_hash`, as
/// `iterations$salt_hex$hash_hex`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, ITERATIONS, &mut out);
    format!("{ITERATIONS}${}${}", hex::encode(salt), hex::encode(out))
}

/// Check `password` against a stored hash produced by [`hash_password`].
/// Any malformed stored value is treated as a non-match rather than an
/// error — a corrupt row should never be verifiable.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(iterations), Some(salt_hex), Some(hash_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(hash_hex) else {
        return false;
    };

    let mut out = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut out);
    out == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_correct_password() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
    }

    #[test]
    fn rejects_wrong_password() {
        let stored = hash_password("hunter2");
        assert!(!verify_password("wrong", &stored));
    }

    #[test]
    fn rejects_malformed_stored_value() {
        assert!(!verify_password("hunter2", "not-a-valid-hash"));
    }
}
