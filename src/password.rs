//! Credential hashing for agent logins

use std::sync::OnceLock;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash a plaintext password with Argon2id, returning the PHC string
/// (salt and parameters are embedded, so it can be stored in a single column)
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

/// Check a plaintext password against a stored PHC string.
///
/// Returns `Ok(false)` on mismatch, and an error only if the stored hash is malformed.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

/// Run a verification against a throwaway hash, costing the same as
/// [`verify_password`]. Used when there is no stored hash to check, so failed
/// logins for unknown and known usernames take the same time.
pub fn verify_dummy(password: &str) {
    if let Some(hash) = DUMMY_HASH.get_or_init(|| hash_password("unused").ok()) {
        let _ = verify_password(password, hash);
    }
}
