//! Password hashing with bcrypt.
//!
//! Stored hashes use the modular crypt format (`$2b$<cost>$...`), so the cost
//! and salt travel with the hash and verification does not depend on the
//! configured cost. Hashing takes milliseconds of CPU; the async helpers run
//! it on the blocking pool.

use std::sync::Arc;

use crate::error::{BrokerError, Result};

const MIN_COST: u32 = 4;
const MAX_COST: u32 = 31;

/// Computes and checks password hashes. Verification only compares; a hash
/// never yields the password back.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String>;

    /// False for a mismatch and for a hash this hasher cannot parse.
    fn verify(&self, password: &str, hash: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct BcryptPasswordHasher {
    cost: u32,
}

impl BcryptPasswordHasher {
    /// `cost` is clamped to the range bcrypt accepts.
    pub fn new(cost: u32) -> Self {
        Self {
            cost: cost.clamp(MIN_COST, MAX_COST),
        }
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptPasswordHasher {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl PasswordHasher for BcryptPasswordHasher {
    fn hash(&self, password: &str) -> Result<String> {
        bcrypt::hash(password, self.cost).map_err(|e| BrokerError::PasswordHash(e.to_string()))
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        match bcrypt::verify(password, hash) {
            Ok(matched) => matched,
            Err(e) => {
                tracing::debug!(error = %e, "Stored password hash is not a bcrypt hash");
                false
            }
        }
    }
}

/// Hash `password` on the blocking pool.
pub async fn hash_password(hasher: Arc<dyn PasswordHasher>, password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hasher.hash(&password))
        .await
        .map_err(|e| BrokerError::PasswordHash(e.to_string()))?
}

/// Check `password` against `hash` on the blocking pool.
pub async fn verify_password(
    hasher: Arc<dyn PasswordHasher>,
    password: String,
    hash: String,
) -> Result<bool> {
    tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
        .await
        .map_err(|e| BrokerError::PasswordHash(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_then_verify() {
        let hasher = BcryptPasswordHasher::new(4);
        let hash = hasher.hash("s3cret").unwrap();
        assert!(hash.starts_with("$2b$04$"));
        assert!(!hash.contains("s3cret"));
        assert!(hasher.verify("s3cret", &hash));
        assert!(!hasher.verify("wrong", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let hasher = BcryptPasswordHasher::new(4);
        assert_ne!(hasher.hash("same").unwrap(), hasher.hash("same").unwrap());
    }

    #[test]
    fn test_cost_comes_from_the_stored_hash() {
        let hash = BcryptPasswordHasher::new(4).hash("pw").unwrap();
        assert!(BcryptPasswordHasher::new(12).verify("pw", &hash));
    }

    #[test]
    fn test_cost_clamped() {
        assert_eq!(BcryptPasswordHasher::new(0).cost(), 4);
        assert_eq!(BcryptPasswordHasher::new(99).cost(), 31);
        assert_eq!(BcryptPasswordHasher::default().cost(), bcrypt::DEFAULT_COST);
    }

    #[test]
    fn test_malformed_hash_rejected() {
        let hasher = BcryptPasswordHasher::new(4);
        for bad in ["", "plain", "$2b$04$short", "sha256$1$00$00"] {
            assert!(!hasher.verify("pw", bad), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_blocking_helpers() {
        let hasher: Arc<dyn PasswordHasher> = Arc::new(BcryptPasswordHasher::new(4));
        let hash = hash_password(hasher.clone(), "pw".into()).await.unwrap();
        assert!(verify_password(hasher.clone(), "pw".into(), hash.clone()).await.unwrap());
        assert!(!verify_password(hasher, "nope".into(), hash).await.unwrap());
    }
}
