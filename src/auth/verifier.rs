//! Credential verification using Argon2id.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{LoginGuardError, Result};

/// Argon2id cost parameters used for new hashes.
///
/// Verification reads the parameters embedded in each stored hash; these
/// values only shape hashes produced here, including the dummy hash checked
/// for unknown identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingConfig {
    /// Memory cost in KiB
    #[serde(default = "default_memory_cost")]
    pub memory_cost_kib: u32,
    /// Number of iterations
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,
    /// Degree of parallelism
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: default_memory_cost(),
            time_cost: default_time_cost(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_memory_cost() -> u32 {
    19_456
}

fn default_time_cost() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

impl HashingConfig {
    pub fn params(&self) -> Result<Params> {
        Params::new(self.memory_cost_kib, self.time_cost, self.parallelism, None)
            .map_err(|e| LoginGuardError::Config(format!("invalid Argon2 parameters: {e}")))
    }
}

/// Check a candidate secret against a PHC-format Argon2 hash.
///
/// A hash that cannot be parsed never matches.
pub fn verify(candidate: &str, stored_hash: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Stored credential hash is malformed");
            return false;
        }
    };

    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

/// Hash a secret with the given parameters.
pub fn hash_secret(secret: &str, params: Params) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| LoginGuardError::Hashing(e.to_string()))
}

/// Runs credential checks on the blocking thread pool.
#[derive(Clone)]
pub struct CredentialVerifier {
    params: Params,
    /// Checked in place of a real hash when the identity does not exist
    dummy_hash: String,
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl CredentialVerifier {
    pub fn new(config: &HashingConfig) -> Result<Self> {
        let params = config.params()?;
        let dummy_hash = hash_secret(&uuid::Uuid::new_v4().to_string(), params.clone())?;
        Ok(Self { params, dummy_hash })
    }

    /// Verify `candidate` against `stored_hash`.
    ///
    /// With no stored hash the dummy hash is checked instead, so an unknown
    /// identity costs the same work as a wrong secret, and the result is
    /// always `false`.
    pub async fn verify(&self, candidate: String, stored_hash: Option<String>) -> bool {
        let known = stored_hash.is_some();
        let hash = stored_hash.unwrap_or_else(|| self.dummy_hash.clone());

        match tokio::task::spawn_blocking(move || verify(&candidate, &hash)).await {
            Ok(matched) => known && matched,
            Err(e) => {
                error!(error = %e, "Credential verification task failed");
                false
            }
        }
    }

    /// Hash a secret with the configured parameters.
    pub async fn hash(&self, secret: String) -> Result<String> {
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || hash_secret(&secret, params))
            .await
            .map_err(|e| LoginGuardError::Hashing(format!("hashing task failed: {e}")))?
    }
}
