//! Login orchestration.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::directory::IdentityDirectory;
use super::guard::{BruteForceGuard, GuardOutcome};
use super::token::TokenIssuer;
use super::verifier::CredentialVerifier;
use crate::config::LoginGuardConfig;
use crate::error::Result;
use crate::ratelimit::{normalize_login_key, GuardKey, Limiter};
use crate::store::CounterStore;

/// Outcome of a login attempt as seen by the caller.
///
/// A wrong secret and an unknown identity both produce
/// [`LoginDecision::InvalidCredentials`]; a blocked attempt says nothing about
/// the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum LoginDecision {
    Allow { identity_id: String, token: String },
    InvalidCredentials,
    RateLimited { retry_after_secs: u64 },
}

impl LoginDecision {
    /// HTTP status the web layer responds with.
    pub fn status_code(&self) -> u16 {
        match self {
            LoginDecision::Allow { .. } => 200,
            LoginDecision::InvalidCredentials => 400,
            LoginDecision::RateLimited { .. } => 429,
        }
    }

    /// Value for the `Retry-After` header, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LoginDecision::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Sequences identity lookup, the brute-force guard and token issuance.
pub struct LoginOrchestrator {
    guard: BruteForceGuard,
    directory: Arc<dyn IdentityDirectory>,
    tokens: Arc<dyn TokenIssuer>,
}

impl LoginOrchestrator {
    pub fn new(
        guard: BruteForceGuard,
        directory: Arc<dyn IdentityDirectory>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            guard,
            directory,
            tokens,
        }
    }

    /// Build the guard from configuration over an already connected store.
    pub fn from_config(
        config: &LoginGuardConfig,
        store: Arc<dyn CounterStore>,
        directory: Arc<dyn IdentityDirectory>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Result<Self> {
        config.validate()?;
        let guard = build_guard(config, store)?;
        Ok(Self::new(guard, directory, tokens))
    }

    pub fn guard(&self) -> &BruteForceGuard {
        &self.guard
    }

    /// Attempt a login.
    ///
    /// Errors are reserved for collaborator faults (identity lookup, token
    /// issuance). Counter store faults are absorbed by the guard.
    #[instrument(skip(self, login_key, candidate_secret, source_address), fields(address = %source_address))]
    pub async fn attempt_login(
        &self,
        login_key: &str,
        candidate_secret: &str,
        source_address: &str,
    ) -> Result<LoginDecision> {
        let login_key = normalize_login_key(login_key);
        let key = GuardKey::new(&login_key, source_address);

        let identity = self.directory.find_identity_by_login_key(&login_key).await?;
        let stored_hash = identity.as_ref().map(|i| i.stored_hash.as_str());

        match self.guard.check(&key, candidate_secret, stored_hash).await {
            GuardOutcome::Allowed => {
                // The guard only allows when a stored hash matched
                let Some(identity) = identity else {
                    return Ok(LoginDecision::InvalidCredentials);
                };
                let token = self.tokens.issue_token(&identity.identity_id)?;
                info!(identity_id = %identity.identity_id, "Login succeeded");
                Ok(LoginDecision::Allow {
                    identity_id: identity.identity_id,
                    token,
                })
            }
            GuardOutcome::CredentialRejected => Ok(LoginDecision::InvalidCredentials),
            GuardOutcome::Blocked {
                retry_after_secs,
                cause,
            } => {
                warn!(?cause, retry_after_secs, "Login rate limited");
                Ok(LoginDecision::RateLimited { retry_after_secs })
            }
        }
    }
}

/// Build the brute-force guard described by `config` over `store`.
pub fn build_guard(config: &LoginGuardConfig, store: Arc<dyn CounterStore>) -> Result<BruteForceGuard> {
    let timeout = Duration::from_millis(config.store.timeout_ms);
    let by_address = Limiter::new(
        "by_address",
        config.limiters.by_address.clone(),
        store.clone(),
        timeout,
    )?;
    let by_identity = Limiter::new(
        "by_identity_and_address",
        config.limiters.by_identity_and_address.clone(),
        store,
        timeout,
    )?;
    let verifier = Arc::new(CredentialVerifier::new(&config.hashing)?);

    BruteForceGuard::new(by_address, by_identity, verifier, config.guard.clone())
}
