//! Brute-force guard for the credential login path.
//!
//! Two limiters share one counter store:
//!
//! - **by address**: every failed attempt from a source address
//! - **by identity and address**: consecutive failures for one identity from
//!   one address, forgiven on success
//!
//! A login attempt moves from checking to exactly one of allowed, blocked or
//! credential rejected. Store faults never let an attempt through: any peek or
//! consume that fails turns into a short block.

use std::sync::Arc;

use futures::future::join;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::verifier::CredentialVerifier;
use crate::error::{LoginGuardError, Result};
use crate::ratelimit::{GuardKey, Limiter, RateLimitResult};
use crate::store::StoreError;

/// Guard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Retry hint returned when the counter store is unavailable
    #[serde(default = "default_fail_closed_retry")]
    pub fail_closed_retry_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            fail_closed_retry_secs: default_fail_closed_retry(),
        }
    }
}

fn default_fail_closed_retry() -> u64 {
    1
}

impl GuardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fail_closed_retry_secs == 0 {
            return Err(LoginGuardError::Config(
                "guard.fail_closed_retry_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why an attempt was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
    /// The source address used up its attempt budget
    AddressLimit,
    /// Too many consecutive failures for this identity from this address
    IdentityLimit,
    /// The counter store could not be reached
    StoreUnavailable,
}

/// Result of guarding one login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Allowed,
    CredentialRejected,
    Blocked {
        retry_after_secs: u64,
        cause: BlockCause,
    },
}

/// Current counters for a guard key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardStatus {
    pub by_address: Option<RateLimitResult>,
    pub by_identity: Option<RateLimitResult>,
    pub blocked: bool,
}

/// Composes the address and identity limiters into the login policy.
#[derive(Debug)]
pub struct BruteForceGuard {
    by_address: Limiter,
    by_identity: Limiter,
    verifier: Arc<CredentialVerifier>,
    config: GuardConfig,
}

impl BruteForceGuard {
    pub fn new(
        by_address: Limiter,
        by_identity: Limiter,
        verifier: Arc<CredentialVerifier>,
        config: GuardConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            by_address,
            by_identity,
            verifier,
            config,
        })
    }

    pub fn address_limiter(&self) -> &Limiter {
        &self.by_address
    }

    pub fn identity_limiter(&self) -> &Limiter {
        &self.by_identity
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    /// Guard one login attempt.
    ///
    /// `stored_hash` is `None` when the identity does not exist; the attempt
    /// then follows the wrong-secret path, including the hash work.
    pub async fn check(
        &self,
        key: &GuardKey,
        candidate_secret: &str,
        stored_hash: Option<&str>,
    ) -> GuardOutcome {
        let (by_address, by_identity) = match self.peek(key).await {
            Ok(states) => states,
            Err(e) => return self.fail_closed("peek", key, &e),
        };

        if let Some(outcome) = self.blocked_by(by_address.as_ref(), by_identity.as_ref()) {
            warn!(key = %key, outcome = ?outcome, "Login attempt rejected before credential check");
            return outcome;
        }

        let verified = self
            .verifier
            .verify(candidate_secret.to_string(), stored_hash.map(str::to_string))
            .await;

        if !verified {
            return self.record_failure(key).await;
        }

        let prior_failures = by_identity.map_or(0, |r| r.consumed_points);
        if prior_failures > 0 {
            match self.by_identity.reset(&key.identity_key).await {
                Ok(()) => debug!(key = %key, prior_failures, "Consecutive failures forgiven"),
                Err(e) => error!(
                    key = %key,
                    error = %e,
                    "Failed to reset identity limiter after successful login"
                ),
            }
        }

        GuardOutcome::Allowed
    }

    /// Read both counters for a key.
    pub async fn status(&self, key: &GuardKey) -> Result<GuardStatus> {
        let (by_address, by_identity) = self.peek(key).await?;
        let blocked = self
            .blocked_by(by_address.as_ref(), by_identity.as_ref())
            .is_some();
        Ok(GuardStatus {
            by_address,
            by_identity,
            blocked,
        })
    }

    /// Clear the identity counter for a key, and the address counter when
    /// `include_address` is set.
    pub async fn unblock(&self, key: &GuardKey, include_address: bool) -> Result<()> {
        self.by_identity.reset(&key.identity_key).await?;
        if include_address {
            self.by_address.reset(&key.address_key).await?;
        }
        warn!(key = %key, include_address, "Login guard counters cleared by operator");
        Ok(())
    }

    async fn peek(
        &self,
        key: &GuardKey,
    ) -> std::result::Result<(Option<RateLimitResult>, Option<RateLimitResult>), StoreError> {
        let (by_address, by_identity) = join(
            self.by_address.peek(&key.address_key),
            self.by_identity.peek(&key.identity_key),
        )
        .await;
        Ok((by_address?, by_identity?))
    }

    async fn record_failure(&self, key: &GuardKey) -> GuardOutcome {
        // Both consumes are always attempted; neither waits on the other
        let (by_address, by_identity) = join(
            self.by_address.consume(&key.address_key),
            self.by_identity.consume(&key.identity_key),
        )
        .await;

        let (by_address, by_identity) = match (by_address, by_identity) {
            (Ok(a), Ok(i)) => (a, i),
            (Err(e), _) | (_, Err(e)) => return self.fail_closed("consume", key, &e),
        };

        match self.blocked_by(Some(&by_address), Some(&by_identity)) {
            Some(outcome) => {
                warn!(
                    key = %key,
                    outcome = ?outcome,
                    address_points = by_address.consumed_points,
                    identity_points = by_identity.consumed_points,
                    "Failed login exhausted a limiter"
                );
                outcome
            }
            None => {
                debug!(
                    key = %key,
                    address_remaining = by_address.remaining_points,
                    identity_remaining = by_identity.remaining_points,
                    "Invalid credentials"
                );
                GuardOutcome::CredentialRejected
            }
        }
    }

    /// The block outcome for the exhausted limiters, waiting for the longest.
    fn blocked_by(
        &self,
        by_address: Option<&RateLimitResult>,
        by_identity: Option<&RateLimitResult>,
    ) -> Option<GuardOutcome> {
        let address = by_address
            .filter(|r| self.by_address.is_exhausted(r))
            .map(|r| (r.retry_after_secs(), BlockCause::AddressLimit));
        let identity = by_identity
            .filter(|r| self.by_identity.is_exhausted(r))
            .map(|r| (r.retry_after_secs(), BlockCause::IdentityLimit));

        let (retry_after_secs, cause) = match (address, identity) {
            (Some(a), Some(i)) => {
                if i.0 > a.0 {
                    i
                } else {
                    a
                }
            }
            (Some(a), None) => a,
            (None, Some(i)) => i,
            (None, None) => return None,
        };

        Some(GuardOutcome::Blocked {
            retry_after_secs,
            cause,
        })
    }

    fn fail_closed(&self, operation: &str, key: &GuardKey, e: &StoreError) -> GuardOutcome {
        error!(
            key = %key,
            operation,
            backend = e.backend(),
            error = %e,
            "Counter store unavailable, blocking login attempt"
        );
        GuardOutcome::Blocked {
            retry_after_secs: self.config.fail_closed_retry_secs,
            cause: BlockCause::StoreUnavailable,
        }
    }
}
