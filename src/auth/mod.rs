//! Credential login path: guard, verifier, orchestration and collaborators.

mod directory;
mod guard;
mod orchestrator;
mod token;
mod verifier;

pub use directory::{Identity, IdentityDirectory, InMemoryIdentityDirectory};
pub use guard::{BlockCause, BruteForceGuard, GuardConfig, GuardOutcome, GuardStatus};
pub use orchestrator::{build_guard, LoginDecision, LoginOrchestrator};
pub use token::{Claims, JwtTokenIssuer, TokenConfig, TokenIssuer};
pub use verifier::{hash_secret, verify, CredentialVerifier, HashingConfig};
