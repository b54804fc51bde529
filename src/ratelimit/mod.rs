//! Rate limiting logic over a shared counter store.

mod key;
mod limiter;

pub use key::{normalize_address, normalize_login_key, GuardKey};
pub use limiter::{Limiter, LimiterConfig, RateLimitResult};
