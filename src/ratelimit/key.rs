//! Guard key derivation.

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};

/// The pair of counter keys tracked for one login attempt.
///
/// `address_key` throttles every attempt from a source address.
/// `identity_key` throttles consecutive failures for one identity from one
/// address; it is a SHA-256 digest so arbitrary login keys cannot inject
/// separators into the store namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardKey {
    /// Normalized source address
    pub address_key: String,
    /// Hex digest of `{identity}_{address}`
    pub identity_key: String,
}

impl GuardKey {
    /// Derive the keys for a login key and a source address.
    pub fn new(login_key: &str, source_address: &str) -> Self {
        let identity = normalize_login_key(login_key);
        let address_key = normalize_address(source_address);

        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update(b"_");
        hasher.update(address_key.as_bytes());
        let identity_key = hex::encode(hasher.finalize());

        Self {
            address_key,
            identity_key,
        }
    }
}

impl std::fmt::Display for GuardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address_key, &self.identity_key[..12])
    }
}

/// Normalize a login key so `A@x.com ` and `a@x.com` share one counter.
pub fn normalize_login_key(login_key: &str) -> String {
    login_key.trim().to_lowercase()
}

/// Canonicalize IP addresses (IPv4-mapped IPv6 becomes IPv4). A socket
/// address keys on its IP only, since the source port changes with every
/// connection. Anything else is only trimmed.
pub fn normalize_address(source_address: &str) -> String {
    let trimmed = source_address.trim();
    if let Ok(socket) = trimmed.parse::<SocketAddr>() {
        return socket.ip().to_canonical().to_string();
    }
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_canonical().to_string(),
        Err(_) => trimmed.to_string(),
    }
}
