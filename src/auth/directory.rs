//! Identity lookup.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoginGuardError, Result};
use crate::ratelimit::normalize_login_key;

/// A stored identity and its credential hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identifier the token is issued for
    pub identity_id: String,
    /// External login key, e.g. an email address
    pub login_key: String,
    /// PHC-format Argon2 hash of the secret
    pub stored_hash: String,
}

/// Source of identities, owned by the surrounding application.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Find the identity for a normalized login key.
    async fn find_identity_by_login_key(&self, login_key: &str) -> Result<Option<Identity>>;
}

/// An identity directory held in memory.
#[derive(Debug, Default)]
pub struct InMemoryIdentityDirectory {
    identities: RwLock<HashMap<String, Identity>>,
}

#[derive(Debug, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    identities: Vec<Identity>,
}

impl InMemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an identity. The login key is normalized.
    pub fn insert(&self, identity: Identity) {
        let key = normalize_login_key(&identity.login_key);
        self.identities.write().insert(key, identity);
    }

    pub fn len(&self) -> usize {
        self.identities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.read().is_empty()
    }

    /// Load identities from a YAML document with an `identities` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: IdentityFile = serde_yaml::from_str(yaml)
            .map_err(|e| LoginGuardError::Config(format!("Failed to parse identities: {}", e)))?;

        let directory = Self::new();
        for identity in file.identities {
            directory.insert(identity);
        }
        Ok(directory)
    }

    /// Load identities from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let directory = Self::from_yaml(&contents)?;
        info!(path = %path.display(), count = directory.len(), "Loaded identities");
        Ok(directory)
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn find_identity_by_login_key(&self, login_key: &str) -> Result<Option<Identity>> {
        Ok(self
            .identities
            .read()
            .get(&normalize_login_key(login_key))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, login_key: &str) -> Identity {
        Identity {
            identity_id: id.to_string(),
            login_key: login_key.to_string(),
            stored_hash: "$argon2id$placeholder".to_string(),
        }
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let directory = InMemoryIdentityDirectory::new();
        directory.insert(identity("1", "Thomas@Example.com"));

        let found = directory
            .find_identity_by_login_key("thomas@example.com")
            .await
            .unwrap();
        assert_eq!(found.unwrap().identity_id, "1");
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let directory = InMemoryIdentityDirectory::new();
        let found = directory.find_identity_by_login_key("nobody@x.com").await.unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_insert_replaces() {
        let directory = InMemoryIdentityDirectory::new();
        directory.insert(identity("1", "a@x.com"));
        directory.insert(identity("2", "A@x.com"));

        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_parse_identities_yaml() {
        let yaml = r#"
identities:
  - identity_id: "64f0c2"
    login_key: thomashatek@gmail.com
    stored_hash: "$argon2id$v=19$m=256,t=1,p=1$c2FsdHNhbHQ$aGFzaA"
  - identity_id: "64f0c3"
    login_key: rod@example.com
    stored_hash: "$argon2id$v=19$m=256,t=1,p=1$c2FsdHNhbHQ$aGFzaA"
"#;
        let directory = InMemoryIdentityDirectory::from_yaml(yaml).unwrap();
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = InMemoryIdentityDirectory::from_yaml("identities: 12");
        assert!(matches!(result, Err(LoginGuardError::Config(_))));
    }
}
