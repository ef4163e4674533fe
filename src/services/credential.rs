//! Enrolled credential: hashing, comparison and storage
//!
//! Only the SHA-256 of the serialized pattern is ever stored. The plain zone
//! sequence never leaves memory.

use crate::domain::types::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential enrolled")]
    NotEnrolled,
    #[error("credential io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse credential file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("failed to serialize credential: {0}")]
    Serialize(String),
}

/// Lowercase hex SHA-256 of `pattern.serialize()`
pub fn hash_pattern(pattern: &Pattern) -> String {
    let digest = Sha256::digest(pattern.serialize().as_bytes());
    hex::encode(digest)
}

/// Compare without short-circuiting on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pattern_hash: String,
}

impl Credential {
    pub fn from_pattern(pattern: &Pattern) -> Self {
        Self { pattern_hash: hash_pattern(pattern) }
    }

    /// Wrap an existing hash; must be 64 hex digits
    pub fn from_hash(hash: &str) -> Option<Self> {
        let hash = hash.trim().to_ascii_lowercase();
        (hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
            .then_some(Self { pattern_hash: hash })
    }

    pub fn pattern_hash(&self) -> &str {
        &self.pattern_hash
    }

    pub fn matches(&self, pattern: &Pattern, constant_time: bool) -> bool {
        let candidate = hash_pattern(pattern);
        if constant_time {
            constant_time_eq(candidate.as_bytes(), self.pattern_hash.as_bytes())
        } else {
            candidate == self.pattern_hash
        }
    }
}

/// Persistence for the enrolled credential
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Credential, CredentialError>;
    fn store(&self, credential: &Credential) -> Result<(), CredentialError>;
    /// Remove the credential; returns false when nothing was enrolled
    fn clear(&self) -> Result<bool, CredentialError>;
}

/// TOML file holding `pattern_hash = "<hex>"`
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CredentialError {
        CredentialError::Io { path: self.path.clone(), source }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Credential, CredentialError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotEnrolled)
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let stored: Credential = toml::from_str(&content).map_err(|e| CredentialError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Credential::from_hash(&stored.pattern_hash).ok_or_else(|| CredentialError::Parse {
            path: self.path.clone(),
            reason: "pattern_hash is not a sha256 hex digest".to_string(),
        })
    }

    fn store(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let payload =
            toml::to_string(credential).map_err(|e| CredentialError::Serialize(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn clear(&self) -> Result<bool, CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// In-process store; also carries a credential supplied through config
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credential: parking_lot::Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self { credential: parking_lot::Mutex::new(Some(credential)) }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Credential, CredentialError> {
        self.credential.lock().clone().ok_or(CredentialError::NotEnrolled)
    }

    fn store(&self, credential: &Credential) -> Result<(), CredentialError> {
        *self.credential.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<bool, CredentialError> {
        Ok(self.credential.lock().take().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_is_sha256_of_serialized_pattern() {
        let pattern = Pattern::parse("1-2-3").unwrap();
        assert_eq!(
            hash_pattern(&pattern),
            "ba101947992ba0aad0d9074451ee3d37a65d881f7dd01e7ad45b6507c471f286"
        );
        assert_ne!(hash_pattern(&pattern), hash_pattern(&Pattern::parse("3-2-1").unwrap()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_credential_matches_both_modes() {
        let credential = Credential::from_pattern(&Pattern::parse("7-5-3").unwrap());
        let right = Pattern::parse("7-5-3").unwrap();
        let wrong = Pattern::parse("7-5-1").unwrap();
        for constant_time in [true, false] {
            assert!(credential.matches(&right, constant_time));
            assert!(!credential.matches(&wrong, constant_time));
        }
    }

    #[test]
    fn test_from_hash_validates() {
        assert!(Credential::from_hash("abc").is_none());
        assert!(Credential::from_hash(&"g".repeat(64)).is_none());
        let upper = "A".repeat(64);
        assert_eq!(Credential::from_hash(&upper).unwrap().pattern_hash(), "a".repeat(64));
    }

    #[test]
    fn test_file_store_roundtrip_and_clear() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/credential.toml"));
        assert!(matches!(store.load(), Err(CredentialError::NotEnrolled)));

        let credential = Credential::from_pattern(&Pattern::parse("1-5-9").unwrap());
        store.store(&credential).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("pattern_hash"));
        assert!(!content.contains("1-5-9"));
        assert_eq!(store.load().unwrap(), credential);

        assert!(store.clear().unwrap());
        assert!(!store.clear().unwrap());
        assert!(matches!(store.load(), Err(CredentialError::NotEnrolled)));
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credential.toml");
        fs::write(&path, "pattern_hash = \"not-a-hash\"\n").unwrap();
        let store = FileCredentialStore::new(&path);
        assert!(matches!(store.load(), Err(CredentialError::Parse { .. })));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert!(matches!(store.load(), Err(CredentialError::NotEnrolled)));
        let credential = Credential::from_pattern(&Pattern::parse("1-2-3").unwrap());
        store.store(&credential).unwrap();
        assert_eq!(store.load().unwrap(), credential);
        assert!(store.clear().unwrap());
    }
}
