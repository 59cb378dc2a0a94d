//! Where the client finds its bearer token.
//!
//! The token is read fresh on every connect attempt, so a store may be
//! updated (for example after a login) while the client is running.

use std::path::PathBuf;
use std::sync::RwLock;
use tracing::warn;

/// Source of the authentication token attached at connect time.
pub trait TokenStore: Send + Sync {
    /// Current token, if any.
    fn token(&self) -> Option<String>;
}

/// Token held in memory.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    /// Create a store holding `token`.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the stored token.
    pub fn set(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Token persisted in a file, one token per file, surrounding whitespace
/// ignored. A missing or empty file means "no token".
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Read the token from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryTokenStore::new(None);
        assert!(store.token().is_none());
        store.set(Some("abc".into()));
        assert_eq!(store.token().as_deref(), Some("abc"));
    }

    #[test]
    fn test_file_store() {
        let path = std::env::temp_dir().join(format!(
            "skystage-token-test-{}",
            std::process::id()
        ));
        let store = FileTokenStore::new(&path);

        let _ = std::fs::remove_file(&path);
        assert!(store.token().is_none());

        std::fs::write(&path, "  bearer-value\n").unwrap();
        assert_eq!(store.token().as_deref(), Some("bearer-value"));

        std::fs::write(&path, "\n").unwrap();
        assert!(store.token().is_none());

        std::fs::remove_file(&path).unwrap();
    }
}
