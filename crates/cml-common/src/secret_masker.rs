// Thread-safe store of secret values (repo tokens, runner registration
// tokens, OAuth client secrets) that are replaced in every trace line.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Secrets shorter than this are not masked; masking "a" would mangle every line.
const MIN_SECRET_LENGTH: usize = 4;

/// A thread-safe secret masker that replaces registered secret values
/// in arbitrary strings with `***`.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    /// Create a new empty `SecretMasker`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new secret value that should be masked in output.
    /// Blank and very short values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.len() < MIN_SECRET_LENGTH {
            return;
        }

        let mut secrets = self.inner.write();
        if !secrets.iter().any(|s| s == trimmed) {
            secrets.push(trimmed.to_string());
            // Longest first, so a secret containing another is masked whole.
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Register the values of the given environment variables, when set.
    pub fn add_env_values(&self, names: &[String]) {
        for name in names {
            if let Ok(value) = std::env::var(name) {
                self.add_value(&value);
            }
        }
    }

    /// Replace all registered secret values in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.inner.read();
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    /// Returns the number of registered secrets.
    pub fn secret_count(&self) -> usize {
        self.inner.read().len()
    }
}
