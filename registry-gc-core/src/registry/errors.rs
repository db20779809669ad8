use thiserror::Error;

/// Discriminated registry failure taxonomy. Transient, auth, and not-found
/// outcomes must never collapse into one variant — deletion correctness
/// depends on being able to tell "retry this" from "this is already gone".
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("image not found: {repository}:{tag}")]
    ImageNotFound { repository: String, tag: String },

    #[error("registry authentication failed for {repository}: {message}")]
    Auth { repository: String, message: String },

    #[error("transient registry error for {repository}: {message}")]
    Transient { repository: String, message: String },

    #[error("rate limited by registry for {repository}")]
    RateLimited { repository: String },

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("retries exhausted after {attempts} attempts for {repository}: {source}")]
    RetriesExhausted {
        repository: String,
        attempts: u32,
        #[source]
        source: Box<RegistryError>,
    },
}

impl RegistryError {
    /// Whether this outcome should ever be retried. Image-not-found and auth
    /// failures are both non-retryable, for opposite reasons: one is a
    /// legitimate terminal state, the other will never succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Transient { .. } | RegistryError::RateLimited { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::ImageNotFound { .. })
    }

    /// Classify a raw transport error string. Pattern-matched rather than
    /// typed, because the registry's v2 API flattens failures into an HTTP
    /// status plus a JSON `errors[]` body with no stable Rust-side type.
    pub fn classify(repository: &str, tag_or_context: &str, raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("404") || lower.contains("not found") || lower.contains("manifest unknown") {
            RegistryError::ImageNotFound {
                repository: repository.to_string(),
                tag: tag_or_context.to_string(),
            }
        } else if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
            RegistryError::Auth {
                repository: repository.to_string(),
                message: raw.to_string(),
            }
        } else if lower.contains("429") || lower.contains("too many requests") {
            RegistryError::RateLimited {
                repository: repository.to_string(),
            }
        } else {
            RegistryError::Transient {
                repository: repository.to_string(),
                message: raw.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_404_as_not_found() {
        let err = RegistryError::classify("env/foo", "abc123", "manifest unknown: 404 Not Found");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_401_as_auth_and_non_retryable() {
        let err = RegistryError::classify("env/foo", "abc123", "401 Unauthorized");
        assert!(!err.is_retryable());
        assert!(matches!(err, RegistryError::Auth { .. }));
    }

    #[test]
    fn classifies_connection_reset_as_transient_and_retryable() {
        let err = RegistryError::classify("env/foo", "abc123", "connection reset by peer");
        assert!(err.is_retryable());
        assert!(matches!(err, RegistryError::Transient { .. }));
    }

    #[test]
    fn classifies_429_as_rate_limited() {
        let err = RegistryError::classify("env/foo", "abc123", "429 Too Many Requests");
        assert!(err.is_retryable());
        assert!(matches!(err, RegistryError::RateLimited { .. }));
    }
}
