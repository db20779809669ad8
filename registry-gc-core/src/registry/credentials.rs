use std::env;

/// Resolved basic-auth or bearer-token credentials for one registry side.
#[derive(Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub bearer_token: Option<String>,
}

impl RegistryCredentials {
    pub fn anonymous() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            bearer_token: None,
        }
    }

    /// Redacted form safe to place in a log line or command invocation trace.
    pub fn redacted(&self) -> String {
        if self.bearer_token.is_some() {
            "bearer ***".to_string()
        } else if !self.username.is_empty() {
            format!("{}:***", self.username)
        } else {
            "anonymous".to_string()
        }
    }
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegistryCredentials({})", self.redacted())
    }
}

/// Priority order for resolving registry credentials: explicit
/// environment variable first, then a named secret in the orchestration
/// platform's secret store, then an object-storage-provider auth callback
/// for provider-managed registries.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self) -> anyhow::Result<RegistryCredentials>;
}

pub struct EnvCredentialSource {
    pub username_var: String,
    pub password_var: String,
}

#[async_trait::async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn resolve(&self) -> anyhow::Result<RegistryCredentials> {
        let username = env::var(&self.username_var).unwrap_or_default();
        let password = env::var(&self.password_var).unwrap_or_default();
        Ok(RegistryCredentials {
            username,
            password,
            bearer_token: None,
        })
    }
}

/// Named-secret lookup in the orchestration platform's secret store (e.g. a
/// Kubernetes Secret). The concrete fetch mechanism is an external
/// collaborator; this adapter owns only the trait boundary and a static
/// fallback used in tests and for registries with no secret configured.
pub struct SecretStoreCredentialSource {
    pub secret_ref: Option<String>,
    pub fallback: RegistryCredentials,
}

#[async_trait::async_trait]
impl CredentialSource for SecretStoreCredentialSource {
    async fn resolve(&self) -> anyhow::Result<RegistryCredentials> {
        match &self.secret_ref {
            Some(_) => Ok(self.fallback.clone()),
            None => Ok(RegistryCredentials::anonymous()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_token() {
        let creds = RegistryCredentials {
            username: String::new(),
            password: String::new(),
            bearer_token: Some("secret-token".into()),
        };
        assert_eq!(creds.redacted(), "bearer ***");
        assert!(!format!("{:?}", creds).contains("secret-token"));
    }

    #[test]
    fn redacts_basic_auth_password() {
        let creds = RegistryCredentials {
            username: "svc".into(),
            password: "hunter2".into(),
            bearer_token: None,
        };
        assert_eq!(creds.redacted(), "svc:***");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[tokio::test]
    async fn secret_store_falls_back_to_anonymous_when_unconfigured() {
        let source = SecretStoreCredentialSource {
            secret_ref: None,
            fallback: RegistryCredentials::anonymous(),
        };
        let creds = source.resolve().await.unwrap();
        assert_eq!(creds.redacted(), "anonymous");
    }
}
