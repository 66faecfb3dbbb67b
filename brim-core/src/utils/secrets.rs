//! Credential resolution and redaction
//!
//! API credentials come from a provider (env vars or a file) and live in
//! `Secret` wrappers that never print their contents. Every resolved secret
//! is registered with the global redactor so no log sink can leak it.

use crate::config::SecretsConfig;
use crate::core::errors::SecretError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A string that refuses to display itself.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Explicit access for signing; never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: Secret,
    pub api_secret: Secret,
}

/// Replaces registered secret values in log output.
#[derive(Default, Clone)]
pub struct Redactor {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, value: &str) {
        if value.len() >= 4 {
            self.secrets.write().push(value.to_string());
        }
    }

    pub fn redact(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut out = input.to_string();
        for secret in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "***");
            }
        }
        out
    }
}

/// Resolve credentials per configuration; `None` yields no credentials,
/// which is the paper-mode default.
pub fn resolve(
    cfg: &SecretsConfig,
    redactor: &Redactor,
) -> Result<Option<Credentials>, SecretError> {
    let creds = match cfg {
        SecretsConfig::None => return Ok(None),
        SecretsConfig::Env {
            api_key_var,
            api_secret_var,
        } => {
            let key = std::env::var(api_key_var)
                .map_err(|_| SecretError::Unavailable(format!("env {api_key_var}")))?;
            let secret = std::env::var(api_secret_var)
                .map_err(|_| SecretError::Unavailable(format!("env {api_secret_var}")))?;
            Credentials {
                api_key: Secret::new(key),
                api_secret: Secret::new(secret),
            }
        }
        SecretsConfig::File { path } => {
            let content = std::fs::read_to_string(path)?;
            let mut lines = content.lines();
            let key = lines
                .next()
                .ok_or_else(|| SecretError::Unavailable("credentials file: missing key".into()))?;
            let secret = lines.next().ok_or_else(|| {
                SecretError::Unavailable("credentials file: missing secret".into())
            })?;
            Credentials {
                api_key: Secret::new(key.trim().to_string()),
                api_secret: Secret::new(secret.trim().to_string()),
            }
        }
    };

    redactor.register(creds.api_key.expose());
    redactor.register(creds.api_secret.expose());
    Ok(Some(creds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_never_debugs_its_value() {
        let secret = Secret::new("hunter2".to_string());
        assert_eq!(format!("{secret:?}"), "Secret(***)");
    }

    #[test]
    fn redactor_strips_registered_values() {
        let redactor = Redactor::new();
        redactor.register("super-secret-key");
        let line = "auth failed for key super-secret-key on venue";
        assert_eq!(redactor.redact(line), "auth failed for key *** on venue");
        // Unregistered content passes through.
        assert_eq!(redactor.redact("plain line"), "plain line");
    }

    #[test]
    fn file_provider_reads_two_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds");
        std::fs::write(&path, "the-key\nthe-secret\n").unwrap();
        let redactor = Redactor::new();
        let creds = resolve(&SecretsConfig::File { path }, &redactor)
            .unwrap()
            .unwrap();
        assert_eq!(creds.api_key.expose(), "the-key");
        assert_eq!(creds.api_secret.expose(), "the-secret");
        // Registered with the redactor.
        assert_eq!(redactor.redact("the-key"), "***");
    }

    #[test]
    fn none_provider_yields_no_credentials() {
        let redactor = Redactor::new();
        assert!(resolve(&SecretsConfig::None, &redactor).unwrap().is_none());
    }
}
