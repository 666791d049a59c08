use secrecy::SecretString;
use tracing::debug;

use super::error::{WorkerError, WorkerResult};
use super::types::{APIKeySource, AuthMethod};

/// Resolves a definition's API key. `None` for definitions that need no key.
pub fn resolve_api_key(source: &APIKeySource) -> WorkerResult<Option<SecretString>> {
    match source.method {
        AuthMethod::None => Ok(None),
        AuthMethod::Inline => {
            if source.value.is_empty() {
                return Err(WorkerError::Configuration(
                    "inline API key is empty".to_string(),
                ));
            }
            Ok(Some(SecretString::from(source.value.clone())))
        }
        AuthMethod::EnvVar => {
            if source.value.is_empty() {
                return Err(WorkerError::Configuration(
                    "env_var auth requires a variable name".to_string(),
                ));
            }
            debug!(variable = %source.value, "reading API key from environment");
            match std::env::var(&source.value) {
                Ok(key) if !key.is_empty() => Ok(Some(SecretString::from(key))),
                _ => Err(WorkerError::Configuration(format!(
                    "environment variable {} is not set",
                    source.value
                ))),
            }
        }
        AuthMethod::ConfigPath | AuthMethod::Vault => Err(WorkerError::NotImplemented(format!(
            "{} API key source",
            source.method
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use secrecy::ExposeSecret;

    fn source(method: AuthMethod, value: &str) -> APIKeySource {
        APIKeySource {
            method,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_inline_and_none() {
        let key = resolve_api_key(&source(AuthMethod::Inline, "sk-123"))
            .unwrap()
            .unwrap();
        assert_eq!(key.expose_secret(), "sk-123");
        assert!(resolve_api_key(&source(AuthMethod::None, ""))
            .unwrap()
            .is_none());
        assert_eq!(
            resolve_api_key(&source(AuthMethod::Inline, ""))
                .unwrap_err()
                .kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_env_var() {
        std::env::set_var("SCRIPTWORKS_TEST_API_KEY", "from-env");
        let key = resolve_api_key(&source(AuthMethod::EnvVar, "SCRIPTWORKS_TEST_API_KEY"))
            .unwrap()
            .unwrap();
        assert_eq!(key.expose_secret(), "from-env");

        let err = resolve_api_key(&source(AuthMethod::EnvVar, "SCRIPTWORKS_TEST_UNSET_KEY"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_reserved_methods() {
        for method in [AuthMethod::Vault, AuthMethod::ConfigPath] {
            let err = resolve_api_key(&source(method, "x")).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotImplemented);
        }
    }
}
