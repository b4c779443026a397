//! Authentication gate: bearer tokens for the control API

use crate::config::AuthSettings;
use crate::error::{GatewayError, Result};
use crate::operators::OperatorStore;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Operator identifier
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub token_ttl_secs: u64,
}

impl AuthConfig {
    /// Build from settings, generating a process-local secret when none is configured
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let secret = match &settings.token_secret {
            Some(secret) => secret.clone(),
            None => hex::encode(rand::random::<[u8; 32]>()),
        };
        Self {
            secret,
            token_ttl_secs: settings.token_ttl_secs,
        }
    }
}

/// The authenticated operator, attached to each control API request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub operator_id: String,
    pub identifier: String,
}

/// Result of a successful token issuance
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct AuthGate {
    config: Arc<AuthConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    operators: OperatorStore,
}

impl AuthGate {
    pub fn new(config: AuthConfig, operators: OperatorStore) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config: Arc::new(config),
            encoding_key,
            decoding_key,
            operators,
        }
    }

    /// Exchange credentials for a signed token
    pub fn issue_token(&self, identifier: &str, secret: &str) -> Result<IssuedToken> {
        let operator = self.operators.verify(identifier, secret)?;

        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.token_ttl_secs as i64);
        let claims = Claims {
            sub: operator.identifier,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Store(format!("token signing failed: {}", e)))?;

        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
        })
    }

    /// Verify a token and resolve the operator it was issued to.
    ///
    /// Tokens of operators that no longer exist are rejected.
    pub fn authenticate(&self, token: &str) -> Result<Identity> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            GatewayError::Unauthenticated
        })?;

        let operator = self
            .operators
            .find_by_identifier(&data.claims.sub)?
            .ok_or(GatewayError::Unauthenticated)?;

        Ok(Identity {
            operator_id: operator.id,
            identifier: operator.identifier,
        })
    }

    /// Authenticate the value of an `Authorization` header
    pub fn authenticate_header(&self, header: Option<&str>) -> Result<Identity> {
        let token = header
            .and_then(extract_bearer)
            .ok_or(GatewayError::Unauthenticated)?;
        self.authenticate(token)
    }
}

/// Extract the token from `Bearer <token>`. Other schemes are ignored.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_config() -> AuthConfig {
        AuthConfig {
            secret: "test-secret-key-for-jwt-testing".to_string(),
            token_ttl_secs: 24 * 3600,
        }
    }

    fn operators() -> OperatorStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = OperatorStore::with_hash_iterations(db, 10);
        store.create("admin@localhost", "hunter2").unwrap();
        store
    }

    #[test]
    fn test_issue_and_authenticate() {
        let ops = operators();
        let gate = AuthGate::new(test_config(), ops.clone());

        let issued = gate.issue_token("admin@localhost", "hunter2").unwrap();
        let identity = gate.authenticate(&issued.token).unwrap();

        let operator = ops.find_by_identifier("admin@localhost").unwrap().unwrap();
        assert_eq!(identity.identifier, "admin@localhost");
        assert_eq!(identity.operator_id, operator.id);
    }

    #[test]
    fn test_token_expiry_matches_ttl() {
        let gate = AuthGate::new(
            AuthConfig {
                token_ttl_secs: 3600,
                ..test_config()
            },
            operators(),
        );
        let issued = gate.issue_token("admin@localhost", "hunter2").unwrap();

        let now = Utc::now().timestamp();
        assert!(issued.expires_at > now);
        assert!(issued.expires_at <= now + 3600 + 1);
    }

    #[test]
    fn test_bad_credentials_are_unauthorized() {
        let gate = AuthGate::new(test_config(), operators());
        assert!(matches!(
            gate.issue_token("admin@localhost", "wrong"),
            Err(GatewayError::Unauthorized)
        ));
        assert!(matches!(
            gate.issue_token("ghost@localhost", "hunter2"),
            Err(GatewayError::Unauthorized)
        ));
    }

    #[test]
    fn test_corrupted_signature_never_authenticates() {
        let gate = AuthGate::new(test_config(), operators());
        let token = gate.issue_token("admin@localhost", "hunter2").unwrap().token;

        let (head, sig) = token.rsplit_once('.').unwrap();
        let mut sig: Vec<char> = sig.chars().collect();
        sig[0] = if sig[0] == 'A' { 'B' } else { 'A' };
        let forged = format!("{}.{}", head, sig.into_iter().collect::<String>());

        assert!(matches!(gate.authenticate(&forged), Err(GatewayError::Unauthenticated)));
        assert!(matches!(
            gate.authenticate("invalid.token.here"),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[test]
    fn test_rotated_secret_invalidates_tokens() {
        let ops = operators();
        let gate1 = AuthGate::new(test_config(), ops.clone());
        let token = gate1.issue_token("admin@localhost", "hunter2").unwrap().token;

        let gate2 = AuthGate::new(
            AuthConfig {
                secret: "different-secret".to_string(),
                ..test_config()
            },
            ops,
        );
        assert!(matches!(gate2.authenticate(&token), Err(GatewayError::Unauthenticated)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = test_config();
        let gate = AuthGate::new(config.clone(), operators());

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "admin@localhost".to_string(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.secret.as_bytes()),
        )
        .unwrap();

        assert!(matches!(gate.authenticate(&token), Err(GatewayError::Unauthenticated)));
    }

    #[test]
    fn test_deleted_operator_loses_access() {
        let ops = operators();
        let other = ops.create("second@localhost", "pw").unwrap();
        let gate = AuthGate::new(test_config(), ops.clone());
        let token = gate.issue_token("second@localhost", "pw").unwrap().token;
        assert!(gate.authenticate(&token).is_ok());

        ops.delete(&other.id).unwrap();
        assert!(matches!(gate.authenticate(&token), Err(GatewayError::Unauthenticated)));
    }

    #[test]
    fn test_authenticate_header() {
        let gate = AuthGate::new(test_config(), operators());
        let token = gate.issue_token("admin@localhost", "hunter2").unwrap().token;

        let header = format!("Bearer {}", token);
        assert!(gate.authenticate_header(Some(&header)).is_ok());
        assert!(matches!(
            gate.authenticate_header(None),
            Err(GatewayError::Unauthenticated)
        ));
        assert!(matches!(
            gate.authenticate_header(Some(&format!("Basic {}", token))),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Basic abc123"), None);
        assert_eq!(extract_bearer("abc123"), None);
    }

    #[test]
    fn test_generated_secret_when_unset() {
        let settings = AuthSettings {
            token_secret: None,
            token_ttl_secs: 60,
        };
        let a = AuthConfig::from_settings(&settings);
        let b = AuthConfig::from_settings(&settings);
        assert_eq!(a.secret.len(), 64);
        assert_ne!(a.secret, b.secret);
    }
}
