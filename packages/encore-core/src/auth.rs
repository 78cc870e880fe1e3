//! Request authentication.
//!
//! Credentials are issued by the auth service. This side only validates the
//! bearer token and turns it into a [`Principal`] before any handler runs.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};

use crate::error::{EncoreError, EncoreResult};

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: u64,
}

/// Resolves the principal attached to a request.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> EncoreResult<Principal>;
}

/// HS256 access-token validation with a shared secret.
#[derive(Clone)]
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("algorithm", &Algorithm::HS256)
            .finish()
    }
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens from the auth service may omit `exp`; it is checked when present.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.leeway = 60;

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validates a raw token and extracts the `user_id` claim.
    pub fn verify(&self, token: &str) -> EncoreResult<Principal> {
        let data = decode::<Map<String, Value>>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    EncoreError::Unauthorized("token expired".to_string())
                }
                _ => EncoreError::Unauthorized(format!("invalid token: {}", e)),
            })?;

        let user_id = data
            .claims
            .get("user_id")
            .and_then(claim_as_user_id)
            .ok_or_else(|| EncoreError::Unauthorized("invalid user_id claim".to_string()))?;

        Ok(Principal { user_id })
    }
}

/// Accepts integer ids and the float encoding some issuers produce.
fn claim_as_user_id(value: &Value) -> Option<u64> {
    let id = match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        }),
        _ => None,
    }?;
    (id != 0).then_some(id)
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> EncoreResult<Principal> {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let token = value
            .strip_prefix("Bearer ")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EncoreError::Unauthorized("bearer token required".to_string()))?;

        self.verify(token)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    pub(crate) fn sign(secret: &str, claims: Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn valid_token_yields_principal() {
        let auth = JwtAuthenticator::new("secret");
        let token = sign("secret", json!({ "user_id": 7, "role": "listener" }));
        assert_eq!(
            auth.authenticate(&bearer(&token)).unwrap(),
            Principal { user_id: 7 }
        );
    }

    #[test]
    fn float_user_id_is_accepted() {
        let auth = JwtAuthenticator::new("secret");
        let token = sign("secret", json!({ "user_id": 12.0 }));
        assert_eq!(auth.authenticate(&bearer(&token)).unwrap().user_id, 12);
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let auth = JwtAuthenticator::new("secret");
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()),
            Err(EncoreError::Unauthorized(_))
        ));
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let auth = JwtAuthenticator::new("secret");
        let token = sign("other", json!({ "user_id": 7 }));
        assert!(auth.authenticate(&bearer(&token)).is_err());
    }

    #[test]
    fn zero_or_missing_user_id_is_unauthorized() {
        let auth = JwtAuthenticator::new("secret");
        for claims in [json!({ "user_id": 0 }), json!({ "role": "x" }), json!({ "user_id": "7" })] {
            let token = sign("secret", claims);
            assert!(auth.authenticate(&bearer(&token)).is_err());
        }
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let auth = JwtAuthenticator::new("secret");
        let token = sign("secret", json!({ "user_id": 7, "exp": 1_000_000 }));
        assert!(auth.authenticate(&bearer(&token)).is_err());
    }
}
