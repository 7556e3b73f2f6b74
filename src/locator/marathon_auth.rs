//! Principal-secret authentication for the Marathon API.
//!
//! The secret is a JSON blob carrying `uid`, `login_endpoint`, and either an
//! RSA private key (PKCS#1 or PKCS#8 PEM) or a plain password. Key-based
//! login self-signs an RS256 JWT whose only claim is the uid, then exchanges
//! it at the login endpoint for a session token.

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to parse marathon principal secret: {0}")]
    Secret(#[from] serde_json::Error),
    #[error("principal secret contains neither 'private_key' nor 'password'")]
    MissingCredential,
    #[error("invalid private key in principal secret: {0}")]
    Key(#[source] jsonwebtoken::errors::Error),
    #[error("failed to sign login token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
    #[error("authentication against '{endpoint}' failed: {reason}")]
    Rejected { endpoint: String, reason: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

enum Credential {
    PrivateKey(EncodingKey),
    Password(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::PrivateKey(_) => f.write_str("PrivateKey(..)"),
            Credential::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Parsed authentication material for one Marathon principal.
#[derive(Debug)]
pub struct AuthContext {
    uid: String,
    auth_endpoint: String,
    credential: Credential,
}

#[derive(Deserialize)]
struct PrincipalSecret {
    uid: String,
    login_endpoint: String,
    private_key: Option<String>,
    password: Option<String>,
}

impl AuthContext {
    /// Parse the principal secret, optionally overriding the login endpoint
    /// it names.
    pub fn from_principal_secret(
        secret: &str,
        endpoint_override: Option<&str>,
    ) -> Result<Self, AuthError> {
        let parsed: PrincipalSecret = serde_json::from_str(secret)?;
        let credential = if let Some(pem) = parsed.private_key {
            Credential::PrivateKey(
                EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(AuthError::Key)?,
            )
        } else if let Some(password) = parsed.password {
            Credential::Password(password)
        } else {
            return Err(AuthError::MissingCredential);
        };
        Ok(Self {
            uid: parsed.uid,
            auth_endpoint: endpoint_override
                .map(str::to_string)
                .unwrap_or(parsed.login_endpoint),
            credential,
        })
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    uid: &'a str,
}

/// Exchanges principal credentials for Marathon session tokens.
#[derive(Debug)]
pub struct Authenticator {
    client: reqwest::Client,
    context: AuthContext,
}

impl Authenticator {
    pub fn new(client: reqwest::Client, context: AuthContext) -> Self {
        Self { client, context }
    }

    /// POST the credentials to the login endpoint and return the session
    /// token from its 200 response.
    pub async fn authenticate(&self) -> Result<String, AuthError> {
        let body = match &self.context.credential {
            Credential::PrivateKey(key) => json!({
                "uid": self.context.uid,
                "token": self.self_signed_token(key)?,
            }),
            Credential::Password(password) => json!({
                "uid": self.context.uid,
                "password": password,
            }),
        };

        debug!(endpoint = %self.context.auth_endpoint, uid = %self.context.uid, "authenticating");
        let response = self
            .client
            .post(&self.context.auth_endpoint)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        debug!(status = status.as_u16(), "authentication result");

        if status.as_u16() != 200 {
            return Err(AuthError::Rejected {
                endpoint: self.context.auth_endpoint.clone(),
                reason: format!("status {status}"),
            });
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }
        Ok(response.json::<TokenResponse>().await?.token)
    }

    /// Self-sign `{"uid": …}` as an RS256 JWT.
    fn self_signed_token(&self, key: &EncodingKey) -> Result<String, AuthError> {
        let claims = Claims {
            uid: &self.context.uid,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
            .map_err(AuthError::Sign)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::tests::support::{TEST_RSA_KEY_PKCS1, TEST_RSA_KEY_PKCS8};

    fn secret_with_key(endpoint: &str, pem: &str) -> String {
        serde_json::to_string(&json!({
            "uid": "mpp-principal",
            "login_endpoint": endpoint,
            "private_key": pem,
        }))
        .unwrap()
    }

    #[test]
    fn test_secret_requires_a_credential() {
        let secret = r#"{"uid":"u","login_endpoint":"http://auth"}"#;
        let err = AuthContext::from_principal_secret(secret, None).unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential));
    }

    #[test]
    fn test_secret_accepts_both_pem_encodings() {
        for pem in [TEST_RSA_KEY_PKCS1, TEST_RSA_KEY_PKCS8] {
            let secret = secret_with_key("http://auth", pem);
            AuthContext::from_principal_secret(&secret, None).unwrap();
        }
    }

    #[test]
    fn test_endpoint_override_wins() {
        let secret = r#"{"uid":"u","login_endpoint":"http://from-secret","password":"pw"}"#;
        let context =
            AuthContext::from_principal_secret(secret, Some("http://override")).unwrap();
        assert_eq!(context.auth_endpoint, "http://override");
    }

    #[tokio::test]
    async fn test_key_login_sends_a_signed_jwt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/acs/api/v1/auth/login"))
            .and(body_partial_json(json!({"uid": "mpp-principal"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"token":"session-token"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/acs/api/v1/auth/login", server.uri());
        let secret = secret_with_key(&endpoint, TEST_RSA_KEY_PKCS8);
        let context = AuthContext::from_principal_secret(&secret, None).unwrap();
        let authenticator = Authenticator::new(reqwest::Client::new(), context);

        let token = authenticator.authenticate().await.unwrap();
        assert_eq!(token, "session-token");
    }

    #[tokio::test]
    async fn test_self_signed_token_shape() {
        let secret = secret_with_key("http://auth", TEST_RSA_KEY_PKCS8);
        let context = AuthContext::from_principal_secret(&secret, None).unwrap();
        let authenticator = Authenticator::new(reqwest::Client::new(), context);
        let Credential::PrivateKey(key) = &authenticator.context.credential else {
            panic!("expected a key credential");
        };

        let token = authenticator.self_signed_token(key).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        // base64url without padding
        assert!(parts.iter().all(|p| !p.contains('=')));

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
    }

    #[tokio::test]
    async fn test_password_login_posts_the_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"uid": "u", "password": "pw"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"token":"t"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let secret = format!(
            r#"{{"uid":"u","login_endpoint":"{}","password":"pw"}}"#,
            server.uri()
        );
        let context = AuthContext::from_principal_secret(&secret, None).unwrap();
        let authenticator = Authenticator::new(reqwest::Client::new(), context);
        assert_eq!(authenticator.authenticate().await.unwrap(), "t");
    }

    #[tokio::test]
    async fn test_non_200_login_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let secret = format!(
            r#"{{"uid":"u","login_endpoint":"{}","password":"pw"}}"#,
            server.uri()
        );
        let context = AuthContext::from_principal_secret(&secret, None).unwrap();
        let authenticator = Authenticator::new(reqwest::Client::new(), context);
        let err = authenticator.authenticate().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { .. }));
    }
}
