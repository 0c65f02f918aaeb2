//! Credential-checking security gate.
//!
//! Credentials are registered per security definition id. Supported
//! schemes: HTTP Basic, API key header, HS256 bearer JWT and OAuth-style
//! client credentials posted as form fields.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use busline_core::{AuthResult, ChannelDescriptor, ChannelParams, SecurityDescriptor, SecurityType};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::dispatch::request::RequestMeta;
use crate::service::error::InvocationError;
use crate::traits::SecurityGate;

const DEFAULT_REALM: &str = "busline";

#[derive(Clone)]
enum Credential {
    Basic { password: String },
    ApiKey { header: String, key: String },
    Jwt { secret: Vec<u8> },
    OAuth { client_secret: String },
}

impl Credential {
    fn sec_type(&self) -> SecurityType {
        match self {
            Self::Basic { .. } => SecurityType::Basic,
            Self::ApiKey { .. } => SecurityType::ApiKey,
            Self::Jwt { .. } => SecurityType::Jwt,
            Self::OAuth { .. } => SecurityType::OAuth,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

fn same(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Security gate checking request credentials against registered secrets.
///
/// With no security definition on the channel (RBAC mandated), the request
/// is refused: there is nothing to authenticate it against.
pub struct CredentialGate {
    credentials: DashMap<u64, Credential>,
    realm: String,
}

impl std::fmt::Debug for CredentialGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGate")
            .field("definitions", &self.credentials.len())
            .field("realm", &self.realm)
            .finish()
    }
}

impl CredentialGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: DashMap::new(),
            realm: DEFAULT_REALM.to_string(),
        }
    }

    /// Realm named in `WWW-Authenticate` challenges.
    #[must_use]
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// The username comes from the security definition.
    #[must_use]
    pub fn basic(self, security_id: u64, password: impl Into<String>) -> Self {
        self.credentials.insert(
            security_id,
            Credential::Basic {
                password: password.into(),
            },
        );
        self
    }

    #[must_use]
    pub fn api_key(self, security_id: u64, header: &str, key: impl Into<String>) -> Self {
        self.credentials.insert(
            security_id,
            Credential::ApiKey {
                header: header.to_ascii_lowercase(),
                key: key.into(),
            },
        );
        self
    }

    #[must_use]
    pub fn jwt(self, security_id: u64, secret: impl Into<Vec<u8>>) -> Self {
        self.credentials.insert(
            security_id,
            Credential::Jwt {
                secret: secret.into(),
            },
        );
        self
    }

    /// The client id is the security definition's username.
    #[must_use]
    pub fn oauth(self, security_id: u64, client_secret: impl Into<String>) -> Self {
        self.credentials.insert(
            security_id,
            Credential::OAuth {
                client_secret: client_secret.into(),
            },
        );
        self
    }

    fn challenge(&self, scheme: &str) -> Option<String> {
        Some(format!("{scheme} realm=\"{}\"", self.realm))
    }

    fn check_basic(
        &self,
        descriptor: &SecurityDescriptor,
        meta: &RequestMeta,
        password: &str,
    ) -> Result<AuthResult, InvocationError> {
        let denied = || InvocationError::unauthorized("invalid credentials", self.challenge("Basic"));
        let encoded = meta
            .header("authorization")
            .and_then(|h| h.strip_prefix("Basic ").or_else(|| h.strip_prefix("basic ")))
            .ok_or_else(denied)?;
        let decoded = STANDARD.decode(encoded.trim()).map_err(|_| denied())?;
        let decoded = String::from_utf8(decoded).map_err(|_| denied())?;
        let (user, pass) = decoded.split_once(':').ok_or_else(denied)?;

        let user_ok = descriptor.username.as_deref().is_none_or(|u| same(u, user));
        if !(user_ok && same(pass, password)) {
            return Err(denied());
        }
        Ok(AuthResult {
            security_id: descriptor.id,
            security_type: SecurityType::Basic,
            username: Some(user.to_string()),
            raw_token: None,
        })
    }

    fn check_jwt(
        &self,
        descriptor: &SecurityDescriptor,
        meta: &RequestMeta,
        secret: &[u8],
    ) -> Result<AuthResult, InvocationError> {
        let denied = || InvocationError::unauthorized("invalid token", self.challenge("Bearer"));
        let token = meta
            .header("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(denied)?;
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| {
            tracing::debug!(security = %descriptor.name, error = %e, "jwt rejected");
            denied()
        })?;
        Ok(AuthResult {
            security_id: descriptor.id,
            security_type: SecurityType::Jwt,
            username: Some(data.claims.sub),
            raw_token: Some(token.to_string()),
        })
    }
}

impl Default for CredentialGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecurityGate for CredentialGate {
    async fn check_security(
        &self,
        channel: &ChannelDescriptor,
        cid: &str,
        _raw_body: &[u8],
        meta: &RequestMeta,
        post: Option<&ChannelParams>,
    ) -> Result<Option<AuthResult>, InvocationError> {
        let Some(descriptor) = channel.security.as_ref() else {
            tracing::warn!(cid = %cid, channel = %channel.name, "no security definition on channel");
            return Err(InvocationError::forbidden("access denied"));
        };
        let Some(credential) = self.credentials.get(&descriptor.id).map(|c| c.clone()) else {
            return Err(InvocationError::Configuration(format!(
                "no credentials for security definition `{}`",
                descriptor.name
            )));
        };
        if credential.sec_type() != descriptor.sec_type {
            return Err(InvocationError::Configuration(format!(
                "security definition `{}` is {}, credentials are {}",
                descriptor.name,
                descriptor.sec_type.as_str(),
                credential.sec_type().as_str()
            )));
        }

        let auth = match &credential {
            Credential::Basic { password } => self.check_basic(descriptor, meta, password)?,
            Credential::ApiKey { header, key } => {
                let presented = meta.header(header).unwrap_or_default();
                if !same(presented, key) {
                    return Err(InvocationError::unauthorized("invalid API key", None));
                }
                AuthResult {
                    security_id: descriptor.id,
                    security_type: SecurityType::ApiKey,
                    username: descriptor.username.clone(),
                    raw_token: None,
                }
            }
            Credential::Jwt { secret } => self.check_jwt(descriptor, meta, secret)?,
            Credential::OAuth { client_secret } => {
                let field = |name: &str| post.and_then(|p| p.get(name)).and_then(|v| v.first());
                let client_id = field("client_id").unwrap_or_default();
                let secret = field("client_secret").unwrap_or_default();
                let id_ok = descriptor.username.as_deref().is_none_or(|u| same(u, client_id));
                if !(id_ok && same(secret, client_secret)) {
                    return Err(InvocationError::unauthorized(
                        "invalid client credentials",
                        self.challenge("Bearer"),
                    ));
                }
                AuthResult {
                    security_id: descriptor.id,
                    security_type: SecurityType::OAuth,
                    username: Some(client_id.to_string()),
                    raw_token: field("access_token").map(ToString::to_string),
                }
            }
        };

        tracing::debug!(
            cid = %cid,
            security = %descriptor.name,
            sec_type = descriptor.sec_type.as_str(),
            "request authenticated"
        );
        Ok(Some(auth))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use busline_core::ParamValue;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    use super::*;

    fn channel(sec_type: SecurityType) -> ChannelDescriptor {
        let mut c = ChannelDescriptor::new(1, "secured", "/s", "svc");
        c.security = Some(SecurityDescriptor {
            id: 10,
            name: "def".into(),
            sec_type,
            username: Some("alice".into()),
            linked_identity: None,
        });
        c
    }

    async fn check(
        gate: &CredentialGate,
        channel: &ChannelDescriptor,
        meta: &RequestMeta,
    ) -> Result<Option<AuthResult>, InvocationError> {
        gate.check_security(channel, "cid", b"", meta, None).await
    }

    #[tokio::test]
    async fn basic_auth() {
        let gate = CredentialGate::new().basic(10, "s3cret");
        let c = channel(SecurityType::Basic);

        let good = RequestMeta::new("GET", "/s")
            .with_header("Authorization", format!("Basic {}", STANDARD.encode("alice:s3cret")));
        let auth = check(&gate, &c, &good).await.unwrap().unwrap();
        assert_eq!(auth.username.as_deref(), Some("alice"));

        let bad = RequestMeta::new("GET", "/s")
            .with_header("Authorization", format!("Basic {}", STANDARD.encode("alice:nope")));
        match check(&gate, &c, &bad).await.unwrap_err() {
            InvocationError::Unauthorized { challenge, .. } => {
                assert_eq!(challenge.as_deref(), Some("Basic realm=\"busline\""));
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = RequestMeta::new("GET", "/s");
        assert!(check(&gate, &c, &missing).await.is_err());
    }

    #[tokio::test]
    async fn api_key() {
        let gate = CredentialGate::new().api_key(10, "X-API-Key", "k-123");
        let c = channel(SecurityType::ApiKey);
        let good = RequestMeta::new("GET", "/s").with_header("x-api-key", "k-123");
        assert!(check(&gate, &c, &good).await.unwrap().is_some());
        let bad = RequestMeta::new("GET", "/s").with_header("x-api-key", "k-124");
        assert!(matches!(
            check(&gate, &c, &bad).await,
            Err(InvocationError::Unauthorized { challenge: None, .. })
        ));
    }

    #[tokio::test]
    async fn jwt_bearer() {
        let gate = CredentialGate::new().jwt(10, b"topsecret".to_vec());
        let c = channel(SecurityType::Jwt);
        let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
        let token = jsonwebtoken::encode(
            &Header::default(),
            &json!({"sub": "bob", "exp": exp}),
            &EncodingKey::from_secret(b"topsecret"),
        )
        .unwrap();

        let good = RequestMeta::new("GET", "/s").with_header("Authorization", format!("Bearer {token}"));
        let auth = check(&gate, &c, &good).await.unwrap().unwrap();
        assert_eq!(auth.username.as_deref(), Some("bob"));
        assert_eq!(auth.raw_token.as_deref(), Some(token.as_str()));

        let forged = jsonwebtoken::encode(
            &Header::default(),
            &json!({"sub": "bob", "exp": exp}),
            &EncodingKey::from_secret(b"guess"),
        )
        .unwrap();
        let bad = RequestMeta::new("GET", "/s").with_header("Authorization", format!("Bearer {forged}"));
        assert!(check(&gate, &c, &bad).await.is_err());
    }

    #[tokio::test]
    async fn oauth_reads_posted_fields() {
        let gate = CredentialGate::new().oauth(10, "cs");
        let c = channel(SecurityType::OAuth);
        let meta = RequestMeta::new("POST", "/s");
        let mut post = ChannelParams::new();
        post.insert("client_id".into(), ParamValue::from("alice"));
        post.insert("client_secret".into(), ParamValue::from("cs"));
        post.insert("access_token".into(), ParamValue::from("tok"));
        let auth = gate
            .check_security(&c, "cid", b"", &meta, Some(&post))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth.raw_token.as_deref(), Some("tok"));

        assert!(gate.check_security(&c, "cid", b"", &meta, None).await.is_err());
    }

    #[tokio::test]
    async fn misconfiguration_is_internal() {
        let c = channel(SecurityType::Basic);
        let meta = RequestMeta::new("GET", "/s");
        let none = CredentialGate::new();
        assert!(matches!(check(&none, &c, &meta).await, Err(InvocationError::Configuration(_))));
        let wrong = CredentialGate::new().api_key(10, "x-api-key", "k");
        assert!(matches!(check(&wrong, &c, &meta).await, Err(InvocationError::Configuration(_))));
    }

    #[tokio::test]
    async fn mandatory_rbac_without_definition_is_refused() {
        let gate = CredentialGate::new();
        let c = ChannelDescriptor::new(1, "open", "/o", "svc");
        let meta = RequestMeta::new("GET", "/o");
        assert!(matches!(check(&gate, &c, &meta).await, Err(InvocationError::Forbidden { .. })));
    }
}
