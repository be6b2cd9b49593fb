//! Identity resolution and permission checks.
//!
//! A caller presents either a signed bearer token or an opaque API
//! credential.  API credentials are looked up first, as exact strings;
//! bearer tokens are verified by a [`TokenCodec`] and resolved through the
//! subject's email.  Every rejection is counted by reason.
//!
//! Share-link tokens never pass through here; see [`crate::sharing`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{DamError, DamResult};
use crate::metadata::store::{MetadataStore, RoleId, UserId, UserRecord};
use crate::metrics::record_auth_failure;

/// Resource name guarding asset operations.
pub const ASSET_RESOURCE: &str = "asset";

/// Mint an opaque capability token: 32 random bytes, hex encoded.
pub fn new_capability_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// A credential as presented by a caller.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Signed, expiring bearer token.
    Bearer(String),
    /// Opaque long-lived API credential.
    ApiKey(String),
}

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub email: String,
    pub role_id: RoleId,
    pub role_name: String,
}

// ── Bearer token codec ──────────────────────────────────────────────

/// Encodes and verifies signed bearer tokens.
pub trait TokenCodec: Send + Sync + 'static {
    /// Sign a token for `subject` valid for `ttl`.
    fn issue(&self, subject: &str, ttl: Duration) -> anyhow::Result<String>;

    /// Verify signature and expiry, returning the subject.
    fn verify(&self, token: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// HS256 JWT codec keyed by a shared secret.
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtCodec {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenCodec for JwtCodec {
    fn issue(&self, subject: &str, ttl: Duration) -> anyhow::Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    fn verify(&self, token: &str) -> anyhow::Result<String> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims.sub)
    }
}

// ── Guard ───────────────────────────────────────────────────────────

/// Resolves identities and enforces `resource:action` permissions.
#[derive(Clone)]
pub struct AuthGuard {
    store: Arc<dyn MetadataStore>,
    tokens: Arc<dyn TokenCodec>,
    admin_role: String,
    token_ttl: Duration,
}

impl AuthGuard {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tokens: Arc<dyn TokenCodec>,
        admin_role: impl Into<String>,
        token_ttl: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            admin_role: admin_role.into(),
            token_ttl,
        }
    }

    /// Sign a bearer token for `user`.
    pub fn issue_bearer(&self, user: &UserRecord) -> DamResult<String> {
        Ok(self.tokens.issue(&user.email, self.token_ttl)?)
    }

    /// Resolve `credential` to a live identity.
    pub async fn authenticate(&self, credential: &Credential) -> DamResult<Identity> {
        let user = match credential {
            Credential::ApiKey(token) => {
                let Some(record) = self.store.get_api_credential(token).await? else {
                    return Err(reject("unknown_api_key", "unknown API credential"));
                };
                if record.revoked {
                    return Err(reject("revoked_api_key", "API credential has been revoked"));
                }
                if record.expires_at.is_some_and(|at| at <= Utc::now()) {
                    return Err(reject("expired_api_key", "API credential has expired"));
                }
                self.store.get_user(record.user_id).await?
            }
            Credential::Bearer(token) => {
                let subject = match self.tokens.verify(token) {
                    Ok(subject) => subject,
                    Err(e) => {
                        debug!(error = %e, "bearer token rejected");
                        return Err(reject("invalid_bearer", "invalid or expired bearer token"));
                    }
                };
                self.store.get_user_by_email(&subject).await?
            }
        };

        let Some(user) = user else {
            return Err(reject("unknown_subject", "credential subject no longer exists"));
        };
        self.identity_for(&user).await
    }

    /// Build the identity for an already-loaded user.
    pub async fn identity_for(&self, user: &UserRecord) -> DamResult<Identity> {
        let role = self
            .store
            .get_role(user.role_id)
            .await?
            .ok_or_else(|| {
                DamError::Internal(anyhow::anyhow!(
                    "user {} references missing role {}",
                    user.user_id,
                    user.role_id
                ))
            })?;
        Ok(Identity {
            user_id: user.user_id,
            email: user.email.clone(),
            role_id: role.role_id,
            role_name: role.name,
        })
    }

    /// Fail with an authorization error unless the identity's role grants
    /// `resource:action`.  Permissions are read fresh on every call.
    pub async fn require_permission(
        &self,
        identity: &Identity,
        resource: &str,
        action: &str,
    ) -> DamResult<()> {
        let permissions = self.store.role_permissions(identity.role_id).await?;
        if permissions
            .iter()
            .any(|p| p.resource == resource && p.action == action)
        {
            Ok(())
        } else {
            debug!(
                user_id = identity.user_id,
                resource, action, "permission denied"
            );
            Err(DamError::authorization(resource, action))
        }
    }

    /// Whether the identity holds the administrative role.
    pub fn is_admin(&self, identity: &Identity) -> bool {
        identity.role_name == self.admin_role
    }

    /// Fail unless the identity holds the administrative role.
    pub fn require_admin(&self, identity: &Identity) -> DamResult<()> {
        if self.is_admin(identity) {
            Ok(())
        } else {
            Err(DamError::authorization("role", "admin"))
        }
    }
}

fn reject(reason: &'static str, message: &str) -> DamError {
    record_auth_failure(reason);
    warn!(reason, "authentication failed");
    DamError::authentication(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::ApiCredentialRecord;
    use crate::testutil::TestEnv;

    #[test]
    fn test_capability_tokens_are_64_hex() {
        let a = new_capability_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_capability_token());
    }

    #[test]
    fn test_jwt_roundtrip() {
        let codec = JwtCodec::new("secret");
        let token = codec.issue("a@example.com", Duration::minutes(5)).unwrap();
        assert_eq!(codec.verify(&token).unwrap(), "a@example.com");
    }

    #[test]
    fn test_jwt_rejects_expired_and_foreign_tokens() {
        let codec = JwtCodec::new("secret");
        let expired = codec.issue("a@example.com", Duration::minutes(-5)).unwrap();
        assert!(codec.verify(&expired).is_err());

        let foreign = JwtCodec::new("other")
            .issue("a@example.com", Duration::minutes(5))
            .unwrap();
        assert!(codec.verify(&foreign).is_err());
    }

    #[tokio::test]
    async fn test_bearer_resolves_identity() {
        let env = TestEnv::new().await;
        let token = env.guard.issue_bearer(&env.admin).unwrap();
        let identity = env
            .guard
            .authenticate(&Credential::Bearer(token))
            .await
            .unwrap();
        assert_eq!(identity.user_id, env.admin.user_id);
        assert_eq!(identity.role_name, "Admin");
        assert!(env.guard.is_admin(&identity));
    }

    #[tokio::test]
    async fn test_garbage_bearer_is_authentication_error() {
        let env = TestEnv::new().await;
        let err = env
            .guard
            .authenticate(&Credential::Bearer("not-a-token".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AuthenticationError");
    }

    #[tokio::test]
    async fn test_api_key_lifecycle() {
        let env = TestEnv::new().await;
        let base = ApiCredentialRecord {
            token: "live".to_string(),
            user_id: env.viewer.user_id,
            label: "ci".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            revoked: false,
        };
        env.store.put_api_credential(base.clone()).await.unwrap();
        env.store
            .put_api_credential(ApiCredentialRecord {
                token: "stale".to_string(),
                expires_at: Some(Utc::now() - Duration::minutes(1)),
                ..base.clone()
            })
            .await
            .unwrap();
        env.store
            .put_api_credential(ApiCredentialRecord {
                token: "dead".to_string(),
                revoked: true,
                ..base
            })
            .await
            .unwrap();

        let identity = env
            .guard
            .authenticate(&Credential::ApiKey("live".into()))
            .await
            .unwrap();
        assert_eq!(identity.user_id, env.viewer.user_id);

        for token in ["stale", "dead", "missing"] {
            let err = env
                .guard
                .authenticate(&Credential::ApiKey(token.into()))
                .await
                .unwrap_err();
            assert!(matches!(err, DamError::Authentication { .. }), "{token}");
        }
    }

    #[tokio::test]
    async fn test_require_permission() {
        let env = TestEnv::new().await;
        let viewer = env.identity(&env.viewer).await;
        env.guard
            .require_permission(&viewer, ASSET_RESOURCE, "view")
            .await
            .unwrap();
        let err = env
            .guard
            .require_permission(&viewer, ASSET_RESOURCE, "upload")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::Authorization { .. }));
        assert!(env.guard.require_admin(&viewer).is_err());
    }
}
