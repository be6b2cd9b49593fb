//! User accounts: registration, login, roles, API credentials and
//! password reset.
//!
//! Password hashing sits behind [`PasswordHasher`]; bcrypt is the stock
//! implementation.  Hashing runs on the blocking pool.

use std::sync::Arc;

use chrono::{Duration, Utc};
use garde::Validate;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditLogger};
use crate::auth::{new_capability_token, AuthGuard, Identity};
use crate::errors::{DamError, DamResult};
use crate::metadata::store::{
    ApiCredentialRecord, MetadataStore, NewUser, ResetTokenRecord, UserId, UserRecord,
};
use crate::metrics::record_auth_failure;

/// One-way password hashing.
pub trait PasswordHasher: Send + Sync + 'static {
    fn hash(&self, password: &str) -> anyhow::Result<String>;
    fn verify(&self, password: &str, hash: &str) -> anyhow::Result<bool>;
}

/// bcrypt with a configurable work factor.
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, password: &str) -> anyhow::Result<String> {
        Ok(bcrypt::hash(password, self.cost)?)
    }

    fn verify(&self, password: &str, hash: &str) -> anyhow::Result<bool> {
        Ok(bcrypt::verify(password, hash)?)
    }
}

/// Registration input.
#[derive(Debug, Clone, Validate)]
pub struct NewAccount {
    #[garde(length(min = 3, max = 254), pattern(r"^[^@ \t\r\n]+@[^@ \t\r\n]+\.[^@ \t\r\n]+$"))]
    pub email: String,
    #[garde(length(min = 8, max = 128))]
    pub password: String,
}

#[derive(Debug, Validate)]
struct NewPassword {
    #[garde(length(min = 8, max = 128))]
    password: String,
}

/// A successful login.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub identity: Identity,
    pub bearer_token: String,
}

/// Account operations.
#[derive(Clone)]
pub struct Accounts {
    store: Arc<dyn MetadataStore>,
    guard: AuthGuard,
    audit: AuditLogger,
    hasher: Arc<dyn PasswordHasher>,
    default_role: String,
    reset_ttl: Duration,
    api_credential_ttl: Option<Duration>,
}

impl Accounts {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        guard: AuthGuard,
        audit: AuditLogger,
        hasher: Arc<dyn PasswordHasher>,
        default_role: impl Into<String>,
        reset_ttl: Duration,
        api_credential_ttl: Option<Duration>,
    ) -> Self {
        Self {
            store,
            guard,
            audit,
            hasher,
            default_role: default_role.into(),
            reset_ttl,
            api_credential_ttl,
        }
    }

    async fn hash_password(&self, password: &str) -> DamResult<String> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| DamError::Internal(e.into()))??;
        Ok(hash)
    }

    async fn verify_password(&self, password: &str, hash: &str) -> DamResult<bool> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        let ok = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| DamError::Internal(e.into()))?
            .unwrap_or(false);
        Ok(ok)
    }

    /// Create a user holding the default role.
    pub async fn register(&self, account: NewAccount) -> DamResult<UserRecord> {
        account.validate()?;
        let role = self
            .store
            .get_role_by_name(&self.default_role)
            .await?
            .ok_or_else(|| DamError::not_found(format!("role {}", self.default_role)))?;
        let password_hash = self.hash_password(&account.password).await?;
        let user = self
            .store
            .create_user(NewUser {
                email: account.email,
                password_hash,
                role_id: role.role_id,
            })
            .await?;
        info!(user_id = user.user_id, "user registered");
        Ok(user)
    }

    /// Check an email/password pair and issue a bearer token.
    pub async fn login(&self, email: &str, password: &str) -> DamResult<LoginSession> {
        let user = self.store.get_user_by_email(email).await?;
        let verified = match &user {
            Some(user) => self.verify_password(password, &user.password_hash).await?,
            None => false,
        };
        let user = match user {
            Some(user) if verified => user,
            other => {
                let user_id = other.map(|u| u.user_id);
                self.audit
                    .record(user_id, None, AuditAction::LoginFailed)
                    .await?;
                record_auth_failure("bad_password");
                warn!(?user_id, "login failed");
                return Err(DamError::authentication("invalid email or password"));
            }
        };

        let identity = self.guard.identity_for(&user).await?;
        let bearer_token = self.guard.issue_bearer(&user)?;
        self.audit
            .record(Some(user.user_id), None, AuditAction::LoginSuccess)
            .await?;
        Ok(LoginSession {
            identity,
            bearer_token,
        })
    }

    /// Record a failed second-factor check for `user_id`.
    pub async fn record_mfa_failure(&self, user_id: UserId) -> DamResult<()> {
        self.audit
            .record(Some(user_id), None, AuditAction::MfaFailed)
            .await?;
        Ok(())
    }

    /// Move `user_id` to the role named `role_name`.  Admin only.
    pub async fn set_user_role(
        &self,
        actor: &Identity,
        user_id: UserId,
        role_name: &str,
    ) -> DamResult<()> {
        self.guard.require_admin(actor)?;
        let role = self
            .store
            .get_role_by_name(role_name)
            .await?
            .ok_or_else(|| DamError::not_found(format!("role {role_name}")))?;
        if !self.store.set_user_role(user_id, role.role_id).await? {
            return Err(DamError::not_found(format!("user {user_id}")));
        }
        self.audit
            .record(Some(actor.user_id), None, AuditAction::RoleChanged(user_id))
            .await?;
        info!(user_id, role = role_name, "role changed");
        Ok(())
    }

    /// Issue an API credential for the caller.
    pub async fn issue_api_credential(
        &self,
        actor: &Identity,
        label: &str,
    ) -> DamResult<ApiCredentialRecord> {
        let created_at = Utc::now();
        let record = ApiCredentialRecord {
            token: new_capability_token(),
            user_id: actor.user_id,
            label: label.to_string(),
            created_at,
            expires_at: self.api_credential_ttl.map(|ttl| created_at + ttl),
            revoked: false,
        };
        self.store.put_api_credential(record.clone()).await?;
        self.audit
            .record(Some(actor.user_id), None, AuditAction::ApiKeyIssued)
            .await?;
        Ok(record)
    }

    /// Revoke one of the caller's own API credentials.
    pub async fn revoke_api_credential(&self, actor: &Identity, token: &str) -> DamResult<()> {
        if !self.store.revoke_api_credential(token, actor.user_id).await? {
            return Err(DamError::not_found("API credential"));
        }
        self.audit
            .record(Some(actor.user_id), None, AuditAction::ApiKeyRevoked)
            .await?;
        Ok(())
    }

    /// Issue a one-time reset token for the account at `email`.
    ///
    /// Delivering the token to the user is someone else's job.
    pub async fn request_password_reset(&self, email: &str) -> DamResult<ResetTokenRecord> {
        let user = self
            .store
            .get_user_by_email(email)
            .await?
            .ok_or_else(|| DamError::not_found("user"))?;
        let record = ResetTokenRecord {
            token: new_capability_token(),
            user_id: user.user_id,
            expires_at: Utc::now() + self.reset_ttl,
            used: false,
        };
        self.store.put_reset_token(record.clone()).await?;
        self.audit
            .record(Some(user.user_id), None, AuditAction::PasswordResetRequested)
            .await?;
        Ok(record)
    }

    /// Redeem a reset token and set a new password.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> DamResult<()> {
        NewPassword {
            password: new_password.to_string(),
        }
        .validate()?;
        let record = self
            .store
            .get_reset_token(token)
            .await?
            .filter(|r| !r.used)
            .ok_or_else(|| DamError::not_found("reset token"))?;
        if Utc::now() > record.expires_at {
            return Err(DamError::expired("reset token"));
        }
        let password_hash = self.hash_password(new_password).await?;
        if !self
            .store
            .consume_reset_token(token, &password_hash)
            .await?
        {
            return Err(DamError::not_found("reset token"));
        }
        self.audit
            .record(Some(record.user_id), None, AuditAction::PasswordReset)
            .await?;
        info!(user_id = record.user_id, "password reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::AuditQuery;
    use crate::testutil::{TestEnv, ADMIN_PASSWORD};

    fn account(email: &str, password: &str) -> NewAccount {
        NewAccount {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    async fn actions(env: &TestEnv) -> Vec<String> {
        env.store
            .list_audit(AuditQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    #[tokio::test]
    async fn test_register_assigns_default_role() {
        let env = TestEnv::new().await;
        let accounts = env.accounts();
        let user = accounts
            .register(account("new@example.com", "long-enough"))
            .await
            .unwrap();
        let identity = env.identity(&user).await;
        assert_eq!(identity.role_name, "Viewer");
    }

    #[test]
    fn test_email_shape() {
        assert!(account("ok@example.com", "long-enough").validate().is_ok());
        for email in [
            "no-at.example.com",
            "two@@example.com",
            "spa ce@example.com",
            "tab\t@example.com",
            "user@nodot",
            "user@example.com\n",
        ] {
            assert!(
                account(email, "long-enough").validate().is_err(),
                "{email:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_bad_input() {
        let env = TestEnv::new().await;
        let accounts = env.accounts();
        accounts
            .register(account("dup@example.com", "long-enough"))
            .await
            .unwrap();
        let err = accounts
            .register(account("dup@example.com", "long-enough"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ConflictError");

        let err = accounts
            .register(account("not-an-email", "long-enough"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ValidationError");

        let err = accounts
            .register(account("short@example.com", "short"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[tokio::test]
    async fn test_login_audits_success_and_failure() {
        let env = TestEnv::new().await;
        let accounts = env.accounts();

        let err = accounts
            .login(&env.admin.email, "wrong-password")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AuthenticationError");

        let session = accounts
            .login(&env.admin.email, ADMIN_PASSWORD)
            .await
            .unwrap();
        assert_eq!(session.identity.user_id, env.admin.user_id);

        // The issued token authenticates.
        let identity = env
            .guard
            .authenticate(&crate::auth::Credential::Bearer(session.bearer_token))
            .await
            .unwrap();
        assert_eq!(identity.user_id, env.admin.user_id);

        assert_eq!(actions(&env).await, vec!["LOGIN_SUCCESS", "LOGIN_FAILED"]);
    }

    #[tokio::test]
    async fn test_unknown_email_login_is_audited_without_actor() {
        let env = TestEnv::new().await;
        let err = env
            .accounts()
            .login("ghost@example.com", "whatever-pass")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::Authentication { .. }));
        let audit = env.store.list_audit(AuditQuery::default()).await.unwrap();
        assert_eq!(audit[0].user_id, None);
    }

    #[tokio::test]
    async fn test_mfa_failure_is_audited() {
        let env = TestEnv::new().await;
        env.accounts()
            .record_mfa_failure(env.viewer.user_id)
            .await
            .unwrap();
        assert_eq!(actions(&env).await, vec!["MFA_FAILED"]);
    }

    #[tokio::test]
    async fn test_role_change_requires_admin() {
        let env = TestEnv::new().await;
        let accounts = env.accounts();
        let viewer = env.identity(&env.viewer).await;
        let admin = env.identity(&env.admin).await;

        let err = accounts
            .set_user_role(&viewer, env.viewer.user_id, "Admin")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::Authorization { .. }));

        accounts
            .set_user_role(&admin, env.viewer.user_id, "Editor")
            .await
            .unwrap();
        let reloaded = env
            .store
            .get_user(env.viewer.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(reloaded.role_id, env.viewer.role_id);
        let promoted = env.identity(&reloaded).await;
        assert_eq!(promoted.role_name, "Editor");
        env.guard
            .require_permission(&promoted, "asset", "upload")
            .await
            .unwrap();
        assert_eq!(
            actions(&env).await,
            vec![format!("ROLE_CHANGED_{}", env.viewer.user_id)]
        );

        let err = accounts
            .set_user_role(&admin, env.viewer.user_id, "Overlord")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_api_credential_issue_and_revoke() {
        let env = TestEnv::new().await;
        let accounts = env.accounts();
        let editor = env.identity(&env.editor).await;
        let viewer = env.identity(&env.viewer).await;

        let record = accounts.issue_api_credential(&editor, "ci").await.unwrap();
        assert_eq!(record.token.len(), 64);
        let credential = crate::auth::Credential::ApiKey(record.token.clone());
        assert_eq!(
            env.guard.authenticate(&credential).await.unwrap().user_id,
            env.editor.user_id
        );

        // Only the owner may revoke.
        let err = accounts
            .revoke_api_credential(&viewer, &record.token)
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::NotFound { .. }));

        accounts
            .revoke_api_credential(&editor, &record.token)
            .await
            .unwrap();
        assert!(env.guard.authenticate(&credential).await.is_err());
        assert_eq!(actions(&env).await, vec!["API_KEY_REVOKED", "API_KEY_ISSUED"]);
    }

    #[tokio::test]
    async fn test_password_reset_flow() {
        let env = TestEnv::new().await;
        let accounts = env.accounts();
        let record = accounts
            .request_password_reset(&env.viewer.email)
            .await
            .unwrap();

        accounts
            .reset_password(&record.token, "brand-new-secret")
            .await
            .unwrap();
        accounts
            .login(&env.viewer.email, "brand-new-secret")
            .await
            .unwrap();

        // Used tokens are gone for good.
        let err = accounts
            .reset_password(&record.token, "another-secret")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_expired_reset_token() {
        let env = TestEnv::new().await;
        env.store
            .put_reset_token(ResetTokenRecord {
                token: "stale".to_string(),
                user_id: env.viewer.user_id,
                expires_at: Utc::now() - Duration::minutes(1),
                used: false,
            })
            .await
            .unwrap();
        let err = env
            .accounts()
            .reset_password("stale", "brand-new-secret")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::ExpiredCredential { .. }));

        let err = env
            .accounts()
            .reset_password("unknown", "brand-new-secret")
            .await
            .unwrap_err();
        assert!(matches!(err, DamError::NotFound { .. }));
    }
}
