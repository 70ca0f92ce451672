//! Credential verification seam. The actual directory service lives outside
//! the gateway; it is injected behind `AuthService`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::core::{User, UserRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Failed,
    ServerError,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn auth_password(&self, login: &str, password: &str) -> AuthOutcome;
    async fn auth_key(&self, login: &str, public_key: &[u8]) -> AuthOutcome;
}

/// Verifies a password and interns the user on success.
pub async fn authenticate_password(
    auth: &dyn AuthService,
    users: &UserRegistry,
    login: &str,
    password: &str,
) -> Option<Arc<User>> {
    match auth.auth_password(login, password).await {
        AuthOutcome::Ok => Some(users.user_from_ssh(login)),
        AuthOutcome::Failed => {
            info!("user {login:?} failed password auth");
            None
        }
        AuthOutcome::ServerError => {
            error!("auth server error on password login by {login:?}");
            None
        }
    }
}

/// Verifies a public key and interns the user on success.
pub async fn authenticate_key(
    auth: &dyn AuthService,
    users: &UserRegistry,
    login: &str,
    public_key: &[u8],
) -> Option<Arc<User>> {
    match auth.auth_key(login, public_key).await {
        AuthOutcome::Ok => Some(users.user_from_ssh(login)),
        AuthOutcome::Failed => {
            info!("user {login:?} failed key auth");
            None
        }
        AuthOutcome::ServerError => {
            error!("auth server error on key auth by {login:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAuth(AuthOutcome);

    #[async_trait]
    impl AuthService for StaticAuth {
        async fn auth_password(&self, _login: &str, _password: &str) -> AuthOutcome {
            self.0
        }
        async fn auth_key(&self, _login: &str, _public_key: &[u8]) -> AuthOutcome {
            self.0
        }
    }

    #[tokio::test]
    async fn successful_auth_interns_the_user() {
        let users = UserRegistry::new("http://unused.invalid");
        let user = authenticate_password(&StaticAuth(AuthOutcome::Ok), &users, "alice", "pw")
            .await
            .unwrap();
        assert_eq!(user.id, "alice");

        let again = authenticate_key(&StaticAuth(AuthOutcome::Ok), &users, "alice", b"ssh-ed25519")
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&user, &again));
    }

    #[tokio::test]
    async fn failures_and_server_errors_deny() {
        let users = UserRegistry::new("http://unused.invalid");
        assert!(
            authenticate_password(&StaticAuth(AuthOutcome::Failed), &users, "bob", "pw")
                .await
                .is_none()
        );
        assert!(
            authenticate_key(&StaticAuth(AuthOutcome::ServerError), &users, "bob", b"key")
                .await
                .is_none()
        );
    }
}
