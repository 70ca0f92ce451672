use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// A stable identity. Login for terminal users; web users are resolved
/// through the external token validator.
pub struct User {
    pub id: String,
    web_token: Mutex<Option<String>>,
}

impl User {
    fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            web_token: Mutex::new(None),
        })
    }

    pub fn web_token(&self) -> Option<String> {
        self.web_token.lock().unwrap().clone()
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User{{id={:?}}}", self.id)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token provided")]
    EmptyToken,
    #[error("unknown token")]
    UnknownToken,
    #[error("auth server error")]
    ServerError,
    #[error("token check request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Default)]
struct Interned {
    by_id: HashMap<String, Arc<User>>,
    by_token: HashMap<String, Arc<User>>,
}

/// Interns `User` records by login and by opaque web token.
pub struct UserRegistry {
    http: reqwest::Client,
    validator_url: String,
    inner: Mutex<Interned>,
}

impl UserRegistry {
    pub fn new(validator_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(5))
            .build()
            .expect("default reqwest client");
        Self {
            http,
            validator_url: validator_url.into(),
            inner: Mutex::new(Interned::default()),
        }
    }

    /// The login was already verified by the auth service; create the user on
    /// first sight.
    pub fn user_from_ssh(&self, login: &str) -> Arc<User> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .by_id
            .entry(login.to_string())
            .or_insert_with(|| User::new(login))
            .clone()
    }

    /// Resolves a web token to a user, consulting the external validator on a
    /// cache miss. The token binding is re-checked under the lock after the
    /// fetch so concurrent first use cannot intern two users.
    pub async fn user_by_web_token(&self, token: &str) -> Result<Arc<User>, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        if let Some(user) = self.inner.lock().unwrap().by_token.get(token) {
            return Ok(user.clone());
        }

        let response = self
            .http
            .post(&self.validator_url)
            .form(&[("token", token)])
            .send()
            .await?;
        match response.status().as_u16() {
            200 => {}
            403 => return Err(AuthError::UnknownToken),
            _ => return Err(AuthError::ServerError),
        }
        let id = response.text().await?.trim().to_string();
        debug!("token validator resolved user {:?}", id);

        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.by_token.get(token) {
            return Ok(user.clone());
        }
        let user = inner
            .by_id
            .entry(id.clone())
            .or_insert_with(|| User::new(id))
            .clone();
        *user.web_token.lock().unwrap() = Some(token.to_string());
        inner.by_token.insert(token.to_string(), user.clone());
        Ok(user)
    }
}
