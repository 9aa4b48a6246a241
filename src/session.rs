//! Session credential ownership, persistence, and refresh.
//!
//! `SessionStore` is the sole owner of the bearer credential. The access
//! token and a remember-me flag survive process restarts through a
//! [`CredentialStore`]; the refresh token is held in memory only. Issuing a
//! new access token from a refresh token is an auth-service contract, so
//! refresh is delegated to an injected [`TokenRefresher`].

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed store key for the persisted access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Fixed store key for the persisted remember-me flag.
pub const REMEMBER_KEY: &str = "remember_me";
/// Default keyring service name.
pub const DEFAULT_KEYRING_SERVICE: &str = "nexuswatch-console";

/// Authenticated operator identity returned by login.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    pub role: String,
    pub email: String,
}

/// Bearer credential pair.
#[derive(Clone, Debug)]
pub struct Credential {
    /// Access token sent as `Authorization: Bearer <token>`.
    pub access_token: SecretString,
    /// Refresh token, when the auth service issued one.
    pub refresh_token: Option<SecretString>,
}

impl Credential {
    /// Credential with an access token only.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: None,
        }
    }
}

/// Errors produced by session persistence and refresh.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Underlying credential store failed.
    #[error("credential store error: {0}")]
    Store(String),

    /// No refresher is configured for this deployment.
    #[error("token refresh is not supported")]
    RefreshUnsupported,

    /// The auth service rejected the refresh token.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The session holds no refresh token.
    #[error("no refresh token available")]
    NoRefreshToken,
}

/// Snapshot of the session state that survives restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedSession {
    pub access_token: String,
    pub remember: bool,
}

/// Key-value persistence seam for the session snapshot.
///
/// Implementations store values under the fixed [`ACCESS_TOKEN_KEY`] and
/// [`REMEMBER_KEY`] names. Absence is not an error: `load` returns `None`
/// when nothing is stored.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>, SessionError>;
    fn save(&self, session: &PersistedSession) -> Result<(), SessionError>;
    fn clear(&self) -> Result<(), SessionError>;
}

/// Platform keyring-backed credential store.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Creates a store writing under the given keyring service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, SessionError> {
        keyring::Entry::new(&self.service, account)
            .map_err(|err| SessionError::Store(err.to_string()))
    }

    fn read(&self, account: &str) -> Result<Option<String>, SessionError> {
        match self.entry(account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(SessionError::Store(err.to_string())),
        }
    }

    fn delete(&self, account: &str) -> Result<(), SessionError> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(SessionError::Store(err.to_string())),
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEYRING_SERVICE)
    }
}

impl CredentialStore for KeyringStore {
    fn load(&self) -> Result<Option<PersistedSession>, SessionError> {
        let Some(access_token) = self.read(ACCESS_TOKEN_KEY)? else {
            return Ok(None);
        };
        let remember = self
            .read(REMEMBER_KEY)?
            .map(|value| value == "true")
            .unwrap_or(false);
        Ok(Some(PersistedSession {
            access_token,
            remember,
        }))
    }

    fn save(&self, session: &PersistedSession) -> Result<(), SessionError> {
        self.entry(ACCESS_TOKEN_KEY)?
            .set_password(&session.access_token)
            .map_err(|err| SessionError::Store(err.to_string()))?;
        self.entry(REMEMBER_KEY)?
            .set_password(if session.remember { "true" } else { "false" })
            .map_err(|err| SessionError::Store(err.to_string()))
    }

    fn clear(&self) -> Result<(), SessionError> {
        self.delete(ACCESS_TOKEN_KEY)?;
        self.delete(REMEMBER_KEY)
    }
}

/// In-memory credential store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<PersistedSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedSession>, SessionError> {
        Ok(self.inner.lock().ok().and_then(|guard| guard.clone()))
    }

    fn save(&self, session: &PersistedSession) -> Result<(), SessionError> {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(session.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = None;
        }
        Ok(())
    }
}

/// Collaborator that exchanges a refresh token for a new credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<Credential, SessionError>;
}

/// Default refresher: refuses every refresh.
///
/// Deployments with a real auth service inject their own implementation; a
/// 401 then clears the session instead of silently retrying forever.
pub struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _refresh_token: &SecretString) -> Result<Credential, SessionError> {
        Err(SessionError::RefreshUnsupported)
    }
}

/// Owner of the current credential and its lifecycle.
pub struct SessionStore {
    store: Box<dyn CredentialStore>,
    refresher: Box<dyn TokenRefresher>,
    current: RwLock<Option<Credential>>,
    remember: RwLock<bool>,
}

impl SessionStore {
    pub fn new(store: Box<dyn CredentialStore>, refresher: Box<dyn TokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            current: RwLock::new(None),
            remember: RwLock::new(false),
        }
    }

    /// Restores a persisted session, if any.
    ///
    /// Returns true when a stored access token was found. Absence means
    /// unauthenticated and is not an error.
    pub fn load(&self) -> Result<bool, SessionError> {
        match self.store.load()? {
            Some(persisted) => {
                self.set_current(Some(Credential::bearer(persisted.access_token)));
                if let Ok(mut remember) = self.remember.write() {
                    *remember = persisted.remember;
                }
                debug!(event = "session_restored");
                Ok(true)
            }
            None => {
                debug!(event = "session_absent");
                Ok(false)
            }
        }
    }

    /// Installs a fresh credential, persisting it when `remember` is set.
    pub fn install(&self, credential: Credential, remember: bool) -> Result<(), SessionError> {
        if remember {
            self.store.save(&PersistedSession {
                access_token: credential.access_token.expose_secret().clone(),
                remember,
            })?;
        } else {
            self.store.clear()?;
        }
        self.set_current(Some(credential));
        if let Ok(mut guard) = self.remember.write() {
            *guard = remember;
        }
        Ok(())
    }

    /// Destroys the credential in memory and in the persistent store.
    pub fn clear(&self) -> Result<(), SessionError> {
        self.set_current(None);
        if let Ok(mut guard) = self.remember.write() {
            *guard = false;
        }
        self.store.clear()
    }

    /// Snapshot of the current access token.
    pub fn access_token(&self) -> Option<SecretString> {
        self.current
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|cred| cred.access_token.clone()))
    }

    /// A present access token means the session is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.current
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Exchanges the held refresh token for a new credential.
    ///
    /// On failure the credential is cleared: an irrecoverable auth failure
    /// must not leave a stale token behind. Publishing the resulting
    /// auth-change event is the caller's responsibility.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        let refresh_token = self.current.read().ok().and_then(|guard| {
            guard
                .as_ref()
                .and_then(|cred| cred.refresh_token.clone())
        });

        let outcome = match refresh_token {
            Some(token) => self.refresher.refresh(&token).await,
            None => Err(SessionError::NoRefreshToken),
        };

        let failure = match outcome {
            Ok(credential) => {
                let remember = self.remember.read().map(|guard| *guard).unwrap_or(false);
                match self.install(credential, remember) {
                    Ok(()) => {
                        debug!(event = "session_refreshed");
                        return Ok(());
                    }
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        warn!(event = "session_refresh_failed", error = %failure);
        if let Err(clear_err) = self.clear() {
            warn!(event = "session_clear_failed", error = %clear_err);
        }
        Err(failure)
    }

    fn set_current(&self, credential: Option<Credential>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = credential;
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{
        Credential, CredentialStore, MemoryStore, NoRefresh, PersistedSession, SessionError,
        SessionStore, TokenRefresher,
    };

    struct StaticRefresher {
        token: &'static str,
    }

    #[async_trait::async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(
            &self,
            _refresh_token: &SecretString,
        ) -> Result<Credential, SessionError> {
            Ok(Credential::bearer(self.token))
        }
    }

    fn store_with(refresher: Box<dyn TokenRefresher>) -> SessionStore {
        SessionStore::new(Box::new(MemoryStore::new()), refresher)
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load().expect("load empty").is_none());

        let session = PersistedSession {
            access_token: "tok".to_string(),
            remember: true,
        };
        store.save(&session).expect("save");
        assert_eq!(store.load().expect("load"), Some(session));

        store.clear().expect("clear");
        assert!(store.load().expect("load cleared").is_none());
    }

    #[test]
    fn install_marks_authenticated_and_clear_reverts() {
        let session = store_with(Box::new(NoRefresh));
        assert!(!session.is_authenticated());

        session
            .install(Credential::bearer("tok"), false)
            .expect("install");
        assert!(session.is_authenticated());
        assert_eq!(
            session
                .access_token()
                .expect("token present")
                .expose_secret(),
            "tok"
        );

        session.clear().expect("clear");
        assert!(!session.is_authenticated());
        assert!(session.access_token().is_none());
    }

    #[test]
    fn remember_false_leaves_nothing_persisted() {
        let backing = std::sync::Arc::new(MemoryStore::new());

        struct Shared(std::sync::Arc<MemoryStore>);
        impl CredentialStore for Shared {
            fn load(&self) -> Result<Option<PersistedSession>, SessionError> {
                self.0.load()
            }
            fn save(&self, session: &PersistedSession) -> Result<(), SessionError> {
                self.0.save(session)
            }
            fn clear(&self) -> Result<(), SessionError> {
                self.0.clear()
            }
        }

        let session = SessionStore::new(
            Box::new(Shared(std::sync::Arc::clone(&backing))),
            Box::new(NoRefresh),
        );
        session
            .install(Credential::bearer("tok"), false)
            .expect("install");
        assert!(backing.load().expect("load").is_none());

        session
            .install(Credential::bearer("tok"), true)
            .expect("install remembered");
        assert!(backing.load().expect("load").is_some());
    }

    #[tokio::test]
    async fn failed_refresh_clears_credentials() {
        let session = store_with(Box::new(NoRefresh));
        session
            .install(
                Credential {
                    access_token: SecretString::new("old".to_string()),
                    refresh_token: Some(SecretString::new("refresh".to_string())),
                },
                false,
            )
            .expect("install");

        let err = session.refresh().await.expect_err("refresh must fail");
        assert!(matches!(err, SessionError::RefreshUnsupported));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails() {
        let session = store_with(Box::new(StaticRefresher { token: "new" }));
        session
            .install(Credential::bearer("old"), false)
            .expect("install");

        let err = session.refresh().await.expect_err("no refresh token");
        assert!(matches!(err, SessionError::NoRefreshToken));
    }

    #[tokio::test]
    async fn successful_refresh_installs_new_token() {
        let session = store_with(Box::new(StaticRefresher { token: "new" }));
        session
            .install(
                Credential {
                    access_token: SecretString::new("old".to_string()),
                    refresh_token: Some(SecretString::new("refresh".to_string())),
                },
                false,
            )
            .expect("install");

        session.refresh().await.expect("refresh");
        assert_eq!(
            session
                .access_token()
                .expect("token present")
                .expose_secret(),
            "new"
        );
    }
}
