//! The synchronous session handle.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

/// The in-memory token state. Never persisted anywhere.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    /// The raw access token.
    pub access_token: String,
    /// Token expiry.
    pub expires_at: DateTime<Utc>,
}

/// A cheap, cloneable handle over the in-memory access token.
///
/// Reads are synchronous so that code outside the async runtime (an HTTP
/// interceptor, a render loop) can attach the current token without
/// awaiting.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<TokenSnapshot>>>,
}

impl SessionHandle {
    /// Create an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current access token, if any.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.read().map(|s| s.access_token)
    }

    /// The current snapshot, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<TokenSnapshot> {
        self.read()
    }

    /// Whether a token is present and not past its expiry.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.read().is_some_and(|s| s.expires_at > now)
    }

    pub(crate) fn set(&self, snapshot: TokenSnapshot) {
        *self.write() = Some(snapshot);
    }

    pub(crate) fn clear(&self) {
        *self.write() = None;
    }

    fn read(&self) -> Option<TokenSnapshot> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<TokenSnapshot>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_read_clear() {
        let handle = SessionHandle::new();
        assert!(handle.access_token().is_none());

        handle.set(TokenSnapshot {
            access_token: "tok".into(),
            expires_at: Utc::now() + Duration::minutes(15),
        });
        assert_eq!(handle.access_token().as_deref(), Some("tok"));
        assert!(handle.is_fresh(Utc::now()));

        handle.clear();
        assert!(handle.access_token().is_none());
        assert!(!handle.is_fresh(Utc::now()));
    }

    #[test]
    fn clones_share_state() {
        let a = SessionHandle::new();
        let b = a.clone();
        a.set(TokenSnapshot {
            access_token: "tok".into(),
            expires_at: Utc::now(),
        });
        assert_eq!(b.access_token().as_deref(), Some("tok"));
    }
}
