//! The atelier API client.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use atelier_core::{BranchId, CompanyId, User};

use crate::error::ClientError;
use crate::selection::{ActiveSelection, MemorySelectionStorage, SelectionStorage};
use crate::session::{SessionHandle, TokenSnapshot};

/// Minimum lead time before firing the scheduled refresh.
const MIN_REFRESH_LEAD: StdDuration = StdDuration::from_secs(5);

/// Client construction options.
pub struct ClientOptions {
    /// API base URL, no trailing slash.
    pub base_url: String,
    /// Origin header value for refresh calls (the app's own origin).
    pub origin: String,
    /// Device fingerprint keying the server-side session.
    pub fingerprint: String,
    /// How long before expiry the proactive refresh fires.
    pub refresh_margin: StdDuration,
    /// Where the active selection persists. Defaults to in-memory.
    pub selection: Option<Arc<dyn SelectionStorage>>,
}

impl ClientOptions {
    /// Options with the default refresh margin and in-memory selection.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        origin: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            origin: origin.into(),
            fingerprint: fingerprint.into(),
            refresh_margin: StdDuration::from_secs(30),
            selection: None,
        }
    }
}

/// Hooks injected at construction time.
///
/// The unauthorized hook fires when the session dies locally (a refresh
/// failed or rotation lost); the app routes to its auth screen from there.
pub struct AuthCallbacks {
    on_unauthorized: Box<dyn Fn() + Send + Sync>,
}

impl AuthCallbacks {
    /// Wrap an unauthorized hook.
    pub fn new(on_unauthorized: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_unauthorized: Box::new(on_unauthorized),
        }
    }

    /// Callbacks that do nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }
}

/// What a successful login returns.
#[derive(Debug)]
pub struct LoginOutcome {
    /// The authenticated user.
    pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    access_token: String,
    expires_at: i64,
    #[serde(default)]
    user: Option<User>,
}

/// The atelier API client with session orchestration.
pub struct AtelierClient {
    http: Client,
    base_url: String,
    origin: String,
    fingerprint: String,
    refresh_margin: Duration,
    session: SessionHandle,
    selection: Arc<dyn SelectionStorage>,
    callbacks: AuthCallbacks,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl AtelierClient {
    /// Create a client. The cookie jar holds the refresh cookie; the
    /// access token never leaves [`SessionHandle`] memory.
    #[must_use]
    pub fn new(options: ClientOptions, callbacks: AuthCallbacks) -> Arc<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(StdDuration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Arc::new(Self {
            http,
            base_url: options.base_url,
            origin: options.origin,
            fingerprint: options.fingerprint,
            refresh_margin: Duration::from_std(options.refresh_margin)
                .unwrap_or_else(|_| Duration::seconds(30)),
            session: SessionHandle::new(),
            selection: options
                .selection
                .unwrap_or_else(|| Arc::new(MemorySelectionStorage::new())),
            callbacks,
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_task: Mutex::new(None),
        })
    }

    /// The synchronous token handle, for interceptor-style consumers.
    #[must_use]
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// The persisted active selection, if any.
    #[must_use]
    pub fn active_selection(&self) -> Option<ActiveSelection> {
        self.selection.load()
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Password login. Applies the returned token and schedules the
    /// proactive refresh.
    pub async fn login(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome, ClientError> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .header("Origin", &self.origin)
            .json(&json!({
                "email": email,
                "password": password,
                "fingerprint": self.fingerprint,
            }))
            .send()
            .await?;

        let data = parse_envelope(response).await?;
        let token: TokenData =
            serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.apply_token(&token);

        Ok(LoginOutcome { user: token.user })
    }

    /// Silent refresh. Concurrent callers share one in-flight request:
    /// whoever wins the lock performs it, everyone else observes the new
    /// token and returns.
    pub async fn refresh(self: &Arc<Self>) -> Result<(), ClientError> {
        let entry_token = self.session.access_token();
        let _guard = self.refresh_lock.lock().await;

        // A concurrent refresh completed while we waited for the lock.
        if self.session.access_token() != entry_token {
            return Ok(());
        }

        match self.do_refresh().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The session is dead server-side (rotation lost, revoked,
                // expired). Clear local state without calling the logout
                // endpoint and hand control to the app.
                tracing::debug!(error = %e, "Refresh failed - forcing logout");
                self.force_logout();
                Err(e)
            }
        }
    }

    async fn do_refresh(self: &Arc<Self>) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/auth/refresh"))
            .header("Origin", &self.origin)
            .json(&json!({"fingerprint": self.fingerprint}))
            .send()
            .await?;

        let data = parse_envelope(response).await?;
        let token: TokenData =
            serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.apply_token(&token);
        Ok(())
    }

    /// Server-side logout for this device, then local teardown. The
    /// selection is cleared; this is an explicit user action.
    pub async fn logout(self: &Arc<Self>) {
        let result = self
            .http
            .post(self.url("/api/auth/logout"))
            .json(&json!({"fingerprint": self.fingerprint}))
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "Logout request failed - clearing locally anyway");
        }

        self.cancel_scheduled_refresh();
        self.session.clear();
        self.selection.clear();
    }

    /// Select the active company/branch: persists the selection and swaps
    /// in a contextual token.
    pub async fn select_company(
        self: &Arc<Self>,
        company_id: CompanyId,
        branch_id: Option<BranchId>,
    ) -> Result<(), ClientError> {
        let data = self
            .send_authed(
                Method::POST,
                "/api/auth/context-token",
                Some(&json!({"company_id": company_id, "branch_id": branch_id})),
            )
            .await?;

        let token: TokenData =
            serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.apply_token(&token);
        self.selection.save(&ActiveSelection {
            company_id,
            branch_id,
        });
        Ok(())
    }

    /// Re-apply the persisted selection after a reload: refreshes the
    /// session off the cookie and requests the contextual token again.
    pub async fn restore(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.session.access_token().is_none() {
            self.refresh().await?;
        }
        if let Some(selection) = self.selection.load() {
            self.select_company(selection.company_id, selection.branch_id)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Authenticated requests
    // ========================================================================

    /// Authenticated GET returning the envelope's `data`.
    pub async fn get_json(self: &Arc<Self>, path: &str) -> Result<serde_json::Value, ClientError> {
        self.send_authed(Method::GET, path, None).await
    }

    /// Authenticated POST returning the envelope's `data`.
    pub async fn post_json(
        self: &Arc<Self>,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        self.send_authed(Method::POST, path, Some(body)).await
    }

    /// One request, with exactly one silent refresh-and-retry on 401.
    async fn send_authed(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        let response = self.raw_send(method.clone(), path, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.refresh().await?;
            let retry = self.raw_send(method, path, body).await?;
            return parse_envelope(retry).await;
        }

        parse_envelope(response).await
    }

    async fn raw_send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http.request(method, self.url(path));
        if let Some(token) = self.session.access_token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_token(self: &Arc<Self>, token: &TokenData) {
        let expires_at = DateTime::<Utc>::from_timestamp(token.expires_at, 0)
            .unwrap_or_else(|| Utc::now() + Duration::minutes(15));
        self.session.set(TokenSnapshot {
            access_token: token.access_token.clone(),
            expires_at,
        });
        self.schedule_refresh(expires_at);
    }

    /// Arm the proactive refresh timer, replacing any previous one. The
    /// task holds only a weak reference so dropping the client cancels it.
    fn schedule_refresh(self: &Arc<Self>, expires_at: DateTime<Utc>) {
        let delay = compute_refresh_delay(expires_at, Utc::now(), self.refresh_margin);
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(client) = weak.upgrade() {
                if let Err(e) = client.refresh().await {
                    tracing::warn!(error = %e, "Scheduled token refresh failed");
                }
            }
        });

        self.replace_refresh_task(Some(handle));
    }

    fn cancel_scheduled_refresh(&self) {
        self.replace_refresh_task(None);
    }

    fn replace_refresh_task(&self, handle: Option<JoinHandle<()>>) {
        let mut guard = match self.refresh_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = std::mem::replace(&mut *guard, handle) {
            old.abort();
        }
    }

    /// Local teardown without the logout endpoint: the server session may
    /// already be dead. The selection survives so a re-login can restore
    /// the same context.
    fn force_logout(&self) {
        self.cancel_scheduled_refresh();
        self.session.clear();
        (self.callbacks.on_unauthorized)();
    }
}

impl Drop for AtelierClient {
    fn drop(&mut self) {
        // Cancel the timer so no refresh fires after the client is gone.
        self.replace_refresh_task(None);
    }
}

/// When the proactive refresh should fire: `margin` before expiry, but
/// never sooner than the minimum lead.
fn compute_refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    margin: Duration,
) -> StdDuration {
    let lead = (expires_at - now - margin)
        .to_std()
        .unwrap_or(StdDuration::ZERO);
    lead.max(MIN_REFRESH_LEAD)
}

async fn parse_envelope(response: reqwest::Response) -> Result<serde_json::Value, ClientError> {
    let status = response.status().as_u16();
    let envelope: Envelope = response
        .json()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))?;

    if envelope.success {
        Ok(envelope.data.unwrap_or(serde_json::Value::Null))
    } else {
        Err(ClientError::Api {
            status,
            code: envelope.code,
            message: envelope.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_delay_honors_margin() {
        let now = Utc::now();
        let delay = compute_refresh_delay(now + Duration::minutes(15), now, Duration::seconds(30));
        let secs = delay.as_secs();
        assert!((secs as i64 - (15 * 60 - 30)).abs() <= 1, "got {secs}");
    }

    #[test]
    fn refresh_delay_never_below_minimum() {
        let now = Utc::now();
        // Already expired
        assert_eq!(
            compute_refresh_delay(now - Duration::minutes(1), now, Duration::seconds(30)),
            MIN_REFRESH_LEAD
        );
        // Expiring inside the margin
        assert_eq!(
            compute_refresh_delay(now + Duration::seconds(10), now, Duration::seconds(30)),
            MIN_REFRESH_LEAD
        );
    }
}
