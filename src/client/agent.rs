//! Client-side session agent.
//!
//! The agent owns the credential pair of one signed-in user. Every request
//! carries the access token; a 401 triggers exactly one rotation followed by
//! exactly one retry. When rotation fails, or the server pushes a
//! `session_revoked` event, all local state is wiped and the observer is told
//! why.
//!
//! Concurrent 401s share a single rotation: callers queue on the rotation
//! lock and, if the access token changed while they waited, retry with the
//! new one instead of rotating again.

use futures::StreamExt;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION},
    Client, Method, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{
    events::SseDecoder,
    storage::{CredentialStorage, StoredSession},
};
use crate::{
    api::{
        error::ErrorResponse,
        handlers::types::{
            LoginRequest, LogoutRequest, RefreshTokenRequest, RegisterRequest, SessionResponse,
        },
    },
    session::UserProfile,
    APP_USER_AGENT,
};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("session expired, sign in again")]
    SessionExpired,
    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("credential storage failed: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Why the local session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// An administrator revoked the session; `message` is the server notice.
    Revoked { message: String },
    /// Rotation failed; the refresh token is no longer accepted.
    Expired,
    LoggedOut,
}

/// Hook for the UI layer, e.g. to show a notice and route to the sign-in page.
pub trait SessionObserver: Send + Sync {
    fn session_ended(&self, reason: &EndReason);
}

#[derive(Deserialize)]
struct RevokedNotice {
    #[serde(default)]
    message: String,
}

enum StreamEnd {
    Closed,
    Revoked,
}

struct EventsHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    http: Client,
    base_url: Url,
    storage: Arc<dyn CredentialStorage>,
    state: RwLock<Option<StoredSession>>,
    rotation: Mutex<()>,
    events: Mutex<Option<EventsHandle>>,
    observer: Option<Arc<dyn SessionObserver>>,
    reconnect_delay: Duration,
}

#[derive(Clone)]
pub struct SessionAgent {
    inner: Arc<Inner>,
}

impl SessionAgent {
    /// # Errors
    /// Returns an error if `base_url` is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str, storage: Arc<dyn CredentialStorage>) -> Result<Self, AgentError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder().user_agent(APP_USER_AGENT).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url,
                storage,
                state: RwLock::new(None),
                rotation: Mutex::new(()),
                events: Mutex::new(None),
                observer: None,
                reconnect_delay: DEFAULT_RECONNECT_DELAY,
            }),
        })
    }

    /// Attach an observer. Call before the agent is cloned or used.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn SessionObserver>) -> Self {
        self.map_inner(|inner| inner.observer = Some(observer))
    }

    #[must_use]
    pub fn with_reconnect_delay(self, delay: Duration) -> Self {
        self.map_inner(|inner| inner.reconnect_delay = delay)
    }

    fn map_inner(self, apply: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("agent already shared; configuration change ignored");
                Self { inner }
            }
        }
    }

    /// Load a previously stored session. Returns whether one was found.
    ///
    /// # Errors
    /// Returns `Storage` if the storage cannot be read.
    pub async fn restore(&self) -> Result<bool, AgentError> {
        let stored = self.inner.storage.load().await.map_err(AgentError::Storage)?;
        let found = stored.is_some();
        *self.inner.state.write().await = stored;
        Ok(found)
    }

    pub async fn current(&self) -> Option<StoredSession> {
        self.inner.state.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.state.read().await.is_some()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    async fn user_id(&self) -> Option<Uuid> {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map(|session| session.user.id)
    }

    /// # Errors
    /// Returns `Rejected` for bad credentials.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, AgentError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response: SessionResponse = self.post_json("auth/login", &request).await?;
        self.store(response).await
    }

    /// # Errors
    /// Returns `Rejected` when the server refuses the registration.
    pub async fn register(&self, request: &RegisterRequest) -> Result<UserProfile, AgentError> {
        let response: SessionResponse = self.post_json("auth/register", request).await?;
        self.store(response).await
    }

    /// Tell the server to revoke the refresh token, then clear local state.
    /// The server call is best effort; local state is always cleared.
    ///
    /// # Errors
    /// Returns `Storage` if the stored credentials cannot be removed.
    pub async fn logout(&self) -> Result<(), AgentError> {
        if let Some(session) = self.current().await {
            let body = LogoutRequest {
                refresh_token: Some(session.refresh_token.clone()),
            };
            let result = self
                .inner
                .http
                .post(self.endpoint("auth/logout")?)
                .bearer_auth(&session.access_token)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => debug!("server logout ok"),
                Ok(response) => debug!(status = %response.status(), "server logout refused"),
                Err(err) => debug!("server logout failed: {err}"),
            }
        }
        self.end(EndReason::LoggedOut).await
    }

    /// Trade the stored pair for a new access token. On any refusal the
    /// session is ended with [`EndReason::Expired`].
    ///
    /// # Errors
    /// Returns `NotAuthenticated` without a session and `SessionExpired` when
    /// the server refuses the rotation.
    pub async fn rotate(&self) -> Result<String, AgentError> {
        let _guard = self.inner.rotation.lock().await;
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> Result<String, AgentError> {
        let Some(session) = self.current().await else {
            return Err(AgentError::NotAuthenticated);
        };
        let request = RefreshTokenRequest {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
        };
        let response = match self.post_json::<_, SessionResponse>("auth/refresh-token", &request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("token rotation failed: {err}");
                self.end(EndReason::Expired).await?;
                return Err(AgentError::SessionExpired);
            }
        };
        let token = response.token.clone();
        self.store(response).await?;
        debug!("access token rotated");
        Ok(token)
    }

    /// Rotate unless another caller already replaced `stale`.
    async fn refresh_after(&self, stale: &str) -> Result<String, AgentError> {
        let _guard = self.inner.rotation.lock().await;
        match self.access_token().await {
            Some(current) if current != stale => {
                trace!("access token already rotated by another request");
                Ok(current)
            }
            Some(_) => self.rotate_locked().await,
            None => Err(AgentError::NotAuthenticated),
        }
    }

    /// Send an authenticated request. A 401 leads to one rotation and one
    /// retry; whatever the retry returns is handed back unchanged.
    ///
    /// # Errors
    /// Returns `NotAuthenticated` without a session, `SessionExpired` if the
    /// rotation is refused, or transport errors.
    pub async fn send<B: Serialize + ?Sized + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, AgentError> {
        let Some(token) = self.access_token().await else {
            return Err(AgentError::NotAuthenticated);
        };
        let response = self.dispatch(method.clone(), path, body, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        debug!(path, "request unauthorized; rotating once");
        let token = self.refresh_after(&token).await?;
        self.dispatch(method, path, body, &token).await
    }

    /// [`Self::send`] and decode a JSON success body.
    ///
    /// # Errors
    /// As [`Self::send`], plus `Rejected` for non-success statuses.
    pub async fn send_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, AgentError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self.send(method, path, body).await?;
        decode(response).await
    }

    async fn dispatch<B: Serialize + ?Sized + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        token: &str,
    ) -> Result<Response, AgentError> {
        let mut request = self
            .inner
            .http
            .request(method, self.endpoint(path)?)
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Open the push connection. It reconnects after the configured delay
    /// while the agent is signed in, and stops on revocation or
    /// [`Self::stop_events`].
    ///
    /// # Errors
    /// Returns `NotAuthenticated` without a session.
    pub async fn start_events(&self) -> Result<(), AgentError> {
        if !self.is_authenticated().await {
            return Err(AgentError::NotAuthenticated);
        }
        let mut events = self.inner.events.lock().await;
        if events.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let agent = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { agent.run_events(task_cancel).await });
        *events = Some(EventsHandle { cancel, task });
        Ok(())
    }

    pub async fn stop_events(&self) {
        let handle = self.inner.events.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(err) = handle.task.await {
                debug!("session events task ended abnormally: {err}");
            }
        }
    }

    pub async fn events_running(&self) -> bool {
        self.inner.events.lock().await.is_some()
    }

    async fn run_events(self, cancel: CancellationToken) {
        loop {
            let Some(user_id) = self.user_id().await else {
                break;
            };
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.stream_events(user_id) => outcome,
            };
            match outcome {
                Ok(StreamEnd::Revoked) => break,
                Ok(StreamEnd::Closed) => debug!("session events stream closed"),
                Err(err) => warn!("session events stream failed: {err}"),
            }
            if !self.is_authenticated().await {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.inner.reconnect_delay) => {}
            }
        }
        debug!("session events listener stopped");
    }

    async fn stream_events(&self, user_id: Uuid) -> Result<StreamEnd, AgentError> {
        let mut url = self.endpoint("session-events")?;
        url.query_pairs_mut()
            .append_pair("userId", &user_id.to_string());
        let response = self
            .inner
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            for event in decoder.feed(&chunk?) {
                match event.event.as_str() {
                    "session_revoked" => {
                        let message = serde_json::from_str::<RevokedNotice>(&event.data)
                            .map(|notice| notice.message)
                            .unwrap_or_default();
                        self.handle_revoked(message).await;
                        return Ok(StreamEnd::Revoked);
                    }
                    "connected" => debug!("session events connected"),
                    "ping" => trace!("session events ping"),
                    other => debug!(event = other, "ignoring session event"),
                }
            }
        }
        Ok(StreamEnd::Closed)
    }

    async fn handle_revoked(&self, message: String) {
        info!("session revoked by the server");
        // Runs inside the events task: drop the handle instead of joining it.
        if let Some(handle) = self.inner.events.lock().await.take() {
            handle.cancel.cancel();
        }
        if let Err(err) = self.end(EndReason::Revoked { message }).await {
            warn!("failed to clear revoked session: {err}");
        }
    }

    /// Wipe memory and storage, then notify the observer.
    async fn end(&self, reason: EndReason) -> Result<(), AgentError> {
        let had_session = self.inner.state.write().await.take().is_some();
        let cleared = self.inner.storage.clear().await.map_err(AgentError::Storage);
        if reason != EndReason::LoggedOut || had_session {
            if let Some(observer) = &self.inner.observer {
                observer.session_ended(&reason);
            }
        }
        if !matches!(reason, EndReason::Revoked { .. }) {
            self.stop_events().await;
        }
        cleared
    }

    async fn store(&self, response: SessionResponse) -> Result<UserProfile, AgentError> {
        let session = StoredSession {
            access_token: response.token,
            refresh_token: response.refresh_token,
            user: response.user,
        };
        self.inner
            .storage
            .save(&session)
            .await
            .map_err(AgentError::Storage)?;
        let user = session.user.clone();
        *self.inner.state.write().await = Some(session);
        Ok(user)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AgentError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .inner
            .http
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await?;
        decode(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, AgentError> {
        Ok(self.inner.base_url.join(path.trim_start_matches('/'))?)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AgentError> {
    if !response.status().is_success() {
        return Err(rejected(response).await);
    }
    Ok(response.json().await?)
}

async fn rejected(response: Response) -> AgentError {
    let status = response.status();
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    AgentError::Rejected { status, message }
}
