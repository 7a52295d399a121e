mod common;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    middleware::{self, Next},
    response::IntoResponse,
};
use chrono::Utc;
use common::{harness, Harness, PASSWORD};
use learnbox::{
    client::{
        AgentError, CredentialStorage, EndReason, MemoryStorage, SessionAgent, SessionObserver,
        StoredSession,
    },
    session::{broadcaster::REVOKED_MESSAGE, identity::ROLE_STUDENT},
};
use reqwest::{Method, StatusCode};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout, Instant},
};

struct ChannelObserver(mpsc::UnboundedSender<EndReason>);

impl SessionObserver for ChannelObserver {
    fn session_ended(&self, reason: &EndReason) {
        let _ = self.0.send(reason.clone());
    }
}

type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// Serve the API while counting requests per path.
async fn counted_server(h: &Harness) -> Result<(SocketAddr, Hits)> {
    let hits: Hits = Arc::default();
    let recorder = hits.clone();
    let router = h.router().layer(middleware::from_fn(move |request: Request, next: Next| {
        let recorder = recorder.clone();
        async move {
            if let Ok(mut hits) = recorder.lock() {
                *hits.entry(request.uri().path().to_string()).or_default() += 1;
            }
            next.run(request).await
        }
    }));
    let addr = h.spawn_server(router).await?;
    Ok((addr, hits))
}

fn hits_for(hits: &Hits, path: &str) -> usize {
    hits.lock()
        .map(|hits| hits.get(path).copied().unwrap_or_default())
        .unwrap_or_default()
}

/// A stored session whose access token expired a minute ago.
async fn expired_session(h: &Harness, email: &str) -> Result<StoredSession> {
    let issued = h.service.login(email, PASSWORD).await?;
    let tokens = h.service.tokens();
    let mut claims = tokens.verify(&issued.access_token)?;
    claims.iat -= 3600;
    claims.exp = Utc::now().timestamp() - 60;
    Ok(StoredSession {
        access_token: tokens.sign(&claims)?,
        refresh_token: issued.refresh_token,
        user: issued.user,
    })
}

async fn next_end(rx: &mut mpsc::UnboundedReceiver<EndReason>) -> Result<EndReason> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("observer was not notified")?
        .context("observer channel closed")
}

#[tokio::test]
async fn expired_access_token_rotates_once_and_retries_once() -> Result<()> {
    let h = harness()?;
    h.seed_user("ada", ROLE_STUDENT).await?;
    let (addr, hits) = counted_server(&h).await?;
    let stored = expired_session(&h, "ada@example.com").await?;
    let storage = Arc::new(MemoryStorage::with_session(stored.clone()));

    let agent = SessionAgent::new(&format!("http://{addr}"), storage.clone())?;
    assert!(agent.restore().await?);

    let response = agent
        .send::<()>(Method::POST, "/auth/validate-token", None)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(hits_for(&hits, "/auth/refresh-token"), 1);
    assert_eq!(hits_for(&hits, "/auth/validate-token"), 2);

    let current = agent.current().await.context("session kept")?;
    assert_ne!(current.access_token, stored.access_token);
    assert_eq!(current.refresh_token, stored.refresh_token);
    assert_eq!(storage.load().await?, Some(current));
    Ok(())
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_rotation() -> Result<()> {
    let h = harness()?;
    h.seed_user("ada", ROLE_STUDENT).await?;
    let (addr, hits) = counted_server(&h).await?;
    let stored = expired_session(&h, "ada@example.com").await?;
    let storage = Arc::new(MemoryStorage::with_session(stored.clone()));
    let agent = SessionAgent::new(&format!("http://{addr}"), storage)?;
    agent.restore().await?;

    let (first, second, third) = tokio::join!(
        agent.send::<()>(Method::POST, "/auth/validate-token", None),
        agent.send::<()>(Method::POST, "/auth/validate-token", None),
        agent.send::<()>(Method::POST, "/auth/validate-token", None),
    );
    for response in [first?, second?, third?] {
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(hits_for(&hits, "/auth/refresh-token"), 1);
    let current = agent.current().await.context("session kept")?;
    assert_ne!(current.access_token, stored.access_token);
    assert_eq!(current.refresh_token, stored.refresh_token);
    Ok(())
}

#[tokio::test]
async fn events_reconnect_after_the_delay() -> Result<()> {
    let h = harness()?;
    let user = h.seed_user("ada", ROLE_STUDENT).await?;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    // The first session-events request fails; later ones reach the API.
    let router = h.router().layer(middleware::from_fn(move |request: Request, next: Next| {
        let counter = counter.clone();
        async move {
            if request.uri().path() == "/session-events"
                && counter.fetch_add(1, Ordering::SeqCst) == 0
            {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            next.run(request).await
        }
    }));
    let addr = h.spawn_server(router).await?;

    let (tx, mut ended) = mpsc::unbounded_channel();
    let delay = Duration::from_millis(100);
    let agent = SessionAgent::new(&format!("http://{addr}"), Arc::new(MemoryStorage::new()))?
        .with_observer(Arc::new(ChannelObserver(tx)))
        .with_reconnect_delay(delay);
    agent.login("ada@example.com", PASSWORD).await?;

    let started = Instant::now();
    agent.start_events().await?;
    timeout(Duration::from_secs(5), async {
        while !h.broadcaster.is_connected(user.id).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("agent never reconnected")?;
    assert!(started.elapsed() >= delay);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(agent.is_authenticated().await);
    assert!(agent.events_running().await);
    assert!(ended.try_recv().is_err());

    // The second connection is live.
    h.service.revoke_sessions(user.id).await?;
    assert!(matches!(next_end(&mut ended).await?, EndReason::Revoked { .. }));
    Ok(())
}

#[tokio::test]
async fn refused_rotation_clears_the_session() -> Result<()> {
    let h = harness()?;
    let user = h.seed_user("ada", ROLE_STUDENT).await?;
    let (addr, hits) = counted_server(&h).await?;
    let stored = expired_session(&h, "ada@example.com").await?;
    h.service.revoke_sessions(user.id).await?;

    let (tx, mut ended) = mpsc::unbounded_channel();
    let storage = Arc::new(MemoryStorage::with_session(stored));
    let agent = SessionAgent::new(&format!("http://{addr}"), storage.clone())?
        .with_observer(Arc::new(ChannelObserver(tx)));
    agent.restore().await?;

    let result = agent
        .send::<()>(Method::POST, "/auth/validate-token", None)
        .await;
    assert!(matches!(result, Err(AgentError::SessionExpired)));
    assert_eq!(next_end(&mut ended).await?, EndReason::Expired);

    assert!(!agent.is_authenticated().await);
    assert_eq!(storage.load().await?, None);
    assert_eq!(hits_for(&hits, "/auth/refresh-token"), 1);
    assert_eq!(hits_for(&hits, "/auth/validate-token"), 1);

    let after = agent
        .send::<()>(Method::POST, "/auth/validate-token", None)
        .await;
    assert!(matches!(after, Err(AgentError::NotAuthenticated)));
    Ok(())
}

#[tokio::test]
async fn revocation_push_signs_the_agent_out() -> Result<()> {
    let h = harness()?;
    let user = h.seed_user("ada", ROLE_STUDENT).await?;
    let addr = h.spawn_server(h.router()).await?;

    let (tx, mut ended) = mpsc::unbounded_channel();
    let storage = Arc::new(MemoryStorage::new());
    let agent = SessionAgent::new(&format!("http://{addr}/"), storage.clone())?
        .with_observer(Arc::new(ChannelObserver(tx)))
        .with_reconnect_delay(Duration::from_millis(50));
    let profile = agent.login("ada@example.com", PASSWORD).await?;
    assert_eq!(profile.id, user.id);
    agent.start_events().await?;

    timeout(Duration::from_secs(5), async {
        while !h.broadcaster.is_connected(user.id).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("agent never connected to session events")?;

    h.service.revoke_sessions(user.id).await?;

    assert_eq!(
        next_end(&mut ended).await?,
        EndReason::Revoked {
            message: REVOKED_MESSAGE.to_string()
        }
    );
    assert!(!agent.is_authenticated().await);
    assert!(!agent.events_running().await);
    assert_eq!(storage.load().await?, None);
    Ok(())
}

#[tokio::test]
async fn login_and_logout_over_http() -> Result<()> {
    let h = harness()?;
    let user = h.seed_user("ada", ROLE_STUDENT).await?;
    let addr = h.spawn_server(h.router()).await?;

    let (tx, mut ended) = mpsc::unbounded_channel();
    let storage = Arc::new(MemoryStorage::new());
    let agent = SessionAgent::new(&format!("http://{addr}"), storage.clone())?
        .with_observer(Arc::new(ChannelObserver(tx)));

    let bad = agent.login("ada@example.com", "wrong").await;
    assert!(matches!(
        bad,
        Err(AgentError::Rejected { status, .. }) if status == StatusCode::UNAUTHORIZED
    ));

    agent.login("ada@example.com", PASSWORD).await?;
    assert!(storage.load().await?.is_some());
    let validated: serde_json::Value = agent
        .send_json::<(), _>(Method::POST, "/auth/validate-token", None)
        .await?;
    assert_eq!(validated["user"]["id"], user.id.to_string());

    agent.logout().await?;
    assert_eq!(next_end(&mut ended).await?, EndReason::LoggedOut);
    assert!(!agent.is_authenticated().await);
    assert_eq!(storage.load().await?, None);
    assert!(h.service.credentials().active_for(user.id).await?.is_empty());

    // Signing out twice is quiet.
    agent.logout().await?;
    assert!(ended.try_recv().is_err());
    Ok(())
}
