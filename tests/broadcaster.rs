use anyhow::{Context, Result};
use learnbox::session::{
    broadcaster::{CONNECTED_MESSAGE, CONNECTION_BUFFER},
    RevocationBroadcaster, SessionEvent,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

async fn wait_until_disconnected(broadcaster: &RevocationBroadcaster, user_id: Uuid) -> Result<()> {
    timeout(Duration::from_secs(2), async {
        while broadcaster.is_connected(user_id).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("connection was never unregistered")
}

#[tokio::test]
async fn connect_greets_then_fans_out_to_every_tab() -> Result<()> {
    let broadcaster = Arc::new(RevocationBroadcaster::default());
    let user_id = Uuid::new_v4();
    let mut first = broadcaster.connect(user_id).await;
    let mut second = broadcaster.connect(user_id).await;
    let mut bystander = broadcaster.connect(Uuid::new_v4()).await;
    assert_eq!(broadcaster.connection_count(user_id).await, 2);
    assert_eq!(broadcaster.connected_users().await, 2);

    for subscription in [&mut first, &mut second, &mut bystander] {
        let greeting = subscription.receiver.recv().await.context("greeting")?;
        assert_eq!(
            greeting,
            SessionEvent::Connected(learnbox::session::broadcaster::ConnectedPayload {
                message: CONNECTED_MESSAGE.to_string(),
            })
        );
    }

    let delivered = broadcaster
        .notify(user_id, SessionEvent::session_revoked("bye"))
        .await;
    assert_eq!(delivered, 2);

    for subscription in [&mut first, &mut second] {
        let event = subscription.receiver.recv().await.context("revocation")?;
        assert_eq!(event.name(), "session_revoked");
        assert!(subscription.receiver.try_recv().is_err());
    }
    assert!(bystander.receiver.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn closed_tab_does_not_block_delivery_and_is_cleaned_up() -> Result<()> {
    let broadcaster = Arc::new(RevocationBroadcaster::default());
    let user_id = Uuid::new_v4();
    let closed = broadcaster.connect(user_id).await;
    let mut open = broadcaster.connect(user_id).await;
    open.receiver.recv().await.context("greeting")?;
    drop(closed);

    let delivered = broadcaster
        .notify(user_id, SessionEvent::session_revoked("bye"))
        .await;
    assert_eq!(delivered, 1);
    let event = open.receiver.recv().await.context("revocation")?;
    assert_eq!(event.name(), "session_revoked");

    timeout(Duration::from_secs(2), async {
        while broadcaster.connection_count(user_id).await > 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("closed tab still registered")?;

    drop(open);
    wait_until_disconnected(&broadcaster, user_id).await?;
    assert_eq!(broadcaster.connected_users().await, 0);
    Ok(())
}

#[tokio::test]
async fn heartbeat_pings_on_the_configured_interval() -> Result<()> {
    let broadcaster = Arc::new(RevocationBroadcaster::new(Duration::from_millis(50)));
    let user_id = Uuid::new_v4();
    let mut subscription = broadcaster.connect(user_id).await;

    let greeting = subscription.receiver.recv().await.context("greeting")?;
    assert_eq!(greeting.name(), "connected");
    for _ in 0..2 {
        let ping = timeout(Duration::from_secs(1), subscription.receiver.recv())
            .await
            .context("no ping")?
            .context("stream closed")?;
        assert!(matches!(ping, SessionEvent::Ping(_)));
    }
    Ok(())
}

#[tokio::test]
async fn shutdown_ends_streams_and_empties_the_registry() -> Result<()> {
    let broadcaster = Arc::new(RevocationBroadcaster::default());
    let user_id = Uuid::new_v4();
    let mut subscription = broadcaster.connect(user_id).await;
    subscription.receiver.recv().await.context("greeting")?;

    broadcaster.shutdown();

    let end = timeout(Duration::from_secs(2), subscription.receiver.recv())
        .await
        .context("stream did not end")?;
    assert!(end.is_none());
    wait_until_disconnected(&broadcaster, user_id).await
}

#[tokio::test]
async fn revocation_reaches_a_tab_with_a_backlog() -> Result<()> {
    let broadcaster = Arc::new(RevocationBroadcaster::default());
    let user_id = Uuid::new_v4();
    let mut subscription = broadcaster.connect(user_id).await;
    // Greeting plus a backlog of pings fills the buffer.
    for _ in 1..CONNECTION_BUFFER {
        assert_eq!(broadcaster.notify(user_id, SessionEvent::ping()).await, 1);
    }

    let notifier = broadcaster.clone();
    let revoke = tokio::spawn(async move {
        notifier
            .notify(user_id, SessionEvent::session_revoked("bye"))
            .await
    });

    let mut last = None;
    for _ in 0..=CONNECTION_BUFFER {
        last = timeout(Duration::from_secs(2), subscription.receiver.recv())
            .await
            .context("backlog not drained")?;
    }
    assert_eq!(last.context("stream closed")?.name(), "session_revoked");
    assert_eq!(revoke.await?, 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_ends_a_stream_that_is_never_read() -> Result<()> {
    let broadcaster = Arc::new(RevocationBroadcaster::new(Duration::from_millis(5)));
    let user_id = Uuid::new_v4();
    let _subscription = broadcaster.connect(user_id).await;

    sleep(Duration::from_millis(300)).await;
    assert!(broadcaster.is_connected(user_id).await);

    broadcaster.shutdown();
    wait_until_disconnected(&broadcaster, user_id).await
}
