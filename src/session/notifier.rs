//! Outbound email notifications.
//!
//! Sends are fire-and-forget: the caller never waits for delivery and a
//! failed send is only logged.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

pub const TEMPLATE_WELCOME: &str = "welcome";
pub const TEMPLATE_PASSWORD_RESET: &str = "password_reset";

#[derive(Clone, Debug, PartialEq)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub variables: Value,
}

/// Email delivery abstraction.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev notifier that logs the message instead of sending it.
#[derive(Clone, Debug)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            "email send stub"
        );
        Ok(())
    }
}

/// Hand `message` to `notifier` on a background task.
pub fn dispatch(notifier: &Arc<dyn Notifier>, message: EmailMessage) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(err) = notifier.send(&message).await {
            error!(
                template = %message.template,
                "failed to send email: {err:#}"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FailingNotifier(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, message: &EmailMessage) -> Result<()> {
            let _ = self.0.send(message.template.clone());
            anyhow::bail!("smtp down")
        }
    }

    #[tokio::test]
    async fn dispatch_swallows_send_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier: Arc<dyn Notifier> = Arc::new(FailingNotifier(tx));
        dispatch(
            &notifier,
            EmailMessage {
                to_email: "ada@example.com".to_string(),
                template: TEMPLATE_WELCOME.to_string(),
                variables: json!({"username": "ada"}),
            },
        );
        let template = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("send attempted");
        assert_eq!(template.as_deref(), Some(TEMPLATE_WELCOME));
    }

    #[tokio::test]
    async fn log_notifier_accepts_everything() {
        let message = EmailMessage {
            to_email: "ada@example.com".to_string(),
            template: TEMPLATE_PASSWORD_RESET.to_string(),
            variables: json!({"code": "123456"}),
        };
        assert!(LogNotifier.send(&message).await.is_ok());
    }
}
