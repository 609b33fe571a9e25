//! Notification channels
//!
//! Channels are named in configuration and addressed by name from the
//! post-merge pipeline. Three transports exist: a JSON webhook, a comment on
//! the merged pull request, and the local log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::{CollaboratorError, GitHost};

/// Notification channel configuration, stored under `[[notifications.channels]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannelConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelKind {
    Webhook { url: String },
    PullRequestComment,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub candidate_id: u64,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: String,
    /// Transport-specific id that can be re-read later, when there is one
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    /// The transport offers no way to read a delivery back
    Unverifiable,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<DeliveryReceipt, CollaboratorError>;

    async fn delivery_status(
        &self,
        receipt: &DeliveryReceipt,
    ) -> Result<DeliveryStatus, CollaboratorError>;
}

/// Notifier that dispatches to the configured channels
pub struct ChannelNotifier {
    channels: Vec<NotificationChannelConfig>,
    http: reqwest::Client,
    host: Arc<dyn GitHost>,
    timeout: Duration,
}

impl ChannelNotifier {
    pub fn new(
        channels: Vec<NotificationChannelConfig>,
        host: Arc<dyn GitHost>,
        timeout: Duration,
    ) -> Self {
        Self {
            channels,
            http: reqwest::Client::new(),
            host,
            timeout,
        }
    }

    fn channel(&self, name: &str) -> Result<&NotificationChannelConfig, CollaboratorError> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CollaboratorError::NotFound(format!("notification channel '{name}'")))
    }

    async fn post_webhook(
        &self,
        url: &str,
        message: &NotificationMessage,
    ) -> Result<(), CollaboratorError> {
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(CollaboratorError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

impl std::fmt::Debug for ChannelNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelNotifier")
            .field("channels", &self.channels)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<DeliveryReceipt, CollaboratorError> {
        let config = self.channel(channel)?;
        debug!(channel, kind = ?config.kind, "Sending notification");

        let id = match &config.kind {
            ChannelKind::Webhook { url } => {
                self.post_webhook(url, message).await?;
                None
            }
            ChannelKind::PullRequestComment => {
                let body = format!("**{}**\n\n{}", message.subject, message.body);
                let comment_id = self.host.add_comment(message.candidate_id, &body).await?;
                Some(comment_id.to_string())
            }
            ChannelKind::Log => {
                info!(
                    channel,
                    candidate = message.candidate_id,
                    subject = %message.subject,
                    "{}",
                    message.body
                );
                None
            }
        };

        Ok(DeliveryReceipt {
            channel: channel.to_string(),
            id,
        })
    }

    async fn delivery_status(
        &self,
        receipt: &DeliveryReceipt,
    ) -> Result<DeliveryStatus, CollaboratorError> {
        let config = self.channel(&receipt.channel)?;
        match (&config.kind, &receipt.id) {
            (ChannelKind::PullRequestComment, Some(id)) => {
                let comment_id = id
                    .parse::<u64>()
                    .map_err(|_| CollaboratorError::NotFound(format!("comment id '{id}'")))?;
                if self.host.comment_exists(comment_id).await? {
                    Ok(DeliveryStatus::Delivered)
                } else {
                    Ok(DeliveryStatus::Failed)
                }
            }
            (ChannelKind::PullRequestComment, None) => Ok(DeliveryStatus::Failed),
            (ChannelKind::Log, _) => Ok(DeliveryStatus::Delivered),
            (ChannelKind::Webhook { .. }, _) => Ok(DeliveryStatus::Unverifiable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::InMemoryGitHost;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> NotificationMessage {
        NotificationMessage {
            candidate_id: 42,
            subject: "Merged #42".to_string(),
            body: "Merged into main".to_string(),
        }
    }

    #[test]
    fn test_channel_config_parses_tagged_kinds() {
        let parsed: Vec<NotificationChannelConfig> = toml::from_str::<toml::Value>(
            r#"
            [[channels]]
            name = "ops"
            type = "webhook"
            url = "https://hooks.example.com/merge"

            [[channels]]
            name = "pr"
            type = "pull_request_comment"
            "#,
        )
        .unwrap()
        .get("channels")
        .unwrap()
        .clone()
        .try_into()
        .unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0].kind,
            ChannelKind::Webhook {
                url: "https://hooks.example.com/merge".to_string()
            }
        );
        assert_eq!(parsed[1].kind, ChannelKind::PullRequestComment);
    }

    #[tokio::test]
    async fn test_comment_channel_is_verified_by_reading_back() {
        let host = Arc::new(InMemoryGitHost::new());
        let notifier = ChannelNotifier::new(
            vec![NotificationChannelConfig {
                name: "pr".to_string(),
                kind: ChannelKind::PullRequestComment,
            }],
            host.clone(),
            Duration::from_secs(5),
        );

        let receipt = notifier.send("pr", &message()).await.unwrap();
        assert!(receipt.id.is_some());
        assert_eq!(notifier.delivery_status(&receipt).await.unwrap(), DeliveryStatus::Delivered);

        host.delete_all_comments();
        assert_eq!(notifier.delivery_status(&receipt).await.unwrap(), DeliveryStatus::Failed);
    }

    fn webhook(server: &MockServer) -> ChannelNotifier {
        ChannelNotifier::new(
            vec![NotificationChannelConfig {
                name: "ops".to_string(),
                kind: ChannelKind::Webhook {
                    url: format!("{}/hooks/merge", server.uri()),
                },
            }],
            Arc::new(InMemoryGitHost::new()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_webhook_channel_posts_message_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/merge"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({
                "candidate_id": 42,
                "subject": "Merged #42",
                "body": "Merged into main",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = webhook(&server);
        let receipt = notifier.send("ops", &message()).await.unwrap();

        assert_eq!(receipt, DeliveryReceipt { channel: "ops".to_string(), id: None });
        assert_eq!(notifier.delivery_status(&receipt).await.unwrap(), DeliveryStatus::Unverifiable);
    }

    #[tokio::test]
    async fn test_webhook_rejection_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/merge"))
            .respond_with(ResponseTemplate::new(500).set_body_string("hook exploded"))
            .mount(&server)
            .await;

        let err = webhook(&server).send("ops", &message()).await.unwrap_err();
        match err {
            CollaboratorError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "hook exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_channel_is_an_error() {
        let host = Arc::new(InMemoryGitHost::new());
        let notifier = ChannelNotifier::new(vec![], host, Duration::from_secs(5));
        let err = notifier.send("missing", &message()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_log_channel_always_delivers() {
        let notifier = ChannelNotifier::new(
            vec![NotificationChannelConfig {
                name: "log".to_string(),
                kind: ChannelKind::Log,
            }],
            Arc::new(InMemoryGitHost::new()),
            Duration::from_secs(5),
        );
        let receipt = notifier.send("log", &message()).await.unwrap();
        assert_eq!(notifier.delivery_status(&receipt).await.unwrap(), DeliveryStatus::Delivered);
    }
}
