//! Notifications shown in response to push messages.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::NotificationConfig;

/// Action button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A notification ready to be displayed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
}

/// Action name that opens the app when a notification is clicked.
pub const ACTION_OPEN: &str = "open";
pub const ACTION_CLOSE: &str = "close";

/// Display subsystem provided by the host.
pub trait Notifier: Send + Sync + 'static {
  fn show(&self, notification: &Notification);
}

/// Notifier that only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn show(&self, notification: &Notification) {
    info!(
      title = %notification.title,
      body = %notification.body,
      tag = ?notification.tag,
      "notification"
    );
  }
}

/// Data carried by a push message. Missing fields use configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
}

impl PushPayload {
  pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(data)
  }
}

/// Build the notification for a push payload.
pub fn build_notification(defaults: &NotificationConfig, payload: &PushPayload) -> Notification {
  Notification {
    title: payload
      .title
      .clone()
      .unwrap_or_else(|| defaults.title.clone()),
    body: payload.body.clone().unwrap_or_else(|| defaults.body.clone()),
    icon: defaults.icon.clone(),
    badge: defaults.badge.clone(),
    tag: defaults.tag.clone(),
    require_interaction: false,
    actions: vec![
      NotificationAction {
        action: ACTION_OPEN.to_string(),
        title: "Open".to_string(),
      },
      NotificationAction {
        action: ACTION_CLOSE.to_string(),
        title: "Close".to_string(),
      },
    ],
  }
}
