//! Backend notifier — lifecycle events enqueued for the control plane.
//! Best-effort: a failed delivery is logged and forgotten.

use serde::Serialize;
use tracing::{debug, error};

use crate::store::MessageQueue;

/// Lifecycle event kind, reported as the `Action` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    Warning,
    Error,
    ServerReady,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::ServerReady => "server-ready",
        }
    }
}

#[derive(Serialize)]
struct TaskNotify<'a> {
    #[serde(rename = "Api")]
    api: &'static str,
    #[serde(rename = "Args")]
    args: TaskNotifyArgs<'a>,
}

#[derive(Serialize)]
struct TaskNotifyArgs<'a> {
    #[serde(rename = "ServerName")]
    server_name: &'a str,
    #[serde(rename = "Action")]
    action: &'static str,
    #[serde(rename = "Message")]
    message: &'a str,
}

pub struct Notifier {
    queue: Option<Box<dyn MessageQueue>>,
    server: String,
}

impl Notifier {
    pub fn new(queue: Option<Box<dyn MessageQueue>>, server: impl Into<String>) -> Self {
        Self { queue, server: server.into() }
    }

    /// Serialize and enqueue one event. Never fails the caller.
    pub async fn notify(&self, kind: EventKind, message: &str) {
        let Some(queue) = &self.queue else {
            debug!(kind = kind.as_str(), message, "no queue configured, notification dropped");
            return;
        };
        let body = TaskNotify {
            api: "tasknotify",
            args: TaskNotifyArgs {
                server_name: &self.server,
                action: kind.as_str(),
                message,
            },
        };
        let body = match serde_json::to_string(&body) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to serialize notification");
                return;
            }
        };
        if let Err(e) = queue.enqueue(body).await {
            error!(error = %e, kind = kind.as_str(), "backend notification failed");
        }
    }
}
