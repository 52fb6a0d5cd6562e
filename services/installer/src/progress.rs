//! Per-batch progress channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// One progress message about a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub package: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget sender for [`ProgressEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// Create a sink and the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, package: &str, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            // A closed receiver is fine.
            let _ = tx.send(ProgressEvent {
                package: package.to_string(),
                message: message.into(),
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_events() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.send("a", "downloading");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.package, "a");
        assert_eq!(event.message, "downloading");
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        sink.send("a", "ignored");
        ProgressSink::disabled().send("a", "ignored");
    }
}
