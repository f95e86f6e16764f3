//! Asynchronous export of request log events.
//!
//! Events are enqueued without blocking the request path and flushed in
//! batches on a fixed period. The HTTP sink POSTs each batch as a JSON
//! array; export failures are logged and dropped, never propagated.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

use crate::content::now_millis;

/// The client that performed a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_agent: String,
    pub origin: String,
    pub host: String,
    pub ip: String,
}

/// The content a request produced or consumed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentInfo {
    pub content_length: u64,
    pub content_type: String,
    pub content_expiry: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEvent {
    kind: &'static str,
    timestamp: i64,
    key: String,
    #[serde(flatten)]
    user: User,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    content: Option<ContentInfo>,
}

impl LogEvent {
    fn new(kind: &'static str, key: &str, user: &User, content: Option<ContentInfo>) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
            key: key.to_string(),
            user: user.clone(),
            content,
        }
    }
}

/// Sink for request log events.
pub trait LogSink: Send + Sync + 'static {
    fn log_attempted_get(&self, key: &str, user: &User);
    fn log_get(&self, key: &str, user: &User, content: ContentInfo);
    fn log_post(&self, key: &str, user: &User, content: ContentInfo);
}

/// Discards all events. Used when no logging URI is configured.
pub struct StubLogSink;

impl LogSink for StubLogSink {
    fn log_attempted_get(&self, _key: &str, _user: &User) {}
    fn log_get(&self, _key: &str, _user: &User, _content: ContentInfo) {}
    fn log_post(&self, _key: &str, _user: &User, _content: ContentInfo) {}
}

/// Batches events and POSTs them to an HTTP endpoint.
pub struct HttpLogSink {
    client: reqwest::Client,
    uri: String,
    queue: Mutex<Vec<LogEvent>>,
}

impl HttpLogSink {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            uri: uri.into(),
            queue: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the periodic flush task.
    pub fn start_flush_task(self: &Arc<Self>, flush_period_secs: u64) -> JoinHandle<()> {
        let sink = self.clone();
        let period = Duration::from_secs(flush_period_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                sink.flush().await;
            }
        })
    }

    fn enqueue(&self, event: LogEvent) {
        self.queue.lock().expect("log queue poisoned").push(event);
    }

    /// Drain the queue and export it. Called periodically and on
    /// shutdown.
    pub async fn flush(&self) {
        let events: Vec<LogEvent> = {
            let mut queue = self.queue.lock().expect("log queue poisoned");
            std::mem::take(&mut *queue)
        };
        if events.is_empty() {
            return;
        }

        let result = self
            .client
            .post(&self.uri)
            .json(&events)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        if let Err(err) = result {
            error!("failed to send log data to HTTP endpoint: {err}");
        }
    }
}

impl LogSink for HttpLogSink {
    fn log_attempted_get(&self, key: &str, user: &User) {
        self.enqueue(LogEvent::new("attempted-get", key, user, None));
    }

    fn log_get(&self, key: &str, user: &User, content: ContentInfo) {
        self.enqueue(LogEvent::new("get", key, user, Some(content)));
    }

    fn log_post(&self, key: &str, user: &User, content: ContentInfo) {
        self.enqueue(LogEvent::new("post", key, user, Some(content)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            user_agent: "test-agent".to_string(),
            origin: "null".to_string(),
            host: "localhost:8080".to_string(),
            ip: "127.0.0.1".to_string(),
        }
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = LogEvent::new(
            "post",
            "abc1234",
            &user(),
            Some(ContentInfo {
                content_length: 42,
                content_type: "text/plain".to_string(),
                content_expiry: None,
            }),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "post");
        assert_eq!(json["key"], "abc1234");
        assert_eq!(json["userAgent"], "test-agent");
        assert_eq!(json["contentLength"], 42);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_attempted_get_has_no_content_fields() {
        let event = LogEvent::new("attempted-get", "abc1234", &user(), None);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("contentLength").is_none());
    }

    #[test]
    fn test_sink_queues_events() {
        let sink = HttpLogSink::new("http://localhost:0/logs");
        sink.log_post(
            "abc1234",
            &user(),
            ContentInfo {
                content_length: 1,
                content_type: "text/plain".to_string(),
                content_expiry: None,
            },
        );
        sink.log_attempted_get("zzz9999", &user());
        assert_eq!(sink.queue.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_drains_queue_even_on_failure() {
        let sink = HttpLogSink::new("http://127.0.0.1:1/logs");
        sink.log_attempted_get("abc1234", &user());
        sink.flush().await;
        assert!(sink.queue.lock().unwrap().is_empty());
    }
}
