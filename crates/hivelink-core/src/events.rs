use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::logging::log;
use crate::now_millis;

/// A structured lifecycle event. Advisory only — losing one never affects
/// correctness.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub fields: serde_json::Value,
    pub timestamp: i64,
}

impl Event {
    /// Merge type and timestamp into the field object for wire consumers.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = self.fields.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".to_string(), serde_json::json!(self.event_type));
            obj.insert("timestamp".to_string(), serde_json::json!(self.timestamp));
        }
        value
    }
}

/// A sink for lifecycle events. Must not block; errors are logged and
/// swallowed by the bus.
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    fn on_event(&self, event: &Event) -> Result<()>;
}

/// Synchronous fan-out of events to a subscriber list fixed at startup.
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    log_file: PathBuf,
}

impl EventBus {
    pub fn new(log_file: PathBuf) -> Self {
        Self {
            subscribers: Vec::new(),
            log_file,
        }
    }

    /// Register a subscriber. Only valid before the daemon starts publishing.
    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn emit(&self, event_type: &str, fields: serde_json::Value) {
        let event = Event {
            event_type: event_type.to_string(),
            fields,
            timestamp: now_millis(),
        };
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.on_event(&event) {
                log(
                    "WARN",
                    &format!(
                        "Event subscriber '{}' failed on '{}': {}",
                        subscriber.name(),
                        event_type,
                        e
                    ),
                    &self.log_file,
                );
            }
        }
    }
}

/// Writes a compact line per event into the daemon log.
pub struct LogSubscriber {
    log_file: PathBuf,
}

impl LogSubscriber {
    pub fn new(log_file: PathBuf) -> Self {
        Self { log_file }
    }
}

impl EventSubscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    fn on_event(&self, event: &Event) -> Result<()> {
        log(
            "EVENT",
            &format!("{} {}", event.event_type, event.fields),
            &self.log_file,
        );
        Ok(())
    }
}

/// Bridges events onto a broadcast channel, consumed by the HTTP server's
/// SSE stream. Lagging or absent receivers are not an error.
pub struct BroadcastSubscriber {
    tx: broadcast::Sender<String>,
}

impl BroadcastSubscriber {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl EventSubscriber for BroadcastSubscriber {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn on_event(&self, event: &Event) -> Result<()> {
        let _ = self.tx.send(event.to_json().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventSubscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn on_event(&self, event: &Event) -> Result<()> {
            self.seen.lock().unwrap().push(event.event_type.clone());
            Ok(())
        }
    }

    struct Failing;

    impl EventSubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn on_event(&self, _event: &Event) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn test_emit_fans_out() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut bus = EventBus::new(tmp.path().join("log"));
        bus.subscribe(recorder.clone());
        bus.emit("chain_step_start", serde_json::json!({"agentId": "coder"}));
        bus.emit("chain_step_done", serde_json::json!({"agentId": "coder"}));
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["chain_step_start", "chain_step_done"]
        );
    }

    #[test]
    fn test_failing_subscriber_never_breaks_others() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut bus = EventBus::new(tmp.path().join("log"));
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(recorder.clone());
        bus.emit("response_ready", serde_json::json!({}));
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_to_json_merges_type_and_timestamp() {
        let event = Event {
            event_type: "agent_routed".to_string(),
            fields: serde_json::json!({"agentId": "coder"}),
            timestamp: 1234,
        };
        let json = event.to_json();
        assert_eq!(json["type"], "agent_routed");
        assert_eq!(json["timestamp"], 1234);
        assert_eq!(json["agentId"], "coder");
    }

    #[test]
    fn test_broadcast_subscriber_without_receivers_is_ok() {
        let (tx, _) = broadcast::channel(8);
        let sub = BroadcastSubscriber::new(tx);
        let event = Event {
            event_type: "processor_start".to_string(),
            fields: serde_json::json!({}),
            timestamp: 0,
        };
        assert!(sub.on_event(&event).is_ok());
    }
}
