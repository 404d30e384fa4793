//! Backend → host events.
//!
//! The engine broadcasts one tagged event stream; a GUI host subscribes once
//! and switches on `event`. Events for a given bundle id are emitted in
//! order, and `update-execute-complete` is always the last event a bundle
//! emits within one execution.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::SelfUpdateInfo;

/// Channel capacity. Slow subscribers lag rather than block the engine.
const EVENT_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "scan-progress")]
    ScanProgress {
        phase: String,
        current: usize,
        total: usize,
        app_name: Option<String>,
    },

    #[serde(rename = "scan-complete")]
    ScanComplete { app_count: usize, duration_ms: u64 },

    #[serde(rename = "update-check-progress")]
    UpdateCheckProgress {
        checked: usize,
        total: usize,
        current_app: Option<String>,
    },

    #[serde(rename = "update-check-complete")]
    UpdateCheckComplete { updates_found: usize, duration_ms: u64 },

    #[serde(rename = "update-found")]
    UpdateFound {
        bundle_id: String,
        current_version: Option<String>,
        available_version: String,
        source: String,
    },

    #[serde(rename = "update-execute-progress")]
    UpdateExecuteProgress {
        bundle_id: String,
        phase: String,
        percent: u8,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
    },

    #[serde(rename = "update-execute-complete")]
    UpdateExecuteComplete {
        bundle_id: String,
        display_name: String,
        success: bool,
        message: Option<String>,
        needs_relaunch: bool,
        app_path: Option<String>,
        delegated: bool,
    },

    #[serde(rename = "self-update-available")]
    SelfUpdateAvailable { info: SelfUpdateInfo },

    #[serde(rename = "self-update-progress")]
    SelfUpdateProgress {
        phase: String,
        percent: u8,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
    },

    #[serde(rename = "self-update-complete")]
    SelfUpdateComplete {
        success: bool,
        message: Option<String>,
        relaunch_required: bool,
    },
}

/// Fan-out bus for engine events. Cloneable; emitting never fails even with
/// zero subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        log::debug!("event: {:?}", event);
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn execute_progress(
        &self,
        bundle_id: &str,
        phase: &str,
        percent: u8,
        bytes: Option<(u64, Option<u64>)>,
    ) {
        self.emit(EngineEvent::UpdateExecuteProgress {
            bundle_id: bundle_id.to_string(),
            phase: phase.to_string(),
            percent,
            downloaded_bytes: bytes.map(|(d, _)| d),
            total_bytes: bytes.and_then(|(_, t)| t),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_payloads() {
        let ev = EngineEvent::UpdateExecuteProgress {
            bundle_id: "com.example.app".into(),
            phase: "Downloading".into(),
            percent: 42,
            downloaded_bytes: Some(1024),
            total_bytes: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "update-execute-progress");
        assert_eq!(json["data"]["bundle_id"], "com.example.app");
        assert_eq!(json["data"]["downloaded_bytes"], 1024);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::ScanComplete {
            app_count: 3,
            duration_ms: 10,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::ScanComplete { app_count, .. } => assert_eq!(app_count, 3),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::ScanComplete {
            app_count: 0,
            duration_ms: 0,
        });
    }
}
