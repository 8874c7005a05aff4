//! Debug event broadcaster: a bounded ring of structured events fanned out
//! to any number of `/api/debug/stream` WebSocket clients.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

/// Events kept for replay and save-to-file.
const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct DebugMessage {
    pub timestamp: DateTime<Utc>,
    pub level: &'static str,
    pub category: &'static str,
    pub event: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub struct DebugHub {
    enabled: AtomicBool,
    history: Mutex<VecDeque<DebugMessage>>,
    tx: broadcast::Sender<DebugMessage>,
}

impl Default for DebugHub {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            enabled: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            tx,
        }
    }
}

impl DebugHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn info(&self, category: &'static str, event: &'static str, message: impl Into<String>) {
        self.publish("INFO", category, event, message.into(), None);
    }

    pub fn warning(&self, category: &'static str, event: &'static str, message: impl Into<String>) {
        self.publish("WARNING", category, event, message.into(), None);
    }

    pub fn error(
        &self,
        category: &'static str,
        event: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        self.publish("ERROR", category, event, message.into(), details);
    }

    pub fn success(
        &self,
        category: &'static str,
        event: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        self.publish("SUCCESS", category, event, message.into(), details);
    }

    fn publish(
        &self,
        level: &'static str,
        category: &'static str,
        event: &'static str,
        message: String,
        details: Option<Value>,
    ) {
        if !self.enabled() {
            return;
        }
        let msg = DebugMessage {
            timestamp: Utc::now(),
            level,
            category,
            event,
            message,
            details,
        };
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(msg.clone());
        }
        // No receivers is fine; the ring still accumulates.
        let _ = self.tx.send(msg);
    }

    pub fn history(&self) -> Vec<DebugMessage> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebugMessage> {
        self.tx.subscribe()
    }

    /// Write the ring to disk in the line format the log viewer expects.
    pub async fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let mut out = format!(
            "=== DEBUG LOG SAVED AT {} ===\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        for msg in self.history() {
            out.push_str(&format!(
                "[{}] [{}] [{}/{}] {}",
                msg.timestamp.format("%H:%M:%S%.3f"),
                msg.level,
                msg.category,
                msg.event,
                msg.message
            ));
            if let Some(details) = &msg.details {
                out.push_str(&format!(" | Details: {details}"));
            }
            out.push('\n');
        }
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, out).await?;
        Ok(())
    }
}

/// Serve one debug-stream WebSocket client: replay history, then relay live
/// events until the client goes away.
pub async fn handle_stream_socket(mut socket: WebSocket, hub: std::sync::Arc<DebugHub>) {
    info!("debug stream client connected");

    for msg in hub.history() {
        let Ok(json) = serde_json::to_string(&msg) else {
            continue;
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let mut rx = hub.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let msg = match event {
                    Ok(m) => m,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "debug stream client lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // clients don't send anything meaningful
                }
            }
        }
    }

    info!("debug stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_hub_drops_events() {
        let hub = DebugHub::new();
        hub.info("WEBRTC", "test", "dropped");
        assert!(hub.history().is_empty());
    }

    #[test]
    fn ring_truncates_at_capacity() {
        let hub = DebugHub::new();
        hub.set_enabled(true);
        for i in 0..HISTORY_CAP + 25 {
            hub.info("SYSTEM", "tick", format!("event {i}"));
        }
        let history = hub.history();
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history[0].message, "event 25");
        assert_eq!(history.last().unwrap().message, format!("event {}", HISTORY_CAP + 24));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = DebugHub::new();
        hub.set_enabled(true);
        let mut rx = hub.subscribe();
        hub.success("WEBRTC", "ice_connected", "up", Some(serde_json::json!({"n": 1})));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "ice_connected");
        assert_eq!(msg.details.unwrap()["n"], 1);
    }
}
