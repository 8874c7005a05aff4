//! AirPlay-side state derived from the window monitor: connection flag,
//! window-size history, and the diagnostics endpoints' data.

use std::collections::VecDeque;
use std::sync::Mutex;

use airbridge_protocol::{CaptureConfig, PathsConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;

use crate::monitor::WindowObservation;

/// Size changes kept for diagnostics.
const SIZE_HISTORY_CAP: usize = 50;

/// Lines of receiver log returned by the logs endpoint.
const LOG_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SizeChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub old_size: String,
    pub new_size: String,
    pub reason: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AirPlayState {
    pub connected: bool,
    pub window_size: String,
    pub last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_start: Option<DateTime<Utc>>,
    pub streaming_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_size_change: Option<DateTime<Utc>>,
    pub size_history: VecDeque<SizeChangeEvent>,
}

impl Default for AirPlayState {
    fn default() -> Self {
        Self {
            connected: false,
            window_size: String::new(),
            last_update: Utc::now(),
            connection_start: None,
            streaming_active: false,
            last_size_change: None,
            size_history: VecDeque::with_capacity(SIZE_HISTORY_CAP),
        }
    }
}

/// Shared tracker, updated once per monitor tick.
#[derive(Default)]
pub struct AirPlayTracker {
    state: Mutex<AirPlayState>,
}

impl AirPlayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one window observation into the state.
    pub fn record(&self, obs: &WindowObservation) {
        let (size, reason, connected) = if obs.present {
            (format!("{}x{}", obs.width, obs.height), "window_detected", true)
        } else {
            (String::new(), "no_windows", false)
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        if state.window_size != size {
            tracing::info!(
                old = %state.window_size,
                new = %size,
                reason,
                connected = state.connected,
                "AirPlay window size changed"
            );
            if state.size_history.len() == SIZE_HISTORY_CAP {
                state.size_history.pop_front();
            }
            let event = SizeChangeEvent {
                timestamp: now,
                old_size: state.window_size.clone(),
                new_size: size.clone(),
                reason: reason.to_string(),
                connected: state.connected,
            };
            state.size_history.push_back(event);
            state.last_size_change = Some(now);
        }

        if state.connected != connected {
            if connected {
                state.connection_start = Some(now);
                tracing::info!(window = %size, "AirPlay connected");
            } else {
                if let Some(start) = state.connection_start.take() {
                    let dur = now.signed_duration_since(start);
                    tracing::info!(seconds = dur.num_seconds(), "AirPlay disconnected");
                }
            }
            state.connected = connected;
        }

        state.window_size = size;
        state.last_update = now;
        // The receiver keeps a 1x1 placeholder window while idle.
        state.streaming_active = !state.window_size.is_empty() && state.window_size != "1x1";
    }

    pub fn snapshot(&self) -> AirPlayState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Tail of the upstream receiver's log, from the first readable candidate path.
pub async fn receiver_log_tail(paths: &PathsConfig) -> anyhow::Result<(String, Vec<String>)> {
    for path in &paths.receiver_log_paths {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let lines: Vec<String> = contents.lines().map(|l| l.to_string()).collect();
                let start = lines.len().saturating_sub(LOG_TAIL_LINES);
                return Ok((path.clone(), lines[start..].to_vec()));
            }
            Err(_) => continue,
        }
    }
    anyhow::bail!("receiver log not readable at any configured path")
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiverProcess {
    pub pid: String,
    pub cpu: String,
    pub mem: String,
    pub command: String,
}

/// List receiver processes via `ps aux` (diagnostics only; failure is an
/// empty list).
pub async fn receiver_processes(cfg: &CaptureConfig) -> Vec<ReceiverProcess> {
    let out = match Command::new("ps").arg("aux").output().await {
        Ok(out) if out.status.success() => out.stdout,
        _ => return Vec::new(),
    };
    let needle = cfg.receiver_process.to_lowercase();
    String::from_utf8_lossy(&out)
        .lines()
        .filter(|line| line.to_lowercase().contains(&needle))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 11 {
                return None;
            }
            Some(ReceiverProcess {
                pid: fields[1].to_string(),
                cpu: fields[2].to_string(),
                mem: fields[3].to_string(),
                command: fields[10..].join(" "),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(id: &str, w: u32, h: u32) -> WindowObservation {
        WindowObservation {
            present: true,
            id: id.to_string(),
            width: w,
            height: h,
        }
    }

    #[test]
    fn connection_flag_follows_observations() {
        let tracker = AirPlayTracker::new();
        tracker.record(&WindowObservation::default());
        assert!(!tracker.snapshot().connected);

        tracker.record(&present("0x1", 1080, 1920));
        let state = tracker.snapshot();
        assert!(state.connected);
        assert!(state.connection_start.is_some());
        assert!(state.streaming_active);

        tracker.record(&WindowObservation::default());
        let state = tracker.snapshot();
        assert!(!state.connected);
        assert!(state.connection_start.is_none());
    }

    #[test]
    fn placeholder_window_is_not_streaming() {
        let tracker = AirPlayTracker::new();
        tracker.record(&present("0x1", 1, 1));
        let state = tracker.snapshot();
        assert!(state.connected);
        assert_eq!(state.window_size, "1x1");
        assert!(!state.streaming_active);
    }

    #[test]
    fn size_history_records_transitions_and_truncates() {
        let tracker = AirPlayTracker::new();
        for i in 0..SIZE_HISTORY_CAP as u32 + 10 {
            tracker.record(&present("0x1", 100 + i, 200));
        }
        let state = tracker.snapshot();
        assert_eq!(state.size_history.len(), SIZE_HISTORY_CAP);
        // Oldest entries were dropped; the newest is the last transition.
        let newest = state.size_history.back().unwrap();
        assert_eq!(newest.new_size, format!("{}x200", 100 + SIZE_HISTORY_CAP as u32 + 9));
    }

    #[test]
    fn unchanged_size_adds_no_history() {
        let tracker = AirPlayTracker::new();
        tracker.record(&present("0x1", 1080, 1920));
        tracker.record(&present("0x1", 1080, 1920));
        tracker.record(&present("0x2", 1080, 1920)); // id change, same size
        assert_eq!(tracker.snapshot().size_history.len(), 1);
    }
}
