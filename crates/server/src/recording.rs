//! MP4 recorder: one ffmpeg screen-grab at a time, written into the
//! configured records directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Longest accepted recording filename.
const MAX_FILENAME_LEN: usize = 128;

/// Grace period for ffmpeg to finalize the MP4 after SIGINT.
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug)]
pub enum StartError {
    AlreadyRecording,
    Other(anyhow::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyRecording => write!(f, "Recording already in progress"),
            StartError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFile {
    pub filename: String,
    pub size: u64,
    pub duration: f64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

struct ActiveRecording {
    child: Child,
    file: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

pub struct Recorder {
    records_dir: PathBuf,
    display: String,
    active: Mutex<Option<ActiveRecording>>,
}

/// Accept only bare `.mp4` names that cannot escape the records directory.
pub fn valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && name.ends_with(".mp4")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

impl Recorder {
    pub fn new(records_dir: impl Into<PathBuf>, display: impl Into<String>) -> Self {
        Self {
            records_dir: records_dir.into(),
            display: display.into(),
            active: Mutex::new(None),
        }
    }

    /// Start a recording. An empty filename gets a timestamped default.
    pub async fn start(&self, filename: Option<String>) -> Result<(String, DateTime<Utc>), StartError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(StartError::AlreadyRecording);
        }

        let filename = match filename.filter(|f| !f.is_empty()) {
            Some(f) => f,
            None => format!("airplay-{}.mp4", Utc::now().format("%Y%m%d-%H%M%S")),
        };
        if !valid_filename(&filename) {
            return Err(StartError::Other(anyhow::anyhow!(
                "invalid recording filename"
            )));
        }

        tokio::fs::create_dir_all(&self.records_dir)
            .await
            .context("failed to create records dir")
            .map_err(StartError::Other)?;

        let out_path = self.records_dir.join(&filename);
        let child = Command::new("ffmpeg")
            .args([
                "-f", "x11grab",
                "-video_size", "1920x1080",
                "-framerate", "30",
                "-i", self.display.as_str(),
                "-f", "alsa",
                "-i", "hw:Loopback,1",
                "-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2",
                "-c:v", "libx264",
                "-preset", "ultrafast",
                "-c:a", "aac",
                "-strict", "-2",
            ])
            .arg(&out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to start ffmpeg")
            .map_err(StartError::Other)?;

        let started_at = Utc::now();
        info!(file = %filename, "recording started");
        *active = Some(ActiveRecording {
            child,
            file: filename.clone(),
            started_at,
            started: Instant::now(),
        });
        Ok((filename, started_at))
    }

    /// Stop the active recording, returning the filename and duration in
    /// seconds. SIGINT first so ffmpeg can finalize the container.
    pub async fn stop(&self) -> Result<(String, f64)> {
        let mut active = self.active.lock().await;
        let Some(mut rec) = active.take() else {
            anyhow::bail!("No active recording to stop");
        };

        let duration = rec.started.elapsed().as_secs_f64();
        if let Some(pid) = rec.child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGINT,
            );
        }
        match tokio::time::timeout(STOP_GRACE, rec.child.wait()).await {
            Ok(Ok(status)) => info!(file = %rec.file, ?status, "recording stopped"),
            Ok(Err(e)) => warn!(file = %rec.file, "failed to wait for ffmpeg: {e}"),
            Err(_) => {
                warn!(file = %rec.file, "ffmpeg did not stop in time, killing");
                let _ = rec.child.kill().await;
            }
        }
        Ok((rec.file, duration))
    }

    /// `(filename, started_at)` of the active recording, if any.
    pub async fn status(&self) -> Option<(String, DateTime<Utc>)> {
        let active = self.active.lock().await;
        active.as_ref().map(|r| (r.file.clone(), r.started_at))
    }

    /// List finished recordings with probed durations.
    pub async fn list(&self) -> Result<Vec<RecordFile>> {
        let mut entries = match tokio::fs::read_dir(&self.records_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("failed to read records dir"),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".mp4") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                continue;
            }
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let duration = probe_duration(&entry.path()).await;
            files.push(RecordFile {
                filename: name,
                size: meta.len(),
                duration,
                created_at,
            });
        }
        Ok(files)
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.records_dir.join(filename)
    }
}

/// Media duration in seconds via ffprobe; 0 when unknown.
async fn probe_duration(path: &Path) -> f64 {
    let out = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await;
    let Ok(out) = out else {
        return 0.0;
    };
    if !out.status.success() {
        return 0.0;
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&out.stdout) else {
        return 0.0;
    };
    value["format"]["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_validation() {
        assert!(valid_filename("session.mp4"));
        assert!(valid_filename("airplay-20250101-120000.mp4"));
        assert!(!valid_filename(""));
        assert!(!valid_filename("clip.mkv"));
        assert!(!valid_filename("../escape.mp4"));
        assert!(!valid_filename("dir/clip.mp4"));
        assert!(!valid_filename(&format!("{}.mp4", "x".repeat(200))));
    }

    #[tokio::test]
    async fn stop_without_recording_fails() {
        let recorder = Recorder::new("/tmp/airbridge-test-records", ":0");
        assert!(recorder.stop().await.is_err());
        assert!(recorder.status().await.is_none());
    }

    #[tokio::test]
    async fn list_on_missing_dir_is_empty() {
        let recorder = Recorder::new("/tmp/airbridge-test-records-missing", ":0");
        assert!(recorder.list().await.unwrap().is_empty());
    }
}
