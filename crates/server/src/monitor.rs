//! Window monitor: polls the X server once per second for the receiver's
//! video window and feeds the controller and the AirPlay state tracker.
//!
//! All X access goes through the external tools (`xset`, `xwininfo`); a
//! failed probe is reported as "no window", never as an error.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use airbridge_protocol::CaptureConfig;
use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::airplay::AirPlayTracker;
use crate::controller::Controller;

/// Minimum dimension for a window to count as present at all.
pub const MIN_WINDOW_DIM: u32 = 100;

/// One observation per monitor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowObservation {
    pub present: bool,
    pub id: String,
    pub width: u32,
    pub height: u32,
}

/// A top-level window as reported by `xwininfo -root -tree`.
#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub id: String,
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl WindowInfo {
    fn aspect(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

fn is_video_aspect(aspect: f64) -> bool {
    (1.7..=1.8).contains(&aspect) // 16:9
        || (1.3..=1.4).contains(&aspect) // 4:3
        || (0.45..=0.6).contains(&aspect) // 9:16 vertical
}

/// Pick the receiver's video window from an enumeration, in strict priority
/// order. Deterministic for a given input; the video-aspect tier breaks ties
/// by area, descending.
pub fn choose_window(windows: &[WindowInfo]) -> Option<&WindowInfo> {
    // 1. Named receiver windows
    if let Some(w) = windows.iter().find(|w| {
        let title = w.title.to_lowercase();
        (title.contains("uxplay") || title.contains("appletv") || title.contains("airplay"))
            && w.width > MIN_WINDOW_DIM
            && w.height > MIN_WINDOW_DIM
    }) {
        return Some(w);
    }

    // 2. Mobile-vertical mirror windows
    if let Some(w) = windows.iter().find(|w| {
        (0.45..=0.6).contains(&w.aspect()) && w.width >= 400 && w.height >= 700
    }) {
        return Some(w);
    }

    // 3. The receiver's GL output surface
    if let Some(w) = windows.iter().find(|w| w.title.contains("OpenGL renderer")) {
        return Some(w);
    }

    // 4. Largest window with a video aspect
    if let Some(w) = windows
        .iter()
        .filter(|w| {
            w.width > MIN_WINDOW_DIM && w.height > MIN_WINDOW_DIM && is_video_aspect(w.aspect())
        })
        .max_by_key(|w| w.area())
    {
        return Some(w);
    }

    // 5. Anything of plausible size
    windows
        .iter()
        .find(|w| w.width > MIN_WINDOW_DIM && w.height > MIN_WINDOW_DIM)
}

/// Parse the per-window lines of `xwininfo -root -tree` output.
///
/// Lines look like:
/// `  0x3a00007 "UxPlay@host": ("uxplay" "UxPlay")  498x1080+0+0  +0+0`
/// The title is optional; geometry is `WxH+X+Y` with possibly negative offsets.
pub fn parse_window_tree(output: &str) -> Vec<WindowInfo> {
    // Compiled per probe (1/s); not worth a once_cell.
    let re = Regex::new(
        r#"(?m)^\s+(0x[0-9a-fA-F]+)\s+(?:"([^"]*)")?.*?\s(\d+)x(\d+)[+-][-]?\d+[+-][-]?\d+"#,
    )
    .expect("window tree regex");

    re.captures_iter(output)
        .filter_map(|cap| {
            let width: u32 = cap.get(3)?.as_str().parse().ok()?;
            let height: u32 = cap.get(4)?.as_str().parse().ok()?;
            Some(WindowInfo {
                id: cap.get(1)?.as_str().to_string(),
                title: cap.get(2).map(|m| m.as_str()).unwrap_or("").to_string(),
                width,
                height,
            })
        })
        .collect()
}

fn x11_command(program: &str, cfg: &CaptureConfig) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("DISPLAY", &cfg.display)
        .env("XAUTHORITY", &cfg.xauthority)
        .stdin(Stdio::null());
    cmd
}

/// Single probe of the X server. Never errors: any failure along the way is
/// an absent-window observation.
pub async fn probe(cfg: &CaptureConfig) -> WindowObservation {
    // Cheap connectivity check first, matching the external-tool contract.
    match x11_command("xset", cfg).arg("q").output().await {
        Ok(out) if out.status.success() => {}
        Ok(out) => {
            debug!(status = ?out.status, "xset q failed, X server unreachable");
            return WindowObservation::default();
        }
        Err(e) => {
            debug!("xset not runnable: {e}");
            return WindowObservation::default();
        }
    }

    let output = match x11_command("xwininfo", cfg)
        .args(["-root", "-tree"])
        .output()
        .await
    {
        Ok(out) if out.status.success() => out.stdout,
        Ok(out) => {
            debug!(status = ?out.status, "xwininfo -root -tree failed");
            return WindowObservation::default();
        }
        Err(e) => {
            debug!("xwininfo not runnable: {e}");
            return WindowObservation::default();
        }
    };

    let text = String::from_utf8_lossy(&output);
    let windows = parse_window_tree(&text);
    match choose_window(&windows) {
        Some(w) if !w.id.is_empty() && w.width >= MIN_WINDOW_DIM && w.height >= MIN_WINDOW_DIM => {
            WindowObservation {
                present: true,
                id: w.id.clone(),
                width: w.width,
                height: w.height,
            }
        }
        _ => WindowObservation::default(),
    }
}

/// Re-read one window's current geometry via `xwininfo -id`. Used right
/// before encoder spawn: the mirror may have been resized (or closed) since
/// the monitor last saw it.
pub async fn window_geometry(cfg: &CaptureConfig, window_id: &str) -> Result<(u32, u32)> {
    let out = x11_command("xwininfo", cfg)
        .args(["-id", window_id])
        .output()
        .await
        .context("failed to run xwininfo -id")?;
    if !out.status.success() {
        anyhow::bail!("window {window_id} no longer exists");
    }

    let text = String::from_utf8_lossy(&out.stdout);
    let mut width = None;
    let mut height = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Width:") {
            width = v.trim().parse::<u32>().ok();
        } else if let Some(v) = line.strip_prefix("Height:") {
            height = v.trim().parse::<u32>().ok();
        }
    }
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => anyhow::bail!("could not parse dimensions of window {window_id}"),
    }
}

/// Spawn the process-wide monitor loop: one X probe per second, published on
/// the watch channel and pushed into the controller and AirPlay tracker.
pub fn spawn(
    cfg: CaptureConfig,
    controller: Arc<Controller>,
    airplay: Arc<AirPlayTracker>,
    tx: watch::Sender<WindowObservation>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let obs = probe(&cfg).await;
            airplay.record(&obs);
            if tx.send(obs.clone()).is_err() {
                warn!("window observation channel closed, monitor exiting");
                return;
            }
            controller.on_observation(&obs).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn win(id: &str, title: &str, w: u32, h: u32) -> WindowInfo {
        WindowInfo {
            id: id.to_string(),
            title: title.to_string(),
            width: w,
            height: h,
        }
    }

    #[test]
    fn named_window_wins_over_everything() {
        let windows = [
            win("0x1", "some huge thing", 1920, 1080),
            win("0x2", "UxPlay@host", 498, 1080),
        ];
        assert_eq!(choose_window(&windows).unwrap().id, "0x2");
    }

    #[test]
    fn named_match_is_case_insensitive() {
        let windows = [win("0x9", "AirPlay Mirror", 800, 600)];
        assert_eq!(choose_window(&windows).unwrap().id, "0x9");
    }

    #[test]
    fn tiny_named_window_is_skipped() {
        // The receiver opens a 1x1 placeholder before the stream starts.
        let windows = [win("0x1", "uxplay", 1, 1), win("0x2", "", 1280, 720)];
        assert_eq!(choose_window(&windows).unwrap().id, "0x2");
    }

    #[test]
    fn phone_shaped_window_beats_gl_surface() {
        let windows = [
            win("0x1", "OpenGL renderer string", 640, 480),
            win("0x2", "", 540, 960), // 0.5625 aspect, phone mirror
        ];
        assert_eq!(choose_window(&windows).unwrap().id, "0x2");
    }

    #[test]
    fn phone_tier_requires_minimum_size() {
        // Right aspect but too small for the phone tier; falls through to
        // the video-aspect tier instead.
        let windows = [win("0x1", "", 270, 480), win("0x2", "", 1280, 720)];
        assert_eq!(choose_window(&windows).unwrap().id, "0x2");
    }

    #[test]
    fn largest_video_aspect_window_wins_tier_four() {
        let windows = [
            win("0x1", "", 1280, 720),
            win("0x2", "", 1920, 1080),
            win("0x3", "", 800, 600), // 1.33, 4:3 but smaller
        ];
        assert_eq!(choose_window(&windows).unwrap().id, "0x2");
    }

    #[test]
    fn fallback_accepts_any_window_over_threshold() {
        // 1.0 aspect matches no video band; fallback still takes it.
        let windows = [win("0x1", "", 101, 101)];
        assert_eq!(choose_window(&windows).unwrap().id, "0x1");
    }

    #[test]
    fn hundred_by_hundred_is_not_present() {
        let windows = [win("0x1", "", 100, 100)];
        assert!(choose_window(&windows).is_none());
    }

    #[test]
    fn empty_enumeration_yields_none() {
        assert!(choose_window(&[]).is_none());
    }

    #[test]
    fn choice_is_deterministic() {
        let windows = [
            win("0x1", "", 1280, 720),
            win("0x2", "", 1280, 720), // identical area; first wins
        ];
        for _ in 0..10 {
            assert_eq!(choose_window(&windows).unwrap().id, "0x1");
        }
    }

    #[test]
    fn parses_xwininfo_tree_lines() {
        let output = r#"
xwininfo: Window id: 0x4c3 (the root window) (has no name)

  Root window id: 0x4c3 (the root window) (has no name)
  Parent window id: 0x0 (none)
     8 children:
     0x3a00007 "UxPlay@host": ("uxplay" "UxPlay")  498x1080+0+0  +0+0
     0x3a00001 "uxplay": ("uxplay" "UxPlay")  1x1+-1+-1  +-1+-1
     0x800003 (has no name): ()  1920x1080+0+0  +0+0
"#;
        let windows = parse_window_tree(output);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].id, "0x3a00007");
        assert_eq!(windows[0].title, "UxPlay@host");
        assert_eq!((windows[0].width, windows[0].height), (498, 1080));
        assert_eq!((windows[1].width, windows[1].height), (1, 1));
        assert_eq!(windows[2].title, "");
        assert_eq!((windows[2].width, windows[2].height), (1920, 1080));
    }

    #[test]
    fn parser_and_chooser_find_the_mirror() {
        let output = r#"
     0x3a00001 "uxplay": ("uxplay" "UxPlay")  1x1+0+0  +0+0
     0x5100002 "UxPlay@living-room": ("uxplay" "UxPlay")  1080x1920+0+0  +0+0
"#;
        let windows = parse_window_tree(output);
        let chosen = choose_window(&windows).unwrap();
        assert_eq!(chosen.id, "0x5100002");
    }
}
