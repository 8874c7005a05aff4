//! Capture pipeline: allocates the RTP ports, supervises the external
//! encoder, and forwards its RTP output into the WebRTC tracks.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use airbridge_protocol::CaptureConfig;
use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::util::Unmarshal;

use crate::controller::Controller;
use crate::monitor;

/// Base range the free-port probe draws from.
const PORT_RANGE_START: u16 = 5000;
const PORT_RANGE_LEN: u16 = 1000;
/// Listener ports are remapped here; the encoder can always write to these.
const RTP_PORT_BASE: u16 = 50000;

/// Largest datagram the encoder emits (MTU-bounded RTP).
const RTP_READ_BUF: usize = 1600;

/// H.264 payload type the encoder is told to use; must match the codec
/// registration on the peer connection.
pub const VIDEO_PAYLOAD_TYPE: u8 = 103;

/// Media plumbing owned by one session. Built only by [`start`]; torn down
/// only by [`CaptureState::shutdown`].
pub struct CaptureState {
    pub video_rtp_port: u16,
    pub audio_rtp_port: u16,
    encoder_pid: Option<u32>,
    expected_kill: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
    forwarders: Vec<JoinHandle<()>>,
}

/// Remap a base port into the writable RTP range.
pub fn rtp_port_for(base_port: u16) -> u16 {
    RTP_PORT_BASE + base_port % PORT_RANGE_LEN
}

/// Draw a free UDP port from [5000, 5999].
fn find_free_port() -> Result<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let port = PORT_RANGE_START + rng.gen_range(0..PORT_RANGE_LEN);
        if std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    anyhow::bail!("no free ports found in [{PORT_RANGE_START}, {})", PORT_RANGE_START + PORT_RANGE_LEN)
}

/// Allocate distinct video and audio RTP ports.
fn allocate_rtp_ports() -> Result<(u16, u16)> {
    let video = rtp_port_for(find_free_port().context("failed to allocate video port")?);
    for _ in 0..100 {
        let audio = rtp_port_for(find_free_port().context("failed to allocate audio port")?);
        if audio != video {
            return Ok((video, audio));
        }
    }
    anyhow::bail!("could not allocate distinct audio RTP port")
}

/// Encoder argv for capturing one X11 window into a single H.264 RTP stream.
///
/// Tuned for WebRTC: zero-latency x264 baseline, fixed 1-second GOP, no
/// scene-cut keyframes, output scaled to even dimensions.
pub fn encoder_args(
    display: &str,
    window_id: &str,
    width: u32,
    height: u32,
    video_rtp_port: u16,
) -> Vec<String> {
    let video_size = format!("{width}x{height}");
    let payload_type = VIDEO_PAYLOAD_TYPE.to_string();
    let rtp_url = format!("rtp://127.0.0.1:{video_rtp_port}");
    [
        "-f", "x11grab",
        "-draw_mouse", "0",
        "-window_id", window_id,
        "-video_size", video_size.as_str(),
        "-framerate", "30",
        "-probesize", "10M",
        "-i", display,
        "-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2,format=yuv420p",
        "-c:v", "libx264",
        "-preset", "ultrafast",
        "-tune", "zerolatency",
        "-profile:v", "baseline",
        "-level", "3.1",
        "-pix_fmt", "yuv420p",
        "-g", "30",
        "-keyint_min", "30",
        "-sc_threshold", "0",
        "-b:v", "2M",
        "-maxrate", "2.5M",
        "-bufsize", "5M",
        "-crf", "28",
        "-f", "rtp",
        "-payload_type", payload_type.as_str(),
        rtp_url.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Start the capture pipeline for a session: bind the RTP listeners, spawn
/// the encoder against the window's *current* geometry, and launch the
/// forwarder and supervisor tasks.
pub async fn start(
    cfg: &CaptureConfig,
    window_id: &str,
    video_track: Arc<TrackLocalStaticRTP>,
    audio_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    controller: Arc<Controller>,
    session_id: Uuid,
) -> Result<CaptureState> {
    // The mirror may have been resized (or closed) since the monitor last
    // observed it; the encoder needs the exact current size.
    let (width, height) = monitor::window_geometry(cfg, window_id)
        .await
        .with_context(|| format!("window {window_id} vanished before capture"))?;

    let (video_rtp_port, audio_rtp_port) = allocate_rtp_ports()?;
    info!(video_rtp_port, audio_rtp_port, "allocated RTP ports");

    let video_sock = UdpSocket::bind(("127.0.0.1", video_rtp_port))
        .await
        .with_context(|| format!("failed to bind video RTP listener on {video_rtp_port}"))?;
    let audio_sock = UdpSocket::bind(("127.0.0.1", audio_rtp_port))
        .await
        .with_context(|| format!("failed to bind audio RTP listener on {audio_rtp_port}"))?;

    let args = encoder_args(&cfg.display, window_id, width, height, video_rtp_port);
    info!(window_id, width, height, "starting encoder: ffmpeg {}", args.join(" "));

    let mut child = Command::new("ffmpeg")
        .args(&args)
        .env("DISPLAY", &cfg.display)
        .env("XAUTHORITY", &cfg.xauthority)
        .env("LIBVA_DRIVER_NAME", "i965")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .context("failed to spawn encoder")?;

    let encoder_pid = child.id();
    info!(pid = encoder_pid.unwrap_or(0), "encoder started");

    let expected_kill = Arc::new(AtomicBool::new(false));

    // Supervisor owns the reap. An exit we did not request is a terminal
    // session event; the report is spawned so a teardown that is already
    // waiting on this task can never be blocked by it.
    let supervisor = {
        let expected = Arc::clone(&expected_kill);
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let status = child.wait().await;
            let expected = expected.load(Ordering::SeqCst);
            match status {
                Ok(status) if expected => {
                    debug!(?status, "encoder reaped after kill");
                }
                Ok(status) => {
                    warn!(?status, "encoder exited on its own");
                    tokio::spawn(async move {
                        controller.on_encoder_exit(session_id).await;
                    });
                }
                Err(e) => warn!("failed to wait for encoder: {e}"),
            }
        })
    };

    let forwarders = vec![
        tokio::spawn(forward_rtp(video_sock, video_track, "video", cancel.clone())),
        tokio::spawn(forward_rtp(audio_sock, audio_track, "audio", cancel.clone())),
    ];

    Ok(CaptureState {
        video_rtp_port,
        audio_rtp_port,
        encoder_pid,
        expected_kill,
        supervisor,
        forwarders,
    })
}

impl CaptureState {
    /// Tear down in order: kill + reap the encoder, then join the forwarders
    /// (dropping the UDP listeners). The session's cancellation token must
    /// already be cancelled so the forwarders are on their way out.
    pub async fn shutdown(self) {
        self.expected_kill.store(true, Ordering::SeqCst);
        if let Some(pid) = self.encoder_pid {
            debug!(pid, "sending SIGKILL to encoder");
            // Lossless at the RTP layer, so no graceful-shutdown dance.
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        if let Err(e) = self.supervisor.await {
            warn!("encoder supervisor task panicked: {e}");
        }
        for task in self.forwarders {
            if let Err(e) = task.await {
                warn!("RTP forwarder task panicked: {e}");
            }
        }
        info!(
            video_rtp_port = self.video_rtp_port,
            audio_rtp_port = self.audio_rtp_port,
            "capture pipeline stopped"
        );
    }
}

/// Forward RTP datagrams from one UDP listener to one track until cancelled.
/// Non-RTP datagrams and track write failures are dropped, not fatal.
async fn forward_rtp(
    socket: UdpSocket,
    track: Arc<TrackLocalStaticRTP>,
    kind: &'static str,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RTP_READ_BUF];
    let mut read: u64 = 0;
    let mut sent: u64 = 0;
    let mut stats = tokio::time::interval(Duration::from_secs(5));
    stats.tick().await; // consume the immediate first tick
    debug!(kind, "RTP forwarder started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = stats.tick() => {
                if read > 0 {
                    info!(kind, read, sent, "RTP forwarder stats");
                }
            }
            result = socket.recv_from(&mut buf) => {
                let n = match result {
                    Ok((n, _)) => n,
                    Err(e) => {
                        warn!(kind, "RTP read error: {e}");
                        continue;
                    }
                };
                if n == 0 {
                    continue;
                }
                read += 1;
                let mut data = &buf[..n];
                let packet = match Packet::unmarshal(&mut data) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(kind, "dropping non-RTP datagram: {e}");
                        continue;
                    }
                };
                match track.write_rtp(&packet).await {
                    Ok(_) => sent += 1,
                    Err(e) => debug!(kind, "track write failed: {e}"),
                }
            }
        }
    }

    info!(kind, read, sent, "RTP forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_remap_stays_in_writable_range() {
        for port in PORT_RANGE_START..PORT_RANGE_START + PORT_RANGE_LEN {
            let rtp = rtp_port_for(port);
            assert!((RTP_PORT_BASE..RTP_PORT_BASE + PORT_RANGE_LEN).contains(&rtp));
        }
        assert_eq!(rtp_port_for(5000), 50000);
        assert_eq!(rtp_port_for(5999), 50999);
        assert_eq!(rtp_port_for(5437), 50437);
    }

    #[test]
    fn allocated_ports_are_distinct_and_in_range() {
        let (video, audio) = allocate_rtp_ports().unwrap();
        assert_ne!(video, audio);
        assert!((RTP_PORT_BASE..RTP_PORT_BASE + PORT_RANGE_LEN).contains(&video));
        assert!((RTP_PORT_BASE..RTP_PORT_BASE + PORT_RANGE_LEN).contains(&audio));
    }

    #[test]
    fn encoder_args_capture_the_window_as_given() {
        let args = encoder_args(":0", "0x3a00007", 1080, 1920, 50123);
        let joined = args.join(" ");
        assert!(joined.starts_with("-f x11grab"));
        assert!(joined.contains("-i :0"));
        assert!(joined.contains("-window_id 0x3a00007"));
        assert!(joined.contains("-video_size 1080x1920"));
        assert!(joined.contains("-draw_mouse 0"));
        assert!(joined.contains("-framerate 30"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-preset ultrafast"));
        assert!(joined.contains("-tune zerolatency"));
        assert!(joined.contains("-profile:v baseline"));
        assert!(joined.contains("-level 3.1"));
        assert!(joined.contains("-g 30"));
        assert!(joined.contains("-keyint_min 30"));
        assert!(joined.contains("-sc_threshold 0"));
        assert!(joined.contains("-b:v 2M"));
        assert!(joined.contains("-maxrate 2.5M"));
        assert!(joined.contains("-bufsize 5M"));
        assert!(joined.contains("-crf 28"));
        assert!(joined.contains("-payload_type 103"));
        assert!(joined.ends_with("rtp://127.0.0.1:50123"));
        // even-dimension scaling always present
        assert!(joined.contains("scale=trunc(iw/2)*2:trunc(ih/2)*2"));
    }

    #[test]
    fn encoder_args_are_deterministic() {
        assert_eq!(
            encoder_args(":0", "0x1", 498, 1080, 50001),
            encoder_args(":0", "0x1", 498, 1080, 50001)
        );
    }
}
