//! Signaling channel: one message-framed WebSocket to the browser.
//!
//! The socket deliberately outlives the WebRTC handshake (and any single
//! session) so the controller can deliver reconnect notifications on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use airbridge_protocol::{BridgeConfig, SignalMessage};
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::{self, CaptureState};
use crate::controller::Controller;
use crate::debug::DebugHub;
use crate::monitor::WindowObservation;
use crate::peer::{self, PeerHandle};
use crate::session::Session;

/// Pause after a transient read error before the loop continues.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How long an offer waits for the window when capture starts lazily.
const OFFER_WINDOW_WAIT: Duration = Duration::from_secs(5);

enum Transport {
    Socket(Mutex<SplitSink<WebSocket, Message>>),
    #[cfg(test)]
    Recorder(std::sync::Mutex<Vec<SignalMessage>>),
    #[cfg(test)]
    Failing,
}

/// Write half of the signaling socket. All sends go through one mutex, so
/// no two outbound writes ever interleave.
pub struct SignalWriter {
    id: Uuid,
    transport: Transport,
}

impl SignalWriter {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            transport: Transport::Socket(Mutex::new(sink)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&self, msg: &SignalMessage) -> Result<()> {
        let json = serde_json::to_string(msg).context("failed to encode signaling message")?;
        match &self.transport {
            Transport::Socket(sink) => {
                let mut sink = sink.lock().await;
                sink.send(Message::Text(json.into()))
                    .await
                    .context("websocket send failed")?;
            }
            #[cfg(test)]
            Transport::Recorder(log) => {
                log.lock().unwrap_or_else(|e| e.into_inner()).push(msg.clone());
            }
            #[cfg(test)]
            Transport::Failing => anyhow::bail!("socket gone"),
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Transport::Socket(sink) = &self.transport {
            let mut sink = sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    #[cfg(test)]
    pub fn recorder() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            transport: Transport::Recorder(std::sync::Mutex::new(Vec::new())),
        })
    }

    #[cfg(test)]
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            transport: Transport::Failing,
        })
    }

    #[cfg(test)]
    pub fn recorded(&self) -> Vec<SignalMessage> {
        match &self.transport {
            Transport::Recorder(log) => log.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            _ => Vec::new(),
        }
    }
}

/// Everything the signaling handler needs from the rest of the service.
#[derive(Clone)]
pub struct SignalContext {
    pub config: Arc<BridgeConfig>,
    pub controller: Arc<Controller>,
    pub debug: Arc<DebugHub>,
    pub window_rx: watch::Receiver<WindowObservation>,
}

/// The handler's view of the session it built. The authoritative owner is
/// the controller's slot; this is re-validated on every offer.
struct LocalSession {
    id: Uuid,
    peer: Arc<PeerHandle>,
    capture: Arc<Mutex<Option<CaptureState>>>,
    cancel: CancellationToken,
}

/// Run one signaling connection to completion. `reservation` was claimed by
/// the upgrade handler before the socket existed.
pub async fn handle_socket(socket: WebSocket, ctx: SignalContext, reservation: Uuid) {
    let (sink, mut reader) = socket.split();
    let signal = SignalWriter::new(sink);
    ctx.controller.register_signal(Arc::clone(&signal)).await;
    ctx.debug.success(
        "WEBSOCKET",
        "connection_established",
        "signaling channel connected",
        None,
    );
    info!("signaling channel connected");

    if let Err(e) = drive(&mut reader, &signal, &ctx, reservation).await {
        warn!("signaling session ended: {e:#}");
    }

    ctx.controller.signal_closed(signal.id()).await;
    ctx.debug
        .info("WEBSOCKET", "connection_closed", "signaling channel closed");
    info!("signaling channel closed");
}

async fn drive(
    reader: &mut SplitStream<WebSocket>,
    signal: &Arc<SignalWriter>,
    ctx: &SignalContext,
    reservation: Uuid,
) -> Result<()> {
    // Two distinct openings: either the phone already reconnected while no
    // socket was listening (skip the window wait, tell the browser to offer
    // immediately), or we wait for a usable window to show up.
    let mut current: Option<LocalSession> = if let Some(window_id) =
        ctx.controller.take_ready().await
    {
        info!(%window_id, "phone already ready at connect, skipping window wait");
        signal
            .send(&SignalMessage::ReconnectionReady {
                message: "phone reconnected - send a new offer".to_string(),
                window_id,
            })
            .await?;
        match build_session(ctx, signal, reservation).await {
            Ok(session) => Some(session),
            Err(e) => {
                error!("session construction failed: {e:#}");
                let _ = signal
                    .send(&SignalMessage::Error {
                        message: "Failed to create peer connection".to_string(),
                    })
                    .await;
                ctx.controller.clear_reservation(reservation).await;
                None
            }
        }
    } else {
        match wait_for_window(reader, signal, ctx).await {
            Ok(obs) => {
                info!(window_id = %obs.id, width = obs.width, height = obs.height, "window found");
                signal
                    .send(&SignalMessage::Status {
                        message: "AirPlay window found, starting WebRTC...".to_string(),
                    })
                    .await?;
                match build_session(ctx, signal, reservation).await {
                    Ok(session) => Some(session),
                    Err(e) => {
                        error!("session construction failed: {e:#}");
                        let _ = signal
                            .send(&SignalMessage::Error {
                                message: "Failed to create peer connection".to_string(),
                            })
                            .await;
                        ctx.controller.clear_reservation(reservation).await;
                        None
                    }
                }
            }
            Err(e) => {
                warn!("no usable window: {e:#}");
                let _ = signal
                    .send(&SignalMessage::Error {
                        message: "AirPlay window not available - please connect your device"
                            .to_string(),
                    })
                    .await;
                ctx.controller.clear_reservation(reservation).await;
                return Err(e);
            }
        }
    };

    // Message loop. Kept alive past the handshake; only a clean close (or a
    // drained stream) ends it. Other read errors get a backoff and another
    // try so post-handshake notifications still have a channel.
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                dispatch(text.as_str(), &mut current, ctx, signal).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong/binary: nothing to do
            Some(Err(e)) => {
                debug!("read error (keeping signaling channel alive): {e}");
                tokio::time::sleep(READ_ERROR_BACKOFF).await;
            }
        }
    }

    Ok(())
}

/// Wait up to the configured cap for the monitor to report a usable window,
/// sending periodic status updates and watching the socket for a client
/// that gave up.
async fn wait_for_window(
    reader: &mut SplitStream<WebSocket>,
    signal: &Arc<SignalWriter>,
    ctx: &SignalContext,
) -> Result<WindowObservation> {
    signal
        .send(&SignalMessage::Status {
            message: "Waiting for AirPlay connection...".to_string(),
        })
        .await?;

    let timeout = Duration::from_secs(ctx.config.reconnect.window_wait_secs);
    let deadline = Instant::now() + timeout;
    let rx = ctx.window_rx.clone();
    let mut last_note = Instant::now();

    loop {
        let obs = rx.borrow().clone();
        if obs.present {
            return Ok(obs);
        }

        let now = Instant::now();
        if now >= deadline {
            anyhow::bail!("no usable window within {}s", timeout.as_secs());
        }
        if now.duration_since(last_note) >= Duration::from_secs(5) {
            let remaining = deadline.duration_since(now).as_secs();
            signal
                .send(&SignalMessage::Status {
                    message: format!(
                        "Still waiting for AirPlay connection... ({remaining}s remaining)"
                    ),
                })
                .await?;
            last_note = now;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("signaling channel closed during window wait")
                    }
                    Some(Err(e)) => {
                        anyhow::bail!("signaling read failed during window wait: {e}")
                    }
                    // Early messages are discarded; the browser is told to
                    // wait for the window-found status first.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Build the peer and attach a session to the reserved slot.
async fn build_session(
    ctx: &SignalContext,
    signal: &Arc<SignalWriter>,
    id: Uuid,
) -> Result<LocalSession> {
    let peer = peer::create_peer(
        &ctx.config.ice,
        Arc::clone(&ctx.controller),
        Arc::clone(signal),
        id,
        Arc::clone(&ctx.debug),
    )
    .await?;

    let session = Session::new(id, Arc::clone(&peer), Arc::clone(signal));
    let local = LocalSession {
        id,
        peer,
        capture: Arc::clone(&session.capture),
        cancel: session.cancel.clone(),
    };
    peer::spawn_state_ticker(Arc::clone(&local.peer), local.cancel.clone());

    if let Err(session) = ctx.controller.attach_session(session).await {
        session.shutdown(true).await;
        anyhow::bail!("session slot was cleared during setup");
    }
    Ok(local)
}

async fn dispatch(
    text: &str,
    current: &mut Option<LocalSession>,
    ctx: &SignalContext,
    signal: &Arc<SignalWriter>,
) {
    let msg: SignalMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Protocol violation: drop the message, keep the channel.
            warn!("invalid signaling message: {e}");
            return;
        }
    };

    match msg {
        SignalMessage::Offer { sdp } => handle_offer(&sdp, current, ctx, signal).await,
        SignalMessage::IceCandidate { candidate } => match current {
            Some(session) => {
                if let Err(e) = session.peer.add_remote_candidate(&candidate).await {
                    // Late or duplicate candidates are routine; drop them.
                    warn!("dropping remote ICE candidate: {e:#}");
                }
            }
            None => warn!("ICE candidate received with no session, dropping"),
        },
        other => {
            debug!(?other, "ignoring unexpected inbound message");
        }
    }
}

async fn handle_offer(
    sdp: &str,
    current: &mut Option<LocalSession>,
    ctx: &SignalContext,
    signal: &Arc<SignalWriter>,
) {
    ctx.debug
        .info("WEBRTC", "sdp_offer_received", "processing SDP offer");

    // The session this handler built may have been torn down behind its
    // back (auto-reconnect, admin cleanup). Re-validate and rebuild.
    let live = ctx.controller.live_session_id().await;
    let valid = matches!((&*current, live), (Some(s), Some(l)) if s.id == l);
    if !valid {
        *current = None;
        if live.is_some() {
            let _ = signal
                .send(&SignalMessage::Error {
                    message: "Another WebRTC session is active".to_string(),
                })
                .await;
            return;
        }
        let reservation = match ctx.controller.reserve().await {
            Ok(r) => r,
            Err(e) => {
                let _ = signal
                    .send(&SignalMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        match build_session(ctx, signal, reservation).await {
            Ok(session) => {
                info!(session_id = %session.id, "session rebuilt for new offer");
                *current = Some(session);
            }
            Err(e) => {
                error!("session construction failed: {e:#}");
                ctx.controller.clear_reservation(reservation).await;
                let _ = signal
                    .send(&SignalMessage::Error {
                        message: "Failed to create peer connection".to_string(),
                    })
                    .await;
                return;
            }
        }
    }
    let Some(session) = current.as_ref() else {
        return;
    };

    if let Err(e) = session.peer.accept_offer(sdp).await {
        warn!("rejecting offer: {e:#}");
        ctx.debug.error(
            "WEBRTC",
            "sdp_offer_failed",
            format!("failed to set remote description: {e:#}"),
            None,
        );
        let _ = signal
            .send(&SignalMessage::Error {
                message: "Failed to set remote description".to_string(),
            })
            .await;
        return;
    }

    // First offer on this peer: create the tracks and start capture.
    {
        let mut cap = session.capture.lock().await;
        if cap.is_none() {
            let Some(obs) = wait_for_usable_window(ctx, OFFER_WINDOW_WAIT).await else {
                let _ = signal
                    .send(&SignalMessage::Error {
                        message: "AirPlay window not available".to_string(),
                    })
                    .await;
                return;
            };

            let (video, audio) = match session.peer.ensure_tracks().await {
                Ok(tracks) => tracks,
                Err(e) => {
                    error!("track creation failed: {e:#}");
                    let _ = signal
                        .send(&SignalMessage::Error {
                            message: "Failed to create media tracks".to_string(),
                        })
                        .await;
                    return;
                }
            };

            match capture::start(
                &ctx.config.capture,
                &obs.id,
                video,
                audio,
                session.cancel.clone(),
                Arc::clone(&ctx.controller),
                session.id,
            )
            .await
            {
                Ok(state) => {
                    ctx.debug.success(
                        "FFMPEG",
                        "capture_started",
                        "encoder and RTP forwarders running",
                        Some(serde_json::json!({
                            "windowID": obs.id,
                            "videoPort": state.video_rtp_port,
                            "audioPort": state.audio_rtp_port,
                        })),
                    );
                    *cap = Some(state);
                }
                Err(e) => {
                    error!("capture start failed: {e:#}");
                    ctx.debug.error(
                        "FFMPEG",
                        "capture_failed",
                        format!("{e:#}"),
                        None,
                    );
                    let _ = signal
                        .send(&SignalMessage::Error {
                            message: "Failed to initialize capture".to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    }

    match session.peer.create_answer().await {
        Ok(answer) => {
            if let Err(e) = signal.send(&SignalMessage::Answer { sdp: answer }).await {
                error!("failed to send answer: {e:#}");
            } else {
                ctx.debug
                    .success("WEBRTC", "sdp_answer_sent", "answer sent to client", None);
            }
        }
        Err(e) => {
            error!("answer creation failed: {e:#}");
            let _ = signal
                .send(&SignalMessage::Error {
                    message: "Failed to create answer".to_string(),
                })
                .await;
        }
    }
}

/// Short poll for a usable window at offer time. The monitor refreshes the
/// channel once a second.
async fn wait_for_usable_window(ctx: &SignalContext, timeout: Duration) -> Option<WindowObservation> {
    let deadline = Instant::now() + timeout;
    let rx = ctx.window_rx.clone();
    loop {
        let obs = rx.borrow().clone();
        if obs.present {
            return Some(obs);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
