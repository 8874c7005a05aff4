//! Reconnection controller: owns the single-session slot and every
//! lifecycle transition — signaling connects, window monitor ticks, peer
//! terminal states, encoder death, admin cleanup.
//!
//! All mutable state lives behind one mutex in [`ControllerState`]; nothing
//! here is process-global except the `Arc<Controller>` itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use airbridge_protocol::{ReconnectConfig, SignalMessage};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::debug::DebugHub;
use crate::monitor::WindowObservation;
use crate::session::Session;
use crate::signaling::SignalWriter;

/// The slot is occupied (reserved or live); a second client must be refused.
#[derive(Debug)]
pub struct SlotBusy;

impl std::fmt::Display for SlotBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a WebRTC session is already active")
    }
}

impl std::error::Error for SlotBusy {}

#[derive(Default)]
enum Slot {
    #[default]
    Free,
    /// Claimed by a connecting client; cleared if construction fails.
    Reserved {
        id: Uuid,
        at: Instant,
    },
    Live(Session),
}

struct ReconnectTracking {
    last_present: bool,
    /// Kept while a flap is unconfirmed so an ID change across a short gap
    /// is still detected; cleared only on a confirmed disappearance.
    last_id: String,
    /// Consecutive ticks disagreeing with `last_present`.
    streak: u32,
    last_attempt: Option<Instant>,
    /// "Phone is back" readiness carried across signaling-channel gaps.
    ready_window_id: Option<String>,
    auto_enabled: bool,
}

impl Default for ReconnectTracking {
    fn default() -> Self {
        Self {
            last_present: false,
            last_id: String::new(),
            streak: 0,
            last_attempt: None,
            ready_window_id: None,
            auto_enabled: true,
        }
    }
}

#[derive(Default)]
struct ControllerState {
    slot: Slot,
    /// The signaling socket parked here when its session is torn down but
    /// the browser connection survives.
    preserved_signal: Option<Arc<SignalWriter>>,
    /// The currently-open signaling socket, session or not.
    active_signal: Option<Arc<SignalWriter>>,
    reconnect: ReconnectTracking,
    /// Most recent raw observation, confirmed or not.
    latest: WindowObservation,
}

pub struct Controller {
    cfg: ReconnectConfig,
    started_at: Instant,
    debug: Arc<DebugHub>,
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(cfg: ReconnectConfig, debug: Arc<DebugHub>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            started_at: Instant::now(),
            debug,
            state: Mutex::new(ControllerState::default()),
        })
    }

    fn in_startup_grace(&self) -> bool {
        self.started_at.elapsed() < Duration::from_secs(self.cfg.startup_grace_secs)
    }

    fn cooldown_active(&self, rc: &ReconnectTracking) -> bool {
        rc.last_attempt
            .is_some_and(|t| t.elapsed() < Duration::from_secs(self.cfg.cooldown_secs))
    }

    /// Initialize presence tracking from a probe taken at process start,
    /// without generating any reconnect events.
    pub async fn seed(&self, obs: &WindowObservation) {
        let mut st = self.state.lock().await;
        st.latest = obs.clone();
        if obs.present && !obs.id.is_empty() {
            info!(window_id = %obs.id, "window already present at startup");
            st.reconnect.last_present = true;
            st.reconnect.last_id = obs.id.clone();
        }
    }

    /// Claim the session slot for a connecting client. A reservation whose
    /// handler never came back (client vanished mid-upgrade) goes stale
    /// after the window-wait cap and may be taken over.
    pub async fn reserve(&self) -> Result<Uuid, SlotBusy> {
        let stale_after = Duration::from_secs(self.cfg.window_wait_secs + 30);
        let mut st = self.state.lock().await;
        if let Slot::Reserved { id, at } = &st.slot {
            if at.elapsed() > stale_after {
                warn!(session_id = %id, "taking over stale reservation");
                st.slot = Slot::Free;
            }
        }
        match st.slot {
            Slot::Free => {
                let id = Uuid::new_v4();
                st.slot = Slot::Reserved {
                    id,
                    at: Instant::now(),
                };
                debug!(session_id = %id, "session slot reserved");
                Ok(id)
            }
            _ => Err(SlotBusy),
        }
    }

    /// Release a reservation that never became a session.
    pub async fn clear_reservation(&self, id: Uuid) {
        let mut st = self.state.lock().await;
        if matches!(st.slot, Slot::Reserved { id: r, .. } if r == id) {
            st.slot = Slot::Free;
            debug!(session_id = %id, "reservation cleared");
        }
    }

    /// Promote a reservation to a live session. Returns the session to the
    /// caller for disposal if the reservation no longer holds the slot.
    pub async fn attach_session(&self, session: Session) -> Result<(), Session> {
        let mut st = self.state.lock().await;
        if !matches!(st.slot, Slot::Reserved { id, .. } if id == session.id) {
            warn!(session_id = %session.id, "slot no longer reserved for this session");
            return Err(session);
        }
        info!(session_id = %session.id, "session attached");
        st.slot = Slot::Live(session);
        Ok(())
    }

    pub async fn live_session_id(&self) -> Option<Uuid> {
        match &self.state.lock().await.slot {
            Slot::Live(s) => Some(s.id),
            _ => None,
        }
    }

    /// Record the signaling socket a connecting client opened.
    pub async fn register_signal(&self, signal: Arc<SignalWriter>) {
        let mut st = self.state.lock().await;
        st.active_signal = Some(signal);
    }

    /// The socket's read loop ended: forget it, and tear down the session
    /// bound to it (a dead socket cannot be preserved).
    pub async fn signal_closed(&self, signal_id: Uuid) {
        let mut st = self.state.lock().await;
        if st.active_signal.as_ref().map(|s| s.id()) == Some(signal_id) {
            st.active_signal = None;
        }
        if st.preserved_signal.as_ref().map(|s| s.id()) == Some(signal_id) {
            st.preserved_signal = None;
        }
        let ours = matches!(&st.slot, Slot::Live(s) if s.signal.id() == signal_id);
        if ours {
            self.teardown_locked(&mut st, false, "signaling channel closed")
                .await;
        }
    }

    /// Consume the readiness flag at signaling-open time. The caller is
    /// about to emit `reconnection_ready` itself, which counts as the
    /// acknowledgement that clears the flag.
    pub async fn take_ready(&self) -> Option<String> {
        let mut st = self.state.lock().await;
        st.reconnect.ready_window_id.take()
    }

    /// One monitor tick.
    pub async fn on_observation(&self, obs: &WindowObservation) {
        let mut st = self.state.lock().await;
        st.latest = obs.clone();

        // A present window under a different ID is a reconnected mirror,
        // whether or not the presence flag ever flipped.
        if obs.present
            && !obs.id.is_empty()
            && !st.reconnect.last_id.is_empty()
            && obs.id != st.reconnect.last_id
        {
            info!(old = %st.reconnect.last_id, new = %obs.id, "window ID changed");
            st.reconnect.last_id = obs.id.clone();
            st.reconnect.last_present = true;
            st.reconnect.streak = 0;
            let new_id = obs.id.clone();
            self.window_id_changed(&mut st, new_id).await;
            return;
        }

        // First sighting: record the ID; presence still needs confirmation.
        if obs.present
            && !st.reconnect.last_present
            && st.reconnect.last_id.is_empty()
            && !obs.id.is_empty()
        {
            debug!(window_id = %obs.id, "first window sighting");
            st.reconnect.last_id = obs.id.clone();
        }

        if obs.present == st.reconnect.last_present {
            st.reconnect.streak = 0;
            return;
        }

        st.reconnect.streak += 1;
        debug!(
            streak = st.reconnect.streak,
            required = self.cfg.confirmation_checks,
            present = obs.present,
            "window state change pending confirmation"
        );
        if st.reconnect.streak < self.cfg.confirmation_checks {
            return;
        }

        st.reconnect.last_present = obs.present;
        st.reconnect.streak = 0;
        if obs.present {
            if !obs.id.is_empty() {
                st.reconnect.last_id = obs.id.clone();
            }
            self.window_appeared(&mut st).await;
        } else {
            self.window_disappeared(&mut st).await;
        }
    }

    /// Confirmed disappearance: the phone left. Notify, tear down the
    /// session but keep the socket, and forget the window ID.
    async fn window_disappeared(&self, st: &mut ControllerState) {
        info!("window disappeared - phone disconnected");
        self.debug
            .warning("AUTO_RECONNECT", "window_disappeared", "mirror window disappeared");

        st.reconnect.ready_window_id = None;

        if let Some(signal) = st.active_signal.clone() {
            let _ = signal
                .send(&SignalMessage::AirplayDisconnected {
                    message: "phone disconnected from the receiver".to_string(),
                })
                .await;
        }

        self.teardown_locked(st, true, "window lost").await;
        st.reconnect.last_id.clear();
    }

    /// Confirmed appearance after the phone was away.
    async fn window_appeared(&self, st: &mut ControllerState) {
        info!(window_id = %st.reconnect.last_id, "window appeared - phone connected");
        self.debug
            .success("AUTO_RECONNECT", "window_appeared", "mirror window appeared", None);

        if self.in_startup_grace() {
            debug!(
                uptime_secs = self.started_at.elapsed().as_secs(),
                "ignoring window appearance during startup grace"
            );
            return;
        }
        if !st.reconnect.auto_enabled {
            return;
        }
        if self.cooldown_active(&st.reconnect) {
            debug!("reconnect cooldown active, skipping");
            return;
        }
        // A session that is already streaming this mirror needs no cycle.
        if let Slot::Live(s) = &st.slot {
            if s.peer.has_media().await {
                debug!("session already has media, no reconnect needed");
                return;
            }
        }

        st.reconnect.last_attempt = Some(Instant::now());
        let window_id = st.reconnect.last_id.clone();
        self.mark_ready_and_notify(st, window_id).await;
    }

    /// The mirror came back under a new window ID while we were tracking the
    /// old one: tear the old session down (keeping the socket) and signal
    /// readiness for the new window.
    async fn window_id_changed(&self, st: &mut ControllerState, new_id: String) {
        if self.in_startup_grace() {
            debug!("ignoring window ID change during startup grace");
            return;
        }
        if !st.reconnect.auto_enabled {
            return;
        }
        if self.cooldown_active(&st.reconnect) {
            debug!("reconnect cooldown active, skipping ID change");
            return;
        }

        st.reconnect.last_attempt = Some(Instant::now());
        self.teardown_locked(st, true, "window ID changed").await;
        self.mark_ready_and_notify(st, new_id).await;
    }

    /// Set the readiness flag and try to deliver `reconnection_ready`.
    /// Exactly one of the two outcomes survives: the message was written and
    /// the flag is cleared, or no socket took it and the flag stays for the
    /// next signaling handler to consume.
    async fn mark_ready_and_notify(&self, st: &mut ControllerState, window_id: String) {
        st.reconnect.ready_window_id = Some(window_id.clone());

        let target = st.preserved_signal.take().or_else(|| st.active_signal.clone());
        let Some(signal) = target else {
            info!(%window_id, "no signaling channel, readiness saved for next connection");
            return;
        };

        let msg = SignalMessage::ReconnectionReady {
            message: "phone reconnected - send a new offer".to_string(),
            window_id: window_id.clone(),
        };
        match signal.send(&msg).await {
            Ok(()) => {
                st.reconnect.ready_window_id = None;
                info!(%window_id, "reconnection_ready delivered");
                self.debug.success(
                    "AUTO_RECONNECT",
                    "reconnection_ready",
                    "reconnection notification sent",
                    Some(json!({ "windowID": window_id })),
                );
            }
            Err(e) => {
                warn!("failed to deliver reconnection_ready, keeping flag: {e:#}");
            }
        }
    }

    /// A peer connection reported a terminal state (ICE failed, connection
    /// closed, ...). Tear the session down keeping the socket; if the phone
    /// is still mirroring, tell the browser it can come straight back.
    pub async fn on_peer_terminal(&self, session_id: Uuid, reason: &str) {
        let mut st = self.state.lock().await;
        let ours = matches!(&st.slot, Slot::Live(s) if s.id == session_id);
        if !ours {
            debug!(%session_id, reason, "terminal event for a session no longer in the slot");
            return;
        }
        warn!(%session_id, reason, "session reached terminal state");
        self.debug
            .error("WEBRTC", "session_terminal", reason.to_string(), None);

        self.teardown_locked(&mut st, true, reason).await;

        if st.latest.present && !self.cooldown_active(&st.reconnect) {
            st.reconnect.last_attempt = Some(Instant::now());
            let window_id = st.latest.id.clone();
            self.mark_ready_and_notify(&mut st, window_id).await;
        }
    }

    /// The encoder died without being asked to.
    pub async fn on_encoder_exit(&self, session_id: Uuid) {
        self.on_peer_terminal(session_id, "encoder exited unexpectedly")
            .await;
    }

    /// Unconditional teardown (admin request or process shutdown). The
    /// socket is closed too.
    pub async fn admin_cleanup(&self) {
        let mut st = self.state.lock().await;
        self.teardown_locked(&mut st, false, "admin cleanup").await;
    }

    async fn teardown_locked(&self, st: &mut ControllerState, preserve_signal: bool, reason: &str) {
        match std::mem::take(&mut st.slot) {
            Slot::Live(session) => {
                info!(session_id = %session.id, reason, "tearing down session");
                if preserve_signal {
                    // Moved aside before the slot empties so a reconnect
                    // event arriving mid-teardown still finds the socket.
                    st.preserved_signal = Some(Arc::clone(&session.signal));
                }
                session.shutdown(preserve_signal).await;
            }
            Slot::Reserved { id, .. } => {
                debug!(session_id = %id, reason, "clearing reserved slot");
            }
            Slot::Free => {}
        }
    }

    /// Summary for `/api/webrtc/status`.
    pub async fn status(&self) -> serde_json::Value {
        let st = self.state.lock().await;
        match &st.slot {
            Slot::Live(s) => {
                let capture = s.capture.lock().await;
                json!({
                    "active": true,
                    "hasSession": true,
                    "sessionID": s.id.to_string(),
                    "uptime": s.started_at.elapsed().as_secs_f64(),
                    "videoPort": capture.as_ref().map(|c| c.video_rtp_port),
                    "audioPort": capture.as_ref().map(|c| c.audio_rtp_port),
                    "hasEncoder": capture.is_some(),
                    "connectionState": s.peer.connection_state().to_string(),
                    "iceConnectionState": s.peer.ice_connection_state().to_string(),
                })
            }
            Slot::Reserved { id, .. } => json!({
                "active": false,
                "hasSession": true,
                "pending": true,
                "sessionID": id.to_string(),
            }),
            Slot::Free => json!({
                "active": false,
                "hasSession": false,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) async fn test_snapshot(&self) -> TestSnapshot {
        let st = self.state.lock().await;
        TestSnapshot {
            last_present: st.reconnect.last_present,
            last_id: st.reconnect.last_id.clone(),
            streak: st.reconnect.streak,
            ready_window_id: st.reconnect.ready_window_id.clone(),
            slot_live: matches!(st.slot, Slot::Live(_)),
            slot_reserved: matches!(st.slot, Slot::Reserved { .. }),
            has_preserved_signal: st.preserved_signal.is_some(),
        }
    }
}

#[cfg(test)]
pub(crate) struct TestSnapshot {
    pub last_present: bool,
    pub last_id: String,
    pub streak: u32,
    pub ready_window_id: Option<String>,
    pub slot_live: bool,
    pub slot_reserved: bool,
    pub has_preserved_signal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> ReconnectConfig {
        ReconnectConfig {
            confirmation_checks: 3,
            cooldown_secs: 0,
            startup_grace_secs: 0,
            window_wait_secs: 60,
        }
    }

    fn controller(cfg: ReconnectConfig) -> Arc<Controller> {
        Controller::new(cfg, Arc::new(DebugHub::new()))
    }

    fn present(id: &str) -> WindowObservation {
        WindowObservation {
            present: true,
            id: id.to_string(),
            width: 1080,
            height: 1920,
        }
    }

    fn absent() -> WindowObservation {
        WindowObservation::default()
    }

    async fn tick_n(ctrl: &Controller, obs: &WindowObservation, n: u32) {
        for _ in 0..n {
            ctrl.on_observation(obs).await;
        }
    }

    #[tokio::test]
    async fn slot_holds_at_most_one_reservation() {
        let ctrl = controller(fast_cfg());
        let first = ctrl.reserve().await.unwrap();
        assert!(ctrl.reserve().await.is_err());
        ctrl.clear_reservation(first).await;
        ctrl.reserve().await.unwrap();
    }

    #[tokio::test]
    async fn clearing_someone_elses_reservation_is_a_no_op() {
        let ctrl = controller(fast_cfg());
        let id = ctrl.reserve().await.unwrap();
        ctrl.clear_reservation(Uuid::new_v4()).await;
        assert!(ctrl.reserve().await.is_err());
        ctrl.clear_reservation(id).await;
    }

    #[tokio::test]
    async fn flapping_never_confirms_a_change() {
        let ctrl = controller(fast_cfg());
        for _ in 0..20 {
            ctrl.on_observation(&present("W1")).await;
            let snap = ctrl.test_snapshot().await;
            assert!(snap.streak <= 1, "streak advanced past 1 on a flap");
            ctrl.on_observation(&absent()).await;
        }
        let snap = ctrl.test_snapshot().await;
        assert!(!snap.last_present);
        assert!(snap.ready_window_id.is_none());
    }

    #[tokio::test]
    async fn confirmed_appearance_sets_ready_flag_without_a_socket() {
        let ctrl = controller(fast_cfg());
        tick_n(&ctrl, &present("W1"), 3).await;
        let snap = ctrl.test_snapshot().await;
        assert!(snap.last_present);
        assert_eq!(snap.ready_window_id.as_deref(), Some("W1"));

        // The next signaling handler consumes it exactly once.
        assert_eq!(ctrl.take_ready().await.as_deref(), Some("W1"));
        assert!(ctrl.take_ready().await.is_none());
    }

    #[tokio::test]
    async fn startup_grace_suppresses_notifications() {
        let cfg = ReconnectConfig {
            startup_grace_secs: 3600,
            ..fast_cfg()
        };
        let ctrl = controller(cfg);
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;
        tick_n(&ctrl, &present("W1"), 3).await;

        let snap = ctrl.test_snapshot().await;
        // State is initialized, but no event fired.
        assert!(snap.last_present);
        assert_eq!(snap.last_id, "W1");
        assert!(snap.ready_window_id.is_none());
        assert!(signal.recorded().is_empty());
    }

    #[tokio::test]
    async fn confirmed_appearance_notifies_exactly_once() {
        let ctrl = controller(fast_cfg());
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;
        tick_n(&ctrl, &present("W1"), 3).await;

        let ready: Vec<_> = signal
            .recorded()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::ReconnectionReady { .. }))
            .collect();
        assert_eq!(ready.len(), 1);
        // Delivered, so the flag must not fire again at the next open.
        assert!(ctrl.take_ready().await.is_none());
    }

    #[tokio::test]
    async fn failed_delivery_keeps_the_ready_flag() {
        let ctrl = controller(fast_cfg());
        let signal = SignalWriter::failing();
        ctrl.register_signal(Arc::clone(&signal)).await;
        tick_n(&ctrl, &present("W1"), 3).await;
        assert_eq!(ctrl.take_ready().await.as_deref(), Some("W1"));
    }

    #[tokio::test]
    async fn cooldown_bounds_a_burst_to_one_notification() {
        let cfg = ReconnectConfig {
            cooldown_secs: 3600,
            ..fast_cfg()
        };
        let ctrl = controller(cfg);
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;

        // Five appear confirmations inside the cooldown window.
        for round in 0..5 {
            let id = format!("W{round}");
            tick_n(&ctrl, &present(&id), 3).await;
            tick_n(&ctrl, &absent(), 3).await;
        }

        let ready_count = signal
            .recorded()
            .iter()
            .filter(|m| matches!(m, SignalMessage::ReconnectionReady { .. }))
            .count();
        assert_eq!(ready_count, 1);
    }

    #[tokio::test]
    async fn confirmed_disappearance_clears_tracking_and_notifies() {
        let ctrl = controller(fast_cfg());
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;

        ctrl.seed(&present("W1")).await;
        tick_n(&ctrl, &absent(), 3).await;

        let snap = ctrl.test_snapshot().await;
        assert!(!snap.last_present);
        assert_eq!(snap.last_id, "");
        assert!(snap.ready_window_id.is_none());
        assert!(
            signal
                .recorded()
                .iter()
                .any(|m| matches!(m, SignalMessage::AirplayDisconnected { .. }))
        );
    }

    #[tokio::test]
    async fn reappearance_with_new_id_yields_one_notification() {
        let ctrl = controller(fast_cfg());
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;

        ctrl.seed(&present("W1")).await;
        tick_n(&ctrl, &absent(), 3).await; // confirmed gone, last_id cleared
        tick_n(&ctrl, &present("W2"), 3).await; // confirmed back

        let ready: Vec<_> = signal
            .recorded()
            .into_iter()
            .filter_map(|m| match m {
                SignalMessage::ReconnectionReady { window_id, .. } => Some(window_id),
                _ => None,
            })
            .collect();
        assert_eq!(ready, vec!["W2".to_string()]);
    }

    #[tokio::test]
    async fn id_change_without_presence_flip_is_a_reconnect() {
        let ctrl = controller(fast_cfg());
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;

        ctrl.seed(&present("W1")).await;
        // Single tick with a new ID; no confirmation streak required.
        ctrl.on_observation(&present("W2")).await;

        let snap = ctrl.test_snapshot().await;
        assert_eq!(snap.last_id, "W2");
        let ready: Vec<_> = signal
            .recorded()
            .into_iter()
            .filter_map(|m| match m {
                SignalMessage::ReconnectionReady { window_id, .. } => Some(window_id),
                _ => None,
            })
            .collect();
        assert_eq!(ready, vec!["W2".to_string()]);
    }

    #[tokio::test]
    async fn disappearance_tears_down_live_session_and_preserves_socket() {
        let ctrl = controller(fast_cfg());
        let signal = SignalWriter::recorder();
        ctrl.register_signal(Arc::clone(&signal)).await;
        ctrl.seed(&present("W1")).await;

        let id = ctrl.reserve().await.unwrap();
        let ice = airbridge_protocol::IceConfig {
            nat_host_ip: String::new(),
        };
        let peer = crate::peer::create_peer(
            &ice,
            Arc::clone(&ctrl),
            Arc::clone(&signal),
            id,
            Arc::new(DebugHub::new()),
        )
        .await
        .unwrap();
        let session = Session::new(id, peer, Arc::clone(&signal));
        assert!(ctrl.attach_session(session).await.is_ok());
        assert!(ctrl.test_snapshot().await.slot_live);
        assert_eq!(ctrl.live_session_id().await, Some(id));

        // A second client is refused while the session is live.
        assert!(ctrl.reserve().await.is_err());

        tick_n(&ctrl, &absent(), 3).await;

        let snap = ctrl.test_snapshot().await;
        assert!(!snap.slot_live);
        assert!(!snap.slot_reserved);
        assert!(snap.has_preserved_signal);
        assert!(
            signal
                .recorded()
                .iter()
                .any(|m| matches!(m, SignalMessage::AirplayDisconnected { .. }))
        );
        // The slot is free again for the next session.
        ctrl.reserve().await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_the_slot_shape() {
        let ctrl = controller(fast_cfg());
        let free = ctrl.status().await;
        assert_eq!(free["active"], false);
        assert_eq!(free["hasSession"], false);

        let id = ctrl.reserve().await.unwrap();
        let reserved = ctrl.status().await;
        assert_eq!(reserved["active"], false);
        assert_eq!(reserved["pending"], true);
        assert_eq!(reserved["sessionID"], id.to_string());
    }
}
