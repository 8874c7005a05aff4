//! The session record: one browser view of one mirrored window.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::CaptureState;
use crate::peer::PeerHandle;
use crate::signaling::SignalWriter;

/// At most one of these exists at a time, held in the controller's slot.
///
/// The peer and capture fields are built and manipulated only by their
/// owning modules (`peer`, `capture`); the signal handle is borrowed — the
/// socket outlives the session across reconnect cycles.
pub struct Session {
    pub id: Uuid,
    pub started_at: Instant,
    pub peer: Arc<PeerHandle>,
    /// Empty until the first offer starts the capture pipeline.
    pub capture: Arc<Mutex<Option<CaptureState>>>,
    pub signal: Arc<SignalWriter>,
    /// Cancels every task started under this session.
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(id: Uuid, peer: Arc<PeerHandle>, signal: Arc<SignalWriter>) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            peer,
            capture: Arc::new(Mutex::new(None)),
            signal,
            cancel: CancellationToken::new(),
        }
    }

    /// Ordered teardown: cancel all tasks, kill and reap the encoder, close
    /// the UDP listeners, close the peer connection, and finally the
    /// signaling socket unless the controller preserved it.
    pub async fn shutdown(self, preserve_signal: bool) {
        info!(
            session_id = %self.id,
            uptime_secs = self.started_at.elapsed().as_secs(),
            preserve_signal,
            "shutting down session"
        );

        self.cancel.cancel();

        let capture = self.capture.lock().await.take();
        if let Some(capture) = capture {
            capture.shutdown().await;
        }

        if let Err(e) = self.peer.close().await {
            warn!(session_id = %self.id, "peer close failed: {e:#}");
        }

        if !preserve_signal {
            self.signal.close().await;
        }

        info!(session_id = %self.id, "session shut down");
    }
}
