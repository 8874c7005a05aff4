use serde::{Deserialize, Serialize};

/// Signaling messages exchanged with the browser over the WebSocket.
///
/// The tag values are the wire protocol; browsers tolerate unknown tags, so
/// new variants can be added without breaking old clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// WebRTC SDP offer from the browser
    #[serde(rename = "offer")]
    Offer { sdp: String },
    /// WebRTC SDP answer to the browser
    #[serde(rename = "answer")]
    Answer { sdp: String },
    /// Trickled ICE candidate, either direction
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: CandidateInit },
    /// Human-readable progress while the session is being set up
    #[serde(rename = "status")]
    Status { message: String },
    /// Recoverable failure; the socket stays open
    #[serde(rename = "error")]
    Error { message: String },
    /// The mirrored phone disconnected; the session was torn down
    #[serde(rename = "airplay_disconnected")]
    AirplayDisconnected { message: String },
    /// The phone is back; the browser should send a fresh offer
    #[serde(rename = "reconnection_ready")]
    ReconnectionReady {
        message: String,
        #[serde(rename = "windowID")]
        window_id: String,
    },
}

/// ICE candidate payload in the browser's RTCIceCandidateInit shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_parses_from_browser_json() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        match msg {
            SignalMessage::Offer { sdp } => assert_eq!(sdp, "v=0\r\n"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_round_trips_browser_field_names() {
        let json = r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 2130706431 192.168.1.115 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        let SignalMessage::IceCandidate { candidate } = &msg else {
            panic!("wrong variant");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["type"], "ice-candidate");
        assert_eq!(out["candidate"]["sdpMid"], "0");
        assert_eq!(out["candidate"]["sdpMLineIndex"], 0);
        // usernameFragment is omitted, not null
        assert!(out["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn reconnection_ready_uses_window_id_key() {
        let out = serde_json::to_value(SignalMessage::ReconnectionReady {
            message: "phone reconnected".into(),
            window_id: "0x3a00007".into(),
        })
        .unwrap();
        assert_eq!(out["type"], "reconnection_ready");
        assert_eq!(out["windowID"], "0x3a00007");
    }

    #[test]
    fn outbound_tags_match_wire_protocol() {
        let cases = [
            (
                serde_json::to_value(SignalMessage::Answer { sdp: "v=0".into() }).unwrap(),
                "answer",
            ),
            (
                serde_json::to_value(SignalMessage::Status {
                    message: "waiting".into(),
                })
                .unwrap(),
                "status",
            ),
            (
                serde_json::to_value(SignalMessage::Error {
                    message: "boom".into(),
                })
                .unwrap(),
                "error",
            ),
            (
                serde_json::to_value(SignalMessage::AirplayDisconnected {
                    message: "gone".into(),
                })
                .unwrap(),
                "airplay_disconnected",
            ),
        ];
        for (value, tag) in cases {
            assert_eq!(value["type"], tag);
        }
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"frobnicate"}"#).is_err());
    }
}
