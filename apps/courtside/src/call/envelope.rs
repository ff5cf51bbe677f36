use serde::{Deserialize, Serialize};

/// Numeric participant id as issued by the session service.
pub type UserId = u64;

/// Messages this client writes to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinSession { user_id: UserId, session_id: String },
    #[serde(rename_all = "camelCase")]
    Signal {
        user_id: UserId,
        receiver_id: UserId,
        session_id: String,
        signal: SignalPayload,
    },
}

/// Messages the relay delivers to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: UserId },
    SessionUsers { users: Vec<UserId> },
    #[serde(rename_all = "camelCase")]
    Signal {
        user_id: UserId,
        signal: SignalPayload,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: UserId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn label(&self) -> &'static str {
        match self {
            SignalPayload::Description(desc) => desc.kind.as_str(),
            SignalPayload::Candidate { .. } => "candidate",
        }
    }
}

impl From<SessionDescription> for SignalPayload {
    fn from(desc: SessionDescription) -> Self {
        SignalPayload::Description(desc)
    }
}

impl From<IceCandidate> for SignalPayload {
    fn from(candidate: IceCandidate) -> Self {
        SignalPayload::Candidate { candidate }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn join_session_uses_camel_case_fields() {
        let message = ClientMessage::JoinSession {
            user_id: 1,
            session_id: "S1".into(),
        };
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({ "type": "join-session", "userId": 1, "sessionId": "S1" })
        );
    }

    #[test]
    fn outbound_signal_carries_sender_receiver_and_session() {
        let message = ClientMessage::Signal {
            user_id: 1,
            receiver_id: 2,
            session_id: "S1".into(),
            signal: SessionDescription::offer("v=0").into(),
        };
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "signal");
        assert_eq!(value["userId"], 1);
        assert_eq!(value["receiverId"], 2);
        assert_eq!(value["sessionId"], "S1");
        assert_eq!(value["signal"], json!({ "type": "offer", "sdp": "v=0" }));
    }

    #[test]
    fn candidate_payload_is_nested_under_candidate_key() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        let value = serde_json::to_value(SignalPayload::from(candidate.clone())).unwrap();
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);

        let decoded: SignalPayload = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, SignalPayload::Candidate { candidate });
    }

    #[test]
    fn decodes_every_inbound_message_kind() {
        let joined = decode_server_message(r#"{"type":"user-joined","userId":7}"#).unwrap();
        assert_eq!(joined, ServerMessage::UserJoined { user_id: 7 });

        let users = decode_server_message(r#"{"type":"session-users","users":[2,3]}"#).unwrap();
        assert_eq!(users, ServerMessage::SessionUsers { users: vec![2, 3] });

        let left = decode_server_message(r#"{"type":"user-left","userId":3}"#).unwrap();
        assert_eq!(left, ServerMessage::UserLeft { user_id: 3 });

        let signal = decode_server_message(
            r#"{"type":"signal","userId":5,"signal":{"type":"answer","sdp":"v=0"}}"#,
        )
        .unwrap();
        assert_eq!(
            signal,
            ServerMessage::Signal {
                user_id: 5,
                signal: SessionDescription::answer("v=0").into(),
            }
        );
    }

    #[test]
    fn rejects_unknown_message_types() {
        assert!(decode_server_message(r#"{"type":"chat","text":"hi"}"#).is_err());
        assert!(
            decode_server_message(r#"{"type":"signal","userId":5,"signal":{"type":"rollback"}}"#)
                .is_err()
        );
    }
}
