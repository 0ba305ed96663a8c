//! Signaling wire model.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Outbound and inbound events are separate sum types so that a message the
//! client never sends (e.g. `incoming_call`) cannot be constructed for
//! sending, and dispatch on received events is exhaustive.

use crate::types::call::{CallId, CallKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

/// Payload of `initiate_call` / `incoming_call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    pub call_id: CallId,
    pub caller_id: String,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_avatar: Option<String>,
    pub receiver_id: String,
    pub call_type: CallKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: CallId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    Declined,
    Busy,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejection {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub call_id: CallId,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub call_id: CallId,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcePayload {
    pub call_id: CallId,
    pub candidate: IceCandidate,
}

/// Events the client sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    HeartbeatAck {},
    InitiateCall(CallInvite),
    AcceptCall(CallRef),
    RejectCall(CallRejection),
    EndCall(CallRef),
    WebrtcOffer(OfferPayload),
    WebrtcAnswer(AnswerPayload),
    WebrtcIceCandidate(IcePayload),
}

/// Events the signaling server delivers to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    Heartbeat {},
    IncomingCall(CallInvite),
    CallAccepted(CallRef),
    CallRejected(CallRejection),
    CallEnded(CallRef),
    WebrtcOffer(OfferPayload),
    WebrtcAnswer(AnswerPayload),
    WebrtcIceCandidate(IcePayload),
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join_room",
            Self::LeaveRoom(_) => "leave_room",
            Self::HeartbeatAck {} => "heartbeat_ack",
            Self::InitiateCall(_) => "initiate_call",
            Self::AcceptCall(_) => "accept_call",
            Self::RejectCall(_) => "reject_call",
            Self::EndCall(_) => "end_call",
            Self::WebrtcOffer(_) => "webrtc_offer",
            Self::WebrtcAnswer(_) => "webrtc_answer",
            Self::WebrtcIceCandidate(_) => "webrtc_ice_candidate",
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::JoinRoom(_) | Self::LeaveRoom(_) | Self::HeartbeatAck {} => None,
            Self::InitiateCall(invite) => Some(&invite.call_id),
            Self::AcceptCall(r) | Self::EndCall(r) => Some(&r.call_id),
            Self::RejectCall(r) => Some(&r.call_id),
            Self::WebrtcOffer(p) => Some(&p.call_id),
            Self::WebrtcAnswer(p) => Some(&p.call_id),
            Self::WebrtcIceCandidate(p) => Some(&p.call_id),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl InboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat {} => "heartbeat",
            Self::IncomingCall(_) => "incoming_call",
            Self::CallAccepted(_) => "call_accepted",
            Self::CallRejected(_) => "call_rejected",
            Self::CallEnded(_) => "call_ended",
            Self::WebrtcOffer(_) => "webrtc_offer",
            Self::WebrtcAnswer(_) => "webrtc_answer",
            Self::WebrtcIceCandidate(_) => "webrtc_ice_candidate",
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Heartbeat {} => None,
            Self::IncomingCall(invite) => Some(&invite.call_id),
            Self::CallAccepted(r) | Self::CallEnded(r) => Some(&r.call_id),
            Self::CallRejected(r) => Some(&r.call_id),
            Self::WebrtcOffer(p) => Some(&p.call_id),
            Self::WebrtcAnswer(p) => Some(&p.call_id),
            Self::WebrtcIceCandidate(p) => Some(&p.call_id),
        }
    }

    /// Parses a text frame. A missing or `null` `data` field is read as `{}`
    /// so that payload-less events like `heartbeat` decode either way.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut value: Value = serde_json::from_str(text)?;
        let object = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;
        match object.get("data") {
            None | Some(Value::Null) => {
                object.insert("data".to_string(), Value::Object(Default::default()));
            }
            Some(_) => {}
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invite() -> CallInvite {
        CallInvite {
            call_id: CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            caller_id: "u-alice".into(),
            caller_name: "Alice".into(),
            caller_avatar: None,
            receiver_id: "u-bob".into(),
            call_type: CallKind::Video,
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        }
    }

    #[test]
    fn test_outbound_invite_wire_shape() {
        let encoded = OutboundMessage::InitiateCall(invite()).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "initiate_call",
                "data": {
                    "callId": "AC90CFD09DF712D981142B172706F9F2",
                    "callerId": "u-alice",
                    "callerName": "Alice",
                    "receiverId": "u-bob",
                    "callType": "video",
                    "timestamp": 1_700_000_000_123i64
                }
            })
        );
    }

    #[test]
    fn test_heartbeat_ack_has_empty_payload() {
        let encoded = OutboundMessage::HeartbeatAck {}.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"event": "heartbeat_ack", "data": {}}));
    }

    #[test]
    fn test_decode_heartbeat_with_and_without_data() {
        assert_eq!(
            InboundMessage::decode(r#"{"event":"heartbeat"}"#).unwrap(),
            InboundMessage::Heartbeat {}
        );
        assert_eq!(
            InboundMessage::decode(r#"{"event":"heartbeat","data":null}"#).unwrap(),
            InboundMessage::Heartbeat {}
        );
        assert_eq!(
            InboundMessage::decode(r#"{"event":"heartbeat","data":{}}"#).unwrap(),
            InboundMessage::Heartbeat {}
        );
    }

    #[test]
    fn test_decode_ice_candidate() {
        let frame = json!({
            "event": "webrtc_ice_candidate",
            "data": {
                "callId": "C1",
                "candidate": {
                    "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }
        })
        .to_string();

        let msg = InboundMessage::decode(&frame).unwrap();
        assert_eq!(msg.name(), "webrtc_ice_candidate");
        assert_eq!(msg.call_id(), Some(&CallId::new("C1")));
        let InboundMessage::WebrtcIceCandidate(payload) = msg else {
            panic!("expected ice candidate");
        };
        assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_decode_rejection_reason_is_optional() {
        let plain = InboundMessage::decode(r#"{"event":"call_rejected","data":{"callId":"C1"}}"#)
            .unwrap();
        assert_eq!(
            plain,
            InboundMessage::CallRejected(CallRejection {
                call_id: CallId::new("C1"),
                reason: None
            })
        );

        let busy = InboundMessage::decode(
            r#"{"event":"call_rejected","data":{"callId":"C1","reason":"busy"}}"#,
        )
        .unwrap();
        let InboundMessage::CallRejected(rejection) = busy else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, Some(RejectReason::Busy));
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed_frames() {
        assert!(InboundMessage::decode(r#"{"event":"new_post","data":{}}"#).is_err());
        assert!(InboundMessage::decode(r#"{"event":"call_accepted","data":{}}"#).is_err());
        assert!(matches!(
            InboundMessage::decode("[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            InboundMessage::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
