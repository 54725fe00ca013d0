//! Signaling messages exchanged over the chat channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{PeerId, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
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
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
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
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferSignal {
    pub from_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub kind: StreamKind,
    pub sdp_offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSignal {
    pub from_id: PeerId,
    pub kind: StreamKind,
    pub sdp_answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSignal {
    pub from_id: PeerId,
    pub kind: StreamKind,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub from_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub kind: StreamKind,
}

/// Broadcast of which media a participant currently publishes. Absent flags
/// mean "unchanged".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStateSignal {
    pub from_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webcam: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microphone: Option<bool>,
}

impl MediaStateSignal {
    pub fn flag_for(&self, kind: StreamKind) -> Option<bool> {
        match kind {
            StreamKind::Camera => self.webcam,
            StreamKind::Screen => self.screen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer(OfferSignal),
    Answer(AnswerSignal),
    IceCandidate(CandidateSignal),
    RequestStream(StreamRequest),
    MediaState(MediaStateSignal),
}

impl SignalMessage {
    pub fn sender(&self) -> &PeerId {
        match self {
            SignalMessage::Offer(msg) => &msg.from_id,
            SignalMessage::Answer(msg) => &msg.from_id,
            SignalMessage::IceCandidate(msg) => &msg.from_id,
            SignalMessage::RequestStream(msg) => &msg.from_id,
            SignalMessage::MediaState(msg) => &msg.from_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::IceCandidate(_) => "ice-candidate",
            SignalMessage::RequestStream(_) => "request-stream",
            SignalMessage::MediaState(_) => "media-state",
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
