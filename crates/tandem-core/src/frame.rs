//! Wire frames.
//!
//! All frames are UTF-8 JSON objects carrying a `type` discriminator that is
//! matched case-insensitively. Inbound text is classified first (a cheap peek
//! at `type`), then parsed into the matching frame struct. Payloads ride as
//! [`RawValue`] so the engine re-emits the sender's exact bytes instead of a
//! re-serialized tree.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// One of the two endpoints of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The opposite side.
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl core::fmt::Display for Side {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

impl core::str::FromStr for Side {
    type Err = InvalidSide;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Side::A),
            "B" => Ok(Side::B),
            _ => Err(InvalidSide),
        }
    }
}

/// Returned when a side string is neither `A` nor `B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSide;

impl core::fmt::Display for InvalidSide {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid side (want A or B)")
    }
}

impl std::error::Error for InvalidSide {}

/// What kind of frame an inbound message is, per its `type` discriminator.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrameKind {
    /// `hello`: resume a side and advance its watermark.
    Hello,
    /// `send`: enqueue to the peer mailbox.
    Send,
    /// `delivered`: advance the watermark of the sender's own mailbox.
    Delivered,
    /// `offer`/`answer`/`ice`: forwarded verbatim to the peer.
    Signal,
    /// Anything else; logged and ignored.
    Unknown(String),
}

/// Peek at the `type` field of an inbound frame.
///
/// Fails only on malformed JSON; a missing `type` classifies as
/// [`ClientFrameKind::Unknown`].
pub fn classify(text: &str) -> Result<ClientFrameKind, serde_json::Error> {
    #[derive(Deserialize)]
    struct Peek {
        #[serde(default, rename = "type")]
        kind: String,
    }

    let peek: Peek = serde_json::from_str(text)?;
    Ok(match peek.kind.to_ascii_lowercase().as_str() {
        "hello" => ClientFrameKind::Hello,
        "send" => ClientFrameKind::Send,
        "delivered" => ClientFrameKind::Delivered,
        "offer" | "answer" | "ice" => ClientFrameKind::Signal,
        _ => ClientFrameKind::Unknown(peek.kind),
    })
}

/// `hello` frame: binds an optional session id and reports the highest
/// sequence the side has durably processed.
#[derive(Debug, Deserialize)]
pub struct Hello {
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, rename = "deliveredUpTo")]
    pub delivered_up_to: u64,
}

/// `send` frame: an application message for the named side's mailbox.
#[derive(Debug, Deserialize)]
pub struct SendFrame {
    pub to: Side,
    pub payload: Box<RawValue>,
}

/// `delivered` frame: acknowledges everything at or below `upTo`.
#[derive(Debug, Deserialize)]
pub struct Delivered {
    #[serde(rename = "upTo")]
    pub up_to: u64,
}

/// A mailbox delivery, emitted server→client.
#[derive(Debug, Serialize)]
pub struct Deliver {
    pub seq: u64,
    pub from: Side,
    pub payload: Box<RawValue>,
}

/// Frames the server originates.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Deliver(Deliver),
    /// Fired once when a room's second side arrives.
    RoomFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(classify(r#"{"type":"HELLO"}"#).unwrap(), ClientFrameKind::Hello);
        assert_eq!(classify(r#"{"type":"Send"}"#).unwrap(), ClientFrameKind::Send);
        assert_eq!(
            classify(r#"{"type":"delivered"}"#).unwrap(),
            ClientFrameKind::Delivered
        );
        for t in ["offer", "Answer", "ICE"] {
            assert_eq!(
                classify(&format!(r#"{{"type":"{t}"}}"#)).unwrap(),
                ClientFrameKind::Signal
            );
        }
    }

    #[test]
    fn classify_unknown_and_missing_type() {
        assert_eq!(
            classify(r#"{"type":"cache"}"#).unwrap(),
            ClientFrameKind::Unknown("cache".into())
        );
        assert_eq!(
            classify(r#"{"payload":1}"#).unwrap(),
            ClientFrameKind::Unknown(String::new())
        );
        assert!(classify("not json").is_err());
    }

    #[test]
    fn hello_defaults() {
        let h: Hello = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(h.session_id, None);
        assert_eq!(h.delivered_up_to, 0);

        let h: Hello =
            serde_json::from_str(r#"{"type":"hello","sessionId":"s1","deliveredUpTo":7}"#).unwrap();
        assert_eq!(h.session_id.as_deref(), Some("s1"));
        assert_eq!(h.delivered_up_to, 7);
    }

    #[test]
    fn send_preserves_payload_bytes() {
        let s: SendFrame =
            serde_json::from_str(r#"{"type":"send","to":"B","payload":{"k":1,"a":[true]}}"#)
                .unwrap();
        assert_eq!(s.to, Side::B);
        assert_eq!(s.payload.get(), r#"{"k":1,"a":[true]}"#);
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        let payload: Box<RawValue> = serde_json::from_str(r#"{"k":1}"#).unwrap();
        let text = serde_json::to_string(&ServerFrame::Deliver(Deliver {
            seq: 3,
            from: Side::A,
            payload,
        }))
        .unwrap();
        assert_eq!(text, r#"{"type":"deliver","seq":3,"from":"A","payload":{"k":1}}"#);

        let text = serde_json::to_string(&ServerFrame::RoomFull).unwrap();
        assert_eq!(text, r#"{"type":"room_full"}"#);
    }
}
