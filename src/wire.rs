// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multipart frame codec.
//!
//! Two frame families share a version byte (ASCII `a`):
//!
//! ```text
//! request/response:  [version][identifier][type][target][payload][bulk]
//! publish:           [topic][version][payload][bulk]
//! ```
//!
//! Empty frames are preserved as zero-length byte strings. Malformed frames
//! (wrong part count, unknown version) decode to a protocol error; servers
//! drop them with a log line, clients fail the pending request.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use tmq::{Message, Multipart};

use crate::error::{MktlError, Result};
use crate::payload::Payload;

/// The single-byte wire protocol revision.
pub const PROTOCOL_VERSION: u8 = b'a';

/// Request and response message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Get,
    Set,
    Hash,
    Config,
    Ack,
    Rep,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Hash => "HASH",
            Self::Config => "CONFIG",
            Self::Ack => "ACK",
            Self::Rep => "REP",
        }
    }

    pub fn parse(frame: &[u8]) -> Result<Self> {
        match frame {
            b"GET" => Ok(Self::Get),
            b"SET" => Ok(Self::Set),
            b"HASH" => Ok(Self::Hash),
            b"CONFIG" => Ok(Self::Config),
            b"ACK" => Ok(Self::Ack),
            b"REP" => Ok(Self::Rep),
            other => Err(MktlError::Protocol(format!(
                "unknown message type: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// True for the types a client may originate.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Set | Self::Hash | Self::Config)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static ID_TICKER: AtomicU32 = AtomicU32::new(0);

/// Opaque request identifier. Locally generated ids are a wrapping 32-bit
/// counter rendered as 8 lowercase hex characters; ids received from peers
/// are echoed verbatim whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Vec<u8>);

impl RequestId {
    /// Draw the next locally unique identifier.
    pub fn next() -> Self {
        let id = ID_TICKER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:08x}", id).into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

fn multipart(parts: Vec<Vec<u8>>) -> Multipart {
    let frames: VecDeque<Message> = parts.into_iter().map(Message::from).collect();
    Multipart(frames)
}

/// Borrow the frames of a multipart message as byte slices.
pub fn frames_of(msg: &Multipart) -> Vec<&[u8]> {
    msg.iter().map(|frame| &frame[..]).collect()
}

fn check_version(frame: &[u8]) -> Result<()> {
    if frame != [PROTOCOL_VERSION] {
        return Err(MktlError::Protocol(format!(
            "message is protocol {:?}, recipient expects {:?}",
            String::from_utf8_lossy(frame),
            PROTOCOL_VERSION as char
        )));
    }
    Ok(())
}

/// A client-originated request: GET, SET, HASH, or CONFIG.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub kind: MessageType,
    /// `<store>.<KEY>` for item operations, `<store>` or empty for metadata.
    pub target: String,
    pub payload: Option<Payload>,
    pub bulk: Option<Vec<u8>>,
}

impl Request {
    pub fn new(kind: MessageType, target: impl Into<String>, payload: Option<Payload>) -> Self {
        Self {
            id: RequestId::next(),
            kind,
            target: target.into(),
            payload,
            bulk: None,
        }
    }

    pub fn with_bulk(mut self, bulk: Vec<u8>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    pub fn encode(&self) -> Result<Multipart> {
        let payload = match &self.payload {
            Some(payload) => payload.encode()?,
            None => Vec::new(),
        };
        Ok(multipart(vec![
            vec![PROTOCOL_VERSION],
            self.id.as_bytes().to_vec(),
            self.kind.as_str().as_bytes().to_vec(),
            self.target.as_bytes().to_vec(),
            payload,
            self.bulk.clone().unwrap_or_default(),
        ]))
    }

    /// Decode the six request frames (the ROUTER identity, if any, must
    /// already be stripped by the caller).
    pub fn decode_frames(frames: &[&[u8]]) -> Result<Self> {
        if frames.len() != 6 {
            return Err(MktlError::Protocol(format!(
                "request has {} parts, expected 6",
                frames.len()
            )));
        }
        check_version(frames[0])?;

        let kind = MessageType::parse(frames[2])?;
        if !kind.is_request() {
            return Err(MktlError::Protocol(format!(
                "{} is not a request type",
                kind
            )));
        }

        let target = std::str::from_utf8(frames[3])
            .map_err(|_| MktlError::Protocol("target is not UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            id: RequestId::from_bytes(frames[1]),
            kind,
            target,
            payload: Payload::decode(frames[4])?,
            bulk: (!frames[5].is_empty()).then(|| frames[5].to_vec()),
        })
    }
}

/// A daemon-originated response: ACK or REP.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub kind: MessageType,
    pub payload: Option<Payload>,
    pub bulk: Option<Vec<u8>>,
}

impl Response {
    /// The immediate acknowledgement every request receives before dispatch.
    pub fn ack(id: RequestId) -> Self {
        Self {
            id,
            kind: MessageType::Ack,
            payload: None,
            bulk: None,
        }
    }

    pub fn rep(id: RequestId, payload: Option<Payload>, bulk: Option<Vec<u8>>) -> Self {
        Self {
            id,
            kind: MessageType::Rep,
            payload,
            bulk,
        }
    }

    pub fn encode(&self) -> Result<Multipart> {
        let payload = match &self.payload {
            Some(payload) => payload.encode()?,
            None => Vec::new(),
        };
        Ok(multipart(vec![
            vec![PROTOCOL_VERSION],
            self.id.as_bytes().to_vec(),
            self.kind.as_str().as_bytes().to_vec(),
            Vec::new(),
            payload,
            self.bulk.clone().unwrap_or_default(),
        ]))
    }

    /// Prefix the response with a ROUTER identity frame for delivery.
    pub fn encode_routed(&self, identity: &[u8]) -> Result<Multipart> {
        let mut encoded = self.encode()?;
        encoded.0.push_front(Message::from(identity.to_vec()));
        Ok(encoded)
    }

    pub fn decode_frames(frames: &[&[u8]]) -> Result<Self> {
        if frames.len() != 6 {
            return Err(MktlError::Protocol(format!(
                "response has {} parts, expected 6",
                frames.len()
            )));
        }
        check_version(frames[0])?;

        let kind = MessageType::parse(frames[2])?;
        if kind.is_request() {
            return Err(MktlError::Protocol(format!(
                "{} is not a response type",
                kind
            )));
        }

        Ok(Self {
            id: RequestId::from_bytes(frames[1]),
            kind,
            payload: Payload::decode(frames[4])?,
            bulk: (!frames[5].is_empty()).then(|| frames[5].to_vec()),
        })
    }
}

/// The three broadcast families, distinguished by topic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Plain,
    Bulk,
    Bundle,
}

/// A publish/subscribe topic. The wire form always carries a trailing `.`
/// so that ZeroMQ's leading-substring subscription match cannot alias one
/// key onto another whose name extends it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    /// `<store>.<KEY>` (or `<store>.<prefix>` for bundles), no trailing dot.
    pub name: String,
}

impl Topic {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Plain,
            name: name.into(),
        }
    }

    pub fn bulk(name: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Bulk,
            name: name.into(),
        }
    }

    pub fn bundle(name: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Bundle,
            name: name.into(),
        }
    }

    /// The byte string placed in the topic frame, and passed verbatim to
    /// subscription options.
    pub fn wire(&self) -> Vec<u8> {
        let prefix = match self.kind {
            TopicKind::Plain => "",
            TopicKind::Bulk => "bulk:",
            TopicKind::Bundle => "bundle:",
        };
        format!("{}{}.", prefix, self.name).into_bytes()
    }

    pub fn parse(frame: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| MktlError::Protocol("topic is not UTF-8".to_string()))?;

        let (kind, rest) = if let Some(rest) = text.strip_prefix("bulk:") {
            (TopicKind::Bulk, rest)
        } else if let Some(rest) = text.strip_prefix("bundle:") {
            (TopicKind::Bundle, rest)
        } else {
            (TopicKind::Plain, text)
        };

        let name = rest
            .strip_suffix('.')
            .ok_or_else(|| MktlError::Protocol(format!("topic missing trailing dot: {}", text)))?;

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.wire()))
    }
}

/// An asynchronous broadcast, either a single item update or a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub topic: Topic,
    pub body: BroadcastBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastBody {
    /// One item's update; `bulk` is present iff the topic carries the
    /// `bulk:` prefix.
    Single {
        payload: Option<Payload>,
        bulk: Option<Vec<u8>>,
    },
    /// Several related items updated atomically. Every element carries the
    /// same `id` and its own `key`.
    Bundle { elements: Vec<Payload> },
}

impl Broadcast {
    pub fn single(topic: Topic, payload: Payload, bulk: Option<Vec<u8>>) -> Self {
        Self {
            topic,
            body: BroadcastBody::Single {
                payload: Some(payload),
                bulk,
            },
        }
    }

    pub fn bundle(name: impl Into<String>, elements: Vec<Payload>) -> Self {
        Self {
            topic: Topic::bundle(name),
            body: BroadcastBody::Bundle { elements },
        }
    }

    pub fn encode(&self) -> Result<Multipart> {
        let (payload, bulk) = match &self.body {
            BroadcastBody::Single { payload, bulk } => {
                let encoded = match payload {
                    Some(payload) => payload.encode()?,
                    None => Vec::new(),
                };
                (encoded, bulk.clone().unwrap_or_default())
            }
            BroadcastBody::Bundle { elements } => (serde_json::to_vec(elements)?, Vec::new()),
        };

        Ok(multipart(vec![
            self.topic.wire(),
            vec![PROTOCOL_VERSION],
            payload,
            bulk,
        ]))
    }

    pub fn decode_frames(frames: &[&[u8]]) -> Result<Self> {
        if frames.len() != 4 {
            return Err(MktlError::Protocol(format!(
                "broadcast has {} parts, expected 4",
                frames.len()
            )));
        }

        let topic = Topic::parse(frames[0])?;
        check_version(frames[1])?;

        let body = match topic.kind {
            TopicKind::Bundle => {
                let elements: Vec<Payload> = serde_json::from_slice(frames[2])
                    .map_err(|err| MktlError::Protocol(format!("unparseable bundle: {}", err)))?;
                BroadcastBody::Bundle { elements }
            }
            _ => BroadcastBody::Single {
                payload: Payload::decode(frames[2])?,
                bulk: (!frames[3].is_empty()).then(|| frames[3].to_vec()),
            },
        };

        Ok(Self { topic, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reframe(msg: &Multipart) -> Vec<Vec<u8>> {
        frames_of(msg).iter().map(|f| f.to_vec()).collect()
    }

    #[test]
    fn request_roundtrip() {
        let request = Request::new(
            MessageType::Get,
            "oven.TEMP",
            Some(Payload {
                refresh: Some(true),
                ..Payload::default()
            }),
        );

        let encoded = request.encode().unwrap();
        let frames = reframe(&encoded);
        let borrowed: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
        let decoded = Request::decode_frames(&borrowed).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_roundtrip_with_bulk() {
        let response = Response::rep(
            RequestId::from_bytes(b"00a0ffee"),
            Some(Payload::of_bulk(vec![2, 3], "int16", 5.0)),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
        );

        let encoded = response.encode().unwrap();
        let frames = reframe(&encoded);
        let borrowed: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
        let decoded = Response::decode_frames(&borrowed).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn ack_has_empty_tail_frames() {
        let ack = Response::ack(RequestId::from_bytes(b"0001"));
        let encoded = ack.encode().unwrap();
        let frames = reframe(&encoded);
        assert_eq!(frames[0], vec![b'a']);
        assert_eq!(frames[2], b"ACK".to_vec());
        assert!(frames[3].is_empty());
        assert!(frames[4].is_empty());
        assert!(frames[5].is_empty());
    }

    #[test]
    fn wrong_part_count_is_rejected() {
        let frames: Vec<&[u8]> = vec![b"a", b"0001", b"GET"];
        assert!(matches!(
            Request::decode_frames(&frames),
            Err(MktlError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let frames: Vec<&[u8]> = vec![b"z", b"0001", b"GET", b"oven.TEMP", b"", b""];
        assert!(matches!(
            Request::decode_frames(&frames),
            Err(MktlError::Protocol(_))
        ));
    }

    #[test]
    fn topic_wire_forms() {
        assert_eq!(Topic::plain("oven.TEMP").wire(), b"oven.TEMP.".to_vec());
        assert_eq!(Topic::bulk("cam.IMG").wire(), b"bulk:cam.IMG.".to_vec());
        assert_eq!(
            Topic::bundle("scope.AXIS").wire(),
            b"bundle:scope.AXIS.".to_vec()
        );
    }

    #[test]
    fn topic_parse_distinguishes_kinds() {
        let topic = Topic::parse(b"bulk:cam.IMG.").unwrap();
        assert_eq!(topic.kind, TopicKind::Bulk);
        assert_eq!(topic.name, "cam.IMG");

        assert!(Topic::parse(b"cam.IMG").is_err()); // no trailing dot
    }

    #[test]
    fn trailing_dot_prevents_prefix_aliasing() {
        // A subscription to foo.BAR. must never match foo.BARBAZ. The wire
        // form of the shorter topic is not a prefix of the longer one.
        let short = Topic::plain("foo.BAR").wire();
        let long = Topic::plain("foo.BARBAZ").wire();
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn bundle_roundtrip() {
        let elements = vec![
            Payload {
                key: Some("ONE".to_string()),
                id: Some("00000abc".to_string()),
                value: Some(json!(1)),
                time: Some(10.0),
                ..Payload::default()
            },
            Payload {
                key: Some("TWO".to_string()),
                id: Some("00000abc".to_string()),
                value: Some(json!(2)),
                time: Some(10.0),
                ..Payload::default()
            },
        ];
        let broadcast = Broadcast::bundle("scope.AXIS", elements.clone());

        let encoded = broadcast.encode().unwrap();
        let frames = reframe(&encoded);
        let borrowed: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
        let decoded = Broadcast::decode_frames(&borrowed).unwrap();

        match decoded.body {
            BroadcastBody::Bundle { elements: decoded } => assert_eq!(decoded, elements),
            _ => panic!("expected a bundle"),
        }
    }

    #[test]
    fn generated_ids_are_distinct_hex() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), 8);
        assert!(a.as_bytes().iter().all(|b| b.is_ascii_hexdigit()));
    }
}
