// tm-protocol: thing-model wire frames and their serialization.
//
// Every frame travels as one transport message holding a JSON envelope
// `{"type": <tag>, "payload": <p>}`.  The fourteen frozen type tags map to
// the `Frame` variants below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

pub const SET_SUBSCRIBE_STATE: &str = "set-subscribe-state";
pub const ADD_SUBSCRIBE_STATE: &str = "add-subscribe-state";
pub const REMOVE_SUBSCRIBE_STATE: &str = "remove-subscribe-state";
pub const CLEAR_SUBSCRIBE_STATE: &str = "clear-subscribe-state";
pub const SET_SUBSCRIBE_EVENT: &str = "set-subscribe-event";
pub const ADD_SUBSCRIBE_EVENT: &str = "add-subscribe-event";
pub const REMOVE_SUBSCRIBE_EVENT: &str = "remove-subscribe-event";
pub const CLEAR_SUBSCRIBE_EVENT: &str = "clear-subscribe-event";
pub const STATE: &str = "state";
pub const EVENT: &str = "event";
pub const CALL: &str = "call";
pub const RESPONSE: &str = "response";
pub const QUERY_META: &str = "query-meta";
pub const META_INFO: &str = "meta-info";

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// An asynchronous state broadcast.
///
/// `name` is the fully-qualified state name (`<model>/<state>`); `data` is
/// the new value, any JSON shape the publisher's schema declares.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatePayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// An asynchronous event broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

/// A method invocation.  `uuid` correlates the eventual `response` frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

/// The callee's answer to a `call` frame.
///
/// A non-empty `error` means the call failed and `response` carries no
/// meaning; an empty `error` means `response` is the method result object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub response: Value,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// How a subscription-update frame mutates the peer's publish set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOp {
    /// Replace the set with the given names.
    Set,
    /// Union the given names into the set.
    Add,
    /// Subtract the given names from the set.
    Remove,
    /// Empty the set.
    Clear,
}

/// One decoded wire frame.
///
/// The eight subscription tags collapse to two variants carrying a [`SubOp`];
/// `kind()` recovers the exact tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SubscribeState { op: SubOp, names: Vec<String> },
    SubscribeEvent { op: SubOp, names: Vec<String> },
    State(StatePayload),
    Event(EventPayload),
    Call(CallPayload),
    Response(ResponsePayload),
    QueryMeta,
    /// Payload is the raw schema JSON object of the sender.
    MetaInfo(Value),
}

/// Errors from [`Frame::decode`].
///
/// Only `Envelope` is fatal to a connection; the other two mean the single
/// frame is dropped and the link stays up.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("decode json: {0}")]
    Envelope(String),
    #[error("payload for {kind:?}: {detail}")]
    Payload { kind: String, detail: String },
    #[error("unknown frame type {0:?}")]
    UnknownKind(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Frame {
    /// The wire type tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SubscribeState { op, .. } => match op {
                SubOp::Set => SET_SUBSCRIBE_STATE,
                SubOp::Add => ADD_SUBSCRIBE_STATE,
                SubOp::Remove => REMOVE_SUBSCRIBE_STATE,
                SubOp::Clear => CLEAR_SUBSCRIBE_STATE,
            },
            Frame::SubscribeEvent { op, .. } => match op {
                SubOp::Set => SET_SUBSCRIBE_EVENT,
                SubOp::Add => ADD_SUBSCRIBE_EVENT,
                SubOp::Remove => REMOVE_SUBSCRIBE_EVENT,
                SubOp::Clear => CLEAR_SUBSCRIBE_EVENT,
            },
            Frame::State(_) => STATE,
            Frame::Event(_) => EVENT,
            Frame::Call(_) => CALL,
            Frame::Response(_) => RESPONSE,
            Frame::QueryMeta => QUERY_META,
            Frame::MetaInfo(_) => META_INFO,
        }
    }

    /// Serialize to the envelope text carried in one transport message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = match self {
            Frame::SubscribeState { names, .. } | Frame::SubscribeEvent { names, .. } => {
                serde_json::to_value(names)?
            }
            Frame::State(p) => serde_json::to_value(p)?,
            Frame::Event(p) => serde_json::to_value(p)?,
            Frame::Call(p) => serde_json::to_value(p)?,
            Frame::Response(p) => serde_json::to_value(p)?,
            Frame::QueryMeta => Value::Object(serde_json::Map::new()),
            Frame::MetaInfo(v) => v.clone(),
        };
        serde_json::to_string(&Envelope {
            kind: self.kind().to_owned(),
            payload,
        })
    }

    /// Decode one transport message.
    ///
    /// Decoding is strict at the envelope level and lenient inside payloads:
    /// missing optional fields take their zero value, but any type mismatch
    /// fails the payload as a whole.  Subscription name lists are
    /// element-strict -- `["a", 123]` fails the entire list so the publish
    /// table is never partially mutated.
    pub fn decode(text: &str) -> Result<Frame, DecodeError> {
        let env: Envelope =
            serde_json::from_str(text).map_err(|e| DecodeError::Envelope(e.to_string()))?;
        let kind = env.kind;

        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: Value,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(value).map_err(|e| DecodeError::Payload {
                kind: kind.to_owned(),
                detail: e.to_string(),
            })
        }

        let frame = match kind.as_str() {
            SET_SUBSCRIBE_STATE => Frame::SubscribeState {
                op: SubOp::Set,
                names: payload(&kind, env.payload)?,
            },
            ADD_SUBSCRIBE_STATE => Frame::SubscribeState {
                op: SubOp::Add,
                names: payload(&kind, env.payload)?,
            },
            REMOVE_SUBSCRIBE_STATE => Frame::SubscribeState {
                op: SubOp::Remove,
                names: payload(&kind, env.payload)?,
            },
            CLEAR_SUBSCRIBE_STATE => Frame::SubscribeState {
                op: SubOp::Clear,
                names: Vec::new(),
            },
            SET_SUBSCRIBE_EVENT => Frame::SubscribeEvent {
                op: SubOp::Set,
                names: payload(&kind, env.payload)?,
            },
            ADD_SUBSCRIBE_EVENT => Frame::SubscribeEvent {
                op: SubOp::Add,
                names: payload(&kind, env.payload)?,
            },
            REMOVE_SUBSCRIBE_EVENT => Frame::SubscribeEvent {
                op: SubOp::Remove,
                names: payload(&kind, env.payload)?,
            },
            CLEAR_SUBSCRIBE_EVENT => Frame::SubscribeEvent {
                op: SubOp::Clear,
                names: Vec::new(),
            },
            STATE => Frame::State(payload(&kind, env.payload)?),
            EVENT => Frame::Event(payload(&kind, env.payload)?),
            CALL => Frame::Call(payload(&kind, env.payload)?),
            RESPONSE => Frame::Response(payload(&kind, env.payload)?),
            QUERY_META => Frame::QueryMeta,
            META_INFO => Frame::MetaInfo(env.payload),
            _ => return Err(DecodeError::UnknownKind(kind)),
        };
        Ok(frame)
    }
}

/// Split a fully-qualified name on its *last* `/` into
/// `(model-prefix, local-name)`.  Returns `None` when there is no separator.
pub fn split_full_name(full: &str) -> Option<(&str, &str)> {
    full.rsplit_once('/')
}
