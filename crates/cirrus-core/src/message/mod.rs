//! Message model and wire codec.
//!
//! A wire unit is one JSON object, optionally preceded by framing markers:
//!
//! ```text
//! [$][!]{"type": "<name>", ...}
//!  |  |
//!  |  +-- raw payload bytes follow the header (file_data only)
//!  +----- message is signed, body carries a "signature"
//! ```
//!
//! [`Message`] is the generic, untyped envelope produced by
//! [`Message::parse`]. [`Message::refine`] turns it into the typed [`Body`]
//! for its declared type, or fails with
//! [`MessageError::InvalidMessageShape`].

mod variant;

pub use variant::{
    Access, Body, ByteRange, CannotStart, DEFAULT_PING_TIMEOUT, FileData, FileEntry, Get,
    GetManifest, Greeting, Identity, KeyMaterial, Keys, KeysAcknowledgment, Manifest,
    ManifestCurrent, Move, Ping, Start, StartTls, Update, Variant, is_valid_path,
};

use crate::error::MessageError;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Marker byte announcing a signed message
pub const SIGNED_MARKER: u8 = b'$';

/// Marker byte announcing a trailing raw payload
pub const PAYLOAD_MARKER: u8 = b'!';

/// Message types, in the protocol's canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    /// Not a valid message type; result of looking up an unrecognized name
    Unknown = 0x00,
    /// Placeholder message without payload
    Empty = 0x01,
    /// Keepalive
    Ping = 0x02,
    /// Software / protocol / feature announcement
    Greeting = 0x03,
    /// Request to start syncing a share
    Start = 0x04,
    /// Refusal to start (or continue) a session
    CannotStart = 0x05,
    /// Transport upgrade request
    StartTls = 0x06,
    /// Peer identity announcement
    Identity = 0x07,
    /// Key content
    Keys = 0x08,
    /// Response to keys
    KeysAcknowledgment = 0x09,
    /// File listing
    Manifest = 0x0A,
    /// Request for manifest
    GetManifest = 0x0B,
    /// Response to `get_manifest` when the revision matches
    ManifestCurrent = 0x0C,
    /// Request to retrieve contents of a file
    Get = 0x0D,
    /// Response with contents of a file
    FileData = 0x0E,
    /// Notification of a changed file
    Update = 0x0F,
    /// Notification of a moved file
    Move = 0x10,
}

impl MessageType {
    /// Every type with a wire representation (all but [`MessageType::Unknown`])
    pub const ALL: [Self; 16] = [
        Self::Empty,
        Self::Ping,
        Self::Greeting,
        Self::Start,
        Self::CannotStart,
        Self::StartTls,
        Self::Identity,
        Self::Keys,
        Self::KeysAcknowledgment,
        Self::Manifest,
        Self::GetManifest,
        Self::ManifestCurrent,
        Self::Get,
        Self::FileData,
        Self::Update,
        Self::Move,
    ];

    /// Wire name of this type, `None` for [`MessageType::Unknown`]
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::Unknown => return None,
            Self::Empty => "empty",
            Self::Ping => "ping",
            Self::Greeting => "greeting",
            Self::Start => "start",
            Self::CannotStart => "cannot_start",
            Self::StartTls => "starttls",
            Self::Identity => "identity",
            Self::Keys => "keys",
            Self::KeysAcknowledgment => "keys_acknowledgment",
            Self::Manifest => "manifest",
            Self::GetManifest => "get_manifest",
            Self::ManifestCurrent => "manifest_current",
            Self::Get => "get",
            Self::FileData => "file_data",
            Self::Update => "update",
            Self::Move => "move",
        })
    }

    /// Look up a type by wire name. Unrecognized names map to
    /// [`MessageType::Unknown`]; this never fails.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == Some(name))
            .unwrap_or(Self::Unknown)
    }

    /// Whether messages of this type carry a raw payload after the header
    #[must_use]
    pub const fn carries_payload(self) -> bool {
        matches!(self, Self::FileData)
    }

    /// Whether messages of this type may be signed
    #[must_use]
    pub const fn signable(self) -> bool {
        matches!(self, Self::Manifest | Self::Update | Self::Move)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or("unknown"))
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::from_name(s) {
            Self::Unknown => Err(MessageError::UnknownMessageType(s.to_string())),
            t => Ok(t),
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or_else(|| MessageError::UnknownMessageType(format!("0x{value:02X}")))
    }
}

/// Generic protocol message: a type tag, framing flags and the raw body.
///
/// The body always is a JSON object holding at least the `type` field.
/// `has_payload` and `is_signed` mirror the framing markers seen on (or
/// computed for) the wire; they cannot be set independently.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    mtype: MessageType,
    has_payload: bool,
    is_signed: bool,
    body: Value,
}

impl Message {
    /// Base constructor: a message carrying only its type.
    ///
    /// Such a message is [`valid`](Self::valid) only for
    /// [`MessageType::Empty`]; every other type needs its variant fields.
    pub fn new(mtype: MessageType) -> Result<Self, MessageError> {
        let name = mtype
            .name()
            .ok_or_else(|| MessageError::UnknownMessageType(mtype.to_string()))?;
        let mut body = Map::new();
        body.insert("type".to_string(), Value::from(name));
        Ok(Self {
            mtype,
            has_payload: false,
            is_signed: false,
            body: Value::Object(body),
        })
    }

    /// Parse one wire unit
    ///
    /// # Errors
    ///
    /// - [`MessageError::MalformedEncoding`] if the unit is not UTF-8 JSON
    ///   holding an object with a string `type`, or repeats a marker
    /// - [`MessageError::UnknownMessageType`] if `type` names no known message
    pub fn parse(wire: impl AsRef<[u8]>) -> Result<Self, MessageError> {
        let (has_payload, is_signed, json) = split_markers(wire.as_ref())?;

        let body: Value = serde_json::from_slice(json)
            .map_err(|e| MessageError::MalformedEncoding(format!("json parse error: {e}").into()))?;

        let type_name = match body.get("type") {
            Some(Value::String(name)) => name,
            Some(_) => {
                return Err(MessageError::MalformedEncoding(
                    "\"type\" is not a string".into(),
                ));
            }
            None if body.is_object() => {
                return Err(MessageError::MalformedEncoding("missing \"type\"".into()));
            }
            None => {
                return Err(MessageError::MalformedEncoding(
                    "message is not an object".into(),
                ));
            }
        };

        let mtype = MessageType::from_name(type_name);
        if mtype == MessageType::Unknown {
            return Err(MessageError::UnknownMessageType(type_name.clone()));
        }

        Ok(Self {
            mtype,
            has_payload,
            is_signed,
            body,
        })
    }

    /// Build the envelope for a typed body.
    ///
    /// Framing flags are computed from the body: the payload flag from the
    /// type, the signed flag from the presence of a signature.
    pub fn from_body(body: &Body) -> Result<Self, MessageError> {
        let value = serde_json::to_value(body).map_err(|e| {
            MessageError::MalformedEncoding(format!("cannot encode {}: {e}", body.mtype()).into())
        })?;
        Ok(Self {
            mtype: body.mtype(),
            has_payload: body.has_payload(),
            is_signed: body.signature().is_some(),
            body: value,
        })
    }

    /// Encode to a wire unit (no trailing newline)
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let json = self.body.to_string();
        let mut out = Vec::with_capacity(json.len() + 2);
        if self.is_signed {
            out.push(SIGNED_MARKER);
        }
        if self.has_payload {
            out.push(PAYLOAD_MARKER);
        }
        out.extend_from_slice(json.as_bytes());
        out
    }

    /// Message type
    #[must_use]
    pub fn mtype(&self) -> MessageType {
        self.mtype
    }

    /// Whether raw payload bytes follow this message on the wire
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.has_payload
    }

    /// Whether this message was (or will be) sent signed
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.is_signed
    }

    /// Raw structured body, including the `type` field
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Structural validity of the untyped envelope.
    ///
    /// Only the content-free `empty` message is valid without refinement.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.mtype == MessageType::Empty
    }

    /// Re-validate the body against the contract of its declared type.
    ///
    /// # Errors
    ///
    /// [`MessageError::InvalidMessageShape`] if required fields are missing
    /// or ill-typed, the variant's validity check fails, or the framing
    /// markers do not fit the type.
    pub fn refine(&self) -> Result<Body, MessageError> {
        if self.has_payload != self.mtype.carries_payload() {
            let reason = if self.has_payload {
                "unexpected payload marker"
            } else {
                "missing payload marker"
            };
            return Err(MessageError::shape(self.mtype, reason));
        }

        let body: Body = serde_json::from_value(self.body.clone())
            .map_err(|e| MessageError::shape(self.mtype, e.to_string()))?;

        if self.is_signed != body.signature().is_some() {
            let reason = if self.is_signed {
                "signed marker without signature"
            } else {
                "signature without signed marker"
            };
            return Err(MessageError::shape(self.mtype, reason));
        }

        if !body.valid() {
            return Err(MessageError::shape(
                self.mtype,
                "field values fail validation",
            ));
        }

        Ok(body)
    }
}

/// Strip leading framing markers, returning `(payload, signed, json)`
fn split_markers(wire: &[u8]) -> Result<(bool, bool, &[u8]), MessageError> {
    let mut has_payload = false;
    let mut is_signed = false;
    let mut rest = wire;

    while let Some((&first, tail)) = rest.split_first() {
        let flag = match first {
            PAYLOAD_MARKER => &mut has_payload,
            SIGNED_MARKER => &mut is_signed,
            _ => break,
        };
        if *flag {
            return Err(MessageError::MalformedEncoding(
                format!("repeated marker '{}'", char::from(first)).into(),
            ));
        }
        *flag = true;
        rest = tail;
    }

    Ok((has_payload, is_signed, rest))
}
