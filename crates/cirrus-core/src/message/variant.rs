//! Concrete message variants.
//!
//! Each variant is a plain struct holding exactly the fields its type
//! requires on the wire, plus a [`Variant::valid`] check for the constraints
//! serde cannot express (non-empty strings, path shape, key material).
//! [`Body`] is the closed sum over all of them, tagged on `type`.

use super::{Message, MessageType};
use crate::error::MessageError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Keepalive timeout announced by a default [`Ping`], in seconds
pub const DEFAULT_PING_TIMEOUT: u32 = 60;

/// Common interface of the concrete message structs
pub trait Variant {
    /// Message type this variant encodes
    const TYPE: MessageType;

    /// Message type of this instance
    fn mtype(&self) -> MessageType {
        Self::TYPE
    }

    /// True when every field required by this type is present and well formed
    fn valid(&self) -> bool;
}

/// Access level a peer holds on a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// May read and modify
    ReadWrite,
    /// May read
    ReadOnly,
    /// Stores encrypted data without being able to read it
    Untrusted,
}

/// Byte range within a file, `[offset, length]` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct ByteRange {
    /// First byte
    pub offset: u64,
    /// Number of bytes
    pub length: u64,
}

impl ByteRange {
    /// Create a range
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Range covering a whole file of `size` bytes
    #[must_use]
    pub const fn whole(size: u64) -> Self {
        Self::new(0, size)
    }

    /// One past the last byte, `None` on overflow
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// Restrict the range to a file of `size` bytes
    #[must_use]
    pub fn clamp(self, size: u64) -> Self {
        let offset = self.offset.min(size);
        Self::new(offset, self.length.min(size - offset))
    }
}

impl From<(u64, u64)> for ByteRange {
    fn from((offset, length): (u64, u64)) -> Self {
        Self::new(offset, length)
    }
}

impl From<ByteRange> for (u64, u64) {
    fn from(range: ByteRange) -> Self {
        (range.offset, range.length)
    }
}

/// Relative, `/`-separated path without empty, `.` or `..` components
#[must_use]
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\0')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_present(s: &str) -> bool {
    !s.trim().is_empty()
}

fn signature_ok(signature: Option<&String>) -> bool {
    signature.is_none_or(|s| is_present(s))
}

/// One entry of a share's file listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the share root
    pub path: String,
    /// Time of the last change to this entry (unix seconds)
    pub utime: u64,
    /// Size in bytes
    pub size: u64,
    /// Modification time (unix seconds)
    pub mtime: i64,
    /// Permission bits
    pub mode: u32,
    /// Content hash, hex encoded; absent for deleted entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Tombstone marker
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl FileEntry {
    /// A live entry with default times and mode
    #[must_use]
    pub fn new(path: impl Into<String>, size: u64, sha256: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            utime: 0,
            size,
            mtime: 0,
            mode: 0o644,
            sha256: Some(sha256.into()),
            deleted: false,
        }
    }

    /// True when the entry names a valid path and, unless deleted, carries
    /// a well-formed hash
    #[must_use]
    pub fn valid(&self) -> bool {
        is_valid_path(&self.path)
            && match &self.sha256 {
                Some(hash) => is_sha256_hex(hash),
                None => self.deleted,
            }
    }
}

/// `ping`: keepalive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Seconds the sender waits for traffic before giving up on the peer
    pub timeout: u32,
}

impl Default for Ping {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl Variant for Ping {
    const TYPE: MessageType = MessageType::Ping;

    fn valid(&self) -> bool {
        self.timeout > 0
    }
}

/// `greeting`: software, protocol versions and features of the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// Software name and version
    pub software: String,
    /// Supported protocol versions
    pub protocol: Vec<u32>,
    /// Optional protocol features
    pub features: Vec<String>,
}

impl Variant for Greeting {
    const TYPE: MessageType = MessageType::Greeting;

    fn valid(&self) -> bool {
        is_present(&self.software)
            && !self.protocol.is_empty()
            && !self.protocol.contains(&0)
            && self.features.iter().all(|f| is_present(f))
    }
}

/// `start`: request to sync one share under the negotiated protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    /// Software name and version
    pub software: String,
    /// Protocol version selected by the sender
    pub protocol: u32,
    /// Features the sender will use
    pub features: Vec<String>,
    /// Share identifier
    pub id: String,
    /// Access level the sender claims
    pub access: Access,
    /// Sender's peer identifier
    pub peer: String,
}

impl Variant for Start {
    const TYPE: MessageType = MessageType::Start;

    fn valid(&self) -> bool {
        is_present(&self.software)
            && self.protocol > 0
            && is_present(&self.id)
            && is_present(&self.peer)
    }
}

/// `cannot_start`: refusal to start or continue the session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CannotStart {
    /// Human-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CannotStart {
    /// Refusal with a reason
    #[must_use]
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

impl Variant for CannotStart {
    const TYPE: MessageType = MessageType::CannotStart;

    fn valid(&self) -> bool {
        true
    }
}

/// `starttls`: upgrade the transport before authenticating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTls {
    /// Sender's peer identifier
    pub peer: String,
    /// Access level the sender claims
    pub access: Access,
}

impl Variant for StartTls {
    const TYPE: MessageType = MessageType::StartTls;

    fn valid(&self) -> bool {
        is_present(&self.peer)
    }
}

/// `identity`: human-facing name of the sending device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Device name
    pub name: String,
    /// Sender's clock (unix seconds)
    pub time: u64,
}

impl Variant for Identity {
    const TYPE: MessageType = MessageType::Identity;

    fn valid(&self) -> bool {
        is_present(&self.name)
    }
}

/// Key material for one access level
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Pre-shared key, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    /// Public/private key, PEM encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa: Option<String>,
}

impl KeyMaterial {
    /// Material holding only a pre-shared key
    #[must_use]
    pub fn psk(psk: impl Into<String>) -> Self {
        Self {
            psk: Some(psk.into()),
            rsa: None,
        }
    }

    /// At least one non-empty key
    #[must_use]
    pub fn valid(&self) -> bool {
        [&self.psk, &self.rsa]
            .into_iter()
            .flatten()
            .any(|key| is_present(key))
    }
}

/// `keys`: key material for the share, up to the sender's access level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    /// Access level the keys grant
    pub access: Access,
    /// Share identifier
    pub share_id: String,
    /// Keys for untrusted peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub untrusted: Option<KeyMaterial>,
    /// Keys for read-only peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<KeyMaterial>,
    /// Keys for read-write peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write: Option<KeyMaterial>,
}

impl Keys {
    /// Material for one access level, if sent
    #[must_use]
    pub fn material(&self, access: Access) -> Option<&KeyMaterial> {
        match access {
            Access::ReadWrite => self.read_write.as_ref(),
            Access::ReadOnly => self.read_only.as_ref(),
            Access::Untrusted => self.untrusted.as_ref(),
        }
    }
}

impl Variant for Keys {
    const TYPE: MessageType = MessageType::Keys;

    fn valid(&self) -> bool {
        let required: &[Access] = match self.access {
            Access::ReadWrite => &[Access::ReadWrite, Access::ReadOnly, Access::Untrusted],
            Access::ReadOnly => &[Access::ReadOnly, Access::Untrusted],
            Access::Untrusted => &[Access::Untrusted],
        };
        is_present(&self.share_id)
            && required.iter().all(|a| self.material(*a).is_some())
            && [&self.untrusted, &self.read_only, &self.read_write]
                .into_iter()
                .flatten()
                .all(KeyMaterial::valid)
    }
}

/// `keys_acknowledgment`: key material accepted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeysAcknowledgment {}

impl Variant for KeysAcknowledgment {
    const TYPE: MessageType = MessageType::KeysAcknowledgment;

    fn valid(&self) -> bool {
        true
    }
}

/// `manifest`: full file listing of a share at one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Peer the listing belongs to
    pub peer: String,
    /// Revision of the listing
    pub revision: u64,
    /// Entries, including tombstones
    pub files: Vec<FileEntry>,
    /// Signature over the listing (read-only shares)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Variant for Manifest {
    const TYPE: MessageType = MessageType::Manifest;

    fn valid(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.files.len());
        is_present(&self.peer)
            && signature_ok(self.signature.as_ref())
            && self
                .files
                .iter()
                .all(|f| f.valid() && seen.insert(f.path.as_str()))
    }
}

/// `get_manifest`: request for the listing, with the revision already held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetManifest {
    /// Revision the requester already has
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl Variant for GetManifest {
    const TYPE: MessageType = MessageType::GetManifest;

    fn valid(&self) -> bool {
        true
    }
}

/// `manifest_current`: requester's revision is up to date
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManifestCurrent {}

impl Variant for ManifestCurrent {
    const TYPE: MessageType = MessageType::ManifestCurrent;

    fn valid(&self) -> bool {
        true
    }
}

/// `get`: request for (part of) one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    /// Path relative to the share root
    pub path: String,
    /// Requested bytes; whole file when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
}

impl Variant for Get {
    const TYPE: MessageType = MessageType::Get;

    fn valid(&self) -> bool {
        is_valid_path(&self.path) && self.range.is_none_or(|r| r.end().is_some())
    }
}

/// `file_data`: header for the file bytes that follow as payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    /// Path relative to the share root
    pub path: String,
    /// Bytes carried by the payload
    pub range: ByteRange,
}

impl Variant for FileData {
    const TYPE: MessageType = MessageType::FileData;

    fn valid(&self) -> bool {
        is_valid_path(&self.path) && self.range.end().is_some()
    }
}

/// `update`: a file changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Sender's manifest revision after the change
    pub revision: u64,
    /// New state of the file
    pub file: FileEntry,
    /// Signature (read-only shares)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Variant for Update {
    const TYPE: MessageType = MessageType::Update;

    fn valid(&self) -> bool {
        self.file.valid() && signature_ok(self.signature.as_ref())
    }
}

/// `move`: a file was renamed or relocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Sender's manifest revision after the move
    pub revision: u64,
    /// Previous path
    pub source: String,
    /// New state of the file, at its new path
    pub destination: FileEntry,
    /// Signature (read-only shares)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Variant for Move {
    const TYPE: MessageType = MessageType::Move;

    fn valid(&self) -> bool {
        is_valid_path(&self.source)
            && self.destination.valid()
            && self.source != self.destination.path
            && signature_ok(self.signature.as_ref())
    }
}

/// Typed message body: one case per wire type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Content-free placeholder
    Empty,
    /// Keepalive
    Ping(Ping),
    /// Capability announcement
    Greeting(Greeting),
    /// Share start request
    Start(Start),
    /// Refusal
    CannotStart(CannotStart),
    /// Transport upgrade
    #[serde(rename = "starttls")]
    StartTls(StartTls),
    /// Identity announcement
    Identity(Identity),
    /// Key material
    Keys(Keys),
    /// Key material accepted
    KeysAcknowledgment(KeysAcknowledgment),
    /// File listing
    Manifest(Manifest),
    /// Listing request
    GetManifest(GetManifest),
    /// Listing unchanged
    ManifestCurrent(ManifestCurrent),
    /// File request
    Get(Get),
    /// File contents header
    FileData(FileData),
    /// Changed file notification
    Update(Update),
    /// Moved file notification
    Move(Move),
}

macro_rules! each_variant {
    ($body:expr, $v:ident => $then:expr, empty => $empty:expr) => {
        match $body {
            Body::Empty => $empty,
            Body::Ping($v) => $then,
            Body::Greeting($v) => $then,
            Body::Start($v) => $then,
            Body::CannotStart($v) => $then,
            Body::StartTls($v) => $then,
            Body::Identity($v) => $then,
            Body::Keys($v) => $then,
            Body::KeysAcknowledgment($v) => $then,
            Body::Manifest($v) => $then,
            Body::GetManifest($v) => $then,
            Body::ManifestCurrent($v) => $then,
            Body::Get($v) => $then,
            Body::FileData($v) => $then,
            Body::Update($v) => $then,
            Body::Move($v) => $then,
        }
    };
}

macro_rules! impl_from_variant {
    ($($name:ident),+ $(,)?) => {
        $(
            impl From<$name> for Body {
                fn from(v: $name) -> Self {
                    Self::$name(v)
                }
            }
        )+
    };
}

impl_from_variant!(
    Ping,
    Greeting,
    Start,
    CannotStart,
    StartTls,
    Identity,
    Keys,
    KeysAcknowledgment,
    Manifest,
    GetManifest,
    ManifestCurrent,
    Get,
    FileData,
    Update,
    Move,
);

impl Body {
    /// Message type of this body
    #[must_use]
    pub fn mtype(&self) -> MessageType {
        each_variant!(self, v => v.mtype(), empty => MessageType::Empty)
    }

    /// Variant-specific validity
    #[must_use]
    pub fn valid(&self) -> bool {
        each_variant!(self, v => v.valid(), empty => true)
    }

    /// Attached signature, for the signable types
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        match self {
            Self::Manifest(m) => m.signature.as_deref(),
            Self::Update(u) => u.signature.as_deref(),
            Self::Move(m) => m.signature.as_deref(),
            _ => None,
        }
    }

    /// Whether raw payload bytes follow this body on the wire
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.mtype().carries_payload()
    }

    /// Wrap into a generic [`Message`]
    pub fn to_message(&self) -> Result<Message, MessageError> {
        Message::from_body(self)
    }

    /// Encode to a wire unit
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(self.to_message()?.encode())
    }
}
