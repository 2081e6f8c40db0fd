//! Error types for the Cirrus core protocol.

use crate::message::MessageType;
use crate::session::SessionState;
use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire unit could not be turned into a typed message
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Message-level errors, raised while parsing or refining a single wire unit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Wire unit cannot be decoded as a structured document
    #[error("malformed encoding: {0}")]
    MalformedEncoding(Cow<'static, str>),

    /// Document decoded, but its `type` names no known message
    #[error("unknown message type: \"{0}\"")]
    UnknownMessageType(String),

    /// Known type, but required fields are missing or ill-typed
    #[error("invalid {mtype} message: {reason}")]
    InvalidMessageShape {
        /// Declared type of the offending message
        mtype: MessageType,
        /// What was wrong with it
        reason: Cow<'static, str>,
    },
}

impl MessageError {
    pub(crate) fn shape(mtype: MessageType, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidMessageShape {
            mtype,
            reason: reason.into(),
        }
    }
}

/// Session-level errors
///
/// Errors returned while handling inbound messages are fatal: the session
/// has already been driven to `Closed` by the time the caller sees them.
/// Local operations such as `request_file` refuse without closing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Message type is not legal in the current state
    #[error("protocol violation: {mtype} not allowed in state {state:?}")]
    ProtocolViolation {
        /// State the session was in
        state: SessionState,
        /// Type of the rejected message
        mtype: MessageType,
    },

    /// Inbound wire unit failed to parse or refine
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    /// No common protocol version during the greeting
    #[error("no common protocol version (ours {ours:?}, theirs {theirs:?})")]
    VersionMismatch {
        /// Versions we support
        ours: Vec<u32>,
        /// Versions the peer announced
        theirs: Vec<u32>,
    },

    /// Peer asked to start a share we do not know
    #[error("unknown share: {0}")]
    UnknownShare(String),

    /// Key material rejected by the share
    #[error("key material rejected for share {0}")]
    KeysRejected(String),

    /// Peer requested a file that is not live in the share
    #[error("unknown file: {0}")]
    UnknownFile(String),

    /// File data arrived that does not answer our outstanding request
    #[error("unsolicited file data for {0}")]
    UnsolicitedFileData(String),

    /// A file request is already outstanding on this connection
    #[error("file request already in flight for {0}")]
    RequestInFlight(String),

    /// Local operation attempted in a state that does not allow it
    #[error("invalid state for operation: {0:?}")]
    InvalidState(SessionState),

    /// Transport collaborator failed
    #[error("transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Session is closed
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Returns true for refusals of a local request that leave the session usable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RequestInFlight(_) | Self::InvalidState(_))
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A live connection already uses this identifier
    #[error("connection already exists: {0}")]
    ConnectionExists(String),

    /// No live connection with this identifier
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// Path is already attached as a share
    #[error("share already attached at {}", .0.display())]
    DuplicateShare(PathBuf),

    /// A share with this identifier is already attached
    #[error("share already attached: {0}")]
    ShareExists(String),

    /// No share with this identifier
    #[error("share not found: {0}")]
    ShareNotFound(String),

    /// Session of the addressed connection failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the configuration file failed
    #[error("config I/O error on {}: {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for the configuration schema
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values parsed but are not usable
    #[error("invalid configuration: {0}")]
    Invalid(Cow<'static, str>),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
