//! Session state machine.
//!
//! A [`Session`] drives one peer connection from the first greeting to
//! close. It consumes decoded messages strictly in arrival order, rejects
//! anything that is not legal in the current state, and queues the replies
//! the transport should send.
//!
//! ```text
//!  Init ──greeting──> GreetingExchanged ──starttls──> TlsUpgraded
//!                        │  (start)                      │
//!                        │  identity, keys (plaintext)   │ identity, keys
//!                        └──────────────┬────────────────┘
//!                                       v
//!                                 Authenticated ──get_manifest──> ManifestSynced
//!                                                                      │ get / file_data
//!                                                                      v
//!                                                                 Transferring
//!
//!  any state ──violation──> Error ──> Closed
//! ```
//!
//! `ping` is legal in every state before `Closed` and never changes it.
//!
//! Both ends walk the same states. The [`Role::Acceptor`] answers: it
//! replies to the greeting, checks `start` and key material and serves the
//! manifest. The [`Role::Initiator`] opens with [`Session::connect`] and
//! drives the handshake through [`Session::start`],
//! [`Session::authenticate`] and [`Session::request_manifest`], moving on
//! as the matching replies arrive. Once synced the two sides are symmetric.

use crate::FEATURE_PLAINTEXT;
use crate::config::ProtocolConfig;
use crate::error::{MessageError, SessionError};
use crate::message::{
    Access, Body, ByteRange, CannotStart, FileData, FileEntry, Get, GetManifest, Greeting,
    Identity, Keys, KeysAcknowledgment, Manifest, ManifestCurrent, Message, MessageType, Ping,
    Start, StartTls, Variant,
};
use crate::share::{Share, ShareSnapshot, ShareStore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Which end of the connection a session speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// The peer connected to us and drives the handshake
    #[default]
    Acceptor,
    /// We connected and drive the handshake
    Initiator,
}

/// Session state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the peer's greeting
    Init,
    /// Protocol and features negotiated
    GreetingExchanged,
    /// Transport upgraded, waiting for identity and keys
    TlsUpgraded,
    /// Key material accepted
    Authenticated,
    /// Manifest (or manifest-current) sent
    ManifestSynced,
    /// At least one file transfer happened
    Transferring,
    /// Fatal failure, about to close
    Error,
    /// Terminal state
    Closed,
}

impl SessionState {
    /// True once the session can no longer process messages
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// True while files and change notifications may be exchanged
    #[must_use]
    pub fn is_syncing(self) -> bool {
        matches!(self, Self::ManifestSynced | Self::Transferring)
    }
}

/// Outcome of the greeting exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Protocol version in use
    pub protocol: u32,
    /// Features both peers offered
    pub features: Vec<String>,
}

impl Negotiated {
    /// Whether a feature was agreed on
    #[must_use]
    pub fn has(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Highest protocol version both sides support
#[must_use]
pub fn negotiate_protocol(ours: &[u32], theirs: &[u32]) -> Option<u32> {
    ours.iter().copied().filter(|v| theirs.contains(v)).max()
}

/// Our features that the peer also offers, in our order
#[must_use]
pub fn negotiate_features(ours: &[String], theirs: &[String]) -> Vec<String> {
    let mut agreed: Vec<String> = Vec::with_capacity(ours.len());
    for feature in ours {
        if theirs.contains(feature) && !agreed.contains(feature) {
            agreed.push(feature.clone());
        }
    }
    agreed
}

/// What the peer told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Software announced in the greeting
    pub software: Option<String>,
    /// Peer identifier from `start`
    pub peer_id: Option<String>,
    /// Device name from `identity`
    pub name: Option<String>,
    /// Access level claimed, then granted by `keys`
    pub access: Option<Access>,
    /// Keepalive timeout from the peer's last `ping`
    pub timeout: Option<Duration>,
}

/// A single protocol session with a remote peer
#[derive(Debug)]
pub struct Session {
    /// Current session state
    state: SessionState,
    /// Side of the handshake we drive
    role: Role,
    /// Local identity and capabilities
    config: Arc<ProtocolConfig>,
    /// Shares known when the connection was accepted
    shares: ShareSnapshot,
    /// Version and features agreed in the greeting
    negotiated: Option<Negotiated>,
    /// Peer details collected during the handshake
    peer: PeerInfo,
    /// Share selected by `start`
    share: Option<Share>,
    /// Our outstanding file request
    pending_get: Option<Get>,
    /// Identity and keys sent, acknowledgment pending
    credentials_sent: bool,
    /// `get_manifest` sent, reply pending
    manifest_requested: bool,
    /// Manifest the peer answered with; `None` after `manifest_current`
    remote_manifest: Option<Manifest>,
    /// Replies waiting for the transport
    outbound: VecDeque<Body>,
    /// Messages handled (including rejected ones)
    messages_received: u64,
    /// Messages handed to the transport
    messages_sent: u64,
    /// Last inbound message
    last_activity: Instant,
    /// First fatal error, if any
    close_reason: Option<SessionError>,
}

impl Session {
    /// Create an accepting session over an immutable snapshot of the share
    /// set
    #[must_use]
    pub fn new(config: Arc<ProtocolConfig>, shares: ShareSnapshot) -> Self {
        Self::with_role(Role::Acceptor, config, shares)
    }

    /// Create an initiating session with our greeting already queued
    #[must_use]
    pub fn connect(config: Arc<ProtocolConfig>, shares: ShareSnapshot) -> Self {
        let mut session = Self::with_role(Role::Initiator, config, shares);
        session.queue(Greeting {
            software: session.config.software.clone(),
            protocol: session.config.protocols.clone(),
            features: session.config.features.clone(),
        });
        session
    }

    fn with_role(role: Role, config: Arc<ProtocolConfig>, shares: ShareSnapshot) -> Self {
        Self {
            state: SessionState::Init,
            role,
            config,
            shares,
            negotiated: None,
            peer: PeerInfo::default(),
            share: None,
            pending_get: None,
            credentials_sent: false,
            manifest_requested: false,
            remote_manifest: None,
            outbound: VecDeque::new(),
            messages_received: 0,
            messages_sent: 0,
            last_activity: Instant::now(),
            close_reason: None,
        }
    }

    /// Get current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Side of the handshake this session drives
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Local configuration
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Shares visible to this session
    #[must_use]
    pub fn shares(&self) -> &ShareSnapshot {
        &self.shares
    }

    /// Negotiated protocol version and features
    #[must_use]
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// What the peer told us so far
    #[must_use]
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Share being synchronized
    #[must_use]
    pub fn share(&self) -> Option<&Share> {
        self.share.as_ref()
    }

    /// Our outstanding file request
    #[must_use]
    pub fn pending_request(&self) -> Option<&Get> {
        self.pending_get.as_ref()
    }

    /// Manifest received from the peer, unless it said ours is current
    #[must_use]
    pub fn remote_manifest(&self) -> Option<&Manifest> {
        self.remote_manifest.as_ref()
    }

    /// Entries of the peer's manifest that differ from our listing
    #[must_use]
    pub fn manifest_changes(&self) -> Vec<FileEntry> {
        let (Some(manifest), Ok(store)) = (&self.remote_manifest, self.store()) else {
            return Vec::new();
        };
        manifest
            .files
            .iter()
            .filter(|file| store.entry(&file.path).as_ref() != Some(*file))
            .cloned()
            .collect()
    }

    /// First fatal error, once the session failed
    #[must_use]
    pub fn close_reason(&self) -> Option<&SessionError> {
        self.close_reason.as_ref()
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState as S;
        match (self.state, to) {
            // Nothing leaves Closed
            (S::Closed, _) => false,
            (_, S::Closed) => true,

            // Error only leads to Closed
            (S::Error, _) => false,
            (_, S::Error) => true,

            // Handshake
            (S::Init, S::GreetingExchanged) => true,
            (S::GreetingExchanged, S::TlsUpgraded | S::Authenticated) => true,
            (S::TlsUpgraded, S::Authenticated) => true,

            // Sync
            (S::Authenticated, S::ManifestSynced) => true,
            (S::ManifestSynced, S::Transferring) => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` if the transition is not allowed
    /// from the current state.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<(), SessionError> {
        if !self.can_transition(new_state) {
            return Err(SessionError::InvalidState(self.state));
        }

        let old_state = self.state;
        self.state = new_state;

        if new_state == SessionState::Closed {
            // Release the share handle and request bookkeeping
            self.share = None;
            self.pending_get = None;
            self.manifest_requested = false;
        }

        tracing::debug!(
            "Session state transition: {:?} -> {:?}",
            old_state,
            new_state
        );

        Ok(())
    }

    /// Handle one wire unit
    ///
    /// Codec failures are fatal exactly like protocol violations.
    pub fn handle_wire(&mut self, wire: &[u8]) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Closed);
        }
        match Message::parse(wire) {
            Ok(message) => self.handle_message(&message),
            Err(err) => {
                self.messages_received += 1;
                Err(self.fail(err.into()))
            }
        }
    }

    /// Handle one parsed message
    pub fn handle_message(&mut self, message: &Message) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Closed);
        }
        match message.refine() {
            Ok(body) => self.handle(body),
            Err(err) => {
                self.messages_received += 1;
                Err(self.fail(err.into()))
            }
        }
    }

    /// Handle one typed message.
    ///
    /// Replies are queued; fetch them with [`Session::drain_outbound`]. On
    /// error the session is already `Closed`, possibly with a final
    /// `cannot_start` still queued.
    ///
    /// # Errors
    ///
    /// - `SessionError::Closed` if the session was closed before
    /// - any other variant when the message was rejected
    pub fn handle(&mut self, body: Body) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Closed);
        }
        self.messages_received += 1;
        self.last_activity = Instant::now();

        let mtype = body.mtype();
        if !body.valid() {
            let err = MessageError::shape(mtype, "field values fail validation");
            return Err(self.fail(err.into()));
        }

        tracing::trace!(state = ?self.state, %mtype, "handling message");

        match self.dispatch(body) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn dispatch(&mut self, body: Body) -> Result<(), SessionError> {
        use SessionState as S;
        let state = self.state;
        let accepting = self.role == Role::Acceptor;

        match body {
            Body::Ping(ping) => {
                self.on_ping(ping);
                Ok(())
            }
            Body::Greeting(greeting) if state == S::Init => self.on_greeting(greeting),
            Body::CannotStart(refusal) if self.may_be_refused() => {
                tracing::info!(
                    reason = refusal.reason.as_deref().unwrap_or("none given"),
                    "Peer declined to start"
                );
                self.close();
                Ok(())
            }

            // Acceptor side of the handshake
            Body::Start(start)
                if accepting && state == S::GreetingExchanged && self.share.is_none() =>
            {
                self.on_start(start)
            }
            Body::StartTls(tls)
                if accepting && state == S::GreetingExchanged && self.share.is_some() =>
            {
                self.on_starttls(tls)
            }
            Body::Identity(identity)
                if accepting && self.awaiting_credentials() && self.peer.name.is_none() =>
            {
                self.on_identity(identity);
                Ok(())
            }
            Body::Keys(keys)
                if accepting && self.awaiting_credentials() && self.peer.name.is_some() =>
            {
                self.on_keys(keys)
            }
            Body::GetManifest(request) if accepting && state == S::Authenticated => {
                self.on_get_manifest(request)
            }

            // Initiator side of the handshake
            Body::KeysAcknowledgment(_)
                if !accepting && self.credentials_sent && self.awaiting_credentials() =>
            {
                tracing::debug!("Keys acknowledged");
                self.transition_to(S::Authenticated)
            }
            Body::Manifest(manifest)
                if !accepting && state == S::Authenticated && self.manifest_requested =>
            {
                self.on_manifest(Some(manifest))
            }
            Body::ManifestCurrent(_)
                if !accepting && state == S::Authenticated && self.manifest_requested =>
            {
                self.on_manifest(None)
            }

            Body::Get(get) if state.is_syncing() => self.on_get(get),
            Body::FileData(data) if state.is_syncing() => self.on_file_data(data),
            Body::Update(update) if state.is_syncing() => {
                self.store()?.apply_update(&update);
                Ok(())
            }
            Body::Move(mv) if state.is_syncing() => {
                self.store()?.apply_move(&mv);
                Ok(())
            }
            other => Err(SessionError::ProtocolViolation {
                state,
                mtype: other.mtype(),
            }),
        }
    }

    /// A peer may decline after the greeting, and an initiator may still be
    /// refused after sending `start` and `starttls`
    fn may_be_refused(&self) -> bool {
        match self.role {
            Role::Acceptor => self.state == SessionState::GreetingExchanged,
            Role::Initiator => matches!(
                self.state,
                SessionState::GreetingExchanged | SessionState::TlsUpgraded
            ),
        }
    }

    /// Identity and keys are legal after `start`, once the transport is
    /// upgraded or both peers opted out of the upgrade
    fn awaiting_credentials(&self) -> bool {
        self.share.is_some()
            && match self.state {
                SessionState::TlsUpgraded => true,
                SessionState::GreetingExchanged => self
                    .negotiated
                    .as_ref()
                    .is_some_and(|n| n.has(FEATURE_PLAINTEXT)),
                _ => false,
            }
    }

    fn on_ping(&mut self, ping: Ping) {
        self.peer.timeout = Some(Duration::from_secs(u64::from(ping.timeout)));
    }

    fn on_greeting(&mut self, greeting: Greeting) -> Result<(), SessionError> {
        self.peer.software = Some(greeting.software);

        let Some(protocol) = negotiate_protocol(&self.config.protocols, &greeting.protocol) else {
            self.queue(CannotStart::because("no common protocol version"));
            return Err(SessionError::VersionMismatch {
                ours: self.config.protocols.clone(),
                theirs: greeting.protocol,
            });
        };
        let features = negotiate_features(&self.config.features, &greeting.features);

        tracing::info!(protocol, ?features, role = ?self.role, "Negotiated protocol");

        if self.role == Role::Acceptor {
            self.queue(Greeting {
                software: self.config.software.clone(),
                protocol: vec![protocol],
                features: features.clone(),
            });
        }
        self.negotiated = Some(Negotiated { protocol, features });
        self.transition_to(SessionState::GreetingExchanged)
    }

    fn on_start(&mut self, start: Start) -> Result<(), SessionError> {
        let negotiated = self.negotiated.as_ref().map(|n| n.protocol);
        if negotiated != Some(start.protocol) {
            self.queue(CannotStart::because("protocol version was not negotiated"));
            return Err(SessionError::VersionMismatch {
                ours: negotiated.into_iter().collect(),
                theirs: vec![start.protocol],
            });
        }

        let Some(share) = self.shares.get(&start.id).cloned() else {
            self.queue(CannotStart::because("unknown share"));
            return Err(SessionError::UnknownShare(start.id));
        };

        tracing::info!(
            share = share.id(),
            peer = %start.peer,
            access = ?start.access,
            "Peer started share"
        );
        self.share = Some(share);
        self.peer.peer_id = Some(start.peer);
        self.peer.access = Some(start.access);
        Ok(())
    }

    fn on_starttls(&mut self, tls: StartTls) -> Result<(), SessionError> {
        if self.peer.peer_id.as_deref() != Some(tls.peer.as_str()) {
            return Err(SessionError::ProtocolViolation {
                state: self.state,
                mtype: MessageType::StartTls,
            });
        }
        self.peer.access = Some(tls.access);
        self.transition_to(SessionState::TlsUpgraded)
    }

    fn on_identity(&mut self, identity: Identity) {
        tracing::debug!(name = %identity.name, "Peer identified");
        self.peer.name = Some(identity.name);
    }

    fn on_keys(&mut self, keys: Keys) -> Result<(), SessionError> {
        let share = self.share.as_ref().ok_or(SessionError::InvalidState(self.state))?;
        if keys.share_id != share.id() || !share.store().accepts_keys(&keys) {
            return Err(SessionError::KeysRejected(keys.share_id));
        }
        self.peer.access = Some(keys.access);
        self.queue(KeysAcknowledgment {});
        self.transition_to(SessionState::Authenticated)
    }

    fn on_get_manifest(&mut self, request: GetManifest) -> Result<(), SessionError> {
        let store = self.store()?;
        let revision = store.revision();
        if request.revision == Some(revision) {
            self.queue(ManifestCurrent {});
        } else {
            self.queue(Manifest {
                peer: self.config.peer_id.clone(),
                revision,
                files: store.manifest(),
                signature: None,
            });
        }
        self.transition_to(SessionState::ManifestSynced)
    }

    fn on_manifest(&mut self, manifest: Option<Manifest>) -> Result<(), SessionError> {
        self.manifest_requested = false;
        match &manifest {
            Some(m) => tracing::info!(
                peer = %m.peer,
                revision = m.revision,
                files = m.files.len(),
                "Received manifest"
            ),
            None => tracing::debug!("Our manifest is current"),
        }
        self.remote_manifest = manifest;
        self.transition_to(SessionState::ManifestSynced)
    }

    fn on_get(&mut self, get: Get) -> Result<(), SessionError> {
        let entry = match self.store()?.entry(&get.path) {
            Some(entry) if !entry.deleted => entry,
            _ => return Err(SessionError::UnknownFile(get.path)),
        };
        let range = get
            .range
            .map_or(ByteRange::whole(entry.size), |r| r.clamp(entry.size));
        self.queue(FileData {
            path: get.path,
            range,
        });
        self.enter_transferring()
    }

    fn on_file_data(&mut self, data: FileData) -> Result<(), SessionError> {
        match &self.pending_get {
            Some(get) if get.path == data.path => {
                self.pending_get = None;
                self.store()?.receive_file(&data);
                self.enter_transferring()
            }
            _ => Err(SessionError::UnsolicitedFileData(data.path)),
        }
    }

    fn enter_transferring(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::ManifestSynced {
            self.transition_to(SessionState::Transferring)?;
        }
        Ok(())
    }

    fn store(&self) -> Result<Arc<dyn ShareStore>, SessionError> {
        self.share
            .as_ref()
            .map(|share| Arc::clone(share.store()))
            .ok_or(SessionError::InvalidState(self.state))
    }

    fn queue(&mut self, body: impl Into<Body>) {
        self.outbound.push_back(body.into());
    }

    fn local(&self, role: Role) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Closed);
        }
        if self.role != role {
            return Err(SessionError::InvalidState(self.state));
        }
        Ok(())
    }

    /// Ask the peer to synchronize one of our shares.
    ///
    /// Queues `start`, followed by `starttls` unless both sides negotiated
    /// plaintext, in which case the session stays in `GreetingExchanged`.
    pub fn start(&mut self, share_id: &str, access: Access) -> Result<(), SessionError> {
        self.local(Role::Initiator)?;
        let negotiated = match &self.negotiated {
            Some(n) if self.state == SessionState::GreetingExchanged && self.share.is_none() => {
                n.clone()
            }
            _ => return Err(SessionError::InvalidState(self.state)),
        };
        let share = self
            .shares
            .get(share_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownShare(share_id.to_string()))?;

        let start = Start {
            software: self.config.software.clone(),
            protocol: negotiated.protocol,
            features: negotiated.features.clone(),
            id: share_id.to_string(),
            access,
            peer: self.config.peer_id.clone(),
        };
        if !start.valid() {
            return Err(MessageError::shape(MessageType::Start, "incomplete local identity").into());
        }

        tracing::info!(share = share_id, ?access, "Starting share");
        self.queue(start);
        self.share = Some(share);
        if negotiated.has(FEATURE_PLAINTEXT) {
            return Ok(());
        }
        self.queue(StartTls {
            peer: self.config.peer_id.clone(),
            access,
        });
        self.transition_to(SessionState::TlsUpgraded)
    }

    /// Send our device name and key material for the started share
    pub fn authenticate(
        &mut self,
        name: impl Into<String>,
        keys: Keys,
    ) -> Result<(), SessionError> {
        self.local(Role::Initiator)?;
        if !self.awaiting_credentials() || self.credentials_sent {
            return Err(SessionError::InvalidState(self.state));
        }
        if self.share.as_ref().map(Share::id) != Some(keys.share_id.as_str()) {
            return Err(SessionError::UnknownShare(keys.share_id));
        }

        let identity = Identity {
            name: name.into(),
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        };
        if !identity.valid() {
            return Err(MessageError::shape(MessageType::Identity, "empty device name").into());
        }
        if !keys.valid() {
            return Err(MessageError::shape(MessageType::Keys, "missing key material").into());
        }

        self.queue(identity);
        self.queue(keys);
        self.credentials_sent = true;
        Ok(())
    }

    /// Ask the peer for its manifest, announcing the revision we hold
    pub fn request_manifest(&mut self) -> Result<(), SessionError> {
        self.local(Role::Initiator)?;
        if self.state != SessionState::Authenticated || self.manifest_requested {
            return Err(SessionError::InvalidState(self.state));
        }
        let revision = self.store()?.revision();
        self.queue(GetManifest {
            revision: Some(revision),
        });
        self.manifest_requested = true;
        Ok(())
    }

    /// Ask the peer for (part of) a file.
    ///
    /// Only one request may be outstanding; the matching `file_data`
    /// clears it. Local operations never close the session.
    pub fn request_file(
        &mut self,
        path: impl Into<String>,
        range: Option<ByteRange>,
    ) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Closed);
        }
        if !self.state.is_syncing() {
            return Err(SessionError::InvalidState(self.state));
        }
        if let Some(pending) = &self.pending_get {
            return Err(SessionError::RequestInFlight(pending.path.clone()));
        }
        let get = Get {
            path: path.into(),
            range,
        };
        if !get.valid() {
            return Err(MessageError::shape(MessageType::Get, "invalid path or range").into());
        }
        self.queue(get.clone());
        self.pending_get = Some(get);
        self.enter_transferring()
    }

    /// Queue a keepalive announcing our timeout
    pub fn keepalive(&mut self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Closed);
        }
        self.queue(Ping {
            timeout: self.config.ping_timeout,
        });
        Ok(())
    }

    /// Close the session. Idempotent.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.transition_to(SessionState::Closed).is_ok() {
            tracing::info!("Session closed");
        }
    }

    /// Fail the session from outside (transport error, timeout)
    pub fn abort(&mut self, err: SessionError) -> SessionError {
        self.fail(err)
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        if !self.state.is_terminal() {
            tracing::warn!(state = ?self.state, error = %err, "Session failed");
            for next in [SessionState::Error, SessionState::Closed] {
                if let Err(e) = self.transition_to(next) {
                    tracing::error!(error = %e, "failed to enter {:?}", next);
                }
            }
        }
        if self.close_reason.is_none() {
            self.close_reason = Some(err.clone());
        }
        err
    }

    /// Take every queued reply, oldest first
    pub fn drain_outbound(&mut self) -> Vec<Body> {
        let drained: Vec<Body> = self.outbound.drain(..).collect();
        self.messages_sent += drained.len() as u64;
        drained
    }

    /// Whether replies are waiting
    #[must_use]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Check if the peer went quiet for longer than its announced timeout
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.peer
            .timeout
            .is_some_and(|timeout| self.last_activity.elapsed() >= timeout)
    }

    /// Get session statistics
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            protocol: self.negotiated.as_ref().map(|n| n.protocol),
            share_id: self.share.as_ref().map(|s| s.id().to_string()),
            last_activity: self.last_activity,
        }
    }
}

/// Session statistics snapshot
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Current session state
    pub state: SessionState,
    /// Messages handled, rejected ones included
    pub messages_received: u64,
    /// Messages handed to the transport
    pub messages_sent: u64,
    /// Negotiated protocol version
    pub protocol: Option<u32>,
    /// Share being synchronized
    pub share_id: Option<String>,
    /// Last inbound message
    pub last_activity: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FileEntry, KeyMaterial, Move, Update};
    use crate::share::MemoryStore;
    use std::collections::BTreeMap;

    const SHARE_ID: &str = "5f1a";
    const HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn config(protocols: &[u32], features: &[&str]) -> Arc<ProtocolConfig> {
        Arc::new(ProtocolConfig {
            software: "cirrus-test".to_string(),
            protocols: protocols.to_vec(),
            features: features.iter().map(|f| f.to_string()).collect(),
            peer_id: "local-peer".to_string(),
            ping_timeout: 45,
        })
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_files(
            3,
            [
                FileEntry::new("a.txt", 10, HASH),
                FileEntry {
                    deleted: true,
                    sha256: None,
                    ..FileEntry::new("gone.txt", 0, HASH)
                },
            ],
        ))
    }

    fn snapshot(store: Arc<MemoryStore>) -> ShareSnapshot {
        let share = Share::with_id(SHARE_ID, "/srv/share", None, store);
        Arc::new(BTreeMap::from([(SHARE_ID.to_string(), share)]))
    }

    fn session_with(features: &[&str]) -> (Session, Arc<MemoryStore>) {
        let store = store();
        let session = Session::new(config(&[1, 2], features), snapshot(Arc::clone(&store)));
        (session, store)
    }

    fn greeting(protocol: &[u32], features: &[&str]) -> Body {
        Body::Greeting(Greeting {
            software: "remote 1.0".to_string(),
            protocol: protocol.to_vec(),
            features: features.iter().map(|f| f.to_string()).collect(),
        })
    }

    fn start(id: &str, protocol: u32) -> Body {
        Body::Start(Start {
            software: "remote 1.0".to_string(),
            protocol,
            features: Vec::new(),
            id: id.to_string(),
            access: Access::ReadWrite,
            peer: "remote-peer".to_string(),
        })
    }

    fn identity() -> Body {
        Body::Identity(Identity {
            name: "laptop".to_string(),
            time: 1_400_000_000,
        })
    }

    fn keys(share_id: &str) -> Body {
        Body::Keys(Keys {
            access: Access::Untrusted,
            share_id: share_id.to_string(),
            untrusted: Some(KeyMaterial::psk("00ff")),
            read_only: None,
            read_write: None,
        })
    }

    /// Plaintext handshake up to `Authenticated`
    fn authenticated() -> (Session, Arc<MemoryStore>) {
        let (mut session, store) = session_with(&["plaintext"]);
        session.handle(greeting(&[1], &["plaintext"])).unwrap();
        session.handle(start(SHARE_ID, 1)).unwrap();
        session.handle(identity()).unwrap();
        session.handle(keys(SHARE_ID)).unwrap();
        session.drain_outbound();
        assert_eq!(session.state(), SessionState::Authenticated);
        (session, store)
    }

    fn synced() -> (Session, Arc<MemoryStore>) {
        let (mut session, store) = authenticated();
        session.handle(Body::GetManifest(GetManifest::default())).unwrap();
        session.drain_outbound();
        assert_eq!(session.state(), SessionState::ManifestSynced);
        (session, store)
    }

    #[test]
    fn test_session_creation() {
        let (session, _) = session_with(&[]);
        assert_eq!(session.state(), SessionState::Init);
        assert!(session.negotiated().is_none());
        assert!(!session.has_outbound());
        assert!(!session.is_idle());
    }

    #[test]
    fn test_get_before_greeting_is_violation() {
        let (mut session, _) = session_with(&[]);
        let err = session
            .handle(Body::Get(Get {
                path: "a.txt".to_string(),
                range: None,
            }))
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation {
                state: SessionState::Init,
                mtype: MessageType::Get,
            }
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(&err));
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn test_negotiates_highest_common_version() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[2, 3], &[])).unwrap();
        assert_eq!(session.state(), SessionState::GreetingExchanged);
        assert_eq!(session.negotiated().map(|n| n.protocol), Some(2));
        assert_eq!(
            session.drain_outbound(),
            vec![Body::Greeting(Greeting {
                software: "cirrus-test".to_string(),
                protocol: vec![2],
                features: vec![],
            })]
        );
    }

    #[test]
    fn test_disjoint_versions_cannot_start() {
        let store = store();
        let mut session = Session::new(config(&[1], &[]), snapshot(store));
        let err = session.handle(greeting(&[3], &[])).unwrap_err();
        assert_eq!(
            err,
            SessionError::VersionMismatch {
                ours: vec![1],
                theirs: vec![3],
            }
        );
        assert_eq!(session.state(), SessionState::Closed);
        let out = session.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mtype(), MessageType::CannotStart);
    }

    #[test]
    fn test_feature_intersection_keeps_our_order() {
        let ours = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let theirs = vec!["c".to_string(), "a".to_string(), "a".to_string()];
        assert_eq!(negotiate_features(&ours, &theirs), vec!["a", "c"]);
        assert_eq!(negotiate_protocol(&[1, 2, 5], &[5, 2]), Some(5));
        assert_eq!(negotiate_protocol(&[1], &[]), None);
    }

    #[test]
    fn test_ping_is_legal_everywhere_and_keeps_state() {
        let (mut session, _) = session_with(&[]);
        session.handle(Body::Ping(Ping { timeout: 30 })).unwrap();
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.peer().timeout, Some(Duration::from_secs(30)));

        let (mut session, _) = synced();
        session.handle(Body::Ping(Ping::default())).unwrap();
        assert_eq!(session.state(), SessionState::ManifestSynced);
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn test_tls_handshake() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1, 2], &["plaintext"])).unwrap();
        session.handle(start(SHARE_ID, 2)).unwrap();
        assert_eq!(session.share().map(Share::id), Some(SHARE_ID));

        session
            .handle(Body::StartTls(StartTls {
                peer: "remote-peer".to_string(),
                access: Access::Untrusted,
            }))
            .unwrap();
        assert_eq!(session.state(), SessionState::TlsUpgraded);

        session.handle(identity()).unwrap();
        session.handle(keys(SHARE_ID)).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.peer().name.as_deref(), Some("laptop"));
        assert_eq!(session.peer().access, Some(Access::Untrusted));

        let out = session.drain_outbound();
        assert_eq!(out.last(), Some(&Body::KeysAcknowledgment(KeysAcknowledgment {})));
    }

    #[test]
    fn test_identity_requires_tls_without_plaintext() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &["plaintext"])).unwrap();
        session.handle(start(SHARE_ID, 1)).unwrap();
        let err = session.handle(identity()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                mtype: MessageType::Identity,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_starttls_requires_start() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &[])).unwrap();
        let err = session
            .handle(Body::StartTls(StartTls {
                peer: "remote-peer".to_string(),
                access: Access::ReadOnly,
            }))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_starttls_peer_must_match_start() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &[])).unwrap();
        session.handle(start(SHARE_ID, 1)).unwrap();
        let err = session
            .handle(Body::StartTls(StartTls {
                peer: "someone-else".to_string(),
                access: Access::ReadOnly,
            }))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_keys_before_identity_is_violation() {
        let (mut session, _) = session_with(&["plaintext"]);
        session.handle(greeting(&[1], &["plaintext"])).unwrap();
        session.handle(start(SHARE_ID, 1)).unwrap();
        let err = session.handle(keys(SHARE_ID)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                mtype: MessageType::Keys,
                ..
            }
        ));
    }

    #[test]
    fn test_start_unknown_share() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &[])).unwrap();
        session.drain_outbound();
        let err = session.handle(start("nope", 1)).unwrap_err();
        assert_eq!(err, SessionError::UnknownShare("nope".to_string()));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.drain_outbound(),
            vec![Body::CannotStart(CannotStart::because("unknown share"))]
        );
    }

    #[test]
    fn test_start_with_other_version() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1, 2], &[])).unwrap();
        let err = session.handle(start(SHARE_ID, 1)).unwrap_err();
        assert!(matches!(err, SessionError::VersionMismatch { .. }));
    }

    #[test]
    fn test_peer_cannot_start_closes() {
        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &[])).unwrap();
        session.handle(Body::CannotStart(CannotStart::default())).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.close_reason().is_none());
    }

    #[test]
    fn test_keys_rejected() {
        let store = Arc::new(MemoryStore::with_psk("cafe"));
        let mut session = Session::new(config(&[1], &["plaintext"]), snapshot(store));
        session.handle(greeting(&[1], &["plaintext"])).unwrap();
        session.handle(start(SHARE_ID, 1)).unwrap();
        session.handle(identity()).unwrap();
        let err = session.handle(keys(SHARE_ID)).unwrap_err();
        assert_eq!(err, SessionError::KeysRejected(SHARE_ID.to_string()));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_keys_for_other_share_rejected() {
        let (mut session, _) = session_with(&["plaintext"]);
        session.handle(greeting(&[1], &["plaintext"])).unwrap();
        session.handle(start(SHARE_ID, 1)).unwrap();
        session.handle(identity()).unwrap();
        assert!(matches!(
            session.handle(keys("other")),
            Err(SessionError::KeysRejected(_))
        ));
    }

    #[test]
    fn test_manifest_current_when_revision_matches() {
        let (mut session, _) = authenticated();
        session
            .handle(Body::GetManifest(GetManifest { revision: Some(3) }))
            .unwrap();
        assert_eq!(
            session.drain_outbound(),
            vec![Body::ManifestCurrent(ManifestCurrent {})]
        );
        assert_eq!(session.state(), SessionState::ManifestSynced);
    }

    #[test]
    fn test_manifest_when_revision_differs() {
        for revision in [Some(2), None] {
            let (mut session, _) = authenticated();
            session
                .handle(Body::GetManifest(GetManifest { revision }))
                .unwrap();
            let out = session.drain_outbound();
            let [Body::Manifest(manifest)] = out.as_slice() else {
                panic!("expected a manifest, got {out:?}");
            };
            assert_eq!(manifest.revision, 3);
            assert_eq!(manifest.peer, "local-peer");
            assert_eq!(manifest.files.len(), 2);
        }
    }

    #[test]
    fn test_get_replied_with_matching_file_data() {
        let (mut session, _) = synced();
        session
            .handle(Body::Get(Get {
                path: "a.txt".to_string(),
                range: Some(ByteRange::new(4, 100)),
            }))
            .unwrap();
        assert_eq!(
            session.drain_outbound(),
            vec![Body::FileData(FileData {
                path: "a.txt".to_string(),
                range: ByteRange::new(4, 6),
            })]
        );
        assert_eq!(session.state(), SessionState::Transferring);

        session
            .handle(Body::Get(Get {
                path: "a.txt".to_string(),
                range: None,
            }))
            .unwrap();
        assert_eq!(
            session.drain_outbound(),
            vec![Body::FileData(FileData {
                path: "a.txt".to_string(),
                range: ByteRange::whole(10),
            })]
        );
    }

    #[test]
    fn test_get_unknown_or_deleted_file() {
        for path in ["missing.txt", "gone.txt"] {
            let (mut session, _) = synced();
            let err = session
                .handle(Body::Get(Get {
                    path: path.to_string(),
                    range: None,
                }))
                .unwrap_err();
            assert_eq!(err, SessionError::UnknownFile(path.to_string()));
            assert_eq!(session.state(), SessionState::Closed);
        }
    }

    #[test]
    fn test_notifications_reach_store_without_reply() {
        let (mut session, store) = synced();
        session
            .handle(Body::Update(Update {
                revision: 9,
                file: FileEntry::new("new.txt", 1, HASH),
                signature: None,
            }))
            .unwrap();
        session
            .handle(Body::Move(Move {
                revision: 10,
                source: "a.txt".to_string(),
                destination: FileEntry::new("b.txt", 10, HASH),
                signature: None,
            }))
            .unwrap();
        assert!(session.drain_outbound().is_empty());
        assert_eq!(store.revision(), 5);
        assert!(store.entry("new.txt").is_some());
        assert!(store.entry("b.txt").is_some());
        assert_eq!(session.state(), SessionState::ManifestSynced);
    }

    #[test]
    fn test_update_before_manifest_is_violation() {
        let (mut session, _) = authenticated();
        let err = session
            .handle(Body::Update(Update {
                revision: 1,
                file: FileEntry::new("x", 1, HASH),
                signature: None,
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                state: SessionState::Authenticated,
                ..
            }
        ));
    }

    #[test]
    fn test_request_file_pairs_with_file_data() {
        let (mut session, store) = synced();
        session.request_file("remote.bin", None).unwrap();
        assert_eq!(session.state(), SessionState::Transferring);
        assert_eq!(
            session.request_file("other.bin", None),
            Err(SessionError::RequestInFlight("remote.bin".to_string()))
        );
        assert_eq!(session.state(), SessionState::Transferring);

        let out = session.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mtype(), MessageType::Get);

        let data = FileData {
            path: "remote.bin".to_string(),
            range: ByteRange::new(0, 512),
        };
        session.handle(Body::FileData(data.clone())).unwrap();
        assert!(session.pending_request().is_none());
        assert_eq!(store.received(), vec![data]);

        session.request_file("other.bin", None).unwrap();
    }

    #[test]
    fn test_unsolicited_file_data() {
        let (mut session, _) = synced();
        session.request_file("wanted", None).unwrap();
        let err = session
            .handle(Body::FileData(FileData {
                path: "unwanted".to_string(),
                range: ByteRange::new(0, 1),
            }))
            .unwrap_err();
        assert_eq!(err, SessionError::UnsolicitedFileData("unwanted".to_string()));
        assert!(session.pending_request().is_none());
    }

    #[test]
    fn test_request_file_needs_sync_state() {
        let (mut session, _) = authenticated();
        assert_eq!(
            session.request_file("a", None),
            Err(SessionError::InvalidState(SessionState::Authenticated))
        );
        let (mut session, _) = synced();
        assert!(matches!(
            session.request_file("../etc", None),
            Err(SessionError::InvalidMessage(_))
        ));
        assert_eq!(session.state(), SessionState::ManifestSynced);
    }

    #[test]
    fn test_invalid_body_closes_session() {
        let (mut session, _) = session_with(&[]);
        let err = session.handle(Body::Ping(Ping { timeout: 0 })).unwrap_err();
        assert!(matches!(err, SessionError::InvalidMessage(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.handle(Body::Ping(Ping::default())), Err(SessionError::Closed));
    }

    #[test]
    fn test_malformed_wire_closes_session() {
        let (mut session, _) = session_with(&[]);
        let err = session.handle_wire(b"{\"type\": ").unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidMessage(MessageError::MalformedEncoding(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);

        let (mut session, _) = session_with(&[]);
        let err = session.handle_wire(br#"{"type": "bogus"}"#).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidMessage(MessageError::UnknownMessageType(_))
        ));

        let (mut session, _) = session_with(&[]);
        let err = session.handle_wire(br#"{"type": "greeting"}"#).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidMessage(MessageError::InvalidMessageShape { .. })
        ));
        assert_eq!(session.stats().messages_received, 1);
    }

    #[test]
    fn test_handle_wire_greeting() {
        let (mut session, _) = session_with(&[]);
        session
            .handle_wire(
                br#"{"type": "greeting", "software": "x", "protocol": [1], "features": []}"#,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::GreetingExchanged);
    }

    #[test]
    fn test_keepalive() {
        let (mut session, _) = session_with(&[]);
        session.keepalive().unwrap();
        assert_eq!(session.drain_outbound(), vec![Body::Ping(Ping { timeout: 45 })]);
        session.close();
        assert_eq!(session.keepalive(), Err(SessionError::Closed));
    }

    #[test]
    fn test_close_is_idempotent_and_releases() {
        let (mut session, _) = synced();
        session.request_file("x", None).unwrap();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.share().is_none());
        assert!(session.pending_request().is_none());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_abort_records_reason() {
        let (mut session, _) = authenticated();
        let err = session.abort(SessionError::Transport("reset by peer".into()));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(&err));
    }

    #[test]
    fn test_state_transitions() {
        let (mut session, _) = session_with(&[]);
        assert!(!session.can_transition(SessionState::Authenticated));
        assert!(session.can_transition(SessionState::GreetingExchanged));
        assert!(session.can_transition(SessionState::Error));
        assert!(session.transition_to(SessionState::Transferring).is_err());

        session.transition_to(SessionState::Error).unwrap();
        assert!(!session.can_transition(SessionState::Init));
        assert!(session.can_transition(SessionState::Closed));
        session.transition_to(SessionState::Closed).unwrap();
        assert!(!session.can_transition(SessionState::Closed));
    }

    #[test]
    fn test_stats() {
        let (mut session, _) = synced();
        session.keepalive().unwrap();
        session.drain_outbound();
        let stats = session.stats();
        assert_eq!(stats.state, SessionState::ManifestSynced);
        assert_eq!(stats.protocol, Some(1));
        assert_eq!(stats.share_id.as_deref(), Some(SHARE_ID));
        assert_eq!(stats.messages_received, 5);
        assert_eq!(stats.messages_sent, 4);
    }

    #[test]
    fn test_idle_detection() {
        let (mut session, _) = session_with(&[]);
        session.handle(Body::Ping(Ping { timeout: 1 })).unwrap();
        assert!(!session.is_idle());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(session.is_idle());
    }

    #[test]
    fn test_ping_in_every_live_state() {
        let ping = || Body::Ping(Ping { timeout: 20 });

        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &[])).unwrap();
        session.handle(ping()).unwrap();
        assert_eq!(session.state(), SessionState::GreetingExchanged);
        session.handle(start(SHARE_ID, 1)).unwrap();
        session
            .handle(Body::StartTls(StartTls {
                peer: "remote-peer".to_string(),
                access: Access::Untrusted,
            }))
            .unwrap();
        session.handle(ping()).unwrap();
        assert_eq!(session.state(), SessionState::TlsUpgraded);

        let (mut session, _) = authenticated();
        session.handle(ping()).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);

        let (mut session, _) = synced();
        session.request_file("remote.bin", None).unwrap();
        session.drain_outbound();
        session.handle(ping()).unwrap();
        assert_eq!(session.state(), SessionState::Transferring);
        assert_eq!(session.peer().timeout, Some(Duration::from_secs(20)));
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn test_notifications_while_request_outstanding() {
        let (mut session, store) = synced();
        session.request_file("remote.bin", None).unwrap();
        session.drain_outbound();
        assert_eq!(session.state(), SessionState::Transferring);

        session
            .handle(Body::Update(Update {
                revision: 4,
                file: FileEntry::new("new.txt", 1, HASH),
                signature: None,
            }))
            .unwrap();
        session
            .handle(Body::Move(Move {
                revision: 5,
                source: "a.txt".to_string(),
                destination: FileEntry::new("moved.txt", 10, HASH),
                signature: None,
            }))
            .unwrap();
        assert_eq!(
            session.pending_request().map(|get| get.path.as_str()),
            Some("remote.bin")
        );
        assert_eq!(store.revision(), 5);
        assert!(store.entry("moved.txt").is_some());

        let data = FileData {
            path: "remote.bin".to_string(),
            range: ByteRange::new(0, 8),
        };
        session.handle(Body::FileData(data.clone())).unwrap();
        assert!(session.pending_request().is_none());
        assert_eq!(store.received(), vec![data]);
        assert_eq!(session.state(), SessionState::Transferring);
        assert!(session.drain_outbound().is_empty());
    }

    /// Hand everything `from` queued to `to` through the wire codec
    fn pump(from: &mut Session, to: &mut Session) -> Vec<MessageType> {
        from.drain_outbound()
            .into_iter()
            .map(|body| {
                to.handle_wire(&body.encode().unwrap()).unwrap();
                body.mtype()
            })
            .collect()
    }

    fn pair(features: &[&str]) -> (Session, Arc<MemoryStore>, Session, Arc<MemoryStore>) {
        let local = Arc::new(MemoryStore::with_files(1, [FileEntry::new("a.txt", 10, HASH)]));
        let remote = store();
        let initiator = Session::connect(config(&[1, 2], features), snapshot(Arc::clone(&local)));
        let acceptor = Session::new(config(&[2, 3], features), snapshot(Arc::clone(&remote)));
        (initiator, local, acceptor, remote)
    }

    #[test]
    fn test_two_sessions_handshake_over_tls() {
        let (mut a, local, mut b, _) = pair(&[]);
        assert_eq!(a.role(), Role::Initiator);
        assert_eq!(b.role(), Role::Acceptor);

        assert_eq!(pump(&mut a, &mut b), vec![MessageType::Greeting]);
        assert_eq!(pump(&mut b, &mut a), vec![MessageType::Greeting]);
        assert_eq!(a.state(), SessionState::GreetingExchanged);
        assert_eq!(a.negotiated().map(|n| n.protocol), Some(2));
        assert_eq!(b.negotiated().map(|n| n.protocol), Some(2));

        a.start(SHARE_ID, Access::Untrusted).unwrap();
        assert_eq!(a.state(), SessionState::TlsUpgraded);
        assert_eq!(
            pump(&mut a, &mut b),
            vec![MessageType::Start, MessageType::StartTls]
        );
        assert_eq!(b.state(), SessionState::TlsUpgraded);

        let Body::Keys(credentials) = keys(SHARE_ID) else {
            unreachable!()
        };
        a.authenticate("laptop", credentials).unwrap();
        assert_eq!(
            pump(&mut a, &mut b),
            vec![MessageType::Identity, MessageType::Keys]
        );
        assert_eq!(b.peer().name.as_deref(), Some("laptop"));
        assert_eq!(pump(&mut b, &mut a), vec![MessageType::KeysAcknowledgment]);
        assert_eq!(a.state(), SessionState::Authenticated);
        assert_eq!(b.state(), SessionState::Authenticated);

        a.request_manifest().unwrap();
        assert_eq!(pump(&mut a, &mut b), vec![MessageType::GetManifest]);
        assert_eq!(pump(&mut b, &mut a), vec![MessageType::Manifest]);
        assert_eq!(a.state(), SessionState::ManifestSynced);
        assert_eq!(a.remote_manifest().map(|m| m.revision), Some(3));
        let changes = a.manifest_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "gone.txt");

        a.request_file("a.txt", None).unwrap();
        assert_eq!(pump(&mut a, &mut b), vec![MessageType::Get]);
        assert_eq!(pump(&mut b, &mut a), vec![MessageType::FileData]);
        assert_eq!(local.received()[0].range, ByteRange::whole(10));
        assert_eq!(a.state(), SessionState::Transferring);
        assert_eq!(b.state(), SessionState::Transferring);
    }

    #[test]
    fn test_two_sessions_plaintext_manifest_current() {
        let (mut a, _, mut b, _) = pair(&["plaintext"]);
        let remote_revision = 3;
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);

        a.start(SHARE_ID, Access::Untrusted).unwrap();
        assert_eq!(a.state(), SessionState::GreetingExchanged);
        assert_eq!(pump(&mut a, &mut b), vec![MessageType::Start]);

        let Body::Keys(credentials) = keys(SHARE_ID) else {
            unreachable!()
        };
        a.authenticate("laptop", credentials).unwrap();
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);
        assert_eq!(a.state(), SessionState::Authenticated);

        // Bring our side up to the peer's revision first
        let local = Arc::clone(a.share().unwrap().store());
        for revision in 2..=remote_revision {
            local.apply_update(&Update {
                revision,
                file: FileEntry::new("a.txt", 10, HASH),
                signature: None,
            });
        }
        a.request_manifest().unwrap();
        pump(&mut a, &mut b);
        assert_eq!(pump(&mut b, &mut a), vec![MessageType::ManifestCurrent]);
        assert_eq!(a.state(), SessionState::ManifestSynced);
        assert!(a.remote_manifest().is_none());
        assert!(a.manifest_changes().is_empty());
    }

    #[test]
    fn test_initiator_rejects_acceptor_messages() {
        let (mut a, _, mut b, _) = pair(&[]);
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);
        let err = a.handle(start(SHARE_ID, 2)).unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation {
                state: SessionState::GreetingExchanged,
                mtype: MessageType::Start,
            }
        );
        assert_eq!(a.state(), SessionState::Closed);
    }

    #[test]
    fn test_acceptor_rejects_unrequested_replies() {
        let (mut session, _) = synced();
        let err = session
            .handle(Body::ManifestCurrent(ManifestCurrent {}))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));

        let (mut session, _) = session_with(&[]);
        session.handle(greeting(&[1], &[])).unwrap();
        let err = session
            .handle(Body::KeysAcknowledgment(KeysAcknowledgment {}))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_initiator_local_ops_check_state() {
        let (mut a, _, mut b, _) = pair(&[]);
        assert_eq!(
            a.start(SHARE_ID, Access::ReadOnly),
            Err(SessionError::InvalidState(SessionState::Init))
        );
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);
        assert_eq!(
            a.start("nope", Access::ReadOnly),
            Err(SessionError::UnknownShare("nope".to_string()))
        );
        assert_eq!(a.state(), SessionState::GreetingExchanged);
        assert_eq!(
            a.request_manifest(),
            Err(SessionError::InvalidState(SessionState::GreetingExchanged))
        );

        // Acceptors never drive the handshake
        assert_eq!(
            b.start(SHARE_ID, Access::ReadOnly),
            Err(SessionError::InvalidState(SessionState::GreetingExchanged))
        );
    }

    #[test]
    fn test_initiator_refused_after_start() {
        let (mut a, _, mut b, _) = pair(&[]);
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);
        a.start(SHARE_ID, Access::Untrusted).unwrap();
        a.drain_outbound();
        a.handle(Body::CannotStart(CannotStart::because("unknown share")))
            .unwrap();
        assert_eq!(a.state(), SessionState::Closed);
        assert!(a.share().is_none());
    }
}
