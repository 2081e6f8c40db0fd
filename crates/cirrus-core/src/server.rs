//! Connection registry.
//!
//! [`Server`] owns the set of attached shares and every live
//! [`Connection`]. Each connection exclusively owns its [`Session`] and the
//! [`Transport`] it writes to; removing the registry entry tears both down.
//!
//! # Concurrency
//!
//! Connections live in a concurrent `DashMap`, so distinct connections can
//! be driven from different tasks sharing one `Arc<Server>`. The share set is copy-on-write: a
//! session receives the snapshot current at accept time and never sees
//! later attaches or detaches. Attach, detach, accept and close are
//! serialized by a single writer lock.

use crate::config::{Config, ProtocolConfig};
use crate::error::{RegistryError, SessionError};
use crate::message::{Access, ByteRange, Keys};
use crate::session::{Session, SessionState};
use crate::share::{MemoryStore, Share, ShareSnapshot, ShareStore};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

/// Byte transport of one connection
///
/// Framing, payload bytes and the TLS handshake itself belong to the
/// implementation; the session only decides when they happen. Transports
/// sit inside the shared registry, hence `Sync`.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Write one encoded wire unit
    fn send(&mut self, wire: &[u8]) -> io::Result<()>;

    /// Upgrade the transport once `starttls` was sent or received
    fn start_tls(&mut self) -> io::Result<()>;

    /// Shut the transport down
    fn close(&mut self) -> io::Result<()>;
}

/// A live peer connection
#[derive(Debug)]
pub struct Connection {
    id: String,
    session: Session,
    transport: Box<dyn Transport>,
    accepted_at: Instant,
    transport_closed: bool,
}

impl Connection {
    fn new(id: String, session: Session, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            session,
            transport,
            accepted_at: Instant::now(),
            transport_closed: false,
        }
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Protocol session
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// When the connection was accepted
    #[must_use]
    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    /// Feed one inbound wire unit through the session and flush its replies.
    ///
    /// Replies are sent even when the unit is rejected, so a final
    /// `cannot_start` reaches the peer before the transport closes.
    pub fn receive(&mut self, wire: &[u8]) -> Result<(), SessionError> {
        let before = self.session.state();
        let result = self.session.handle_wire(wire);
        self.settle(before, result)
    }

    /// Ask the peer to synchronize one of our shares
    pub fn start(&mut self, share_id: &str, access: Access) -> Result<(), SessionError> {
        let before = self.session.state();
        let result = self.session.start(share_id, access);
        self.settle(before, result)
    }

    /// Send our device name and key material
    pub fn authenticate(
        &mut self,
        name: impl Into<String>,
        keys: Keys,
    ) -> Result<(), SessionError> {
        let before = self.session.state();
        let result = self.session.authenticate(name, keys);
        self.settle(before, result)
    }

    /// Ask the peer for its manifest
    pub fn request_manifest(&mut self) -> Result<(), SessionError> {
        let before = self.session.state();
        let result = self.session.request_manifest();
        self.settle(before, result)
    }

    /// Request a file from the peer
    pub fn request_file(
        &mut self,
        path: impl Into<String>,
        range: Option<ByteRange>,
    ) -> Result<(), SessionError> {
        let before = self.session.state();
        let result = self.session.request_file(path, range);
        self.settle(before, result)
    }

    /// Send a keepalive
    pub fn keepalive(&mut self) -> Result<(), SessionError> {
        let before = self.session.state();
        let result = self.session.keepalive();
        self.settle(before, result)
    }

    /// Flush queued messages, upgrade the transport when the session just
    /// entered `TlsUpgraded`, and shut it down once the session closed
    fn settle(
        &mut self,
        before: SessionState,
        result: Result<(), SessionError>,
    ) -> Result<(), SessionError> {
        let flushed = self.flush();

        if result.is_ok()
            && flushed.is_ok()
            && before != SessionState::TlsUpgraded
            && self.session.state() == SessionState::TlsUpgraded
        {
            if let Err(e) = self.transport.start_tls() {
                let err = self.session.abort(transport_error("start_tls", &e));
                self.shutdown_transport();
                return Err(err);
            }
            tracing::debug!(connection = %self.id, "Transport upgraded");
        }

        if self.session.state().is_terminal() {
            self.shutdown_transport();
        }
        result.and(flushed)
    }

    /// Close the session and the transport. Idempotent.
    pub fn close(&mut self) {
        self.session.close();
        // Best effort, the transport closes regardless
        let _ = self.flush();
        self.shutdown_transport();
    }

    /// Hand every queued message to the transport
    pub fn flush(&mut self) -> Result<(), SessionError> {
        if self.transport_closed {
            return Ok(());
        }
        for body in self.session.drain_outbound() {
            let wire = body.encode()?;
            if let Err(e) = self.transport.send(&wire) {
                let err = self.session.abort(transport_error("send", &e));
                self.shutdown_transport();
                return Err(err);
            }
        }
        Ok(())
    }

    fn shutdown_transport(&mut self) {
        if self.transport_closed {
            return;
        }
        self.transport_closed = true;
        if let Err(e) = self.transport.close() {
            tracing::warn!(connection = %self.id, error = %e, "Transport close failed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_transport();
    }
}

fn transport_error(op: &str, e: &io::Error) -> SessionError {
    SessionError::Transport(format!("{op}: {e}").into())
}

/// Registry of shares and live connections
#[derive(Debug)]
pub struct Server {
    config: Arc<ProtocolConfig>,
    shares: RwLock<ShareSnapshot>,
    connections: DashMap<String, Connection>,
    writer: Mutex<()>,
}

impl Server {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config: Arc::new(config),
            shares: RwLock::new(Arc::new(BTreeMap::new())),
            connections: DashMap::new(),
            writer: Mutex::new(()),
        }
    }

    /// Create a registry and attach the configured shares
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let server = Self::new(config.protocol.clone());
        for share in &config.shares {
            server.attach_share(share.path.clone(), share.dbpath.clone())?;
        }
        Ok(server)
    }

    /// Protocol configuration handed to every session
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a share backed by an in-memory store
    ///
    /// # Errors
    ///
    /// `RegistryError::DuplicateShare` if `path` is already attached.
    pub fn attach_share(
        &self,
        path: impl Into<PathBuf>,
        dbpath: Option<PathBuf>,
    ) -> Result<String, RegistryError> {
        self.attach_share_with(path, dbpath, Arc::new(MemoryStore::new()))
    }

    /// Attach a share backed by a custom store
    pub fn attach_share_with(
        &self,
        path: impl Into<PathBuf>,
        dbpath: Option<PathBuf>,
        store: Arc<dyn ShareStore>,
    ) -> Result<String, RegistryError> {
        self.attach(Share::new(path, dbpath, store))
    }

    /// Attach a share under the identifier it already carries, as when
    /// both peers of a share run their own registry
    ///
    /// # Errors
    ///
    /// `RegistryError::DuplicateShare` if its path is attached,
    /// `RegistryError::ShareExists` if its identifier is.
    pub fn attach(&self, share: Share) -> Result<String, RegistryError> {
        let _writer = self.lock_writer();

        let current = self.snapshot();
        if current.values().any(|s| s.path() == share.path()) {
            return Err(RegistryError::DuplicateShare(share.path().to_path_buf()));
        }
        if current.contains_key(share.id()) {
            return Err(RegistryError::ShareExists(share.id().to_string()));
        }

        let id = share.id().to_string();
        tracing::info!(share = %id, path = %share.path().display(), "Attached share");

        let mut next = BTreeMap::clone(&current);
        next.insert(id.clone(), share);
        self.replace_shares(next);
        Ok(id)
    }

    /// Detach a share. Running sessions keep their snapshot.
    pub fn detach_share(&self, id: &str) -> Result<Share, RegistryError> {
        let _writer = self.lock_writer();

        let mut next = BTreeMap::clone(&self.snapshot());
        let share = next
            .remove(id)
            .ok_or_else(|| RegistryError::ShareNotFound(id.to_string()))?;
        self.replace_shares(next);
        tracing::info!(share = %id, "Detached share");
        Ok(share)
    }

    fn replace_shares(&self, shares: BTreeMap<String, Share>) {
        *self.shares.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(shares);
    }

    /// Current share set
    #[must_use]
    pub fn snapshot(&self) -> ShareSnapshot {
        Arc::clone(&self.shares.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Identifiers of the attached shares
    #[must_use]
    pub fn share_ids(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    /// Register a new connection with a session over the current shares.
    ///
    /// The returned guard locks the connection's map shard; drop it before
    /// calling back into the registry.
    ///
    /// # Errors
    ///
    /// `RegistryError::ConnectionExists` if `id` is live. The existing
    /// connection is left untouched.
    pub fn accept_connection(
        &self,
        id: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Result<RefMut<'_, String, Connection>, RegistryError> {
        self.register(id.into(), transport, Session::new)
    }

    /// Register an outbound connection and send our greeting.
    ///
    /// Drive the rest of the handshake through [`Server::with_connection`]
    /// with [`Connection::start`], [`Connection::authenticate`] and
    /// [`Connection::request_manifest`], feeding replies to
    /// [`Server::deliver`].
    ///
    /// # Errors
    ///
    /// `RegistryError::ConnectionExists` if `id` is live, or the session
    /// error if the greeting could not be sent.
    pub fn connect(
        &self,
        id: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        drop(self.register(id.clone(), transport, Session::connect)?);
        self.with_connection(&id, Connection::flush)?
            .map_err(RegistryError::from)
    }

    fn register(
        &self,
        id: String,
        transport: Box<dyn Transport>,
        session: fn(Arc<ProtocolConfig>, ShareSnapshot) -> Session,
    ) -> Result<RefMut<'_, String, Connection>, RegistryError> {
        let _writer = self.lock_writer();

        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(connection = %id, "Rejected colliding connection id");
                Err(RegistryError::ConnectionExists(id))
            }
            Entry::Vacant(slot) => {
                let session = session(Arc::clone(&self.config), self.snapshot());
                tracing::info!(connection = %id, role = ?session.role(), "Registered connection");
                Ok(slot.insert(Connection::new(id, session, transport)))
            }
        }
    }

    /// Hand one inbound wire unit to a connection.
    ///
    /// A connection whose session ends up closed is removed.
    pub fn deliver(&self, id: &str, wire: &[u8]) -> Result<(), RegistryError> {
        self.with_connection(id, |conn| conn.receive(wire))?
            .map_err(RegistryError::from)
    }

    /// Run `f` on a live connection, removing it afterwards if its session
    /// closed
    pub fn with_connection<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Result<R, RegistryError> {
        let (output, closed) = {
            let mut conn = self
                .connections
                .get_mut(id)
                .ok_or_else(|| RegistryError::ConnectionNotFound(id.to_string()))?;
            let output = f(&mut *conn);
            (output, conn.session().state().is_terminal())
        };

        if closed {
            let _writer = self.lock_writer();
            if let Some((_, mut conn)) = self
                .connections
                .remove_if(id, |_, conn| conn.session().state().is_terminal())
            {
                conn.close();
                tracing::info!(connection = %id, "Connection closed by session");
            }
        }
        Ok(output)
    }

    /// Close and remove a connection. Idempotent.
    pub fn close_connection(&self, id: &str) {
        let _writer = self.lock_writer();
        if let Some((_, mut conn)) = self.connections.remove(id) {
            conn.close();
            tracing::info!(connection = %id, "Closed connection");
        }
    }

    /// Close every connection whose peer outlived its keepalive timeout
    pub fn close_idle(&self) -> Vec<String> {
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|conn| conn.session().is_idle())
            .map(|conn| conn.key().clone())
            .collect();
        for id in &idle {
            tracing::debug!(connection = %id, "Peer idle past its timeout");
            self.close_connection(id);
        }
        idle
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Identifiers of the live connections
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }
}
