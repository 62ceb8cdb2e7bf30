use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, watch},
};

use crate::mtcp::tunnel::{
    protocol::{self, Frame, ProtocolError},
    transport::StreamWriter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Unclassified,
    LocalConnector,
    ExternalCaller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unclassified => "unclassified",
            Role::LocalConnector => "local_connector",
            Role::ExternalCaller => "external_caller",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SharedConnector = Arc<Connector>;

/// The write half and the peer link are guarded together: whoever holds the
/// lock sees a peer that matches what is about to go on the wire.
struct Link {
    writer: StreamWriter,
    peer: Option<SharedConnector>,
    /// Set by `open_session`, cleared by the agent's end-of-session. The peer
    /// may already be gone while this is still set.
    in_session: bool,
}

/// Outcome of an end-of-session frame from the agent.
#[derive(Debug)]
pub enum SessionEnd {
    /// No session was open; the frame is a duplicate.
    NotInSession,
    /// The session ended; `caller` is the peer still linked, if any.
    Ended { caller: Option<SharedConnector> },
}

/// One accepted stream as seen by the relay.
pub struct Connector {
    id: String,
    remote: String,
    role: OnceLock<Role>,
    link: Mutex<Link>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(id: String, remote: String, writer: StreamWriter) -> Self {
        let (closed, _rx) = watch::channel(false);
        Self {
            id,
            remote,
            role: OnceLock::new(),
            link: Mutex::new(Link {
                writer,
                peer: None,
                in_session: false,
            }),
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role.get().copied().unwrap_or(Role::Unclassified)
    }

    /// Classification happens once; later calls are ignored.
    pub fn set_role(&self, role: Role) {
        let _ = self.role.set(role);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called. Read loops select on it.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub async fn peer(&self) -> Option<SharedConnector> {
        self.link.lock().await.peer.clone()
    }

    pub async fn set_peer(&self, peer: SharedConnector) {
        self.link.lock().await.peer = Some(peer);
    }

    pub async fn take_peer(&self) -> Option<SharedConnector> {
        self.link.lock().await.peer.take()
    }

    /// Clears the peer link only if it still points at `id`.
    pub async fn clear_peer_if(&self, id: &str) -> bool {
        let mut link = self.link.lock().await;
        if link.peer.as_ref().is_some_and(|p| p.id() == id) {
            link.peer = None;
            return true;
        }
        false
    }

    /// Links a pooled connector to `caller` and announces the session to the
    /// agent. Fails if the connector died while queued.
    pub async fn open_session(&self, caller: &SharedConnector) -> Result<(), ProtocolError> {
        let mut link = self.link.lock().await;
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        if let Some(existing) = &link.peer {
            tracing::warn!(
                connector = %self.id,
                peer = %existing.id(),
                "relay: pooled connector still had a peer; replacing"
            );
        }
        protocol::write_frame(&mut link.writer, &Frame::Open).await?;
        link.peer = Some(caller.clone());
        link.in_session = true;
        Ok(())
    }

    /// Closes out the session the agent just ended and unlinks its caller.
    pub async fn end_session(&self) -> SessionEnd {
        let mut link = self.link.lock().await;
        if !link.in_session {
            return SessionEnd::NotInSession;
        }
        link.in_session = false;
        SessionEnd::Ended {
            caller: link.peer.take(),
        }
    }

    /// Sends caller payload as `Data` frames. Returns `Ok(false)` without
    /// writing when this connector is no longer paired with `caller_id`.
    pub async fn forward_from(&self, caller_id: &str, data: &[u8]) -> Result<bool, ProtocolError> {
        let mut link = self.link.lock().await;
        if !link.peer.as_ref().is_some_and(|p| p.id() == caller_id) {
            return Ok(false);
        }
        protocol::write_data(&mut link.writer, data).await?;
        Ok(true)
    }

    /// Unpairs from `caller_id` and tells the agent the caller is gone.
    pub async fn hangup_if(&self, caller_id: &str) -> Result<bool, ProtocolError> {
        let mut link = self.link.lock().await;
        if !link.peer.as_ref().is_some_and(|p| p.id() == caller_id) {
            return Ok(false);
        }
        link.peer = None;
        protocol::write_frame(&mut link.writer, &Frame::Hangup).await?;
        Ok(true)
    }

    /// Writes raw bytes; used for external callers, which are not framed.
    pub async fn write_raw(&self, data: &[u8]) -> std::io::Result<()> {
        let mut link = self.link.lock().await;
        link.writer.write_all(data).await?;
        link.writer.flush().await
    }

    /// Marks the connector closed, wakes its read loop and shuts down the
    /// write side. Idempotent.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        let mut link = self.link.lock().await;
        let _ = link.writer.shutdown().await;
    }
}
