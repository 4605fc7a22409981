//! One negotiated association and its message loop
//!
//! A `Session` owns the accepted presentation contexts, the peer identity
//! and the channel, and drives the post-negotiation message loop until the
//! peer releases, aborts, or the transport fails. Messages are processed
//! strictly in arrival order. A built-in handler answers C-ECHO; all other
//! commands dispatch through a [`HandlerRegistry`] owned by the service
//! layered on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AssocError, Result};
use crate::pool::PoolJob;
use crate::transport::{AssociationChannel, AssociationResponse, Message, Pdu};
use crate::types::{CommandType, RefusalReason, Role, Status};

/// One accepted presentation context of a live association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
    /// Presentation context id used by application messages
    pub id: u8,
    /// Abstract syntax UID
    pub abstract_syntax: String,
    /// The transfer syntax the acceptor selected
    pub transfer_syntax: String,
    /// The negotiated role
    pub role: Role,
}

/// Scan accepted contexts for an exact match; the role filter is optional
pub(crate) fn find_context(
    accepted: &[AcceptedContext],
    abstract_syntax: &str,
    transfer_syntax: &str,
    role: Option<Role>,
) -> Option<u8> {
    accepted
        .iter()
        .find(|c| {
            c.abstract_syntax == abstract_syntax
                && c.transfer_syntax == transfer_syntax
                && role.map_or(true, |r| c.role == r)
        })
        .map(|c| c.id)
}

/// Identity of the two endpoints of an association
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// AE title of the association requester
    pub calling_ae: String,
    /// AE title the association was addressed to
    pub called_ae: String,
    /// Transport-level peer description
    pub address: String,
}

/// Handler invoked for application messages of one command type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a request and produce the response status and payload
    async fn handle(&self, context: &AcceptedContext, request: &Message) -> Result<(Status, Bytes)>;
}

/// Table from command type to handler, registered by the service layered
/// on top of the association core
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandType, Box<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one command type, replacing any previous one
    pub fn register(&mut self, command: CommandType, handler: impl MessageHandler + 'static) {
        self.handlers.insert(command, Box::new(handler));
    }

    fn get(&self, command: CommandType) -> Option<&dyn MessageHandler> {
        self.handlers.get(&command).map(|h| h.as_ref())
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Negotiation finished, message loop not yet entered
    Accepted,
    /// Message loop running
    Serving,
    /// Association over; a session never serves again
    Terminated,
}

/// One negotiated, live association on the acceptor side
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    peer: PeerIdentity,
    accepted: Vec<AcceptedContext>,
    state: SessionState,
    channel: Box<dyn AssociationChannel>,
    handlers: Arc<HandlerRegistry>,
    receive_timeout: Option<Duration>,
    // The accept response goes out as the first act of serve(), so an
    // overloaded pool can still refuse the peer before anything commits
    pending_response: Option<AssociationResponse>,
}

impl Session {
    pub(crate) fn new(
        channel: Box<dyn AssociationChannel>,
        peer: PeerIdentity,
        accepted: Vec<AcceptedContext>,
        pending_response: Option<AssociationResponse>,
        handlers: Arc<HandlerRegistry>,
        receive_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            peer,
            accepted,
            state: SessionState::Accepted,
            channel,
            handlers,
            receive_timeout,
            pending_response,
        }
    }

    /// Unique id of this session
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When this session was accepted
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Identity of the peer this session talks to
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// The accepted presentation contexts
    pub fn accepted_contexts(&self) -> &[AcceptedContext] {
        &self.accepted
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send the refusal for an association the server cannot take after
    /// all, then close the transport
    pub(crate) async fn refuse(mut self, reason: RefusalReason) {
        self.state = SessionState::Terminated;
        let _ = self.channel.send(Pdu::Reject { reason }).await;
        let _ = self.channel.close().await;
    }

    /// Run the message loop until release, abort, or failure
    pub async fn serve(mut self) -> Result<()> {
        if let Some(response) = self.pending_response.take() {
            self.channel.send(Pdu::Accept(response)).await?;
        }
        self.state = SessionState::Serving;
        info!(
            "Serving association {} with {} ({} accepted contexts)",
            self.id,
            self.peer.calling_ae,
            self.accepted.len()
        );

        loop {
            let received = match self.receive_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.channel.recv()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "Association {} idle for more than {:?}, aborting",
                            self.id, limit
                        );
                        self.abort("message receive timeout").await;
                        return Err(AssocError::timeout("message receive timeout"));
                    }
                },
                None => self.channel.recv().await,
            };

            match received {
                Ok(Some(Pdu::Message(message))) => {
                    if let Err(e) = self.dispatch(&message).await {
                        self.abort(&e.to_string()).await;
                        return Err(e);
                    }
                }
                Ok(Some(Pdu::ReleaseRequest)) => {
                    debug!("Association {} released by {}", self.id, self.peer.calling_ae);
                    self.channel.send(Pdu::ReleaseResponse).await?;
                    self.channel.close().await?;
                    self.state = SessionState::Terminated;
                    return Ok(());
                }
                Ok(Some(Pdu::Abort { reason })) => {
                    warn!(
                        "Association {} aborted by {}: {}",
                        self.id, self.peer.calling_ae, reason
                    );
                    let _ = self.channel.close().await;
                    self.state = SessionState::Terminated;
                    return Ok(());
                }
                Ok(Some(other)) => {
                    let e = AssocError::protocol(format!(
                        "unexpected {} on established association",
                        other.name()
                    ));
                    self.abort(&e.to_string()).await;
                    return Err(e);
                }
                Ok(None) => {
                    self.state = SessionState::Terminated;
                    return Err(AssocError::protocol(
                        "transport closed without release or abort",
                    ));
                }
                Err(e) => {
                    self.abort("transport error").await;
                    return Err(e);
                }
            }
        }
    }

    /// Handle one incoming application message
    async fn dispatch(&mut self, message: &Message) -> Result<()> {
        if !message.is_request() {
            return Err(AssocError::protocol("received a response without a request"));
        }

        let context = self
            .accepted
            .iter()
            .find(|c| c.id == message.context_id)
            .cloned()
            .ok_or_else(|| {
                AssocError::protocol(format!(
                    "message references unknown presentation context id {}",
                    message.context_id
                ))
            })?;

        debug!(
            "Association {} received {} on context {}",
            self.id, message.command, message.context_id
        );

        let (status, payload) = match message.command {
            CommandType::Echo => (Status::SUCCESS, Bytes::new()),
            command => match self.handlers.get(command) {
                Some(handler) => match handler.handle(&context, message).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(
                            "Handler for {} failed on association {}: {}",
                            command, self.id, e
                        );
                        (Status::PROCESSING_FAILURE, Bytes::new())
                    }
                },
                None => {
                    debug!("No handler registered for {}", command);
                    (Status::UNRECOGNIZED_OPERATION, Bytes::new())
                }
            },
        };

        self.channel
            .send(Pdu::Message(message.response(status, payload)))
            .await
    }

    /// Best-effort abort: tell the peer, then close
    async fn abort(&mut self, reason: &str) {
        self.state = SessionState::Terminated;
        let _ = self
            .channel
            .send(Pdu::Abort {
                reason: reason.to_string(),
            })
            .await;
        let _ = self.channel.close().await;
    }
}

#[async_trait]
impl PoolJob for Session {
    async fn run(self) {
        let id = self.id;
        let peer = self.peer.address.clone();
        if let Err(e) = self.serve().await {
            warn!("Association {} with {} ended with error: {}", id, peer, e);
        }
    }

    fn describe(&self) -> String {
        format!("association {} with {}", self.id, self.peer.calling_ae)
    }
}
