//! Association initiator: proposal, connection and the client association
//!
//! The SCU side builds a proposal from a profile, opens the transport,
//! negotiates, and exposes the accepted contexts plus a request/response
//! correlation facility for application messages.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AssocConfig, RemoteNode};
use crate::error::{AssocError, Result};
use crate::negotiate::{ContextOutcome, ExtendedItem};
use crate::session::{find_context, AcceptedContext};
use crate::store::ProfileStore;
use crate::transport::{
    AssociationChannel, AssociationRequest, FramedChannel, Message, Pdu,
};
use crate::types::{CommandType, RefusalReason, Role, Status};

/// Association Service Class User: negotiates outbound associations
pub struct AssocScu {
    config: AssocConfig,
    store: Arc<ProfileStore>,
}

impl AssocScu {
    /// Create a new SCU with the given configuration and profile store
    pub fn new(config: AssocConfig, store: Arc<ProfileStore>) -> Self {
        Self { config, store }
    }

    /// Open a negotiated association to a remote node using the named
    /// profile. Blocks until the peer's decision arrives or the
    /// association timeout elapses.
    pub async fn open(&self, node: &RemoteNode, profile: &str) -> Result<ClientAssociation> {
        node.validate()?;
        let proposal = self.store.propose(profile)?;

        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout());
        let addr = format!("{}:{}", node.host, node.port);

        info!(
            "Opening association to {}@{} with profile {}",
            node.ae_title, addr, profile
        );
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| AssocError::timeout(format!("connecting to {}", addr)))??;

        let max_message_size = node.max_message_size.unwrap_or(self.config.max_message_size);
        let channel = FramedChannel::new(stream, addr, max_message_size as usize);

        let request = AssociationRequest {
            application_context: crate::APPLICATION_CONTEXT_NAME.to_string(),
            calling_ae: self.config.local_aet.clone(),
            called_ae: node.ae_title.clone(),
            max_message_size,
            contexts: proposal.contexts,
            extended: proposal.extended,
        };
        self.negotiate(Box::new(channel), request).await
    }

    /// Negotiate over a pre-built channel (in-memory pairs, custom codecs)
    pub async fn open_channel(
        &self,
        channel: Box<dyn AssociationChannel>,
        called_ae: &str,
        profile: &str,
    ) -> Result<ClientAssociation> {
        let proposal = self.store.propose(profile)?;
        let request = AssociationRequest {
            application_context: crate::APPLICATION_CONTEXT_NAME.to_string(),
            calling_ae: self.config.local_aet.clone(),
            called_ae: called_ae.to_string(),
            max_message_size: self.config.max_message_size,
            contexts: proposal.contexts,
            extended: proposal.extended,
        };
        self.negotiate(channel, request).await
    }

    /// Open an association, probe the peer with C-ECHO, and release.
    /// The profile must negotiate a verification context.
    pub async fn echo(&self, node: &RemoteNode, profile: &str) -> Result<bool> {
        let mut association = self.open(node, profile).await?;
        let alive = association.echo().await?;
        association.release().await?;
        Ok(alive)
    }

    async fn negotiate(
        &self,
        mut channel: Box<dyn AssociationChannel>,
        request: AssociationRequest,
    ) -> Result<ClientAssociation> {
        channel.send(Pdu::Request(request)).await?;

        let received = timeout(self.config.association_timeout(), channel.recv())
            .await
            .map_err(|_| AssocError::timeout("association response"))??;
        let response = match received {
            Some(Pdu::Accept(response)) => response,
            Some(Pdu::Reject { reason }) => {
                let _ = channel.close().await;
                return Err(AssocError::Refused(reason));
            }
            Some(other) => {
                let _ = channel.close().await;
                return Err(AssocError::protocol(format!(
                    "expected A-ASSOCIATE-AC, got {}",
                    other.name()
                )));
            }
            None => {
                return Err(AssocError::protocol(
                    "transport closed during negotiation",
                ))
            }
        };

        let accepted: Vec<AcceptedContext> = response
            .contexts
            .iter()
            .filter_map(|d| match &d.outcome {
                ContextOutcome::Accepted {
                    transfer_syntax,
                    role,
                } => Some(AcceptedContext {
                    id: d.id,
                    abstract_syntax: d.abstract_syntax.clone(),
                    transfer_syntax: transfer_syntax.clone(),
                    role: *role,
                }),
                ContextOutcome::Rejected { .. } => None,
            })
            .collect();

        if accepted.is_empty() {
            warn!("Peer {} accepted none of the proposed contexts", response.called_ae);
            let _ = channel.send(Pdu::Abort {
                reason: "no acceptable presentation contexts".to_string(),
            })
            .await;
            let _ = channel.close().await;
            return Err(AssocError::Refused(
                RefusalReason::NoAcceptablePresentationContexts,
            ));
        }

        info!(
            "Association established with {} ({} accepted contexts)",
            response.called_ae,
            accepted.len()
        );

        Ok(ClientAssociation {
            channel,
            peer_ae: response.called_ae,
            accepted,
            extended: response.extended,
            next_message_id: 1,
            response_timeout: self.config.receive_timeout(),
            release_timeout: self.config.association_timeout(),
        })
    }
}

/// One negotiated association on the initiator side
pub struct ClientAssociation {
    channel: Box<dyn AssociationChannel>,
    peer_ae: String,
    accepted: Vec<AcceptedContext>,
    extended: Vec<ExtendedItem>,
    next_message_id: u16,
    response_timeout: Option<Duration>,
    release_timeout: Duration,
}

impl std::fmt::Debug for ClientAssociation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAssociation")
            .field("channel", &self.channel.peer_addr())
            .field("peer_ae", &self.peer_ae)
            .field("accepted", &self.accepted)
            .field("extended", &self.extended)
            .field("next_message_id", &self.next_message_id)
            .field("response_timeout", &self.response_timeout)
            .field("release_timeout", &self.release_timeout)
            .finish()
    }
}

impl ClientAssociation {
    /// AE title the acceptor answered with
    pub fn peer_ae(&self) -> &str {
        &self.peer_ae
    }

    /// The accepted presentation contexts
    pub fn accepted_contexts(&self) -> &[AcceptedContext] {
        &self.accepted
    }

    /// Extended-negotiation payloads attached by the acceptor
    pub fn extended(&self) -> &[ExtendedItem] {
        &self.extended
    }

    /// Find the accepted context matching the abstract and transfer syntax
    /// exactly; the role filter is optional and defaults to any role
    pub fn find_accepted_context(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
        role: Option<Role>,
    ) -> Option<u8> {
        find_context(&self.accepted, abstract_syntax, transfer_syntax, role)
    }

    /// Send one request on an accepted context and wait for the matching
    /// response. Responses are correlated by message id; within one
    /// association messages are strictly ordered, so a response carrying a
    /// different id is a protocol error.
    pub async fn send_request(
        &mut self,
        context_id: u8,
        command: CommandType,
        payload: Bytes,
    ) -> Result<Message> {
        if !self.accepted.iter().any(|c| c.id == context_id) {
            return Err(AssocError::protocol(format!(
                "presentation context id {} was not accepted",
                context_id
            )));
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(2);

        debug!(
            "Sending {} (message id {}) on context {}",
            command, message_id, context_id
        );
        self.channel
            .send(Pdu::Message(Message::request(
                context_id, command, message_id, payload,
            )))
            .await?;

        let received = match self.response_timeout {
            Some(limit) => timeout(limit, self.channel.recv())
                .await
                .map_err(|_| AssocError::timeout(format!("{} response", command)))??,
            None => self.channel.recv().await?,
        };
        match received {
            Some(Pdu::Message(message)) if !message.is_request() => {
                if message.message_id != message_id {
                    return Err(AssocError::protocol(format!(
                        "response correlation mismatch: expected message id {}, got {}",
                        message_id, message.message_id
                    )));
                }
                Ok(message)
            }
            Some(Pdu::Abort { reason }) => {
                Err(AssocError::protocol(format!("aborted by peer: {}", reason)))
            }
            Some(other) => Err(AssocError::protocol(format!(
                "expected a response message, got {}",
                other.name()
            ))),
            None => Err(AssocError::protocol(
                "transport closed while awaiting a response",
            )),
        }
    }

    /// Probe the peer with C-ECHO on the verification context
    pub async fn echo(&mut self) -> Result<bool> {
        let context_id = self
            .accepted
            .iter()
            .find(|c| c.abstract_syntax == crate::VERIFICATION_SOP_CLASS)
            .map(|c| c.id)
            .ok_or_else(|| {
                AssocError::config("No verification context was negotiated")
            })?;
        let response = self
            .send_request(context_id, CommandType::Echo, Bytes::new())
            .await?;
        Ok(response.response_status == Some(Status::SUCCESS))
    }

    /// Release or abort the association
    pub async fn close(self, graceful: bool) -> Result<()> {
        if graceful {
            self.release().await
        } else {
            self.abort().await
        }
    }

    /// Request a graceful release and wait for the acknowledgement
    pub async fn release(mut self) -> Result<()> {
        debug!("Releasing association with {}", self.peer_ae);
        self.channel.send(Pdu::ReleaseRequest).await?;
        let received = timeout(self.release_timeout, self.channel.recv())
            .await
            .map_err(|_| AssocError::timeout("release acknowledgement"))??;
        match received {
            Some(Pdu::ReleaseResponse) | None => {
                self.channel.close().await?;
                Ok(())
            }
            Some(other) => Err(AssocError::protocol(format!(
                "expected A-RELEASE-RP, got {}",
                other.name()
            ))),
        }
    }

    /// Abort the association and close immediately
    pub async fn abort(mut self) -> Result<()> {
        debug!("Aborting association with {}", self.peer_ae);
        let _ = self
            .channel
            .send(Pdu::Abort {
                reason: "aborted by local user".to_string(),
            })
            .await;
        self.channel.close().await?;
        Ok(())
    }
}
