//! Wire surface and channel abstraction for association traffic
//!
//! The byte-level encoding of association PDUs and application messages is
//! an external concern; this module defines the data carried across the
//! wire and a channel trait the rest of the crate talks to. The built-in
//! [`FramedChannel`] moves length-delimited JSON frames over any async
//! stream (TCP sockets, or [`tokio::io::duplex`] pairs in tests); a
//! production DICOM upper-layer codec would be another implementation of
//! the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{AssocError, Result};
use crate::negotiate::{ContextDecision, ExtendedItem, ProposedContext};
use crate::types::{CommandType, RefusalReason, Status};

/// An association request as received from the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRequest {
    /// Application context name proposed by the peer
    pub application_context: String,
    /// AE title of the requesting peer
    pub calling_ae: String,
    /// AE title the peer is addressing
    pub called_ae: String,
    /// Maximum message size the peer is willing to receive
    pub max_message_size: u32,
    /// Proposed presentation contexts
    pub contexts: Vec<ProposedContext>,
    /// Extended-negotiation payloads from the peer
    pub extended: Vec<ExtendedItem>,
}

/// The acceptor's answer to an association request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationResponse {
    /// AE title the acceptor answers with
    pub called_ae: String,
    /// Maximum message size the acceptor is willing to receive
    pub max_message_size: u32,
    /// Per-context accept/reject decisions
    pub contexts: Vec<ContextDecision>,
    /// Extended-negotiation payloads attached by the acceptor
    pub extended: Vec<ExtendedItem>,
}

/// One application message on a negotiated association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Presentation context id of the accepted context this message uses
    pub context_id: u8,
    /// The command this message carries
    pub command: CommandType,
    /// Correlation id; responses echo the id of the request they answer
    pub message_id: u16,
    /// `None` marks a request; a response carries its status here
    pub response_status: Option<Status>,
    /// Opaque message payload
    pub payload: Bytes,
}

impl Message {
    /// Create a request message
    pub fn request(context_id: u8, command: CommandType, message_id: u16, payload: Bytes) -> Self {
        Self {
            context_id,
            command,
            message_id,
            response_status: None,
            payload,
        }
    }

    /// Create the response answering this message
    pub fn response(&self, status: Status, payload: Bytes) -> Self {
        Self {
            context_id: self.context_id,
            command: self.command,
            message_id: self.message_id,
            response_status: Some(status),
            payload,
        }
    }

    /// Check whether this message is a request
    pub fn is_request(&self) -> bool {
        self.response_status.is_none()
    }
}

/// Everything that can travel over an association channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pdu {
    /// Association request (initiator to acceptor)
    Request(AssociationRequest),
    /// Association accepted, with per-context decisions
    Accept(AssociationResponse),
    /// Association refused outright
    Reject {
        /// Why the association was refused
        reason: RefusalReason,
    },
    /// An application message on an established association
    Message(Message),
    /// Graceful release requested
    ReleaseRequest,
    /// Graceful release acknowledged
    ReleaseResponse,
    /// Association aborted
    Abort {
        /// Human-readable abort cause
        reason: String,
    },
}

impl Pdu {
    /// Short PDU name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::Request(_) => "A-ASSOCIATE-RQ",
            Pdu::Accept(_) => "A-ASSOCIATE-AC",
            Pdu::Reject { .. } => "A-ASSOCIATE-RJ",
            Pdu::Message(_) => "P-DATA",
            Pdu::ReleaseRequest => "A-RELEASE-RQ",
            Pdu::ReleaseResponse => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

/// A bidirectional, message-oriented transport for one association
#[async_trait]
pub trait AssociationChannel: Send {
    /// Send one PDU to the peer
    async fn send(&mut self, pdu: Pdu) -> Result<()>;

    /// Receive the next PDU; `None` means the peer closed the transport
    async fn recv(&mut self) -> Result<Option<Pdu>>;

    /// Flush and close the transport
    async fn close(&mut self) -> Result<()>;

    /// Describe the peer endpoint (for logging)
    fn peer_addr(&self) -> &str;
}

/// Length-delimited JSON channel over any async byte stream
pub struct FramedChannel<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    peer: String,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FramedChannel<T> {
    /// Wrap a stream, bounding the frame size to `max_frame` bytes
    pub fn new(stream: T, peer: impl Into<String>, max_frame: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AssociationChannel for FramedChannel<T> {
    async fn send(&mut self, pdu: Pdu) -> Result<()> {
        let frame = serde_json::to_vec(&pdu)?;
        self.framed.send(Bytes::from(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Pdu>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(AssocError::Network(e)),
            Some(Ok(frame)) => {
                let pdu = serde_json::from_slice(&frame)
                    .map_err(|e| AssocError::protocol(format!("malformed PDU: {}", e)))?;
                Ok(Some(pdu))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.framed.close().await?;
        Ok(())
    }

    fn peer_addr(&self) -> &str {
        &self.peer
    }
}

/// Create a connected in-memory channel pair, for tests and in-process use
pub fn memory_pair(max_frame: usize) -> (FramedChannel<DuplexStream>, FramedChannel<DuplexStream>) {
    let (a, b) = tokio::io::duplex(max_frame * 2);
    (
        FramedChannel::new(a, "memory:a", max_frame),
        FramedChannel::new(b, "memory:b", max_frame),
    )
}
