//! DICOM upper-layer association negotiation and concurrent SCP services
//!
//! This crate implements the association layer of a DICOM network service:
//! named, reusable negotiation profiles (transfer syntaxes, presentation
//! contexts, role selections, extended negotiation), the accept/reject
//! evaluation algorithm, and both sides of the association lifecycle.
//!
//! # Features
//! - [`ProfileStore`]: keyed configuration tables composed into profiles,
//!   loadable from the bracket-delimited profile file format
//! - Negotiation engine: proposal construction for the initiator,
//!   per-context evaluation (including SCP/SCU role resolution) for the
//!   acceptor
//! - [`AssocScp`]: accept loop serving many associations concurrently on a
//!   bounded pool of reusable workers, with graceful stop and drain
//! - [`AssocScu`]: client side with accepted-context lookup and
//!   request/response correlation
//!
//! The byte-level DIMSE codecs and the dataset object model stay outside
//! this crate; traffic flows through the [`transport::AssociationChannel`]
//! seam.

pub mod config;
pub mod error;
pub mod loader;
pub mod negotiate;
pub mod pool;
pub mod scp;
pub mod scu;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{AssocConfig, RemoteNode};
pub use error::{AssocError, Result};
pub use negotiate::{Decision, NegotiationOptions, Proposal};
pub use scp::{AssocScp, StopHandle};
pub use scu::{AssocScu, ClientAssociation};
pub use session::{AcceptedContext, HandlerRegistry, MessageHandler, Session};
pub use store::ProfileStore;
pub use types::{CommandType, RefusalReason, RejectReason, Role, Status};

/// Default DICOM port (non-TLS)
pub const DEFAULT_PORT: u16 = 11112;

/// The DICOM application context name; the only top-level protocol
/// context this implementation speaks
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Verification SOP class UID, the abstract syntax of the built-in
/// C-ECHO liveness check
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Presentation-context lists are capped by the protocol at 128 entries
pub const MAX_CONTEXTS_PER_LIST: usize = 128;

/// Extended-negotiation payloads are capped at 1024 bytes
pub const MAX_EXTENDED_PAYLOAD: usize = 1024;
