//! Common types for association negotiation and DIMSE-level dispatch

use serde::{Deserialize, Serialize};

/// SCP/SCU role negotiated for one presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Association requester acts as SCU only
    Scu,
    /// Association requester acts as SCP only
    Scp,
    /// Association requester may act as both SCU and SCP
    Both,
    /// No role negotiated; the protocol default applies
    Unspecified,
}

impl Default for Role {
    fn default() -> Self {
        Role::Unspecified
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Scu => write!(f, "SCU"),
            Role::Scp => write!(f, "SCP"),
            Role::Both => write!(f, "BOTH"),
            Role::Unspecified => write!(f, "DEFAULT"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::AssocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SCU" => Ok(Role::Scu),
            "SCP" => Ok(Role::Scp),
            "BOTH" => Ok(Role::Both),
            _ => Err(crate::error::AssocError::config(format!(
                "Invalid role keyword: {}",
                s
            ))),
        }
    }
}

/// DIMSE command types carried over a negotiated association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    /// C-ECHO command (verification)
    Echo,
    /// C-FIND command
    Find,
    /// C-MOVE command
    Move,
    /// C-STORE command
    Store,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::Echo => write!(f, "C-ECHO"),
            CommandType::Find => write!(f, "C-FIND"),
            CommandType::Move => write!(f, "C-MOVE"),
            CommandType::Store => write!(f, "C-STORE"),
        }
    }
}

/// Reason sent to the peer when an association request is refused outright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// The acceptor is configured to refuse all associations
    ServiceRefused,
    /// The proposed application context name is not supported
    ApplicationContextNotSupported,
    /// The calling AE title is not recognized
    CallingAeNotRecognized,
    /// The called AE title does not match the local AE title
    CalledAeNotRecognized,
    /// Every proposed presentation context was rejected
    NoAcceptablePresentationContexts,
    /// The concurrent-association limit has been reached
    TooManyConnections,
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefusalReason::ServiceRefused => write!(f, "service refused"),
            RefusalReason::ApplicationContextNotSupported => {
                write!(f, "application context not supported")
            }
            RefusalReason::CallingAeNotRecognized => write!(f, "calling AE title not recognized"),
            RefusalReason::CalledAeNotRecognized => write!(f, "called AE title not recognized"),
            RefusalReason::NoAcceptablePresentationContexts => {
                write!(f, "no acceptable presentation contexts")
            }
            RefusalReason::TooManyConnections => write!(f, "too many concurrent associations"),
        }
    }
}

/// Reason a single presentation context was rejected during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The abstract syntax is not configured on the acceptor
    AbstractSyntaxNotSupported,
    /// None of the proposed transfer syntaxes is configured
    TransferSyntaxesNotSupported,
    /// SCP/SCU role negotiation failed for this context
    RoleSelectionFailed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AbstractSyntaxNotSupported => write!(f, "abstract syntax not supported"),
            RejectReason::TransferSyntaxesNotSupported => {
                write!(f, "transfer syntaxes not supported")
            }
            RejectReason::RoleSelectionFailed => write!(f, "role selection failed"),
        }
    }
}

/// DIMSE response status carried in message responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status(pub u16);

impl Status {
    /// Operation completed successfully
    pub const SUCCESS: Status = Status(0x0000);
    /// The command is not recognized by this peer
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    /// Processing failed on the receiving side
    pub const PROCESSING_FAILURE: Status = Status(0x0110);

    /// Check whether this status reports success
    pub fn is_success(&self) -> bool {
        self.0 == 0x0000
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}
