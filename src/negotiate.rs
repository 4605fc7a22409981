//! Association negotiation: proposal construction and evaluation
//!
//! The initiator side turns a profile into an ordered list of proposed
//! presentation contexts; the acceptor side evaluates a peer's proposal
//! against a profile and decides, per context, accept/reject/role.

use serde::{Deserialize, Serialize};

use crate::error::{AssocError, Result};
use crate::store::ProfileStore;
use crate::types::{RejectReason, Role};
use crate::MAX_CONTEXTS_PER_LIST;

/// One proposed presentation context as carried in an association request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedContext {
    /// Presentation context id: odd, starting at 1, incrementing by 2
    pub id: u8,
    /// Abstract syntax UID
    pub abstract_syntax: String,
    /// Candidate transfer syntaxes, most preferred first
    pub transfer_syntaxes: Vec<String>,
    /// Role proposed by the association requester
    pub role: Role,
}

/// One extended-negotiation payload as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedItem {
    /// Abstract syntax UID this payload applies to
    pub abstract_syntax: String,
    /// Raw service-class application information
    pub data: bytes::Bytes,
}

/// A complete proposal built from a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposed presentation contexts in profile order
    pub contexts: Vec<ProposedContext>,
    /// Extended-negotiation payloads configured for the profile
    pub extended: Vec<ExtendedItem>,
}

/// Outcome for a single proposed presentation context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextOutcome {
    /// Context accepted with the selected transfer syntax and role
    Accepted {
        /// The transfer syntax chosen by the acceptor
        transfer_syntax: String,
        /// The role granted to the association requester
        role: Role,
    },
    /// Context rejected
    Rejected {
        /// Why the context was rejected
        reason: RejectReason,
    },
}

/// Decision for one proposed presentation context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDecision {
    /// The presentation context id from the proposal
    pub id: u8,
    /// Abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// Accept or reject
    pub outcome: ContextOutcome,
}

impl ContextDecision {
    /// Check whether this context was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, ContextOutcome::Accepted { .. })
    }
}

/// The complete result of evaluating a peer proposal against a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Per-context outcomes, in proposal order
    pub contexts: Vec<ContextDecision>,
    /// Extended-negotiation payloads attached for accepted abstract syntaxes
    pub extended: Vec<ExtendedItem>,
}

impl Decision {
    /// Number of accepted presentation contexts
    pub fn accepted_count(&self) -> usize {
        self.contexts.iter().filter(|c| c.is_accepted()).count()
    }
}

/// Switches that alter evaluation behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationOptions {
    /// Treat a failed role negotiation as "unspecified" instead of rejecting
    /// the context. Off by default: a silent downgrade changes which party
    /// may originate which message types.
    pub lenient_role_negotiation: bool,
}

/// Resolve the accepted role from the peer's proposed role and the locally
/// configured preference. `None` means role negotiation fails for this
/// context; with `lenient` set, a failed negotiation downgrades to
/// `Unspecified` instead.
pub fn resolve_role(proposed: Role, preferred: Role, lenient: bool) -> Option<Role> {
    use Role::*;
    let resolved = match (proposed, preferred) {
        (Scu, Scu) => Some(Scu),
        (Scu, Scp) => None,
        (Scu, Both) => Some(Scu),
        (Scu, Unspecified) => Some(Unspecified),

        (Scp, Scu) => None,
        (Scp, Scp) => Some(Scp),
        (Scp, Both) => Some(Scp),
        (Scp, Unspecified) => Some(Unspecified),

        // A peer offering both sides concedes to whatever we prefer
        (Both, preference) => Some(preference),

        (Unspecified, Scp) => None,
        (Unspecified, _) => Some(Unspecified),
    };
    match resolved {
        None if lenient => Some(Unspecified),
        other => other,
    }
}

impl ProfileStore {
    fn resolve_profile(
        &self,
        name: &str,
    ) -> Result<(
        &[crate::store::PresentationContextItem],
        Option<&[crate::store::RoleSelectionItem]>,
        Option<&[crate::store::ExtendedNegotiationItem]>,
    )> {
        let profile = self
            .profile(name)
            .ok_or_else(|| AssocError::unresolved("profile", name))?;
        let contexts = self
            .context_list(&profile.context_key)
            .ok_or_else(|| {
                AssocError::unresolved("presentation context list", &profile.context_key)
            })?;
        let roles = match &profile.role_key {
            Some(k) => Some(
                self.role_list(k)
                    .ok_or_else(|| AssocError::unresolved("role selection list", k))?,
            ),
            None => None,
        };
        let extended = match &profile.extended_key {
            Some(k) => Some(
                self.extended_list(k)
                    .ok_or_else(|| AssocError::unresolved("extended negotiation list", k))?,
            ),
            None => None,
        };
        Ok((contexts, roles, extended))
    }

    /// Build an association proposal from the named profile.
    ///
    /// Emits one proposed context per presentation-context item, carrying
    /// the full ordered transfer-syntax list and the configured role (or
    /// `Unspecified` when none is configured), plus all configured
    /// extended-negotiation payloads.
    pub fn propose(&self, profile: &str) -> Result<Proposal> {
        let (context_items, roles, extended) = self.resolve_profile(profile)?;

        if context_items.len() > MAX_CONTEXTS_PER_LIST {
            return Err(AssocError::TooManyItems {
                list: profile.to_string(),
                limit: MAX_CONTEXTS_PER_LIST,
            });
        }

        let mut contexts = Vec::with_capacity(context_items.len());
        let mut id: u8 = 1;
        for item in context_items {
            let transfer_syntaxes = self
                .transfer_syntax_list(&item.transfer_syntax_key)
                .ok_or_else(|| {
                    AssocError::unresolved("transfer syntax list", &item.transfer_syntax_key)
                })?;
            if transfer_syntaxes.is_empty() {
                return Err(AssocError::config(format!(
                    "Transfer syntax list is empty: {}",
                    item.transfer_syntax_key
                )));
            }
            if transfer_syntaxes.len() > MAX_CONTEXTS_PER_LIST {
                return Err(AssocError::TooManyItems {
                    list: item.transfer_syntax_key.clone(),
                    limit: MAX_CONTEXTS_PER_LIST,
                });
            }

            let role = roles
                .and_then(|list| {
                    list.iter()
                        .find(|r| r.abstract_syntax == item.abstract_syntax)
                })
                .map(|r| r.role)
                .unwrap_or(Role::Unspecified);

            contexts.push(ProposedContext {
                id,
                abstract_syntax: item.abstract_syntax.clone(),
                transfer_syntaxes: transfer_syntaxes.to_vec(),
                role,
            });
            id = id.wrapping_add(2);
        }

        let extended = extended
            .map(|list| {
                list.iter()
                    .map(|e| ExtendedItem {
                        abstract_syntax: e.abstract_syntax.clone(),
                        data: e.data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Proposal { contexts, extended })
    }

    /// Evaluate a peer's proposed presentation contexts against the named
    /// profile and produce the per-context decision plus the extended
    /// payloads to attach to the response.
    pub fn evaluate(
        &self,
        profile: &str,
        proposed: &[ProposedContext],
        options: NegotiationOptions,
    ) -> Result<Decision> {
        let (context_items, roles, extended) = self.resolve_profile(profile)?;

        let mut decisions = Vec::with_capacity(proposed.len());
        for pc in proposed {
            let outcome = match context_items
                .iter()
                .find(|item| item.abstract_syntax == pc.abstract_syntax)
            {
                None => ContextOutcome::Rejected {
                    reason: RejectReason::AbstractSyntaxNotSupported,
                },
                Some(item) => {
                    let preferred = roles
                        .and_then(|list| {
                            list.iter().find(|r| r.abstract_syntax == pc.abstract_syntax)
                        })
                        .map(|r| r.role)
                        .unwrap_or(Role::Unspecified);

                    match resolve_role(pc.role, preferred, options.lenient_role_negotiation) {
                        None => ContextOutcome::Rejected {
                            reason: RejectReason::RoleSelectionFailed,
                        },
                        Some(role) => {
                            let configured = self
                                .transfer_syntax_list(&item.transfer_syntax_key)
                                .ok_or_else(|| {
                                    AssocError::unresolved(
                                        "transfer syntax list",
                                        &item.transfer_syntax_key,
                                    )
                                })?;
                            // First configured preference present among the
                            // peer's candidates wins
                            match configured
                                .iter()
                                .find(|ts| pc.transfer_syntaxes.contains(*ts))
                            {
                                Some(ts) => ContextOutcome::Accepted {
                                    transfer_syntax: ts.clone(),
                                    role,
                                },
                                None => ContextOutcome::Rejected {
                                    reason: RejectReason::TransferSyntaxesNotSupported,
                                },
                            }
                        }
                    }
                }
            };
            decisions.push(ContextDecision {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                outcome,
            });
        }

        // Extended payloads attach only where at least one context for the
        // abstract syntax was accepted; the rest drop silently
        let extended = extended
            .map(|list| {
                list.iter()
                    .filter(|e| {
                        decisions
                            .iter()
                            .any(|d| d.is_accepted() && d.abstract_syntax == e.abstract_syntax)
                    })
                    .map(|e| ExtendedItem {
                        abstract_syntax: e.abstract_syntax.clone(),
                        data: e.data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Decision {
            contexts: decisions,
            extended,
        })
    }
}
