//! Keyed store of association negotiation profiles
//!
//! Transfer-syntax lists, presentation-context lists, role-selection lists
//! and extended-negotiation lists are held under symbolic names and composed
//! into named profiles. Cross-references between the tables are validated
//! when a profile is created, so a profile handed to the negotiation engine
//! is always internally consistent.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{AssocError, Result};
use crate::types::Role;
use crate::{MAX_CONTEXTS_PER_LIST, MAX_EXTENDED_PAYLOAD};

/// One entry of a presentation-context list: an abstract syntax paired with
/// the name of the transfer-syntax list proposed or accepted for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextItem {
    /// Abstract syntax UID
    pub abstract_syntax: String,
    /// Name of the transfer-syntax list for this context
    pub transfer_syntax_key: String,
}

/// One entry of a role-selection list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelectionItem {
    /// Abstract syntax UID this role applies to
    pub abstract_syntax: String,
    /// The role preference
    pub role: Role,
}

/// One entry of an extended-negotiation list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedNegotiationItem {
    /// Abstract syntax UID this payload applies to
    pub abstract_syntax: String,
    /// Raw service-class application information
    pub data: Bytes,
}

/// A named bundle of list references, the unit selected when negotiating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Name of the presentation-context list (required)
    pub context_key: String,
    /// Name of the role-selection list (optional)
    pub role_key: Option<String>,
    /// Name of the extended-negotiation list (optional)
    pub extended_key: Option<String>,
}

/// The five keyed tables of the association configuration
///
/// List names are matched case-insensitively. The store is built
/// incrementally by `add_*` calls and is read-only once shared with a
/// running server or client (wrap it in an `Arc` at that point).
#[derive(Debug, Default, Clone)]
pub struct ProfileStore {
    transfer_syntaxes: HashMap<String, Vec<String>>,
    contexts: HashMap<String, Vec<PresentationContextItem>>,
    roles: HashMap<String, Vec<RoleSelectionItem>>,
    extended: HashMap<String, Vec<ExtendedNegotiationItem>>,
    profiles: HashMap<String, Profile>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_uppercase()
}

impl ProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transfer syntax UID to the named list, creating the list on
    /// first use. Order expresses preference, most preferred first.
    pub fn add_transfer_syntax(
        &mut self,
        key: impl AsRef<str>,
        uid: impl Into<String>,
    ) -> Result<()> {
        let uid = uid.into();
        if uid.trim().is_empty() {
            return Err(AssocError::config("Transfer syntax UID cannot be empty"));
        }
        self.transfer_syntaxes
            .entry(normalize_key(key.as_ref()))
            .or_default()
            .push(uid);
        Ok(())
    }

    /// Append a presentation context to the named list
    pub fn add_presentation_context(
        &mut self,
        key: impl AsRef<str>,
        abstract_syntax: impl Into<String>,
        transfer_syntax_key: impl AsRef<str>,
    ) -> Result<()> {
        let abstract_syntax = abstract_syntax.into();
        if abstract_syntax.trim().is_empty() {
            return Err(AssocError::config("Abstract syntax UID cannot be empty"));
        }
        let ts_key = normalize_key(transfer_syntax_key.as_ref());
        if !self.transfer_syntaxes.contains_key(&ts_key) {
            return Err(AssocError::unresolved("transfer syntax list", ts_key));
        }

        let key = normalize_key(key.as_ref());
        let list = self.contexts.entry(key.clone()).or_default();
        if list.len() >= MAX_CONTEXTS_PER_LIST {
            return Err(AssocError::TooManyItems {
                list: key,
                limit: MAX_CONTEXTS_PER_LIST,
            });
        }
        list.push(PresentationContextItem {
            abstract_syntax,
            transfer_syntax_key: ts_key,
        });
        Ok(())
    }

    /// Append a role selection to the named list. At most one entry per
    /// abstract syntax is allowed within one list.
    pub fn add_role(
        &mut self,
        key: impl AsRef<str>,
        abstract_syntax: impl Into<String>,
        role: Role,
    ) -> Result<()> {
        let abstract_syntax = abstract_syntax.into();
        if abstract_syntax.trim().is_empty() {
            return Err(AssocError::config("Abstract syntax UID cannot be empty"));
        }
        let list = self.roles.entry(normalize_key(key.as_ref())).or_default();
        if list.iter().any(|r| r.abstract_syntax == abstract_syntax) {
            return Err(AssocError::config(format!(
                "Duplicate role selection for abstract syntax {}",
                abstract_syntax
            )));
        }
        list.push(RoleSelectionItem {
            abstract_syntax,
            role,
        });
        Ok(())
    }

    /// Append an extended-negotiation payload to the named list. At most one
    /// entry per abstract syntax is allowed within one list, and the payload
    /// is limited to 1024 bytes.
    pub fn add_extended_negotiation(
        &mut self,
        key: impl AsRef<str>,
        abstract_syntax: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let abstract_syntax = abstract_syntax.into();
        if abstract_syntax.trim().is_empty() {
            return Err(AssocError::config("Abstract syntax UID cannot be empty"));
        }
        let data = data.into();
        if data.len() > MAX_EXTENDED_PAYLOAD {
            return Err(AssocError::config(format!(
                "Extended negotiation payload for {} exceeds {} bytes",
                abstract_syntax, MAX_EXTENDED_PAYLOAD
            )));
        }
        let list = self
            .extended
            .entry(normalize_key(key.as_ref()))
            .or_default();
        if list.iter().any(|e| e.abstract_syntax == abstract_syntax) {
            return Err(AssocError::config(format!(
                "Duplicate extended negotiation for abstract syntax {}",
                abstract_syntax
            )));
        }
        list.push(ExtendedNegotiationItem {
            abstract_syntax,
            data,
        });
        Ok(())
    }

    /// Create a named profile referencing a presentation-context list and,
    /// optionally, a role-selection list and an extended-negotiation list.
    ///
    /// All references are resolved here: the context list must exist, and
    /// every abstract syntax mentioned by the optional lists must appear in
    /// the context list. Nothing is stored if any check fails.
    pub fn add_profile(
        &mut self,
        name: impl AsRef<str>,
        context_key: impl AsRef<str>,
        role_key: Option<&str>,
        extended_key: Option<&str>,
    ) -> Result<()> {
        let context_key = normalize_key(context_key.as_ref());
        let context_list = self
            .contexts
            .get(&context_key)
            .ok_or_else(|| AssocError::unresolved("presentation context list", &context_key))?;

        let role_key = match role_key {
            Some(k) => {
                let k = normalize_key(k);
                let list = self
                    .roles
                    .get(&k)
                    .ok_or_else(|| AssocError::unresolved("role selection list", &k))?;
                for item in list {
                    if !context_list
                        .iter()
                        .any(|c| c.abstract_syntax == item.abstract_syntax)
                    {
                        return Err(AssocError::unresolved(
                            "abstract syntax in role selection list",
                            &item.abstract_syntax,
                        ));
                    }
                }
                Some(k)
            }
            None => None,
        };

        let extended_key = match extended_key {
            Some(k) => {
                let k = normalize_key(k);
                let list = self
                    .extended
                    .get(&k)
                    .ok_or_else(|| AssocError::unresolved("extended negotiation list", &k))?;
                for item in list {
                    if !context_list
                        .iter()
                        .any(|c| c.abstract_syntax == item.abstract_syntax)
                    {
                        return Err(AssocError::unresolved(
                            "abstract syntax in extended negotiation list",
                            &item.abstract_syntax,
                        ));
                    }
                }
                Some(k)
            }
            None => None,
        };

        self.profiles.insert(
            normalize_key(name.as_ref()),
            Profile {
                context_key,
                role_key,
                extended_key,
            },
        );
        Ok(())
    }

    /// Check whether a profile with this name exists
    pub fn is_known_profile(&self, name: impl AsRef<str>) -> bool {
        self.profiles.contains_key(&normalize_key(name.as_ref()))
    }

    /// Check whether the named profile is usable on the acceptor side.
    ///
    /// A profile whose context list repeats an abstract syntax is valid for
    /// an initiator (multiple transfer-syntax sets may be tried) but not for
    /// an acceptor, which must answer unambiguously per abstract syntax.
    /// Returns false for unknown profiles.
    pub fn is_server_profile(&self, name: impl AsRef<str>) -> bool {
        let Some(profile) = self.profiles.get(&normalize_key(name.as_ref())) else {
            return false;
        };
        let Some(list) = self.contexts.get(&profile.context_key) else {
            return false;
        };
        for (i, outer) in list.iter().enumerate() {
            if list[i + 1..]
                .iter()
                .any(|inner| inner.abstract_syntax == outer.abstract_syntax)
            {
                return false;
            }
        }
        true
    }

    /// Find an existing transfer-syntax list whose ordered contents exactly
    /// match the given sequence; used to intern duplicate lists. When more
    /// than one list matches, the lexicographically smallest name wins so
    /// repeated calls always agree.
    pub fn find_transfer_syntax_key<S: AsRef<str>>(&self, contents: &[S]) -> Option<&str> {
        let mut keys: Vec<&String> = self
            .transfer_syntaxes
            .iter()
            .filter(|(_, uids)| {
                uids.len() == contents.len()
                    && uids
                        .iter()
                        .zip(contents.iter())
                        .all(|(a, b)| a == b.as_ref())
            })
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys.first().map(|k| k.as_str())
    }

    /// Reset the store to empty
    pub fn clear(&mut self) {
        self.transfer_syntaxes.clear();
        self.contexts.clear();
        self.roles.clear();
        self.extended.clear();
        self.profiles.clear();
    }

    /// Look up a transfer-syntax list by name
    pub fn transfer_syntax_list(&self, key: impl AsRef<str>) -> Option<&[String]> {
        self.transfer_syntaxes
            .get(&normalize_key(key.as_ref()))
            .map(|v| v.as_slice())
    }

    /// Look up a presentation-context list by name
    pub fn context_list(&self, key: impl AsRef<str>) -> Option<&[PresentationContextItem]> {
        self.contexts
            .get(&normalize_key(key.as_ref()))
            .map(|v| v.as_slice())
    }

    /// Look up a role-selection list by name
    pub fn role_list(&self, key: impl AsRef<str>) -> Option<&[RoleSelectionItem]> {
        self.roles
            .get(&normalize_key(key.as_ref()))
            .map(|v| v.as_slice())
    }

    /// Look up an extended-negotiation list by name
    pub fn extended_list(&self, key: impl AsRef<str>) -> Option<&[ExtendedNegotiationItem]> {
        self.extended
            .get(&normalize_key(key.as_ref()))
            .map(|v| v.as_slice())
    }

    /// Look up a profile by name
    pub fn profile(&self, name: impl AsRef<str>) -> Option<&Profile> {
        self.profiles.get(&normalize_key(name.as_ref()))
    }
}
