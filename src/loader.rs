//! Loader for the bracket-delimited association profile file format
//!
//! The format has three levels: `[[Section]]` opens one of the five
//! top-level tables, `[Name]` opens a named list (or profile) within it,
//! and `KEY = VALUE` entries populate the current list. Numbered entry
//! keys (`TransferSyntax1`, `PresentationContext1`, `Role1`,
//! `ExtendedNegotiation1`, …) must be contiguous starting at 1. Keys are
//! matched case-insensitively with surrounding whitespace stripped; `#`
//! starts a comment line. Any malformed line is a hard parse error, not a
//! skipped line.
//!
//! Profiles reference lists by name, so the `[[Profiles]]` section must
//! come after the lists it refers to.

use std::path::Path;

use crate::error::{AssocError, Result};
use crate::store::ProfileStore;
use crate::types::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    TransferSyntaxes,
    PresentationContexts,
    RoleSelection,
    ExtendedNegotiation,
    Profiles,
}

impl Section {
    fn parse(name: &str, line: usize) -> Result<Self> {
        match name.trim().to_uppercase().as_str() {
            "TRANSFERSYNTAXES" => Ok(Section::TransferSyntaxes),
            "PRESENTATIONCONTEXTS" => Ok(Section::PresentationContexts),
            "ROLESELECTION" => Ok(Section::RoleSelection),
            "EXTENDEDNEGOTIATION" => Ok(Section::ExtendedNegotiation),
            "PROFILES" => Ok(Section::Profiles),
            other => Err(AssocError::parse(
                line,
                format!("unknown section name: {}", other),
            )),
        }
    }

    fn entry_prefix(self) -> &'static str {
        match self {
            Section::TransferSyntaxes => "TRANSFERSYNTAX",
            Section::PresentationContexts => "PRESENTATIONCONTEXT",
            Section::RoleSelection => "ROLE",
            Section::ExtendedNegotiation => "EXTENDEDNEGOTIATION",
            Section::Profiles => "",
        }
    }
}

#[derive(Debug, Default)]
struct PendingProfile {
    name: String,
    opened_at: usize,
    context_key: Option<String>,
    role_key: Option<String>,
    extended_key: Option<String>,
}

struct Loader<'a> {
    store: &'a mut ProfileStore,
    section: Option<Section>,
    list_name: Option<String>,
    entry_count: usize,
    pending_profile: Option<PendingProfile>,
}

impl<'a> Loader<'a> {
    fn new(store: &'a mut ProfileStore) -> Self {
        Self {
            store,
            section: None,
            list_name: None,
            entry_count: 0,
            pending_profile: None,
        }
    }

    fn run(&mut self, input: &str) -> Result<()> {
        for (idx, raw) in input.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(name) = section_header(trimmed, "[[", "]]") {
                self.commit_pending_profile()?;
                self.section = Some(Section::parse(name, line)?);
                self.list_name = None;
                self.entry_count = 0;
            } else if let Some(name) = section_header(trimmed, "[", "]") {
                let Some(section) = self.section else {
                    return Err(AssocError::parse(
                        line,
                        "list name outside of any [[Section]]",
                    ));
                };
                self.commit_pending_profile()?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(AssocError::parse(line, "empty list name"));
                }
                if section == Section::Profiles {
                    self.pending_profile = Some(PendingProfile {
                        name: name.to_string(),
                        opened_at: line,
                        ..Default::default()
                    });
                }
                self.list_name = Some(name.to_string());
                self.entry_count = 0;
            } else {
                self.entry(trimmed, line)?;
            }
        }
        self.commit_pending_profile()
    }

    fn entry(&mut self, text: &str, line: usize) -> Result<()> {
        let Some(section) = self.section else {
            return Err(AssocError::parse(line, "entry outside of any [[Section]]"));
        };
        let (key, value) = text.split_once('=').ok_or_else(|| {
            AssocError::parse(line, "missing '=' between key and value")
        })?;
        let key = key.trim().to_uppercase();
        let value = value.trim();

        if section == Section::Profiles {
            return self.profile_entry(&key, value, line);
        }

        let list = self
            .list_name
            .clone()
            .ok_or_else(|| AssocError::parse(line, "entry outside of any [Name] list"))?;
        let index = numbered_key(&key, section.entry_prefix())
            .ok_or_else(|| {
                AssocError::parse(
                    line,
                    format!("expected {}<n> entry key, got {}", section.entry_prefix(), key),
                )
            })?;
        if index != self.entry_count + 1 {
            return Err(AssocError::parse(
                line,
                format!(
                    "entry numbers must be contiguous: expected {}{}, got {}{}",
                    section.entry_prefix(),
                    self.entry_count + 1,
                    section.entry_prefix(),
                    index
                ),
            ));
        }

        match section {
            Section::TransferSyntaxes => {
                if value.is_empty() {
                    return Err(AssocError::parse(line, "empty transfer syntax UID"));
                }
                self.store.add_transfer_syntax(&list, value)?;
            }
            Section::PresentationContexts => {
                let (abstract_syntax, ts_key) = split_fields(value, line)?;
                self.store
                    .add_presentation_context(&list, abstract_syntax, ts_key)?;
            }
            Section::RoleSelection => {
                let (abstract_syntax, role) = split_fields(value, line)?;
                let role: Role = role
                    .parse()
                    .map_err(|_| AssocError::parse(line, format!("invalid role keyword: {}", role)))?;
                self.store.add_role(&list, abstract_syntax, role)?;
            }
            Section::ExtendedNegotiation => {
                let (abstract_syntax, hex) = split_fields(value, line)?;
                let data = parse_hex_pairs(hex, line)?;
                self.store
                    .add_extended_negotiation(&list, abstract_syntax, data)?;
            }
            Section::Profiles => unreachable!(),
        }
        self.entry_count = index;
        Ok(())
    }

    fn profile_entry(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        let pending = self
            .pending_profile
            .as_mut()
            .ok_or_else(|| AssocError::parse(line, "entry outside of any [Name] profile"))?;
        if value.is_empty() {
            return Err(AssocError::parse(line, format!("empty value for {}", key)));
        }
        let slot = match key {
            "PRESENTATIONCONTEXTS" => &mut pending.context_key,
            "ROLES" => &mut pending.role_key,
            "EXTENDEDNEGOTIATION" => &mut pending.extended_key,
            other => {
                return Err(AssocError::parse(
                    line,
                    format!("unknown profile key: {}", other),
                ))
            }
        };
        if slot.is_some() {
            return Err(AssocError::parse(line, format!("duplicate key: {}", key)));
        }
        *slot = Some(value.to_string());
        Ok(())
    }

    fn commit_pending_profile(&mut self) -> Result<()> {
        let Some(pending) = self.pending_profile.take() else {
            return Ok(());
        };
        let context_key = pending.context_key.ok_or_else(|| {
            AssocError::parse(
                pending.opened_at,
                format!("profile {} lacks a PresentationContexts key", pending.name),
            )
        })?;
        self.store.add_profile(
            &pending.name,
            &context_key,
            pending.role_key.as_deref(),
            pending.extended_key.as_deref(),
        )
    }
}

fn section_header<'t>(text: &'t str, open: &str, close: &str) -> Option<&'t str> {
    text.strip_prefix(open)?.strip_suffix(close)
}

/// Parse `PREFIXn` into `n`; None if the prefix or number is malformed
fn numbered_key(key: &str, prefix: &str) -> Option<usize> {
    let digits = key.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Split a two-field value at the single backslash separator
fn split_fields(value: &str, line: usize) -> Result<(&str, &str)> {
    let (first, second) = value
        .split_once('\\')
        .ok_or_else(|| AssocError::parse(line, "missing '\\' field separator"))?;
    let (first, second) = (first.trim(), second.trim());
    if first.is_empty() {
        return Err(AssocError::parse(line, "empty first field"));
    }
    Ok((first, second))
}

/// Decode a sequence of hex pairs, tolerating whitespace between bytes
fn parse_hex_pairs(hex: &str, line: usize) -> Result<Vec<u8>> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(AssocError::parse(line, "odd number of hex digits"));
    }
    let mut out = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let hi = hex_value(pair[0]).ok_or_else(|| {
            AssocError::parse(line, format!("invalid hex digit: {}", pair[0] as char))
        })?;
        let lo = hex_value(pair[1]).ok_or_else(|| {
            AssocError::parse(line, format!("invalid hex digit: {}", pair[1] as char))
        })?;
        out.push(hi << 4 | lo);
    }
    Ok(out)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parse a profile configuration from a string into the store
pub fn load_profiles_str(input: &str, store: &mut ProfileStore) -> Result<()> {
    Loader::new(store).run(input)
}

/// Parse a profile configuration file into the store
pub fn load_profiles_file(path: impl AsRef<Path>, store: &mut ProfileStore) -> Result<()> {
    let input = std::fs::read_to_string(path)?;
    load_profiles_str(&input, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    const SAMPLE: &str = r#"
# Storage SCP profile configuration

[[TransferSyntaxes]]
[Uncompressed]
TransferSyntax1 = 1.2.840.10008.1.2.1
TransferSyntax2 = 1.2.840.10008.1.2

[[PresentationContexts]]
[StoragePlusEcho]
PresentationContext1 = 1.2.840.10008.1.1\Uncompressed
PresentationContext2 = 1.2.840.10008.5.1.4.1.1.2\Uncompressed

[[RoleSelection]]
[StorageRoles]
Role1 = 1.2.840.10008.5.1.4.1.1.2\SCP

[[ExtendedNegotiation]]
[StorageExt]
ExtendedNegotiation1 = 1.2.840.10008.5.1.4.1.1.2\00 01 FF

[[Profiles]]
[Default]
PresentationContexts = StoragePlusEcho
Roles = StorageRoles
ExtendedNegotiation = StorageExt
"#;

    #[test]
    fn test_load_sample() {
        let mut store = ProfileStore::new();
        load_profiles_str(SAMPLE, &mut store).unwrap();

        assert_eq!(
            store.transfer_syntax_list("Uncompressed").unwrap(),
            &[
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2".to_string()
            ]
        );
        assert_eq!(store.context_list("StoragePlusEcho").unwrap().len(), 2);
        let roles = store.role_list("StorageRoles").unwrap();
        assert_eq!(roles[0].role, Role::Scp);
        let ext = store.extended_list("StorageExt").unwrap();
        assert_eq!(&ext[0].data[..], &[0x00, 0x01, 0xFF]);
        assert!(store.is_known_profile("Default"));
        assert!(store.is_server_profile("Default"));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let mut store = ProfileStore::new();
        let input = "[[transfersyntaxes]]\n[ts]\ntransfersyntax1 = 1.2\n";
        load_profiles_str(input, &mut store).unwrap();
        assert!(store.transfer_syntax_list("TS").is_some());
    }

    #[test]
    fn test_entry_number_gap_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[TransferSyntaxes]]\n[TS]\nTransferSyntax1 = 1.2\nTransferSyntax3 = 1.3\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 4, .. }));
    }

    #[test]
    fn test_numbering_restarts_per_list() {
        let mut store = ProfileStore::new();
        let input = "[[TransferSyntaxes]]\n[A]\nTransferSyntax1 = 1.2\n[B]\nTransferSyntax1 = 1.3\n";
        load_profiles_str(input, &mut store).unwrap();
        assert!(store.transfer_syntax_list("A").is_some());
        assert!(store.transfer_syntax_list("B").is_some());
    }

    #[test]
    fn test_missing_separator_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[TransferSyntaxes]]\n[TS]\nTransferSyntax1 1.2\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_missing_backslash_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[TransferSyntaxes]]\n[TS]\nTransferSyntax1 = 1.2\n\
                     [[PresentationContexts]]\n[C]\nPresentationContext1 = 1.2.3 TS\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 6, .. }));
    }

    #[test]
    fn test_bad_role_keyword_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[RoleSelection]]\n[R]\nRole1 = 1.2.3\\NEITHER\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_odd_hex_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[ExtendedNegotiation]]\n[E]\nExtendedNegotiation1 = 1.2.3\\00F\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_invalid_hex_digit_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[ExtendedNegotiation]]\n[E]\nExtendedNegotiation1 = 1.2.3\\0G\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_unknown_section_is_an_error() {
        let mut store = ProfileStore::new();
        let err = load_profiles_str("[[Wurst]]\n", &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_entry_outside_section_is_an_error() {
        let mut store = ProfileStore::new();
        let err = load_profiles_str("Key = Value\n", &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_profile_without_contexts_is_an_error() {
        let mut store = ProfileStore::new();
        let input = "[[Profiles]]\n[Broken]\nRoles = Nope\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_profile_with_unknown_list_fails() {
        let mut store = ProfileStore::new();
        let input = "[[Profiles]]\n[P]\nPresentationContexts = Missing\n";
        let err = load_profiles_str(input, &mut store).unwrap_err();
        assert!(matches!(err, AssocError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assoc.cfg");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut store = ProfileStore::new();
        load_profiles_file(&path, &mut store).unwrap();
        assert!(store.is_known_profile("Default"));
    }
}
