//! # Overview
//!
//! Shared vocabulary for privleap's daemon and protocol crates: the
//! identifier grammar used for action names, config filenames, and
//! user/group names, plus the `UserRef`/`GroupRef` types that let a
//! configuration value be either a textual name or a numeric id.
//!
//! # Design
//!
//! Nothing here talks to the OS. Resolving a `UserRef`/`GroupRef` against
//! the host's user database is the caller's job (`privleap-daemon::config`
//! and `privleap-daemon::exec` do this via `privleap-platform`); this crate
//! only owns the grammar and the closed representation.
//!
//! # Invariants
//!
//! - [`Identifier::parse`] accepts exactly the grammar in the wire
//!   protocol and configuration sections: non-empty, `[A-Za-z0-9._-]+`,
//!   not starting with `-`.
//! - [`UserRef`]/[`GroupRef`] never normalize case; name comparison is
//!   exact, matching the reference behavior of passwd/group lookups.
//!
//! # Errors
//!
//! [`Identifier::parse`] returns [`IdentifierError`] on any grammar
//! violation.
//!
//! # Examples
//!
//! ```
//! use privleap_core::{Identifier, UserRef};
//!
//! let id = Identifier::parse("backup-job").unwrap();
//! assert_eq!(id.as_str(), "backup-job");
//!
//! assert_eq!(UserRef::parse("1000"), UserRef::Id(1000));
//! assert_eq!(UserRef::parse("alice"), UserRef::Name("alice".to_string()));
//! ```
//!
//! # See also
//!
//! `privleap-daemon::action` for how `UserRef`/`GroupRef` compose into an
//! `Action`'s authorization policy.

use std::fmt;

/// A validated identifier: an action name, a config filename stem, or a
/// user/group name that was not recognized as purely numeric.
///
/// Grammar: non-empty, every byte in `[A-Za-z0-9._-]`, and the first byte
/// is not `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(String);

/// Error returned when a string does not satisfy the identifier grammar.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier starts with '-'")]
    LeadingHyphen,
    #[error("identifier contains disallowed byte {byte:#04x} at position {position}")]
    DisallowedByte { byte: u8, position: usize },
}

impl Identifier {
    /// Parses and validates `s` against the identifier grammar.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        if s.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if s.starts_with('-') {
            return Err(IdentifierError::LeadingHyphen);
        }
        for (position, byte) in s.bytes().enumerate() {
            if !is_identifier_byte(byte) {
                return Err(IdentifierError::DisallowedByte { byte, position });
            }
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the underlying validated string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes `self`, returning the underlying `String`.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

/// A user reference from configuration: either a textual user name or a
/// numeric UID, exactly as written in the source file.
///
/// `UserRef` does not itself validate the identifier grammar for the
/// `Name` variant beyond what [`UserRef::parse`] does — callers that need
/// the stricter grammar (e.g. the comm-endpoint filename) should also run
/// [`Identifier::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    Name(String),
    Id(u32),
}

/// A group reference from configuration: either a textual group name or a
/// numeric GID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupRef {
    Name(String),
    Id(u32),
}

impl UserRef {
    /// Parses `s` as a numeric UID if every byte is an ASCII digit,
    /// otherwise treats it as a name verbatim.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if let Some(id) = parse_numeric(s) {
            UserRef::Id(id)
        } else {
            UserRef::Name(s.to_string())
        }
    }
}

impl GroupRef {
    /// Parses `s` as a numeric GID if every byte is an ASCII digit,
    /// otherwise treats it as a name verbatim.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if let Some(id) = parse_numeric(s) {
            GroupRef::Id(id)
        } else {
            GroupRef::Name(s.to_string())
        }
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRef::Name(name) => f.write_str(name),
            UserRef::Id(id) => write!(f, "{id}"),
        }
    }
}

impl fmt::Display for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRef::Name(name) => f.write_str(name),
            GroupRef::Id(id) => write!(f, "{id}"),
        }
    }
}

/// A single severity among the four the daemon's logs use. Kept here
/// (rather than in `privleap-logging`) so that error enums throughout the
/// workspace can name a severity without depending on `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

fn parse_numeric(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
