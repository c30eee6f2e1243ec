//! Error type shared across the engine.

use std::fmt;

/// Broad failure category, surfaced to embedders alongside the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    /// Caller drove the protocol wrong: bad argument, option not accepted by
    /// this context kind, operation invalid in the current state.
    ClientMisuse,
    /// Input bytes do not parse: short ciphertext, bad blob subtype, broken
    /// document, missing mandatory field.
    MalformedInput,
    /// Input parsed but is refused: view collections, rejected option combos.
    Policy,
    /// A required key could not be served.
    KeyUnavailable,
    /// A collaborator (crypto provider, cache) reported failure.
    Collaborator,
}

impl ErrorKind {
    fn label(&self) -> &'static str {
        match self {
            ErrorKind::ClientMisuse => "client misuse",
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::Policy => "policy",
            ErrorKind::KeyUnavailable => "key unavailable",
            ErrorKind::Collaborator => "collaborator error",
        }
    }
}

/// Category plus a human-readable message. Contexts store the first failure
/// and report it through `Context::status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn client_misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientMisuse, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedInput, message)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, message)
    }

    pub fn key_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeyUnavailable, message)
    }

    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Collaborator, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
