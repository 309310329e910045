use std::fmt;

/// Why a cache key could not be built.
///
/// Rejecting these keeps distinct calls from collapsing onto one shared key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unknown key type `{0}`")]
    UnknownKeyType(String),
    #[error("empty {0} in cache key")]
    EmptyPart(KeyPart),
    #[error("{part} `{value}` contains the key separator `{separator}`")]
    AmbiguousPart {
        part: KeyPart,
        value: String,
        separator: String,
    },
    #[error("key separator is empty")]
    EmptySeparator,
}

/// Which part of a derived key was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    Prefix,
    KeyType,
    /// The argument at this position
    Argument(usize),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Prefix => write!(f, "prefix"),
            KeyPart::KeyType => write!(f, "key type"),
            KeyPart::Argument(idx) => write!(f, "argument {idx}"),
        }
    }
}

/// The error returned by [`crate::Cached::call`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CachedError<E> {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("fetch failed: {0}")]
    Fetch(E),
}

impl<E> CachedError<E> {
    /// The fetch error, if this was one.
    pub fn into_fetch(self) -> Option<E> {
        match self {
            CachedError::Fetch(e) => Some(e),
            CachedError::Key(_) => None,
        }
    }
}
