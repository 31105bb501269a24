use std::fmt;

/// Error kinds surfaced by the engine.
///
/// Foreground operations propagate through `anyhow::Result`; this enum exists
/// for the places a status must be *shared*: the sticky background error and
/// the status handed to every writer of a coalesced batch group. Both are
/// cloned to many observers, which `anyhow::Error` does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    Corruption(String),
    InvalidArgument(String),
    Io(String),
    NotSupported(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Corruption(msg) => write!(f, "corruption: {}", msg),
            DbError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            DbError::Io(msg) => write!(f, "io error: {}", msg),
            DbError::NotSupported(msg) => write!(f, "not supported: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

impl DbError {
    /// Flatten an `anyhow` error into a clonable kind, preserving the kind
    /// when the chain bottoms out in a `DbError`.
    pub fn from_anyhow(e: &anyhow::Error) -> Self {
        for cause in e.chain() {
            if let Some(kind) = cause.downcast_ref::<DbError>() {
                return kind.clone();
            }
        }
        DbError::Io(format!("{:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_preserves_kind() {
        let e = anyhow::Error::new(DbError::Corruption("bad block".to_string()));
        assert_eq!(
            DbError::from_anyhow(&e),
            DbError::Corruption("bad block".to_string())
        );
    }
}
