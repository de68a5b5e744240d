//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of pure catalog logic. Missing or duplicate records are reported by
/// the store, which knows the record kind and id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A record failed validation (e.g. negative price).
    #[error("{0}")]
    Validation(String),

    /// An identifier was blank or unparseable.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_detail() {
        assert_eq!(
            DomainError::validation("price must not be negative").to_string(),
            "price must not be negative"
        );
        assert_eq!(
            DomainError::invalid_id("EntityId: empty").to_string(),
            "invalid identifier: EntityId: empty"
        );
    }
}
