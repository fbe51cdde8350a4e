// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine error taxonomy.
//!
//! Everything except [`EngineError::InitFailure`] concerns a single fact or
//! record and is reported per item. A failed init is fatal to the engine
//! instance and propagated to the host.

use thiserror::Error;

/// Discovery engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sequence number not newer than the applied one. Discarded silently.
    #[error("Stale update for {0}")]
    StaleUpdate(String),

    /// Endpoint references a participant that is unknown or no longer alive.
    #[error("Unknown owner participant {0}")]
    UnknownOwner(String),

    /// Unparseable or invalid discovery payload.
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Durable apply failed; the engine continues in-memory only.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// The engine could not stand up its discovery endpoints.
    #[error("Initialization failed: {0}")]
    InitFailure(String),

    #[error("Engine already initialized")]
    AlreadyInitialized,

    #[error("Engine not initialized")]
    NotInitialized,
}

impl EngineError {
    /// True for errors that take the whole engine instance down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InitFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_init_failure_is_fatal() {
        assert!(EngineError::InitFailure("no endpoints".into()).is_fatal());
        assert!(!EngineError::UnknownOwner("x".into()).is_fatal());
        assert!(!EngineError::PersistenceFailure("disk full".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::MalformedDescriptor("zero lease".into());
        assert!(err.to_string().contains("Malformed"));
    }
}
