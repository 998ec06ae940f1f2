//! The error taxonomy of the orchestration layer.
//!
//! Errors that come from one player's leg of an operation keep the player and
//! the node's own error, so operators can tell which node misbehaved.

use thiserror::Error;

use crate::{
    derivation::DerivationError, escrow::EscrowError, keygen::KeyId, node::NodeError,
    participants::Participant, recovery::RecoveryState,
};

#[derive(Debug, Error)]
pub enum Error {
    /// The topology, threshold or client setup is inconsistent.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A quorum was too small, had duplicates, or named unknown players.
    #[error("invalid quorum: {0}")]
    InvalidQuorum(String),
    /// A node could not be reached, even after a retry.
    #[error("{player} is unreachable: {cause}")]
    UnreachableNode { player: Participant, cause: NodeError },
    #[error("key generation failed at {player}: {cause}")]
    KeyGenFailed { player: Participant, cause: NodeError },
    /// Two players finished the same key generation with different key ids.
    #[error("{player} reported key {found}, but key {expected} was reported before")]
    InconsistentKeyId {
        player: Participant,
        expected: KeyId,
        found: KeyId,
    },
    #[error("partial signing failed at {player}: {cause}")]
    PartialSignFailed { player: Participant, cause: NodeError },
    /// No player could answer a public key query.
    #[error("public key query failed at {player}: {cause}")]
    PublicKeyFailed { player: Participant, cause: NodeError },
    /// Partial results could not be combined into one valid result.
    #[error("combination failed: {0}")]
    Combination(String),
    #[error("only {collected} recovery shares collected, {required} are required")]
    InsufficientRecoveryShares {
        collected: usize,
        required: usize,
        failures: Vec<(Participant, NodeError)>,
    },
    #[error("recovery validation failed: {0}")]
    RecoveryValidationFailed(String),
    #[error("key reconstruction failed: {0}")]
    Reconstruction(String),
    /// A recovery phase was run out of order, or after the attempt failed.
    #[error("recovery attempt is {found:?}, expected {expected:?}")]
    RecoveryState {
        expected: RecoveryState,
        found: RecoveryState,
    },
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl Error {
    /// Whether running the operation again, as a brand new operation, may succeed.
    ///
    /// Consistency violations are never retryable: they can indicate a faulty
    /// or malicious participant, and retrying blindly would hide that.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UnreachableNode { .. }
                | Error::KeyGenFailed { .. }
                | Error::PartialSignFailed { .. }
                | Error::PublicKeyFailed { .. }
                | Error::InsufficientRecoveryShares { .. }
        )
    }

    /// The player blamed for this error, if there is one.
    pub fn player(&self) -> Option<Participant> {
        match self {
            Error::UnreachableNode { player, .. }
            | Error::KeyGenFailed { player, .. }
            | Error::InconsistentKeyId { player, .. }
            | Error::PartialSignFailed { player, .. }
            | Error::PublicKeyFailed { player, .. } => Some(*player),
            _ => None,
        }
    }
}
