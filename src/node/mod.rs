//! The capability of a single MPC node, as seen by the orchestration layer.
//!
//! What a node does internally (the secret sharing, the rounds it runs with
//! the other nodes) is opaque here. A node is something that answers five
//! calls, each of which may block until the node's leg of a distributed
//! protocol has completed.
//!
//! Two families of implementations exist: [remote::RemoteNode] forwards calls
//! over a caller provided [remote::Transport], and [simulated::SimulatedCluster]
//! runs a whole cluster in process, for tests.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    compat::CurveName, derivation::DerivationPath, keygen::KeyId, participants::Participant,
    participants::ParticipantList, session::SessionId, sign::MessageDigest,
};

pub mod remote;
pub mod simulated;

/// An error reported by, or while talking to, a single node.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NodeError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("call timed out")]
    Timeout,
    #[error("unknown key {0}")]
    UnknownKey(KeyId),
    /// The node refused the request, e.g. because of a session conflict.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// One player's contribution to a signature or a recovery.
///
/// The data is opaque and meaningless on its own; it only makes sense when
/// combined with the contributions of the rest of a quorum, produced under the
/// same session for the same key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    pub player: Participant,
    pub data: Vec<u8>,
}

impl fmt::Debug for PartialResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialResult")
            .field("player", &self.player)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The arguments of a partial signing call.
///
/// Every member of the quorum receives an identical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignRequest {
    pub session: SessionId,
    pub key_id: KeyId,
    pub path: DerivationPath,
    pub digest: MessageDigest,
    pub quorum: ParticipantList,
}

/// The arguments of a partial recovery call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfoRequest {
    pub session: SessionId,
    pub key_id: KeyId,
    /// The escrow public key, DER encoded, that shares get sealed to.
    pub escrow_public_key: Vec<u8>,
    /// Domain separation tag binding the shares to one escrow context.
    pub label: Vec<u8>,
}

impl fmt::Debug for RecoveryInfoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryInfoRequest")
            .field("session", &self.session)
            .field("key_id", &self.key_id)
            .field("label", &String::from_utf8_lossy(&self.label))
            .finish_non_exhaustive()
    }
}

/// The calls an MPC node answers.
///
/// Implementations must be safe to call from several threads at once, since
/// a fan out issues one call per node concurrently, and several operations
/// may share a node.
pub trait Node: Send + Sync {
    /// Return the version of the node software.
    fn ping(&self) -> Result<String, NodeError>;

    /// Run this node's leg of a distributed key generation.
    fn keygen(&self, session: SessionId, curve: CurveName) -> Result<KeyId, NodeError>;

    /// Produce this node's share of a signature.
    fn partial_sign(&self, request: &PartialSignRequest) -> Result<PartialResult, NodeError>;

    /// Return the DER encoded public key of a key, derived along a path.
    fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>, NodeError>;

    /// Produce this node's recovery share, sealed to an escrow public key.
    fn partial_recovery_info(
        &self,
        request: &RecoveryInfoRequest,
    ) -> Result<PartialResult, NodeError>;
}

/// A node that alters requests before forwarding them, for tests.
#[cfg(test)]
pub(crate) struct Rewriting {
    inner: std::sync::Arc<dyn Node>,
    sign: Box<dyn Fn(&mut PartialSignRequest) + Send + Sync>,
    recovery: Box<dyn Fn(&mut RecoveryInfoRequest) + Send + Sync>,
}

#[cfg(test)]
impl Rewriting {
    pub(crate) fn sign(
        inner: std::sync::Arc<dyn Node>,
        f: impl Fn(&mut PartialSignRequest) + Send + Sync + 'static,
    ) -> std::sync::Arc<dyn Node> {
        std::sync::Arc::new(Self {
            inner,
            sign: Box::new(f),
            recovery: Box::new(|_| {}),
        })
    }

    pub(crate) fn recovery(
        inner: std::sync::Arc<dyn Node>,
        f: impl Fn(&mut RecoveryInfoRequest) + Send + Sync + 'static,
    ) -> std::sync::Arc<dyn Node> {
        std::sync::Arc::new(Self {
            inner,
            sign: Box::new(|_| {}),
            recovery: Box::new(f),
        })
    }
}

#[cfg(test)]
impl Node for Rewriting {
    fn ping(&self) -> Result<String, NodeError> {
        self.inner.ping()
    }

    fn keygen(&self, session: SessionId, curve: CurveName) -> Result<KeyId, NodeError> {
        self.inner.keygen(session, curve)
    }

    fn partial_sign(&self, request: &PartialSignRequest) -> Result<PartialResult, NodeError> {
        let mut request = request.clone();
        (self.sign)(&mut request);
        self.inner.partial_sign(&request)
    }

    fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>, NodeError> {
        self.inner.public_key(key_id, path)
    }

    fn partial_recovery_info(
        &self,
        request: &RecoveryInfoRequest,
    ) -> Result<PartialResult, NodeError> {
        let mut request = request.clone();
        (self.recovery)(&mut request);
        self.inner.partial_recovery_info(&request)
    }
}
