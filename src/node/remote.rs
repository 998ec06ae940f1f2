//! Nodes reached through a transport.
//!
//! Calls are encoded as a [Request], with MessagePack, and shipped by a
//! [Transport] the caller provides: HTTP, TLS and connection handling all live
//! there. The node side decodes the request and dispatches it with [serve].

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    compat::CurveName,
    derivation::DerivationPath,
    error::Error,
    keygen::KeyId,
    node::{Node, NodeError, PartialResult, PartialSignRequest, RecoveryInfoRequest},
    serde::{decode, encode},
    session::SessionId,
    topology::NodeEndpoint,
};

/// A call to a node, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    KeyGen { session: SessionId, curve: CurveName },
    PartialSign(PartialSignRequest),
    PublicKey { key_id: KeyId, path: DerivationPath },
    PartialRecoveryInfo(RecoveryInfoRequest),
}

/// A node's answer, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Version(String),
    KeyId(KeyId),
    Partial(PartialResult),
    PublicKey(Vec<u8>),
    Error(NodeError),
}

/// Moves encoded requests to a node, and its encoded responses back.
///
/// Authentication with the endpoint's [Authenticator](crate::topology::Authenticator)
/// is the transport's job.
pub trait Transport: Send + Sync {
    fn round_trip(&self, endpoint: &NodeEndpoint, request: Vec<u8>) -> Result<Vec<u8>, NodeError>;
}

/// A node on the other side of a transport.
pub struct RemoteNode<T> {
    endpoint: NodeEndpoint,
    transport: T,
}

impl<T: Transport> RemoteNode<T> {
    pub fn new(endpoint: NodeEndpoint, transport: T) -> Self {
        Self {
            endpoint,
            transport,
        }
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    fn call(&self, request: &Request) -> Result<Response, NodeError> {
        let bytes = encode(request).map_err(|e| NodeError::Malformed(e.to_string()))?;
        debug!(address = %self.endpoint.address, len = bytes.len(), "sending request");
        let reply = self.transport.round_trip(&self.endpoint, bytes)?;
        match decode::<Response>(&reply).map_err(|e| NodeError::Malformed(e.to_string()))? {
            Response::Error(e) => Err(e),
            response => Ok(response),
        }
    }
}

fn unexpected(response: Response) -> NodeError {
    NodeError::Malformed(format!("unexpected response: {response:?}"))
}

impl<T: Transport> Node for RemoteNode<T> {
    fn ping(&self) -> Result<String, NodeError> {
        match self.call(&Request::Ping)? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    fn keygen(&self, session: SessionId, curve: CurveName) -> Result<KeyId, NodeError> {
        match self.call(&Request::KeyGen { session, curve })? {
            Response::KeyId(key_id) => Ok(key_id),
            other => Err(unexpected(other)),
        }
    }

    fn partial_sign(&self, request: &PartialSignRequest) -> Result<PartialResult, NodeError> {
        match self.call(&Request::PartialSign(request.clone()))? {
            Response::Partial(partial) => Ok(partial),
            other => Err(unexpected(other)),
        }
    }

    fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>, NodeError> {
        let request = Request::PublicKey {
            key_id: key_id.clone(),
            path: path.clone(),
        };
        match self.call(&request)? {
            Response::PublicKey(der) => Ok(der),
            other => Err(unexpected(other)),
        }
    }

    fn partial_recovery_info(&self, request: &RecoveryInfoRequest) -> Result<PartialResult, NodeError> {
        match self.call(&Request::PartialRecoveryInfo(request.clone()))? {
            Response::Partial(partial) => Ok(partial),
            other => Err(unexpected(other)),
        }
    }
}

impl<T> fmt::Debug for RemoteNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Answer one encoded request with a node.
///
/// Errors from the node, and undecodable requests, are encoded into the
/// response; only a failure to encode the response itself is returned.
pub fn serve(node: &dyn Node, request: &[u8]) -> Result<Vec<u8>, Error> {
    let response = match decode::<Request>(request) {
        Err(e) => Err(NodeError::Malformed(e.to_string())),
        Ok(Request::Ping) => node.ping().map(Response::Version),
        Ok(Request::KeyGen { session, curve }) => node.keygen(session, curve).map(Response::KeyId),
        Ok(Request::PartialSign(request)) => node.partial_sign(&request).map(Response::Partial),
        Ok(Request::PublicKey { key_id, path }) => {
            node.public_key(&key_id, &path).map(Response::PublicKey)
        }
        Ok(Request::PartialRecoveryInfo(request)) => {
            node.partial_recovery_info(&request).map(Response::Partial)
        }
    };
    encode(&response.unwrap_or_else(Response::Error))
}

/// A transport delivering requests to in-process nodes, by address.
#[derive(Clone)]
pub struct LoopbackTransport {
    nodes: Arc<HashMap<String, Arc<dyn Node>>>,
}

impl LoopbackTransport {
    pub fn new(nodes: Vec<(String, Arc<dyn Node>)>) -> Self {
        Self {
            nodes: Arc::new(nodes.into_iter().collect()),
        }
    }
}

impl Transport for LoopbackTransport {
    fn round_trip(&self, endpoint: &NodeEndpoint, request: Vec<u8>) -> Result<Vec<u8>, NodeError> {
        let node = self
            .nodes
            .get(&endpoint.address)
            .ok_or_else(|| NodeError::Unreachable(format!("no node at {}", endpoint.address)))?;
        serve(node.as_ref(), &request).map_err(|e| NodeError::Malformed(e.to_string()))
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut addresses: Vec<&String> = self.nodes.keys().collect();
        addresses.sort();
        f.debug_struct("LoopbackTransport")
            .field("addresses", &addresses)
            .finish()
    }
}
