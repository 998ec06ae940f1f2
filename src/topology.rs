//! Cluster topology, and the client holding one connection per player.

use std::{fmt, sync::Arc, thread, time::Duration};

use k256::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::{
    compat::{parse_public_key, CurveName},
    derivation::DerivationPath,
    error::Error,
    keygen::KeyId,
    node::{Node, NodeError, PartialResult, PartialSignRequest, RecoveryInfoRequest},
    participants::{Participant, ParticipantList},
    protocol::{fan_out, PlayerCall},
    session::SessionId,
};

/// How a client proves its identity to a node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Authenticator {
    None,
    Password { user_id: String, password: String },
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::None => f.write_str("None"),
            Authenticator::Password { user_id, .. } => f
                .debug_struct("Password")
                .field("user_id", user_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Where one node lives, and how to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub address: String,
    pub authenticator: Authenticator,
}

impl NodeEndpoint {
    pub fn new(address: impl Into<String>, authenticator: Authenticator) -> Self {
        Self {
            address: address.into(),
            authenticator,
        }
    }
}

/// The shape of a cluster: how many players, how many may be corrupted, and where they are.
///
/// A player's position in `nodes` is its identity for the whole lifetime of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTopology")]
pub struct ClusterTopology {
    player_count: usize,
    threshold: usize,
    nodes: Vec<NodeEndpoint>,
}

#[derive(Deserialize)]
struct RawTopology {
    player_count: usize,
    threshold: usize,
    nodes: Vec<NodeEndpoint>,
}

impl TryFrom<RawTopology> for ClusterTopology {
    type Error = Error;

    fn try_from(raw: RawTopology) -> Result<Self, Self::Error> {
        Self::new(raw.player_count, raw.threshold, raw.nodes)
    }
}

impl ClusterTopology {
    pub fn new(
        player_count: usize,
        threshold: usize,
        nodes: Vec<NodeEndpoint>,
    ) -> Result<Self, Error> {
        if player_count < 2 {
            return Err(Error::Configuration(format!(
                "player count cannot be < 2, found: {player_count}"
            )));
        }
        if threshold < 1 || threshold >= player_count {
            return Err(Error::Configuration(format!(
                "threshold must be in 1..{player_count}, found: {threshold}"
            )));
        }
        if nodes.len() != player_count {
            return Err(Error::Configuration(format!(
                "expected {player_count} nodes, found: {}",
                nodes.len()
            )));
        }
        if u32::try_from(player_count).is_err() {
            return Err(Error::Configuration("too many players".to_string()));
        }
        Ok(Self {
            player_count,
            threshold,
            nodes,
        })
    }

    pub fn player_count(&self) -> usize {
        self.player_count
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The smallest number of players able to sign or recover.
    pub fn quorum_size(&self) -> usize {
        self.threshold + 1
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.nodes
    }

    /// Every player of the cluster, in order.
    pub fn participants(&self) -> Vec<Participant> {
        (0..self.player_count as u32).map(Participant::from).collect()
    }

    pub fn endpoint(&self, player: Participant) -> Option<&NodeEndpoint> {
        self.nodes.get(player.index())
    }

    /// Check that a quorum names known players and is large enough to act.
    pub fn check_quorum(&self, quorum: &ParticipantList) -> Result<(), Error> {
        if let Some(p) = quorum.iter().find(|p| p.index() >= self.player_count) {
            return Err(Error::InvalidQuorum(format!(
                "{p} is not part of a {} player cluster",
                self.player_count
            )));
        }
        if quorum.len() < self.quorum_size() {
            return Err(Error::InvalidQuorum(format!(
                "{} players cannot exceed threshold {}",
                quorum.len(),
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Tunables of the client. None of them change what an operation computes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait before the single retry of a failed ping.
    pub ping_retry_delay: Duration,
    /// Upper bound on one fan out; players that have not answered by then count as failed.
    pub deadline: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_retry_delay: Duration::from_secs(1),
            deadline: None,
        }
    }
}

/// A client for the whole cluster.
///
/// This is read only after construction, and can be shared by any number of
/// concurrent operations.
#[derive(Clone)]
pub struct ThresholdClient {
    topology: Arc<ClusterTopology>,
    config: ClientConfig,
    players: Vec<PlayerClient>,
}

impl ThresholdClient {
    /// Create a client from one node capability per player, in player order.
    ///
    /// No call is made to any node.
    pub fn new(
        topology: ClusterTopology,
        config: ClientConfig,
        nodes: Vec<Arc<dyn Node>>,
    ) -> Result<Self, Error> {
        if nodes.len() != topology.player_count() {
            return Err(Error::Configuration(format!(
                "expected {} node connections, found: {}",
                topology.player_count(),
                nodes.len()
            )));
        }
        let topology = Arc::new(topology);
        let players = topology
            .participants()
            .into_iter()
            .zip(nodes)
            .map(|(player, node)| PlayerClient {
                player,
                topology: topology.clone(),
                node,
            })
            .collect();
        Ok(Self {
            topology,
            config,
            players,
        })
    }

    /// Create a client, building each player's node from its endpoint.
    pub fn connect<F>(topology: ClusterTopology, config: ClientConfig, mut connect: F) -> Result<Self, Error>
    where
        F: FnMut(Participant, &NodeEndpoint) -> Arc<dyn Node>,
    {
        let nodes = topology
            .participants()
            .into_iter()
            .zip(topology.nodes())
            .map(|(player, endpoint)| connect(player, endpoint))
            .collect();
        Self::new(topology, config, nodes)
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A client scoped to one player's node.
    pub fn player(&self, player: Participant) -> Result<&PlayerClient, Error> {
        self.players.get(player.index()).ok_or_else(|| {
            Error::Configuration(format!(
                "{player} is not part of a {} player cluster",
                self.topology.player_count()
            ))
        })
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerClient> + '_ {
        self.players.iter()
    }

    /// Ping a node, retrying once after the configured delay.
    pub fn ping(&self, player: Participant) -> Result<String, Error> {
        self.player(player)?
            .ping_with_retry(self.config.ping_retry_delay)
            .map_err(|cause| Error::UnreachableNode { player, cause })
    }

    /// Ping every node concurrently, returning their versions in player order.
    pub fn ping_all(&self) -> Result<Vec<String>, Error> {
        let _span = info_span!("ping_all", players = self.players.len()).entered();
        let delay = self.config.ping_retry_delay;
        let calls: Vec<(Participant, PlayerCall<String>)> = self
            .players
            .iter()
            .map(|pc| {
                let pc = pc.clone();
                let player = pc.player();
                let call: PlayerCall<String> = Box::new(move || pc.ping_with_retry(delay));
                (player, call)
            })
            .collect();
        let versions = fan_out(calls, self.config.deadline)
            .map_err(|(player, cause)| Error::UnreachableNode { player, cause })?;
        info!("all nodes answered");
        Ok(versions.into_iter().map(|(_, v)| v).collect())
    }

    /// Query the DER encoded public key of a key.
    ///
    /// Public keys are not secret, so a single answer is enough: players are
    /// asked in order until one of them answers.
    pub fn public_key_der(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>, Error> {
        let mut last = None;
        for pc in &self.players {
            match pc.public_key(key_id, path) {
                Ok(der) => return Ok(der),
                Err(cause) => {
                    warn!(player = %pc.player(), %cause, "public key query failed");
                    last = Some((pc.player(), cause));
                }
            }
        }
        // The topology has at least two players, so something was recorded.
        let (player, cause) = last.unwrap_or((
            Participant::from(0u32),
            NodeError::Unreachable("no players".to_string()),
        ));
        Err(Error::PublicKeyFailed { player, cause })
    }

    /// Query and parse the public key of a key.
    pub fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<PublicKey, Error> {
        parse_public_key(&self.public_key_der(key_id, path)?)
    }
}

impl fmt::Debug for ThresholdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdClient")
            .field("topology", &self.topology)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A client bound to exactly one player's node.
///
/// It carries the cluster topology, but only ever talks to its own node.
#[derive(Clone)]
pub struct PlayerClient {
    player: Participant,
    topology: Arc<ClusterTopology>,
    node: Arc<dyn Node>,
}

impl PlayerClient {
    pub fn player(&self) -> Participant {
        self.player
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.topology.nodes()[self.player.index()]
    }

    pub fn ping(&self) -> Result<String, NodeError> {
        self.node.ping()
    }

    fn ping_with_retry(&self, delay: Duration) -> Result<String, NodeError> {
        match self.node.ping() {
            Ok(version) => Ok(version),
            Err(e) => {
                warn!(player = %self.player, error = %e, "could not ping, retrying");
                thread::sleep(delay);
                self.node.ping()
            }
        }
    }

    pub fn keygen(&self, session: SessionId, curve: CurveName) -> Result<KeyId, NodeError> {
        self.node.keygen(session, curve)
    }

    pub fn partial_sign(&self, request: &PartialSignRequest) -> Result<PartialResult, NodeError> {
        self.node.partial_sign(request)
    }

    pub fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>, NodeError> {
        self.node.public_key(key_id, path)
    }

    pub fn partial_recovery_info(
        &self,
        request: &RecoveryInfoRequest,
    ) -> Result<PartialResult, NodeError> {
        self.node.partial_recovery_info(request)
    }
}

impl fmt::Debug for PlayerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerClient")
            .field("player", &self.player)
            .field("endpoint", self.endpoint())
            .finish()
    }
}
