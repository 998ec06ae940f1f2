use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::{
    compat::CurveName,
    error::Error,
    participants::Participant,
    protocol::{fan_out, PlayerCall},
    session::{SessionCoordinator, SessionId},
    topology::ThresholdClient,
};

/// Identifies a key whose shares are spread across every player.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Drives distributed key generation.
///
/// Key generation involves every player, not just a quorum: a player without
/// a share could never take part in signing with that key.
pub struct KeyGenOrchestrator<'a> {
    client: &'a ThresholdClient,
    sessions: &'a SessionCoordinator,
}

impl<'a> KeyGenOrchestrator<'a> {
    pub fn new(client: &'a ThresholdClient, sessions: &'a SessionCoordinator) -> Self {
        Self { client, sessions }
    }

    /// Generate a new key under a fresh session.
    pub fn keygen(&self, curve: CurveName) -> Result<KeyId, Error> {
        self.keygen_with_session(self.sessions.next_session(), curve)
    }

    /// Generate a new key, with every player joining the given session.
    ///
    /// Fails if any player fails; shares already created on other nodes are
    /// left to the nodes' own administration. All players must agree on the
    /// key id, a disagreement is reported and never papered over.
    pub fn keygen_with_session(&self, session: SessionId, curve: CurveName) -> Result<KeyId, Error> {
        let _span = info_span!("keygen", %session, %curve).entered();

        let calls: Vec<(Participant, PlayerCall<KeyId>)> = self
            .client
            .players()
            .map(|pc| {
                let pc = pc.clone();
                let player = pc.player();
                let call: PlayerCall<KeyId> = Box::new(move || pc.keygen(session, curve));
                (player, call)
            })
            .collect();

        let results = fan_out(calls, self.client.config().deadline)
            .map_err(|(player, cause)| Error::KeyGenFailed { player, cause })?;

        let mut results = results.into_iter();
        let (_, expected) = results.next().ok_or_else(|| {
            Error::Configuration("key generation needs at least one player".to_string())
        })?;
        for (player, found) in results {
            if found != expected {
                return Err(Error::InconsistentKeyId {
                    player,
                    expected,
                    found,
                });
            }
        }

        info!(key_id = %expected, "key generated");
        Ok(expected)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{sync::Arc, time::Duration};

    use easy_parallel::Parallel;

    use crate::{
        node::{
            remote::{LoopbackTransport, RemoteNode},
            simulated::{Fault, SimulatedCluster},
            Node, NodeError,
        },
        topology::{Authenticator, ClientConfig, ClusterTopology, NodeEndpoint},
    };

    fn setup(n: usize, t: usize) -> (SimulatedCluster, ThresholdClient) {
        let cluster = SimulatedCluster::new(n, t).with_leg_timeout(Duration::from_secs(2));
        let nodes = (0..n)
            .map(|i| NodeEndpoint::new(format!("node-{i}"), Authenticator::None))
            .collect();
        let topology = ClusterTopology::new(n, t, nodes).unwrap();
        let client = ThresholdClient::new(topology, ClientConfig::default(), cluster.nodes()).unwrap();
        (cluster, client)
    }

    #[test]
    fn test_keygen_agrees_on_key() -> Result<(), Error> {
        let (cluster, client) = setup(3, 1);
        let sessions = SessionCoordinator::default();
        let key_id = KeyGenOrchestrator::new(&client, &sessions).keygen(CurveName::Secp256k1)?;
        for p in 0..3u32 {
            assert!(cluster.holds_key(p.into(), &key_id));
        }
        Ok(())
    }

    #[test]
    fn test_one_failure_fails_keygen() -> Result<(), Error> {
        let (cluster, client) = setup(3, 1);
        let sessions = SessionCoordinator::default();
        cluster.inject(1u32.into(), Fault::Unreachable);
        match KeyGenOrchestrator::new(&client, &sessions).keygen(CurveName::Secp256k1) {
            Err(Error::KeyGenFailed { player, cause }) => {
                assert_eq!(player, 1u32.into());
                assert!(matches!(cause, NodeError::Unreachable(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_inconsistent_key_id() {
        let (cluster, client) = setup(3, 1);
        let sessions = SessionCoordinator::default();
        cluster.inject(2u32.into(), Fault::WrongKeyId);
        match KeyGenOrchestrator::new(&client, &sessions).keygen(CurveName::Secp256k1) {
            Err(Error::InconsistentKeyId { player, expected, found }) => {
                assert_eq!(player, 2u32.into());
                assert_ne!(expected, found);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_sessions_fail() {
        let (_cluster, client) = setup(2, 1);
        let sessions = SessionCoordinator::default();
        let a = sessions.next_session();
        let b = sessions.next_session();
        // Each player waits for a partner that joined another session.
        let results = Parallel::new()
            .add(|| client.player(0u32.into()).unwrap().keygen(a, CurveName::Secp256k1))
            .add(|| client.player(1u32.into()).unwrap().keygen(b, CurveName::Secp256k1))
            .run();
        assert!(results.iter().all(|r| r == &Err(NodeError::Timeout)));
    }

    #[test]
    fn test_session_cannot_be_reused() -> Result<(), Error> {
        let (_cluster, client) = setup(2, 1);
        let sessions = SessionCoordinator::default();
        let orchestrator = KeyGenOrchestrator::new(&client, &sessions);
        let session = sessions.next_session();
        orchestrator.keygen_with_session(session, CurveName::Secp256k1)?;
        assert!(matches!(
            orchestrator.keygen_with_session(session, CurveName::Secp256k1),
            Err(Error::KeyGenFailed {
                cause: NodeError::Rejected(_),
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_concurrent_keygens_share_a_client() -> Result<(), Error> {
        let (_cluster, client) = setup(3, 2);
        let sessions = SessionCoordinator::default();
        let orchestrator = KeyGenOrchestrator::new(&client, &sessions);
        let keys = Parallel::new()
            .each(0..4, |_| orchestrator.keygen(CurveName::Secp256k1))
            .run()
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        let mut unique = keys.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), keys.len());
        Ok(())
    }

    #[test]
    fn test_keygen_through_remote_nodes() -> Result<(), Error> {
        let cluster = SimulatedCluster::new(3, 1);
        let transport = LoopbackTransport::new(
            (0..3)
                .map(|i| (format!("node-{i}"), cluster.node((i as u32).into())))
                .collect(),
        );
        let nodes = (0..3)
            .map(|i| NodeEndpoint::new(format!("node-{i}"), Authenticator::None))
            .collect();
        let topology = ClusterTopology::new(3, 1, nodes)?;
        let client = ThresholdClient::connect(topology, ClientConfig::default(), |_, endpoint| {
            Arc::new(RemoteNode::new(endpoint.clone(), transport.clone())) as Arc<dyn Node>
        })?;
        let sessions = SessionCoordinator::default();
        let key_id = KeyGenOrchestrator::new(&client, &sessions).keygen(CurveName::Secp256k1)?;
        assert!(cluster.holds_key(2u32.into(), &key_id));
        Ok(())
    }
}
