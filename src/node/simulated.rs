//! A whole cluster, simulated in process.
//!
//! This is a test double, for tests, benches and demos: the last node to
//! arrive deals every secret as a trusted dealer, which no real cluster does.
//!
//! Each [SimulatedNode] answers the [Node] calls for one player. The
//! distributed parts of keygen and signing are simulated with rendezvous
//! rooms, one per session: every player's call deposits its contribution and
//! blocks until the whole room is present, at which point the last arrival
//! deals everybody's output. Once every output is collected the room is
//! closed, keeping only its session id, so a session can only ever be used
//! once. A cluster therefore grows by one session id per operation, and is
//! meant to live as long as a test, not as long as a service.
//!
//! Faults can be injected per player to exercise the failure paths of the
//! orchestrators.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use elliptic_curve::Field;
use event_listener::Event;
use k256::{AffinePoint, ProjectivePoint, Scalar};
use rand_core::{CryptoRngCore, OsRng, RngCore};

use crate::{
    compat::{digest_scalar, public_key_to_der, x_coordinate, CurveName},
    derivation::{derive, ChainCode, DerivationPath},
    escrow::seal,
    keygen::KeyId,
    math::Polynomial,
    node::{Node, NodeError, PartialResult, PartialSignRequest, RecoveryInfoRequest},
    participants::{Participant, ParticipantList},
    recovery::{escrow_binding, share_context, RecoveryShare},
    session::SessionId,
    sign::{signing_context, SignatureShare},
};

const DEFAULT_LEG_TIMEOUT: Duration = Duration::from_secs(10);

/// Misbehavior to inject into one player's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails as if the node were down.
    Unreachable,
    /// The next pings fail, then the node recovers.
    FailPings(usize),
    /// Every call but ping is refused.
    RejectAll,
    /// Key generation completes, but reports a forged key id.
    WrongKeyId,
    /// Signature shares are off by one.
    CorruptSignatureShare,
}

#[derive(Clone)]
struct KeyShare {
    curve: CurveName,
    threshold: usize,
    x_i: Scalar,
    public_key: AffinePoint,
    chain_code: ChainCode,
}

#[derive(Default)]
struct NodeState {
    keys: HashMap<KeyId, KeyShare>,
    fault: Option<Fault>,
}

struct KeyGenRoom {
    curve: CurveName,
    joined: Vec<Participant>,
    outputs: HashMap<Participant, (KeyId, KeyShare)>,
}

struct SignRoom {
    context: [u8; 32],
    quorum: ParticipantList,
    threshold: usize,
    deposits: Vec<(Participant, Scalar)>,
    /// The nonce point, and each player's shares of `k` and `k * x`.
    outputs: HashMap<Participant, (AffinePoint, Scalar, Scalar)>,
}

enum Room {
    KeyGen(KeyGenRoom),
    Sign(SignRoom),
    /// Every output was handed out.
    Closed,
}

fn used_elsewhere(room: &Room) -> NodeError {
    match room {
        Room::Closed => NodeError::Rejected("session was already used".to_string()),
        _ => NodeError::Rejected("session is used by another operation".to_string()),
    }
}

struct Shared {
    player_count: usize,
    threshold: usize,
    nodes: Vec<Mutex<NodeState>>,
    rooms: Mutex<HashMap<SessionId, Room>>,
    event: Event,
    rng: Mutex<Box<dyn CryptoRngCore + Send>>,
    leg_timeout: Mutex<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn random_bytes<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        lock(&self.rng).fill_bytes(&mut out);
        out
    }

    /// Block until `poll` produces an outcome, or the leg times out.
    ///
    /// `poll` runs with the rooms locked, and is rerun whenever a room changes.
    fn wait<T>(
        &self,
        mut poll: impl FnMut(&mut HashMap<SessionId, Room>) -> Option<Result<T, NodeError>>,
    ) -> Result<T, NodeError> {
        let deadline = Instant::now() + *lock(&self.leg_timeout);
        loop {
            let listener = {
                let mut rooms = lock(&self.rooms);
                if let Some(out) = poll(&mut rooms) {
                    return out;
                }
                self.event.listen()
            };
            if !listener.wait_deadline(deadline) {
                return Err(NodeError::Timeout);
            }
        }
    }

    fn deal_key(&self, curve: CurveName) -> HashMap<Participant, (KeyId, KeyShare)> {
        let key_id = KeyId::from(hex::encode(self.random_bytes::<16>()));
        let chain_code = ChainCode::from_bytes(self.random_bytes::<32>());
        let f = Polynomial::random(&mut *lock(&self.rng), self.threshold + 1);
        let public_key = (ProjectivePoint::GENERATOR * f.evaluate_zero()).to_affine();

        (0..self.player_count as u32)
            .map(Participant::from)
            .map(|p| {
                let share = KeyShare {
                    curve,
                    threshold: self.threshold,
                    x_i: f.evaluate(&p.scalar()),
                    public_key,
                    chain_code,
                };
                (p, (key_id.clone(), share))
            })
            .collect()
    }

    fn deal_presignature(&self, room: &SignRoom) -> HashMap<Participant, (AffinePoint, Scalar, Scalar)> {
        let mut x = Scalar::ZERO;
        for (p, x_p) in &room.deposits {
            x += room.quorum.lagrange(*p) * x_p;
        }

        let mut rng = lock(&self.rng);
        let (k, k_inv) = loop {
            let k = Scalar::random(&mut *rng);
            if let Some(k_inv) = Option::<Scalar>::from(k.invert()) {
                break (k, k_inv);
            }
        };
        let big_r = (ProjectivePoint::GENERATOR * k_inv).to_affine();
        let g = Polynomial::extend_random(&mut *rng, room.threshold + 1, &k);
        let h = Polynomial::extend_random(&mut *rng, room.threshold + 1, &(k * x));

        room.quorum
            .iter()
            .map(|p| (p, (big_r, g.evaluate(&p.scalar()), h.evaluate(&p.scalar()))))
            .collect()
    }
}

/// An in-process cluster of simulated nodes, for tests.
#[derive(Clone)]
pub struct SimulatedCluster {
    shared: Arc<Shared>,
}

impl SimulatedCluster {
    pub fn new(player_count: usize, threshold: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                player_count,
                threshold,
                nodes: (0..player_count).map(|_| Mutex::default()).collect(),
                rooms: Mutex::default(),
                event: Event::new(),
                rng: Mutex::new(Box::new(OsRng)),
                leg_timeout: Mutex::new(DEFAULT_LEG_TIMEOUT),
            }),
        }
    }

    /// Use a specific source of randomness for every secret the cluster deals.
    pub fn with_rng(self, rng: impl CryptoRngCore + Send + 'static) -> Self {
        *lock(&self.shared.rng) = Box::new(rng);
        self
    }

    /// How long a node waits for the rest of its session before timing out.
    pub fn with_leg_timeout(self, timeout: Duration) -> Self {
        *lock(&self.shared.leg_timeout) = timeout;
        self
    }

    pub fn player_count(&self) -> usize {
        self.shared.player_count
    }

    pub fn node(&self, player: Participant) -> Arc<dyn Node> {
        Arc::new(SimulatedNode {
            player,
            shared: self.shared.clone(),
        })
    }

    /// One node per player, in player order.
    pub fn nodes(&self) -> Vec<Arc<dyn Node>> {
        (0..self.shared.player_count as u32)
            .map(|i| self.node(i.into()))
            .collect()
    }

    pub fn inject(&self, player: Participant, fault: Fault) {
        if let Some(state) = self.shared.nodes.get(player.index()) {
            lock(state).fault = Some(fault);
        }
    }

    pub fn clear(&self, player: Participant) {
        if let Some(state) = self.shared.nodes.get(player.index()) {
            lock(state).fault = None;
        }
    }

    /// Whether a player holds a share of a key.
    pub fn holds_key(&self, player: Participant, key_id: &KeyId) -> bool {
        self.shared
            .nodes
            .get(player.index())
            .map(|state| lock(state).keys.contains_key(key_id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for SimulatedCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCluster")
            .field("player_count", &self.shared.player_count)
            .field("threshold", &self.shared.threshold)
            .finish_non_exhaustive()
    }
}

/// One player's node in a [SimulatedCluster].
pub struct SimulatedNode {
    player: Participant,
    shared: Arc<Shared>,
}

impl SimulatedNode {
    fn state(&self) -> Result<MutexGuard<'_, NodeState>, NodeError> {
        self.shared
            .nodes
            .get(self.player.index())
            .map(lock)
            .ok_or_else(|| NodeError::Unreachable(format!("no node for {}", self.player)))
    }

    fn fault(&self) -> Result<Option<Fault>, NodeError> {
        Ok(self.state()?.fault)
    }

    /// Apply the faults shared by every call but ping.
    fn gate(&self) -> Result<(), NodeError> {
        match self.fault()? {
            Some(Fault::Unreachable) => Err(NodeError::Unreachable(format!("{} is down", self.player))),
            Some(Fault::RejectAll) => Err(NodeError::Rejected(format!("{} refuses to serve", self.player))),
            _ => Ok(()),
        }
    }

    fn key_share(&self, key_id: &KeyId) -> Result<KeyShare, NodeError> {
        self.state()?
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| NodeError::UnknownKey(key_id.clone()))
    }
}

impl Node for SimulatedNode {
    fn ping(&self) -> Result<String, NodeError> {
        let mut state = self.state()?;
        match state.fault {
            Some(Fault::Unreachable) => {
                return Err(NodeError::Unreachable(format!("{} is down", self.player)))
            }
            Some(Fault::FailPings(n)) => {
                state.fault = if n > 1 { Some(Fault::FailPings(n - 1)) } else { None };
                return Err(NodeError::Unreachable(format!("{} dropped a ping", self.player)));
            }
            _ => {}
        }
        Ok(format!("simulated-node/{}", env!("CARGO_PKG_VERSION")))
    }

    fn keygen(&self, session: SessionId, curve: CurveName) -> Result<KeyId, NodeError> {
        self.gate()?;
        let player = self.player;
        {
            let mut rooms = lock(&self.shared.rooms);
            let room = rooms.entry(session).or_insert_with(|| {
                Room::KeyGen(KeyGenRoom {
                    curve,
                    joined: Vec::new(),
                    outputs: HashMap::new(),
                })
            });
            let room = match room {
                Room::KeyGen(room) => room,
                other => return Err(used_elsewhere(other)),
            };
            if room.curve != curve {
                return Err(NodeError::Rejected(format!(
                    "session runs on {}, not {curve}",
                    room.curve
                )));
            }
            if room.joined.contains(&player) {
                return Err(NodeError::Rejected("session was already joined".to_string()));
            }
            room.joined.push(player);
            if room.joined.len() == self.shared.player_count {
                room.outputs = self.shared.deal_key(curve);
                self.shared.event.notify(usize::MAX);
            }
        }

        let (key_id, share) = self.shared.wait(|rooms| {
            let Some(Room::KeyGen(room)) = rooms.get_mut(&session) else {
                return Some(Err(NodeError::Rejected("session vanished".to_string())));
            };
            let out = room.outputs.remove(&player)?;
            if room.outputs.is_empty() {
                rooms.insert(session, Room::Closed);
            }
            Some(Ok(out))
        })?;

        let mut state = self.state()?;
        state.keys.insert(key_id.clone(), share);
        if state.fault == Some(Fault::WrongKeyId) {
            return Ok(KeyId::from(format!("{key_id}-forged")));
        }
        Ok(key_id)
    }

    fn partial_sign(&self, request: &PartialSignRequest) -> Result<PartialResult, NodeError> {
        self.gate()?;
        let player = self.player;
        if !request.quorum.contains(player) {
            return Err(NodeError::Rejected(format!("{player} is not in quorum {}", request.quorum)));
        }
        let share = self.key_share(&request.key_id)?;
        if request.quorum.len() <= share.threshold {
            return Err(NodeError::Rejected("quorum is too small".to_string()));
        }
        let derived = derive(&share.public_key, &share.chain_code, &request.path)
            .map_err(|e| NodeError::Rejected(e.to_string()))?;
        let context = signing_context(&request.key_id, &request.path, &request.digest, &request.quorum)
            .map_err(|e| NodeError::Malformed(e.to_string()))?;

        {
            let mut rooms = lock(&self.shared.rooms);
            let room = rooms.entry(request.session).or_insert_with(|| {
                Room::Sign(SignRoom {
                    context,
                    quorum: request.quorum.clone(),
                    threshold: share.threshold,
                    deposits: Vec::new(),
                    outputs: HashMap::new(),
                })
            });
            let room = match room {
                Room::Sign(room) => room,
                other => return Err(used_elsewhere(other)),
            };
            if room.context != context {
                return Err(NodeError::Rejected(
                    "session is bound to another signing request".to_string(),
                ));
            }
            if room.deposits.iter().any(|(p, _)| *p == player) {
                return Err(NodeError::Rejected("session was already joined".to_string()));
            }
            room.deposits.push((player, share.x_i + derived.tweak));
            if room.deposits.len() == room.quorum.len() {
                room.outputs = self.shared.deal_presignature(room);
                self.shared.event.notify(usize::MAX);
            }
        }

        let (big_r, k_i, sigma_i) = self.shared.wait(|rooms| {
            let Some(Room::Sign(room)) = rooms.get_mut(&request.session) else {
                return Some(Err(NodeError::Rejected("session vanished".to_string())));
            };
            let out = room.outputs.remove(&player)?;
            if room.outputs.is_empty() {
                rooms.insert(request.session, Room::Closed);
            }
            Some(Ok(out))
        })?;

        let m = digest_scalar(request.digest.as_bytes());
        let mut s = m * k_i + x_coordinate(&big_r) * sigma_i;
        if self.fault()? == Some(Fault::CorruptSignatureShare) {
            s += Scalar::ONE;
        }

        SignatureShare {
            session: request.session,
            context,
            player,
            threshold: share.threshold as u32,
            quorum: request.quorum.clone(),
            digest: request.digest,
            public_key: derived.public_key,
            big_r,
            s,
        }
        .to_partial()
        .map_err(|e| NodeError::Malformed(e.to_string()))
    }

    fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>, NodeError> {
        self.gate()?;
        let share = self.key_share(key_id)?;
        let derived = derive(&share.public_key, &share.chain_code, path)
            .map_err(|e| NodeError::Rejected(e.to_string()))?;
        public_key_to_der(&derived.public_key).map_err(|e| NodeError::Malformed(e.to_string()))
    }

    fn partial_recovery_info(&self, request: &RecoveryInfoRequest) -> Result<PartialResult, NodeError> {
        self.gate()?;
        let share = self.key_share(&request.key_id)?;
        let malformed = |e: crate::error::Error| NodeError::Malformed(e.to_string());

        let binding = escrow_binding(&request.escrow_public_key, &request.label).map_err(malformed)?;
        let aad = share_context(&request.session, &request.key_id, self.player, &request.label)
            .map_err(malformed)?;
        let sealed = seal(
            &mut *lock(&self.shared.rng),
            &request.escrow_public_key,
            &aad,
            &share.x_i.to_bytes(),
        )
        .map_err(|e| NodeError::Rejected(e.to_string()))?;

        RecoveryShare {
            session: request.session,
            key_id: request.key_id.clone(),
            curve: share.curve,
            player: self.player,
            threshold: share.threshold as u32,
            public_key: share.public_key,
            chain_code: share.chain_code,
            binding,
            public_share: (ProjectivePoint::GENERATOR * share.x_i).to_affine(),
            sealed,
        }
        .to_partial()
        .map_err(malformed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use easy_parallel::Parallel;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    use crate::{session::SessionCoordinator, sign::MessageDigest};

    fn run_keygen(cluster: &SimulatedCluster, session: SessionId) -> Vec<Result<KeyId, NodeError>> {
        let nodes = cluster.nodes();
        Parallel::new()
            .each(nodes, |node| node.keygen(session, CurveName::Secp256k1))
            .run()
    }

    #[test]
    fn test_dealt_shares_interpolate_to_public_key() {
        let cluster = SimulatedCluster::new(4, 2);
        let session = SessionCoordinator::default().next_session();
        let keys = run_keygen(&cluster, session);
        let key_id = keys[0].clone().unwrap();
        assert!(keys.iter().all(|k| k.as_ref() == Ok(&key_id)));

        let shares: Vec<KeyShare> = (0..4)
            .map(|i| lock(&cluster.shared.nodes[i]).keys[&key_id].clone())
            .collect();
        let quorum = ParticipantList::from_indices(&[1, 2, 3]).unwrap();
        let mut x = Scalar::ZERO;
        for p in quorum.iter() {
            x += quorum.lagrange(p) * shares[p.index()].x_i;
        }
        assert_eq!((ProjectivePoint::GENERATOR * x).to_affine(), shares[0].public_key);
    }

    #[test]
    fn test_seeded_clusters_deal_the_same_key() {
        let deal = || {
            let cluster = SimulatedCluster::new(2, 1).with_rng(ChaCha20Rng::seed_from_u64(42));
            let session = SessionCoordinator::new(ChaCha20Rng::seed_from_u64(1)).next_session();
            let key_id = run_keygen(&cluster, session)[0].clone().unwrap();
            cluster.nodes()[0]
                .public_key(&key_id, &DerivationPath::root())
                .unwrap()
        };
        assert_eq!(deal(), deal());
    }

    #[test]
    fn test_finished_rooms_are_closed() {
        let cluster = SimulatedCluster::new(3, 1);
        let session = SessionCoordinator::default().next_session();
        let key_id = run_keygen(&cluster, session)[0].clone().unwrap();
        assert!(matches!(lock(&cluster.shared.rooms).get(&session), Some(Room::Closed)));

        let sign_session = SessionCoordinator::default().next_session();
        let request = PartialSignRequest {
            session: sign_session,
            key_id,
            path: DerivationPath::root(),
            digest: MessageDigest::sha256(b"closed"),
            quorum: ParticipantList::from_indices(&[0, 1]).unwrap(),
        };
        let results = Parallel::new()
            .each(0..2u32, |p| cluster.node(p.into()).partial_sign(&request))
            .run();
        assert!(results.iter().all(Result::is_ok));
        assert!(matches!(lock(&cluster.shared.rooms).get(&sign_session), Some(Room::Closed)));

        // A closed session still cannot be joined again.
        assert_eq!(
            cluster.node(0u32.into()).keygen(session, CurveName::Secp256k1),
            Err(NodeError::Rejected("session was already used".to_string()))
        );
        assert!(matches!(
            cluster.node(0u32.into()).partial_sign(&request),
            Err(NodeError::Rejected(_))
        ));
    }

    #[test]
    fn test_missing_player_times_out() {
        let cluster = SimulatedCluster::new(3, 1).with_leg_timeout(Duration::from_millis(50));
        let session = SessionCoordinator::default().next_session();
        let result = cluster.node(0u32.into()).keygen(session, CurveName::Secp256k1);
        assert_eq!(result, Err(NodeError::Timeout));
    }

    #[test]
    fn test_session_cannot_change_request() {
        let cluster = SimulatedCluster::new(2, 1).with_leg_timeout(Duration::from_millis(50));
        let sessions = SessionCoordinator::default();
        let key_id = run_keygen(&cluster, sessions.next_session())[0].clone().unwrap();

        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let request = |digest: &[u8]| PartialSignRequest {
            session: SessionId::from_bytes([7u8; 32]),
            key_id: key_id.clone(),
            path: DerivationPath::root(),
            digest: MessageDigest::sha256(digest),
            quorum: quorum.clone(),
        };
        // Player 0 waits in vain, player 1 asks for another digest under the same session.
        let results = Parallel::new()
            .add(|| cluster.node(0u32.into()).partial_sign(&request(b"one")))
            .add(|| {
                std::thread::sleep(Duration::from_millis(10));
                cluster.node(1u32.into()).partial_sign(&request(b"two"))
            })
            .run();
        assert_eq!(results[0], Err(NodeError::Timeout));
        assert!(matches!(results[1], Err(NodeError::Rejected(_))));
    }

    #[test]
    fn test_faults() {
        let cluster = SimulatedCluster::new(2, 1);
        let node = cluster.node(1u32.into());
        cluster.inject(1u32.into(), Fault::FailPings(2));
        assert!(node.ping().is_err());
        assert!(node.ping().is_err());
        assert!(node.ping().is_ok());

        cluster.inject(1u32.into(), Fault::RejectAll);
        assert!(node.ping().is_ok());
        assert!(matches!(
            node.public_key(&"k".into(), &DerivationPath::root()),
            Err(NodeError::Rejected(_))
        ));
        cluster.clear(1u32.into());
        assert_eq!(
            node.public_key(&"k".into(), &DerivationPath::root()),
            Err(NodeError::UnknownKey("k".into()))
        );
    }
}
