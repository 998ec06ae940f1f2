use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand_core::OsRng;
use tsm_client::{
    node::simulated::SimulatedCluster,
    recovery::{self, RecoveryBundle},
    sign::{self, SignBinding},
    Authenticator, ClientConfig, ClusterTopology, CurveName, DerivationPath, EscrowKeyPair,
    KeyGenOrchestrator, KeyId, MessageDigest, NodeEndpoint, ParticipantList, RecoveryOrchestrator,
    SessionCoordinator, SignOrchestrator, ThresholdClient,
};

fn setup(n: usize, t: usize) -> ThresholdClient {
    let cluster = SimulatedCluster::new(n, t);
    let endpoints = (0..n)
        .map(|i| NodeEndpoint::new(format!("node-{i}"), Authenticator::None))
        .collect();
    let topology = ClusterTopology::new(n, t, endpoints).unwrap();
    ThresholdClient::new(topology, ClientConfig::default(), cluster.nodes()).unwrap()
}

fn run_keygen(client: &ThresholdClient, sessions: &SessionCoordinator) -> KeyId {
    KeyGenOrchestrator::new(client, sessions)
        .keygen(CurveName::Secp256k1)
        .unwrap()
}

fn run_recovery_collection(
    client: &ThresholdClient,
    sessions: &SessionCoordinator,
    key_id: &KeyId,
    escrow: &EscrowKeyPair,
) -> RecoveryBundle {
    let mut attempt =
        RecoveryOrchestrator::new(client, sessions).begin(key_id, escrow.public_key(), escrow.label());
    attempt.collect().unwrap();
    attempt.combine().unwrap().clone()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let client = setup(3, 1);
    let sessions = SessionCoordinator::default();

    c.bench_function("keygen (3,1)", |b| {
        b.iter(|| run_keygen(black_box(&client), &sessions))
    });

    let key_id = run_keygen(&client, &sessions);
    let path = DerivationPath::root();
    let digest = MessageDigest::sha256(b"hello world");
    let quorum = ParticipantList::from_indices(&[0, 2]).unwrap();
    let signer = SignOrchestrator::new(&client, &sessions);

    c.bench_function("sign (3,1)", |b| {
        b.iter(|| signer.sign(black_box(&key_id), &path, black_box(&digest), &quorum).unwrap())
    });

    let session = sessions.next_session();
    let partials = signer
        .partial_sign(session, &key_id, &path, &digest, &quorum)
        .unwrap();
    let public_key = client.public_key(&key_id, &path).unwrap();
    let expected =
        SignBinding::new(session, &key_id, &path, &digest, &quorum, 1, &public_key).unwrap();

    c.bench_function("combine signature (3,1)", |b| {
        b.iter(|| sign::combine(black_box(&partials), &expected).unwrap())
    });

    let escrow = EscrowKeyPair::generate(&mut OsRng, "bench").unwrap();

    c.bench_function("collect recovery shares (3,1)", |b| {
        b.iter(|| run_recovery_collection(&client, &sessions, black_box(&key_id), &escrow))
    });

    let bundle = run_recovery_collection(&client, &sessions, &key_id, &escrow);

    c.bench_function("reconstruct (3,1)", |b| {
        b.iter(|| recovery::reconstruct(black_box(&bundle), &escrow).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
