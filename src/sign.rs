//! Threshold signing: fanning a digest out to a quorum, and combining the
//! partial signatures that come back.
//!
//! Every node of the quorum answers with a [SignatureShare]. A share carries
//! the public data of the signing session, most importantly the nonce point
//! `R`, and the player's share `s_i` of the second signature scalar. The
//! shares lie on a polynomial of degree `threshold`, so any `threshold + 1`
//! of them interpolate to `s`.
//!
//! Combination is a pure function. It is where a faulty or malicious node is
//! caught: shares must agree on everything public, and the result must verify
//! under the derived public key before it is handed out.

use std::fmt;

use elliptic_curve::{ops::Invert, point::AffineCoordinates, scalar::IsHigh};
use k256::{
    ecdsa::{signature::hazmat::PrehashVerifier, RecoveryId, Signature, VerifyingKey},
    AffinePoint, ProjectivePoint, PublicKey, Scalar,
};
use magikitten::Transcript;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConditionallySelectable;
use tracing::{info, info_span};

use crate::{
    compat::{digest_scalar, x_coordinate},
    constants::{DIGEST_LEN, HARDENED_OFFSET, SIGN_CONTEXT_LABEL},
    derivation::{DerivationError, DerivationPath},
    error::Error,
    keygen::KeyId,
    node::{PartialResult, PartialSignRequest},
    participants::{Participant, ParticipantList, QuorumSelection},
    protocol::{fan_out, PlayerCall},
    serde::{decode, encode},
    session::{SessionCoordinator, SessionId},
    topology::ThresholdClient,
};

/// A 32 byte digest of the message being signed.
///
/// Hashing happens before this layer; nodes sign the digest as is.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageDigest([u8; DIGEST_LEN]);

impl MessageDigest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Accept a digest of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            Error::Encoding(format!(
                "a message digest is {DIGEST_LEN} bytes, found: {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Hash a message with SHA-256.
    pub fn sha256(message: &[u8]) -> Self {
        Self(Sha256::digest(message).into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageDigest({})", hex::encode(self.0))
    }
}

/// Hash everything a signature is bound to into a single tag.
///
/// Two shares with the same tag were produced for the same key, path, digest
/// and quorum.
pub fn signing_context(
    key_id: &KeyId,
    path: &DerivationPath,
    digest: &MessageDigest,
    quorum: &ParticipantList,
) -> Result<[u8; 32], Error> {
    let mut transcript = Transcript::new(SIGN_CONTEXT_LABEL);
    transcript.message(b"key id", key_id.as_str().as_bytes());
    transcript.message(b"path", &encode(path)?);
    transcript.message(b"digest", digest.as_bytes());
    transcript.message(b"quorum", &encode(quorum)?);

    let mut out = [0u8; 32];
    transcript.challenge(b"context").fill_bytes(&mut out);
    Ok(out)
}

/// What a node puts inside the [PartialResult] of a signing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub session: SessionId,
    /// See [signing_context].
    pub context: [u8; 32],
    pub player: Participant,
    pub threshold: u32,
    pub quorum: ParticipantList,
    pub digest: MessageDigest,
    /// The public key derived along the signing path.
    pub public_key: AffinePoint,
    /// The nonce point, shared by every share of a session.
    pub big_r: AffinePoint,
    /// This player's share of `s`, not yet weighted.
    pub s: Scalar,
}

impl SignatureShare {
    pub fn to_partial(&self) -> Result<PartialResult, Error> {
        Ok(PartialResult {
            player: self.player,
            data: encode(self)?,
        })
    }

    pub fn from_partial(partial: &PartialResult) -> Result<Self, Error> {
        let share: Self = decode(&partial.data).map_err(|e| {
            Error::Combination(format!("undecodable share from {}: {e}", partial.player))
        })?;
        if share.player != partial.player {
            return Err(Error::Combination(format!(
                "share from {} claims to be from {}",
                partial.player, share.player
            )));
        }
        Ok(share)
    }
}

/// Represents a signature with extra information, to support different variants of ECDSA.
///
/// An ECDSA signature is usually two scalars. The first scalar is derived from
/// a point on the curve, and because this process is lossy, some other variants
/// of ECDSA also include some extra information in order to recover this point.
#[derive(Clone)]
pub struct FullSignature {
    /// This is the entire first point.
    pub big_r: AffinePoint,
    /// This is the second scalar, normalized to be in the lower range.
    pub s: Scalar,
}

impl FullSignature {
    #[must_use]
    fn verify(&self, public_key: &AffinePoint, msg_hash: &Scalar) -> bool {
        let r: Scalar = x_coordinate(&self.big_r);
        if r.is_zero().into() || self.s.is_zero().into() {
            return false;
        }
        let s_inv: Option<Scalar> = self.s.invert_vartime().into();
        let Some(s_inv) = s_inv else {
            return false;
        };
        let reproduced = (ProjectivePoint::GENERATOR * (*msg_hash * s_inv))
            + (ProjectivePoint::from(*public_key) * (r * s_inv));
        x_coordinate(&reproduced.to_affine()) == r
    }
}

/// A complete ECDSA signature, normalized to low-s, with its recovery id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedSignature {
    signature: Signature,
    recovery_id: RecoveryId,
}

impl CombinedSignature {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The fixed width encoding, `r || s`, each 32 bytes big endian.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out.copy_from_slice(&self.signature.to_bytes());
        out
    }

    /// The ASN.1 DER encoding, `SEQUENCE { r INTEGER, s INTEGER }`.
    pub fn to_der(&self) -> Vec<u8> {
        self.signature.to_der().as_bytes().to_vec()
    }

    /// The recovery id, in 0..=3.
    ///
    /// Bit 0 is the parity of the y coordinate of `R`, bit 1 is set when the x
    /// coordinate of `R` was reduced modulo the group order.
    pub fn recovery_id(&self) -> u8 {
        self.recovery_id.to_byte()
    }

    /// `r || s || v`, with `v` the recovery id.
    pub fn to_recoverable_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&self.to_bytes());
        out[64] = self.recovery_id();
        out
    }

    pub fn verify(&self, public_key: &PublicKey, digest: &MessageDigest) -> Result<(), Error> {
        VerifyingKey::from(public_key)
            .verify_prehash(digest.as_bytes(), &self.signature)
            .map_err(|_| Error::Combination("signature does not verify".to_string()))
    }

    /// Recover the public key that produced this signature over a digest.
    pub fn recover_public_key(&self, digest: &MessageDigest) -> Result<PublicKey, Error> {
        let key =
            VerifyingKey::recover_from_prehash(digest.as_bytes(), &self.signature, self.recovery_id)
                .map_err(|_| Error::Combination("no key recovers this signature".to_string()))?;
        Ok(PublicKey::from(&key))
    }
}

/// What every share of one signing call must be bound to.
///
/// This is built by the caller from what it asked for, never from what
/// the nodes answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignBinding {
    pub session: SessionId,
    /// See [signing_context].
    pub context: [u8; 32],
    pub digest: MessageDigest,
    pub quorum: ParticipantList,
    pub threshold: u32,
    /// The public key derived along the signing path.
    pub public_key: AffinePoint,
}

impl SignBinding {
    pub fn new(
        session: SessionId,
        key_id: &KeyId,
        path: &DerivationPath,
        digest: &MessageDigest,
        quorum: &ParticipantList,
        threshold: usize,
        public_key: &PublicKey,
    ) -> Result<Self, Error> {
        Ok(Self {
            session,
            context: signing_context(key_id, path, digest, quorum)?,
            digest: *digest,
            quorum: quorum.clone(),
            threshold: threshold as u32,
            public_key: *public_key.as_affine(),
        })
    }
}

fn mismatch(player: Participant, what: &str) -> Error {
    Error::Combination(format!("{player} answered for another {what}"))
}

/// Combine the partial signatures of a quorum into a single signature.
///
/// Every share must be bound to `expected`: same session, same signing
/// context, same threshold and public key. Shares must also agree on the
/// nonce, come exactly one per quorum member, and the result must verify
/// for the expected digest and public key.
pub fn combine(partials: &[PartialResult], expected: &SignBinding) -> Result<CombinedSignature, Error> {
    let shares = partials
        .iter()
        .map(SignatureShare::from_partial)
        .collect::<Result<Vec<_>, _>>()?;
    let first = shares
        .first()
        .ok_or_else(|| Error::Combination("no signature shares".to_string()))?;

    for share in &shares {
        if share.session != expected.session {
            return Err(mismatch(share.player, "session"));
        }
        if share.context != expected.context
            || share.quorum != expected.quorum
            || share.digest != expected.digest
        {
            return Err(mismatch(share.player, "signing context"));
        }
        if share.threshold != expected.threshold {
            return Err(mismatch(share.player, "threshold"));
        }
        if share.public_key != expected.public_key {
            return Err(mismatch(share.player, "public key"));
        }
        if share.big_r != first.big_r {
            return Err(Error::Combination(format!(
                "{} disagrees on the nonce",
                share.player
            )));
        }
    }

    let players: Vec<Participant> = shares.iter().map(|s| s.player).collect();
    let contributors = ParticipantList::new(&players)
        .ok_or_else(|| Error::Combination("duplicate signature shares".to_string()))?;
    if contributors.len() <= expected.threshold as usize {
        return Err(Error::Combination(format!(
            "{} shares cannot exceed threshold {}",
            contributors.len(),
            expected.threshold
        )));
    }
    if contributors != expected.quorum {
        return Err(Error::Combination(format!(
            "shares came from {contributors}, but the quorum is {}",
            expected.quorum
        )));
    }

    let mut s = Scalar::ZERO;
    for share in &shares {
        s += contributors.lagrange(share.player) * share.s;
    }

    // Normalize s, and remember whether that negated R.
    let is_high = s.is_high();
    s.conditional_assign(&(-s), is_high);

    let sig = FullSignature {
        big_r: first.big_r,
        s,
    };
    if !sig.verify(&expected.public_key, &digest_scalar(expected.digest.as_bytes())) {
        return Err(Error::Combination("signature failed to verify".to_string()));
    }

    let r = x_coordinate(&sig.big_r);
    let is_y_odd = bool::from(sig.big_r.y_is_odd()) ^ bool::from(is_high);
    let is_x_reduced = r.to_bytes() != sig.big_r.x();
    let signature = Signature::from_scalars(r, sig.s)
        .map_err(|e| Error::Combination(format!("invalid signature scalars: {e}")))?;

    Ok(CombinedSignature {
        signature,
        recovery_id: RecoveryId::new(is_y_odd, is_x_reduced),
    })
}

/// Drives threshold signing with a chosen quorum.
pub struct SignOrchestrator<'a> {
    client: &'a ThresholdClient,
    sessions: &'a SessionCoordinator,
}

impl<'a> SignOrchestrator<'a> {
    pub fn new(client: &'a ThresholdClient, sessions: &'a SessionCoordinator) -> Self {
        Self { client, sessions }
    }

    /// Sign a digest with the key derived along a path, under a fresh session.
    ///
    /// The shares are held to what was asked for here, with the public key
    /// queried from the cluster, never to what the shares say about themselves.
    pub fn sign(
        &self,
        key_id: &KeyId,
        path: &DerivationPath,
        digest: &MessageDigest,
        quorum: &QuorumSelection,
    ) -> Result<CombinedSignature, Error> {
        let session = self.sessions.next_session();
        let partials = self.partial_sign(session, key_id, path, digest, quorum)?;
        let public_key = self.client.public_key(key_id, path)?;
        let expected = SignBinding::new(
            session,
            key_id,
            path,
            digest,
            quorum,
            self.client.topology().threshold(),
            &public_key,
        )?;
        let signature = combine(&partials, &expected)?;
        info!(%session, recovery_id = signature.recovery_id(), "signature combined");
        Ok(signature)
    }

    /// Collect one partial signature from every member of the quorum.
    ///
    /// The quorum is checked before anything is sent. If any member fails, the
    /// whole attempt fails: picking another quorum is left to the caller.
    pub fn partial_sign(
        &self,
        session: SessionId,
        key_id: &KeyId,
        path: &DerivationPath,
        digest: &MessageDigest,
        quorum: &QuorumSelection,
    ) -> Result<Vec<PartialResult>, Error> {
        if let Some(&index) = path.as_slice().iter().find(|&&i| i >= HARDENED_OFFSET) {
            return Err(DerivationError::Hardened(index).into());
        }
        self.client.topology().check_quorum(quorum)?;

        let _span = info_span!("sign", %session, %key_id, %path, %quorum).entered();

        let request = PartialSignRequest {
            session,
            key_id: key_id.clone(),
            path: path.clone(),
            digest: *digest,
            quorum: quorum.clone(),
        };
        let calls = quorum
            .iter()
            .map(|p| -> Result<(Participant, PlayerCall<PartialResult>), Error> {
                let pc = self.client.player(p)?.clone();
                let request = request.clone();
                let call: PlayerCall<PartialResult> = Box::new(move || pc.partial_sign(&request));
                Ok((p, call))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let partials = fan_out(calls, self.client.config().deadline)
            .map_err(|(player, cause)| Error::PartialSignFailed { player, cause })?;
        partials
            .into_iter()
            .map(|(player, partial)| {
                if partial.player != player {
                    return Err(Error::Combination(format!(
                        "{player} answered with a share tagged {}",
                        partial.player
                    )));
                }
                Ok(partial)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use elliptic_curve::Field;
    use k256::ecdsa::signature::Verifier;
    use rand_core::OsRng;

    use crate::{
        compat::CurveName,
        keygen::KeyGenOrchestrator,
        math::Polynomial,
        node::{
            simulated::{Fault, SimulatedCluster},
            NodeError, Rewriting,
        },
        topology::{Authenticator, ClientConfig, ClusterTopology, NodeEndpoint},
    };

    /// Deal signature shares for a quorum, the way nodes would produce them.
    fn deal(
        threshold: usize,
        quorum: &ParticipantList,
        session: SessionId,
        digest: &MessageDigest,
    ) -> (PublicKey, SignBinding, Vec<PartialResult>) {
        let f = Polynomial::random(&mut OsRng, threshold + 1);
        let x = f.evaluate_zero();
        let public_key = (ProjectivePoint::GENERATOR * x).to_affine();

        let k = Scalar::random(&mut OsRng);
        let big_r = (ProjectivePoint::GENERATOR * k.invert().unwrap()).to_affine();
        let g = Polynomial::extend_random(&mut OsRng, threshold + 1, &k);
        let h = Polynomial::extend_random(&mut OsRng, threshold + 1, &(k * x));

        let m = digest_scalar(digest.as_bytes());
        let r = x_coordinate(&big_r);
        let public = PublicKey::from_affine(public_key).unwrap();
        let binding = SignBinding::new(
            session,
            &"key".into(),
            &DerivationPath::root(),
            digest,
            quorum,
            threshold,
            &public,
        )
        .unwrap();
        let context = binding.context;
        let partials = quorum
            .iter()
            .map(|p| {
                let at = p.scalar();
                SignatureShare {
                    session,
                    context,
                    player: p,
                    threshold: threshold as u32,
                    quorum: quorum.clone(),
                    digest: *digest,
                    public_key,
                    big_r,
                    s: m * g.evaluate(&at) + r * h.evaluate(&at),
                }
                .to_partial()
                .unwrap()
            })
            .collect();
        (public, binding, partials)
    }

    fn session() -> SessionId {
        SessionCoordinator::default().next_session()
    }

    #[test]
    fn test_combine_verifies() -> Result<(), Error> {
        let msg = b"hello?";
        let digest = MessageDigest::sha256(msg);
        let quorum = ParticipantList::from_indices(&[0, 2, 3]).unwrap();

        // Run a few times, so both values of the recovery id get exercised.
        for _ in 0..8 {
            let (public_key, binding, partials) = deal(2, &quorum, session(), &digest);
            let sig = combine(&partials, &binding)?;
            sig.verify(&public_key, &digest)?;
            assert!(sig.signature().normalize_s().is_none());
            VerifyingKey::from(&public_key)
                .verify(msg, sig.signature())
                .map_err(|_| Error::Combination("message verification".to_string()))?;
            assert_eq!(sig.recover_public_key(&digest)?, public_key);
        }
        Ok(())
    }

    #[test]
    fn test_encodings() -> Result<(), Error> {
        let digest = MessageDigest::sha256(b"encode me");
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let (_, binding, partials) = deal(1, &quorum, session(), &digest);
        let sig = combine(&partials, &binding)?;

        let bytes = sig.to_bytes();
        assert_eq!(Signature::from_der(&sig.to_der()).unwrap(), *sig.signature());
        assert_eq!(Signature::from_slice(&bytes).unwrap(), *sig.signature());
        let recoverable = sig.to_recoverable_bytes();
        assert_eq!(&recoverable[..64], &bytes[..]);
        assert!(recoverable[64] <= 3);
        Ok(())
    }

    #[test]
    fn test_too_few_shares() {
        let digest = MessageDigest::sha256(b"few");
        let quorum = ParticipantList::from_indices(&[0, 1, 2]).unwrap();
        let (_, binding, partials) = deal(2, &quorum, session(), &digest);
        assert!(matches!(combine(&partials[..2], &binding), Err(Error::Combination(_))));
        assert!(matches!(combine(&[], &binding), Err(Error::Combination(_))));
    }

    #[test]
    fn test_duplicate_shares() {
        let digest = MessageDigest::sha256(b"dup");
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let (_, binding, partials) = deal(1, &quorum, session(), &digest);
        let doubled = vec![partials[0].clone(), partials[0].clone(), partials[1].clone()];
        assert!(matches!(combine(&doubled, &binding), Err(Error::Combination(_))));
    }

    #[test]
    fn test_sessions_do_not_mix() {
        let digest = MessageDigest::sha256(b"mix");
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let (_, a_binding, a) = deal(1, &quorum, session(), &digest);
        let (_, b_binding, b) = deal(1, &quorum, session(), &digest);
        let mixed = vec![a[0].clone(), b[1].clone()];
        assert!(matches!(combine(&mixed, &a_binding), Err(Error::Combination(_))));
        // Shares consistent among themselves still belong to one call only.
        assert!(matches!(combine(&a, &b_binding), Err(Error::Combination(_))));
    }

    #[test]
    fn test_shares_bound_to_the_request() {
        let digest = MessageDigest::sha256(b"requested");
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let (public_key, binding, partials) = deal(1, &quorum, session(), &digest);
        assert!(combine(&partials, &binding).is_ok());

        let other_digest = MessageDigest::sha256(b"something else");
        let mut expected = binding.clone();
        expected.digest = other_digest;
        expected.context =
            signing_context(&"key".into(), &DerivationPath::root(), &other_digest, &quorum).unwrap();
        assert!(matches!(combine(&partials, &expected), Err(Error::Combination(_))));

        let mut expected = binding.clone();
        expected.context = signing_context(&"other key".into(), &DerivationPath::root(), &digest, &quorum).unwrap();
        assert!(matches!(combine(&partials, &expected), Err(Error::Combination(_))));

        let mut expected = binding.clone();
        expected.threshold = 0;
        assert!(matches!(combine(&partials, &expected), Err(Error::Combination(_))));

        let mut expected = binding.clone();
        expected.public_key = (ProjectivePoint::from(*public_key.as_affine()) + ProjectivePoint::GENERATOR).to_affine();
        assert!(matches!(combine(&partials, &expected), Err(Error::Combination(_))));
    }

    #[test]
    fn test_corrupt_share_is_caught() {
        let digest = MessageDigest::sha256(b"corrupt");
        let quorum = ParticipantList::from_indices(&[1, 2]).unwrap();
        let (_, binding, mut partials) = deal(1, &quorum, session(), &digest);
        let mut share = SignatureShare::from_partial(&partials[1]).unwrap();
        share.s += Scalar::ONE;
        partials[1] = share.to_partial().unwrap();
        assert!(matches!(combine(&partials, &binding), Err(Error::Combination(_))));

        // A share relabelled to another player is refused outright.
        partials[1].player = 0u32.into();
        assert!(matches!(combine(&partials, &binding), Err(Error::Combination(_))));
    }

    #[test]
    fn test_digest_length() {
        assert!(MessageDigest::from_slice(&[0u8; 32]).is_ok());
        assert!(matches!(MessageDigest::from_slice(&[0u8; 31]), Err(Error::Encoding(_))));
    }

    fn setup(n: usize, t: usize) -> (SimulatedCluster, ThresholdClient, SessionCoordinator, KeyId) {
        let cluster = SimulatedCluster::new(n, t);
        let nodes = (0..n)
            .map(|i| NodeEndpoint::new(format!("node-{i}"), Authenticator::None))
            .collect();
        let client = ThresholdClient::new(
            ClusterTopology::new(n, t, nodes).unwrap(),
            ClientConfig::default(),
            cluster.nodes(),
        )
        .unwrap();
        let sessions = SessionCoordinator::default();
        let key_id = KeyGenOrchestrator::new(&client, &sessions)
            .keygen(CurveName::Secp256k1)
            .unwrap();
        (cluster, client, sessions, key_id)
    }

    /// A client over `cluster` whose nodes all see a rewritten signing request.
    fn rewriting_client(
        cluster: &SimulatedCluster,
        t: usize,
        f: impl Fn(&mut PartialSignRequest) + Clone + Send + Sync + 'static,
    ) -> ThresholdClient {
        let n = cluster.player_count();
        let endpoints = (0..n)
            .map(|i| NodeEndpoint::new(format!("node-{i}"), Authenticator::None))
            .collect();
        let nodes = cluster
            .nodes()
            .into_iter()
            .map(|node| Rewriting::sign(node, f.clone()))
            .collect();
        ThresholdClient::new(
            ClusterTopology::new(n, t, endpoints).unwrap(),
            ClientConfig::default(),
            nodes,
        )
        .unwrap()
    }

    #[test]
    fn test_nodes_signing_another_digest_are_caught() {
        let (cluster, _, sessions, key_id) = setup(3, 1);
        let client = rewriting_client(&cluster, 1, |request| {
            request.digest = MessageDigest::sha256(b"pay someone else");
        });
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let result = SignOrchestrator::new(&client, &sessions).sign(
            &key_id,
            &DerivationPath::root(),
            &MessageDigest::sha256(b"pay alice"),
            &quorum,
        );
        assert!(matches!(result, Err(Error::Combination(_))));
    }

    #[test]
    fn test_nodes_signing_in_another_session_are_caught() {
        let (cluster, _, sessions, key_id) = setup(3, 1);
        let client = rewriting_client(&cluster, 1, |request| {
            request.session = SessionId::from_bytes([0xaa; 32]);
        });
        let quorum = ParticipantList::from_indices(&[0, 2]).unwrap();
        let result = SignOrchestrator::new(&client, &sessions).sign(
            &key_id,
            &DerivationPath::root(),
            &MessageDigest::sha256(b"replayed"),
            &quorum,
        );
        assert!(matches!(result, Err(Error::Combination(_))));
    }

    #[test]
    fn test_nodes_signing_with_another_key_are_caught() {
        let (cluster, honest, sessions, key_id) = setup(3, 1);
        let other = KeyGenOrchestrator::new(&honest, &sessions)
            .keygen(CurveName::Secp256k1)
            .unwrap();
        let client = rewriting_client(&cluster, 1, move |request| {
            request.key_id = other.clone();
        });
        let quorum = ParticipantList::from_indices(&[1, 2]).unwrap();
        let result = SignOrchestrator::new(&client, &sessions).sign(
            &key_id,
            &DerivationPath::root(),
            &MessageDigest::sha256(b"wrong key"),
            &quorum,
        );
        assert!(matches!(result, Err(Error::Combination(_))));
    }

    #[test]
    fn test_sign_with_derived_key() -> Result<(), Error> {
        let (_cluster, client, sessions, key_id) = setup(4, 2);
        let path: DerivationPath = vec![7, 0, 12].into();
        let digest = MessageDigest::sha256(b"derived");
        let quorum = ParticipantList::from_indices(&[1, 2, 3]).unwrap();

        let sig = SignOrchestrator::new(&client, &sessions).sign(&key_id, &path, &digest, &quorum)?;
        sig.verify(&client.public_key(&key_id, &path)?, &digest)?;
        assert!(sig
            .verify(&client.public_key(&key_id, &DerivationPath::root())?, &digest)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_bad_quorums_rejected_before_dispatch() {
        let (cluster, client, sessions, key_id) = setup(3, 1);
        // Nothing would answer, so only a local check can produce these errors.
        for p in 0..3u32 {
            cluster.inject(p.into(), Fault::Unreachable);
        }
        let orchestrator = SignOrchestrator::new(&client, &sessions);
        let digest = MessageDigest::sha256(b"quorum");
        let quorums: [&[u32]; 3] = [&[0], &[1], &[0, 5]];
        for quorum in quorums {
            let quorum = ParticipantList::from_indices(quorum).unwrap();
            assert!(matches!(
                orchestrator.sign(&key_id, &DerivationPath::root(), &digest, &quorum),
                Err(Error::InvalidQuorum(_))
            ));
        }
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        assert!(matches!(
            orchestrator.sign(&key_id, &vec![HARDENED_OFFSET].into(), &digest, &quorum),
            Err(Error::Derivation(DerivationError::Hardened(_)))
        ));
    }

    #[test]
    fn test_failing_member_fails_signing() {
        let (cluster, client, sessions, key_id) = setup(3, 1);
        cluster.inject(2u32.into(), Fault::RejectAll);
        let quorum = ParticipantList::from_indices(&[0, 2]).unwrap();
        let result = SignOrchestrator::new(&client, &sessions).sign(
            &key_id,
            &DerivationPath::root(),
            &MessageDigest::sha256(b"fail"),
            &quorum,
        );
        match result {
            Err(Error::PartialSignFailed { player, cause }) => {
                assert_eq!(player, 2u32.into());
                assert!(matches!(cause, NodeError::Rejected(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_node_share_fails_combination() {
        let (cluster, client, sessions, key_id) = setup(3, 1);
        cluster.inject(0u32.into(), Fault::CorruptSignatureShare);
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let result = SignOrchestrator::new(&client, &sessions).sign(
            &key_id,
            &DerivationPath::root(),
            &MessageDigest::sha256(b"corrupt"),
            &quorum,
        );
        assert!(matches!(result, Err(Error::Combination(_))));
    }

    #[test]
    fn test_unknown_key() {
        let (_cluster, client, sessions, _) = setup(3, 1);
        let quorum = ParticipantList::from_indices(&[0, 1]).unwrap();
        let result = SignOrchestrator::new(&client, &sessions).sign(
            &"nope".into(),
            &DerivationPath::root(),
            &MessageDigest::sha256(b"unknown"),
            &quorum,
        );
        assert!(matches!(
            result,
            Err(Error::PartialSignFailed {
                cause: NodeError::UnknownKey(_),
                ..
            })
        ));
    }
}
