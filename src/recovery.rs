//! Escrowed key recovery.
//!
//! Every node seals its key share to an escrow public key and hands it over,
//! along with public data about the key and a public commitment `x_i * G` to
//! its share. Once enough sealed shares are collected, the escrow holder can
//! reconstruct the private key, outside the cluster, without any node ever
//! seeing it.
//!
//! A recovery runs as a one way state machine:
//!
//! ```text
//! Collecting -> Combining -> Validating -> Reconstructing -> Recovered
//! ```
//!
//! with `Failed` reachable from every phase before `Recovered`. A failed
//! attempt is never resumed: start another one, under another session.

use std::fmt;

use elliptic_curve::{pkcs8::EncodePublicKey, PrimeField};
use k256::{AffinePoint, FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::{
    compat::{parse_public_key, CurveName},
    constants::ESCROW_BINDING_LABEL,
    crypto::{commit, Commitment},
    derivation::{derive, ChainCode, DerivationPath},
    error::Error,
    escrow::{open, EscrowKeyPair, Envelope},
    keygen::KeyId,
    node::{NodeError, PartialResult, RecoveryInfoRequest},
    participants::{Participant, ParticipantList},
    protocol::{fan_out_all, PlayerCall},
    serde::{decode, encode},
    session::{SessionCoordinator, SessionId},
    topology::ThresholdClient,
};

/// The phases of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryState {
    Collecting,
    Combining,
    Validating,
    Reconstructing,
    Recovered,
    Failed,
}

/// Commit to the escrow context recovery shares are produced for.
pub fn escrow_binding(escrow_public_key: &[u8], label: &[u8]) -> Result<Commitment, Error> {
    commit(ESCROW_BINDING_LABEL, &(escrow_public_key, label))
}

/// The associated data a player's sealed share is bound to.
pub fn share_context(
    session: &SessionId,
    key_id: &KeyId,
    player: Participant,
    label: &[u8],
) -> Result<Vec<u8>, Error> {
    encode(&(session, key_id, player, label))
}

/// What every recovery share of one attempt must be bound to.
///
/// It comes from the attempt itself, so shares from any other session, key
/// or escrow context are refused no matter how consistent they are.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryContext {
    pub session: SessionId,
    pub key_id: KeyId,
    pub threshold: u32,
    /// The escrow public key, DER encoded.
    pub escrow_public_key: Vec<u8>,
    pub label: Vec<u8>,
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("session", &self.session)
            .field("key_id", &self.key_id)
            .field("threshold", &self.threshold)
            .field("label", &String::from_utf8_lossy(&self.label))
            .finish_non_exhaustive()
    }
}

/// What a node puts inside the [PartialResult] of a recovery call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryShare {
    pub session: SessionId,
    pub key_id: KeyId,
    pub curve: CurveName,
    pub player: Participant,
    pub threshold: u32,
    pub public_key: AffinePoint,
    pub chain_code: ChainCode,
    /// See [escrow_binding].
    pub binding: Commitment,
    /// The public commitment `x_i * G` to the sealed share.
    pub public_share: AffinePoint,
    /// The share `x_i`, sealed under [share_context].
    pub sealed: Envelope,
}

impl RecoveryShare {
    pub fn to_partial(&self) -> Result<PartialResult, Error> {
        Ok(PartialResult {
            player: self.player,
            data: encode(self)?,
        })
    }

    pub fn from_partial(partial: &PartialResult) -> Result<Self, Error> {
        let share: Self = decode(&partial.data).map_err(|e| {
            Error::Combination(format!("undecodable recovery share from {}: {e}", partial.player))
        })?;
        if share.player != partial.player {
            return Err(Error::Combination(format!(
                "recovery share from {} claims to be from {}",
                partial.player, share.player
            )));
        }
        Ok(share)
    }
}

/// One player's sealed share, as kept in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedShare {
    pub player: Participant,
    pub public_share: AffinePoint,
    pub sealed: Envelope,
}

/// The combined recovery data of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryBundle {
    pub session: SessionId,
    pub key_id: KeyId,
    pub curve: CurveName,
    pub threshold: u32,
    pub public_key: AffinePoint,
    pub chain_code: ChainCode,
    pub binding: Commitment,
    /// Sorted by player, one per player.
    pub shares: Vec<SealedShare>,
}

/// Check that public shares lie on one polynomial of degree `threshold`, whose value at zero is `public_key`.
fn check_public_shares(
    threshold: usize,
    public_key: &AffinePoint,
    shares: &[SealedShare],
) -> Result<(), String> {
    let players: Vec<Participant> = shares.iter().map(|s| s.player).collect();
    let all = ParticipantList::new(&players).ok_or_else(|| "duplicate shares".to_string())?;
    if all.len() <= threshold {
        return Err(format!("{} shares cannot exceed threshold {threshold}", all.len()));
    }

    // The first threshold + 1 shares fix the polynomial, the rest must agree with it.
    let (base, rest) = shares.split_at(threshold + 1);
    let base_players: Vec<Participant> = base.iter().map(|s| s.player).collect();
    let base_list = ParticipantList::new(&base_players).ok_or_else(|| "duplicate shares".to_string())?;
    let interpolate = |at: &Scalar| -> AffinePoint {
        base.iter()
            .map(|s| ProjectivePoint::from(s.public_share) * base_list.lagrange_at(s.player, at))
            .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p)
            .to_affine()
    };

    if interpolate(&Scalar::ZERO) != *public_key {
        return Err("public shares do not interpolate to the public key".to_string());
    }
    for share in rest {
        if interpolate(&share.player.scalar()) != share.public_share {
            return Err(format!("public share of {} is inconsistent", share.player));
        }
    }
    Ok(())
}

fn mismatch(player: Participant, what: &str) -> Error {
    Error::Combination(format!("{player} disagrees on the {what}"))
}

/// Merge the recovery shares of several players into a bundle.
///
/// This is pure: it checks the shares against the attempt's context and
/// against each other, and opens nothing.
pub fn combine(partials: &[PartialResult], context: &RecoveryContext) -> Result<RecoveryBundle, Error> {
    let mut shares = partials
        .iter()
        .map(RecoveryShare::from_partial)
        .collect::<Result<Vec<_>, _>>()?;
    shares.sort_by_key(|s| s.player);
    let first = shares
        .first()
        .ok_or_else(|| Error::Combination("no recovery shares".to_string()))?;

    let binding = escrow_binding(&context.escrow_public_key, &context.label)?;
    for share in &shares {
        if share.binding != binding {
            return Err(Error::Combination(format!(
                "share of {} is not bound to this escrow key and label",
                share.player
            )));
        }
        if share.session != context.session {
            return Err(Error::Combination(format!(
                "share of {} belongs to session {}, not {}",
                share.player, share.session, context.session
            )));
        }
        if share.key_id != context.key_id {
            return Err(Error::Combination(format!(
                "share of {} is for key {}, not {}",
                share.player, share.key_id, context.key_id
            )));
        }
        if share.threshold != context.threshold {
            return Err(mismatch(share.player, "threshold"));
        }
        if share.curve != first.curve {
            return Err(mismatch(share.player, "curve"));
        }
        if share.public_key != first.public_key || share.chain_code != first.chain_code {
            return Err(mismatch(share.player, "public key"));
        }
    }

    let sealed: Vec<SealedShare> = shares
        .iter()
        .map(|s| SealedShare {
            player: s.player,
            public_share: s.public_share,
            sealed: s.sealed.clone(),
        })
        .collect();
    check_public_shares(first.threshold as usize, &first.public_key, &sealed)
        .map_err(Error::Combination)?;

    Ok(RecoveryBundle {
        session: first.session,
        key_id: first.key_id.clone(),
        curve: first.curve,
        threshold: first.threshold,
        public_key: first.public_key,
        chain_code: first.chain_code,
        binding,
        shares: sealed,
    })
}

/// Check a bundle against the attempt's context and the key's DER encoded public key.
///
/// This only reads its inputs, so it can be run any number of times.
pub fn validate(
    bundle: &RecoveryBundle,
    context: &RecoveryContext,
    public_key_der: &[u8],
) -> Result<(), Error> {
    let failed = |msg: &str| Error::RecoveryValidationFailed(msg.to_string());

    if bundle.session != context.session {
        return Err(failed("bundle belongs to another session"));
    }
    if bundle.key_id != context.key_id {
        return Err(failed("bundle is for another key"));
    }
    if bundle.threshold != context.threshold {
        return Err(failed("bundle has another threshold"));
    }
    if bundle.binding != escrow_binding(&context.escrow_public_key, &context.label)? {
        return Err(failed("bundle is bound to another escrow key or label"));
    }
    let public_key = parse_public_key(public_key_der)
        .map_err(|e| Error::RecoveryValidationFailed(e.to_string()))?;
    if *public_key.as_affine() != bundle.public_key {
        return Err(failed("bundle is for another public key"));
    }
    check_public_shares(bundle.threshold as usize, &bundle.public_key, &bundle.shares)
        .map_err(Error::RecoveryValidationFailed)
}

/// A private key, reconstructed outside the cluster.
#[derive(Clone)]
pub struct RecoveredKey {
    curve: CurveName,
    secret_key: SecretKey,
    chain_code: ChainCode,
}

impl RecoveredKey {
    pub fn curve(&self) -> CurveName {
        self.curve
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// The master chain code of the key.
    pub fn chain_code(&self) -> &ChainCode {
        &self.chain_code
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret_key.public_key()
    }

    /// The public key, DER encoded the way nodes answer public key queries.
    pub fn public_key_der(&self) -> Result<Vec<u8>, Error> {
        Ok(self
            .public_key()
            .to_public_key_der()
            .map_err(|e| Error::Encoding(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Derive the private key along a path, matching what the cluster signs with.
    pub fn derive(&self, path: &DerivationPath) -> Result<SecretKey, Error> {
        let derived = derive(self.public_key().as_affine(), &self.chain_code, path)?;
        let child = *self.secret_key.to_nonzero_scalar() + derived.tweak;
        let child: Option<NonZeroScalar> = NonZeroScalar::new(child).into();
        child
            .map(SecretKey::from)
            .ok_or_else(|| Error::Reconstruction("derived key is zero".to_string()))
    }
}

impl fmt::Debug for RecoveredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveredKey")
            .field("curve", &self.curve)
            .field("chain_code", &self.chain_code)
            .finish_non_exhaustive()
    }
}

/// Open every share of a bundle, and interpolate the private key.
pub fn reconstruct(bundle: &RecoveryBundle, escrow: &EscrowKeyPair) -> Result<RecoveredKey, Error> {
    let failed = |msg: String| Error::Reconstruction(msg);

    let players: Vec<Participant> = bundle.shares.iter().map(|s| s.player).collect();
    let players = ParticipantList::new(&players).ok_or_else(|| failed("duplicate shares".to_string()))?;
    if players.len() <= bundle.threshold as usize {
        return Err(failed(format!(
            "{} shares cannot exceed threshold {}",
            players.len(),
            bundle.threshold
        )));
    }

    let mut x = Scalar::ZERO;
    for share in &bundle.shares {
        let aad = share_context(&bundle.session, &bundle.key_id, share.player, escrow.label())?;
        let bytes = open(escrow.private_key(), &aad, &share.sealed)
            .map_err(|e| failed(format!("share of {}: {e}", share.player)))?;
        if bytes.len() != 32 {
            return Err(failed(format!("share of {} has the wrong length", share.player)));
        }
        let x_i: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(&bytes)).into();
        let x_i = x_i.ok_or_else(|| failed(format!("share of {} is not a scalar", share.player)))?;
        if (ProjectivePoint::GENERATOR * x_i).to_affine() != share.public_share {
            return Err(failed(format!(
                "share of {} does not match its public share",
                share.player
            )));
        }
        x += players.lagrange(share.player) * x_i;
    }

    if (ProjectivePoint::GENERATOR * x).to_affine() != bundle.public_key {
        return Err(failed("shares do not reconstruct the public key".to_string()));
    }
    let x: Option<NonZeroScalar> = NonZeroScalar::new(x).into();
    let secret_key = x
        .map(SecretKey::from)
        .ok_or_else(|| failed("reconstructed key is zero".to_string()))?;

    Ok(RecoveredKey {
        curve: bundle.curve,
        secret_key,
        chain_code: bundle.chain_code,
    })
}

/// One recovery of one key, driven phase by phase.
pub struct RecoveryAttempt<'a> {
    client: &'a ThresholdClient,
    context: RecoveryContext,
    state: RecoveryState,
    partials: Vec<PartialResult>,
    bundle: Option<RecoveryBundle>,
}

impl<'a> RecoveryAttempt<'a> {
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn session(&self) -> SessionId {
        self.context.session
    }

    pub fn context(&self) -> &RecoveryContext {
        &self.context
    }

    /// The combined bundle, available once combination succeeded.
    pub fn bundle(&self) -> Option<&RecoveryBundle> {
        self.bundle.as_ref()
    }

    fn expect(&self, expected: RecoveryState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::RecoveryState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn advance<T>(&mut self, next: RecoveryState, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Ok(out) => {
                self.state = next;
                Ok(out)
            }
            Err(e) => {
                warn!(session = %self.context.session, error = %e, "recovery failed");
                self.state = RecoveryState::Failed;
                Err(e)
            }
        }
    }

    /// Ask every player for its sealed share, tolerating failures.
    ///
    /// Returns how many shares were collected.
    pub fn collect(&mut self) -> Result<usize, Error> {
        self.expect(RecoveryState::Collecting)?;
        let _span = info_span!(
            "recovery_collect",
            session = %self.context.session,
            key_id = %self.context.key_id
        )
        .entered();

        let request = RecoveryInfoRequest {
            session: self.context.session,
            key_id: self.context.key_id.clone(),
            escrow_public_key: self.context.escrow_public_key.clone(),
            label: self.context.label.clone(),
        };
        let calls: Vec<(Participant, PlayerCall<PartialResult>)> = self
            .client
            .players()
            .map(|pc| {
                let pc = pc.clone();
                let player = pc.player();
                let request = request.clone();
                let call: PlayerCall<PartialResult> =
                    Box::new(move || pc.partial_recovery_info(&request));
                (player, call)
            })
            .collect();

        let mut partials = Vec::new();
        let mut failures: Vec<(Participant, NodeError)> = Vec::new();
        for (player, result) in fan_out_all(calls, self.client.config().deadline) {
            match result {
                Ok(partial) => partials.push(partial),
                Err(e) => failures.push((player, e)),
            }
        }

        let required = self.client.topology().quorum_size();
        let collected = partials.len();
        let result = if collected < required {
            Err(Error::InsufficientRecoveryShares {
                collected,
                required,
                failures,
            })
        } else {
            info!(collected, "recovery shares collected");
            self.partials = partials;
            Ok(collected)
        };
        self.advance(RecoveryState::Combining, result)
    }

    /// Merge the collected shares into a bundle.
    pub fn combine(&mut self) -> Result<&RecoveryBundle, Error> {
        self.expect(RecoveryState::Combining)?;
        let result = combine(&self.partials, &self.context);
        let bundle = self.advance(RecoveryState::Validating, result)?;
        Ok(self.bundle.insert(bundle))
    }

    /// Check the bundle against the key's public key, queried from the cluster.
    pub fn validate(&mut self) -> Result<(), Error> {
        self.expect(RecoveryState::Validating)?;
        let result = match &self.bundle {
            Some(bundle) => self
                .client
                .public_key_der(&self.context.key_id, &DerivationPath::root())
                .and_then(|der| validate(bundle, &self.context, &der)),
            None => Err(Error::RecoveryValidationFailed("no bundle".to_string())),
        };
        self.advance(RecoveryState::Reconstructing, result)
    }

    /// Open the bundle with the escrow private key.
    ///
    /// The key pair must be the one the attempt was started with.
    pub fn reconstruct(&mut self, escrow: &EscrowKeyPair) -> Result<RecoveredKey, Error> {
        self.expect(RecoveryState::Reconstructing)?;
        let result = if escrow.public_key() != self.context.escrow_public_key.as_slice()
            || escrow.label() != self.context.label.as_slice()
        {
            Err(Error::Reconstruction(
                "escrow key pair does not match this recovery".to_string(),
            ))
        } else {
            match &self.bundle {
                Some(bundle) => reconstruct(bundle, escrow),
                None => Err(Error::Reconstruction("no bundle".to_string())),
            }
        };
        let key = self.advance(RecoveryState::Recovered, result)?;
        info!(session = %self.context.session, key_id = %self.context.key_id, "key recovered");
        Ok(key)
    }
}

impl fmt::Debug for RecoveryAttempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryAttempt")
            .field("context", &self.context)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Drives escrowed recovery of keys.
pub struct RecoveryOrchestrator<'a> {
    client: &'a ThresholdClient,
    sessions: &'a SessionCoordinator,
}

impl<'a> RecoveryOrchestrator<'a> {
    pub fn new(client: &'a ThresholdClient, sessions: &'a SessionCoordinator) -> Self {
        Self { client, sessions }
    }

    /// Start a recovery of a key, to be sealed to an escrow public key under a label.
    pub fn begin(&self, key_id: &KeyId, escrow_public_key: &[u8], label: &[u8]) -> RecoveryAttempt<'a> {
        RecoveryAttempt {
            client: self.client,
            context: RecoveryContext {
                session: self.sessions.next_session(),
                key_id: key_id.clone(),
                threshold: self.client.topology().threshold() as u32,
                escrow_public_key: escrow_public_key.to_vec(),
                label: label.to_vec(),
            },
            state: RecoveryState::Collecting,
            partials: Vec::new(),
            bundle: None,
        }
    }

    /// Run every phase of a recovery.
    pub fn recover(&self, key_id: &KeyId, escrow: &EscrowKeyPair) -> Result<RecoveredKey, Error> {
        let mut attempt = self.begin(key_id, escrow.public_key(), escrow.label());
        attempt.collect()?;
        attempt.combine()?;
        attempt.validate()?;
        attempt.reconstruct(escrow)
    }
}
