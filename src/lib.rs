//! A client for clusters of MPC nodes running threshold ECDSA.
//!
//! In such a cluster, no node ever holds a full private key. Each of the
//! `n` players holds a share, and any `threshold + 1` of them can sign
//! together, while `threshold` or fewer learn nothing. This crate is the
//! orchestration layer above the nodes: it decides who takes part in an
//! operation, makes sure every participant works on exactly the same thing,
//! and turns what the nodes send back into a single result.
//!
//! # Warning
//!
//! The orchestration layer is where consistency is enforced. Every check
//! here (same session, same key, same path, same quorum, a result that
//! verifies) exists because a node may be faulty, or malicious. Failing
//! operations are never silently repaired: a disagreement is surfaced as an
//! error naming the player involved.
//!
//! # Design
//!
//! The client talks to nodes through the [node::Node] trait. How a node is
//! reached is up to the caller: [node::remote::RemoteNode] encodes calls and
//! ships them over any [node::remote::Transport], and
//! [node::simulated::SimulatedCluster] runs a whole cluster in process.
//!
//! Every operation follows the same shape:
//!
//! - A fresh [SessionId] is drawn from a [SessionCoordinator].
//! - One call per participating node is issued concurrently, all carrying
//!   the same session and parameters.
//! - The answers are gathered, and combined locally into the final result.
//!
//! The operations are:
//!
//! - Key generation ([KeyGenOrchestrator]), involving every player, and
//!   producing a [KeyId].
//! - Signing ([SignOrchestrator]), with a chosen quorum, producing a
//!   [CombinedSignature]. Keys can be derived BIP32 style, along
//!   non-hardened [DerivationPath]s.
//! - Escrowed recovery ([RecoveryOrchestrator]), where nodes seal their
//!   shares to an [EscrowKeyPair] held outside the cluster, letting its
//!   holder reconstruct the private key.
//!
//! ## API Design
//!
//! Everything is blocking from the caller's point of view. Internally, the
//! calls of one step run in parallel on a thread pool. A [ThresholdClient]
//! is immutable once built, so any number of operations can share one.
//!
//! ```ignore
//! let client = ThresholdClient::new(topology, ClientConfig::default(), nodes)?;
//! let sessions = SessionCoordinator::default();
//!
//! let key_id = KeyGenOrchestrator::new(&client, &sessions).keygen(CurveName::Secp256k1)?;
//! let quorum = ParticipantList::from_indices(&[0, 2]).unwrap();
//! let signature = SignOrchestrator::new(&client, &sessions).sign(
//!     &key_id,
//!     &DerivationPath::root(),
//!     &MessageDigest::sha256(b"hello"),
//!     &quorum,
//! )?;
//! ```
//!
//! # Shortcomings
//!
//! - A failed step is not retried with another quorum; the caller decides.
//! - Calls still in flight when a step fails are not cancelled, only ignored.
mod compat;
mod constants;
mod crypto;
pub mod derivation;
mod error;
pub mod escrow;
mod keygen;
mod math;
pub mod node;
mod participants;
mod protocol;
pub mod recovery;
mod serde;
mod session;
pub mod sign;
mod topology;

pub use compat::{ethereum_address, parse_public_key, public_key_to_der, CurveName};
pub use crypto::Commitment;
pub use derivation::{ChainCode, DerivationPath};
pub use error::Error;
pub use escrow::EscrowKeyPair;
pub use keygen::{KeyGenOrchestrator, KeyId};
pub use participants::{Participant, ParticipantList, QuorumSelection};
pub use recovery::{
    RecoveredKey, RecoveryAttempt, RecoveryBundle, RecoveryContext, RecoveryOrchestrator, RecoveryState,
};
pub use session::{SessionCoordinator, SessionId};
pub use sign::{CombinedSignature, MessageDigest, SignOrchestrator};
pub use topology::{Authenticator, ClientConfig, ClusterTopology, NodeEndpoint, PlayerClient, ThresholdClient};
