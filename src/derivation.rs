//! Hierarchical key derivation.
//!
//! Child keys are derived BIP32 style, from the parent public key and chain
//! code. Only non-hardened derivation is possible for a shared key: the tweak
//! for each step depends on public data only, and adding the same tweak to
//! every player's share adds it to the shared secret, since Lagrange
//! coefficients sum to one.

use std::{fmt, str::FromStr};

use elliptic_curve::{sec1::ToEncodedPoint, PrimeField};
use hmac::{Hmac, Mac};
use k256::{AffinePoint, FieldBytes, ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use thiserror::Error;

use crate::constants::{CHAIN_CODE_LEN, HARDENED_OFFSET};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("hardened index {0} cannot be derived from a shared key")]
    Hardened(u32),
    /// The derived tweak or child key was invalid, BIP32 says to skip this index.
    #[error("index {0} does not produce a valid child key")]
    InvalidChild(u32),
    #[error("malformed derivation path: {0}")]
    Malformed(String),
}

/// A sequence of child indices selecting a key below a root key.
///
/// The empty path is the root key itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(indices: Vec<u32>) -> Self {
        Self(indices)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u32>> for DerivationPath {
    fn from(indices: Vec<u32>) -> Self {
        Self(indices)
    }
}

impl From<&[u32]> for DerivationPath {
    fn from(indices: &[u32]) -> Self {
        Self(indices.to_vec())
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for i in &self.0 {
            write!(f, "/{i}")?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = DerivationError;

    /// Parse a path like `m/2/5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        if parts.next() != Some("m") {
            return Err(DerivationError::Malformed(s.to_string()));
        }
        parts
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| DerivationError::Malformed(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// The chain code accompanying a key, needed to derive its children.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCode([u8; CHAIN_CODE_LEN]);

impl ChainCode {
    pub fn from_bytes(bytes: [u8; CHAIN_CODE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHAIN_CODE_LEN] {
        &self.0
    }
}

impl fmt::Debug for ChainCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainCode({})", hex::encode(self.0))
    }
}

/// The outcome of deriving along a path.
#[derive(Debug, Clone)]
pub struct Derived {
    /// The amount added to the parent secret to get the child secret.
    pub tweak: Scalar,
    pub public_key: AffinePoint,
    pub chain_code: ChainCode,
}

/// Derive the child public key, chain code and cumulative tweak for a path.
pub fn derive(
    public_key: &AffinePoint,
    chain_code: &ChainCode,
    path: &DerivationPath,
) -> Result<Derived, DerivationError> {
    let mut tweak = Scalar::ZERO;
    let mut big_k = ProjectivePoint::from(*public_key);
    let mut chain_code = *chain_code;

    for &index in path.as_slice() {
        if index >= HARDENED_OFFSET {
            return Err(DerivationError::Hardened(index));
        }

        let mut mac = Hmac::<Sha512>::new_from_slice(chain_code.as_bytes())
            .map_err(|_| DerivationError::InvalidChild(index))?;
        mac.update(big_k.to_affine().to_encoded_point(true).as_bytes());
        mac.update(&index.to_be_bytes());
        let i = mac.finalize().into_bytes();
        let (i_l, i_r) = i.split_at(32);

        let step: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(i_l)).into();
        let step = step.ok_or(DerivationError::InvalidChild(index))?;

        big_k += ProjectivePoint::GENERATOR * step;
        if big_k == ProjectivePoint::IDENTITY {
            return Err(DerivationError::InvalidChild(index));
        }
        tweak += step;

        let mut next = [0u8; CHAIN_CODE_LEN];
        next.copy_from_slice(i_r);
        chain_code = ChainCode(next);
    }

    Ok(Derived {
        tweak,
        public_key: big_k.to_affine(),
        chain_code,
    })
}
