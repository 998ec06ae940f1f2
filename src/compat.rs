//! Curve specific plumbing: the curve selector, point encodings, and the
//! conversions between digests, coordinates and scalars.

use std::{fmt, str::FromStr};

use digest::Digest;
use elliptic_curve::{
    ops::Reduce,
    pkcs8::{DecodePublicKey, EncodePublicKey},
    point::AffineCoordinates,
    sec1::ToEncodedPoint,
    Curve,
};
use k256::{AffinePoint, FieldBytes, PublicKey, Scalar, Secp256k1};
use serde::{Deserialize, Serialize};
use sha3::Keccak256;

use crate::error::Error;

/// The elliptic curves a key can be generated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurveName {
    #[serde(rename = "secp256k1")]
    Secp256k1,
}

impl CurveName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurveName::Secp256k1 => "secp256k1",
        }
    }
}

impl fmt::Display for CurveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurveName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "secp256k1" => Ok(CurveName::Secp256k1),
            other => Err(Error::Configuration(format!("unsupported curve: {other}"))),
        }
    }
}

/// Get the x coordinate of a point, as a scalar
pub(crate) fn x_coordinate(point: &AffinePoint) -> Scalar {
    <Scalar as Reduce<<Secp256k1 as Curve>::Uint>>::reduce_bytes(&point.x())
}

/// Interpret a 32 byte message digest as a scalar, the way ECDSA does.
pub(crate) fn digest_scalar(digest: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<<Secp256k1 as Curve>::Uint>>::reduce_bytes(FieldBytes::from_slice(digest))
}

/// Encode a public key as a DER SubjectPublicKeyInfo, the format nodes answer public key queries in.
pub fn public_key_to_der(point: &AffinePoint) -> Result<Vec<u8>, Error> {
    let public_key = PublicKey::from_affine(*point)
        .map_err(|_| Error::Encoding("the identity is not a public key".to_string()))?;
    let document = public_key
        .to_public_key_der()
        .map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(document.as_bytes().to_vec())
}

/// Parse a DER SubjectPublicKeyInfo into a secp256k1 public key.
pub fn parse_public_key(der: &[u8]) -> Result<PublicKey, Error> {
    PublicKey::from_public_key_der(der).map_err(|e| Error::Encoding(format!("bad public key: {e}")))
}

/// The Ethereum address of a public key.
///
/// This is the last 20 bytes of the Keccak-256 hash of the uncompressed point,
/// without its leading tag byte.
pub fn ethereum_address(public_key: &PublicKey) -> [u8; 20] {
    let encoded = public_key.as_affine().to_encoded_point(false);
    let hash = Keccak256::digest(&encoded.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    out
}
