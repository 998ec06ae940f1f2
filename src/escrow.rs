//! The escrow key pair, and the envelopes recovery shares travel in.
//!
//! Nodes seal their key shares to the escrow public key with ECIES over
//! secp256k1: an ephemeral Diffie-Hellman exchange, HKDF-SHA256 to derive a
//! key, and AES-256-GCM. The associated data binds an envelope to the session,
//! the key, the player and the escrow label, so an envelope can't be replayed
//! in another context.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use elliptic_curve::sec1::ToEncodedPoint;
use hkdf::Hkdf;
use k256::{
    ecdh::{diffie_hellman, EphemeralSecret},
    pkcs8::{DecodePublicKey, EncodePublicKey},
    PublicKey, SecretKey,
};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::constants::ESCROW_KDF_INFO;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("invalid escrow public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid escrow private key")]
    InvalidPrivateKey,
    #[error("escrow private key does not belong to the public key")]
    KeyMismatch,
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// Wrong key, wrong associated data, or a tampered envelope.
    #[error("envelope could not be opened")]
    Open,
    #[error("envelope could not be sealed")]
    Seal,
}

/// The key pair recovery shares are sealed to.
///
/// It is generated outside the cluster. Nodes only ever see the public key;
/// the private key is used locally to reconstruct, and wiped on drop.
#[derive(Clone)]
pub struct EscrowKeyPair {
    /// DER encoded SubjectPublicKeyInfo.
    public_key: Vec<u8>,
    /// The raw 32 byte scalar.
    private_key: Zeroizing<Vec<u8>>,
    label: Vec<u8>,
}

impl EscrowKeyPair {
    pub fn generate(rng: &mut impl CryptoRngCore, label: impl Into<Vec<u8>>) -> Result<Self, EscrowError> {
        let secret = SecretKey::random(rng);
        let public_key = secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| EscrowError::InvalidPublicKey(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            public_key,
            private_key: Zeroizing::new(secret.to_bytes().to_vec()),
            label: label.into(),
        })
    }

    /// Assemble a key pair, checking that both halves belong together.
    pub fn from_parts(public_key: Vec<u8>, private_key: Vec<u8>, label: Vec<u8>) -> Result<Self, EscrowError> {
        let private_key = Zeroizing::new(private_key);
        let secret = SecretKey::from_slice(&private_key).map_err(|_| EscrowError::InvalidPrivateKey)?;
        let public = PublicKey::from_public_key_der(&public_key)
            .map_err(|e| EscrowError::InvalidPublicKey(e.to_string()))?;
        if secret.public_key() != public {
            return Err(EscrowError::KeyMismatch);
        }
        Ok(Self {
            public_key,
            private_key,
            label,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    pub fn label(&self) -> &[u8] {
        &self.label
    }
}

impl fmt::Debug for EscrowKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowKeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .field("label", &String::from_utf8_lossy(&self.label))
            .finish_non_exhaustive()
    }
}

/// A sealed payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender's ephemeral public key, SEC1 compressed.
    pub ephemeral: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("ephemeral", &hex::encode(&self.ephemeral))
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

fn cipher(shared: &[u8], ephemeral: &[u8], recipient: &PublicKey) -> Result<Aes256Gcm, EscrowError> {
    let recipient = recipient.to_encoded_point(true);
    let hk = Hkdf::<Sha256>::new(Some(ephemeral), shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand_multi_info(&[ESCROW_KDF_INFO, recipient.as_bytes()], &mut key[..])
        .map_err(|_| EscrowError::Seal)?;
    Aes256Gcm::new_from_slice(&key[..]).map_err(|_| EscrowError::Seal)
}

/// Seal a payload to a DER encoded escrow public key.
pub fn seal(
    rng: &mut impl CryptoRngCore,
    recipient: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Envelope, EscrowError> {
    let recipient = PublicKey::from_public_key_der(recipient)
        .map_err(|e| EscrowError::InvalidPublicKey(e.to_string()))?;

    let secret = EphemeralSecret::random(rng);
    let ephemeral = secret.public_key().to_encoded_point(true).as_bytes().to_vec();
    let shared = secret.diffie_hellman(&recipient);
    let cipher = cipher(shared.raw_secret_bytes(), &ephemeral, &recipient)?;

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EscrowError::Seal)?;

    Ok(Envelope {
        ephemeral,
        nonce,
        ciphertext,
    })
}

/// Open an envelope with the raw escrow private key.
pub fn open(private_key: &[u8], aad: &[u8], envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, EscrowError> {
    let secret = SecretKey::from_slice(private_key).map_err(|_| EscrowError::InvalidPrivateKey)?;
    let ephemeral = PublicKey::from_sec1_bytes(&envelope.ephemeral)
        .map_err(|_| EscrowError::Malformed("bad ephemeral key".to_string()))?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let cipher = cipher(shared.raw_secret_bytes(), &envelope.ephemeral, &secret.public_key())?;
    cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            Payload {
                msg: &envelope.ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| EscrowError::Open)
}
