//! Session identifiers, and the coordinator handing them out.
//!
//! Every call belonging to one logical operation (one key generation, one
//! signature, one recovery) carries the same [SessionId]. Nodes use it to
//! find each other's contributions, so it must be fixed before any call is
//! dispatched, and must never be shared by two unrelated operations.

use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use rand_core::{CryptoRngCore, OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{constants::SESSION_ID_LEN, error::Error};

/// An opaque, fixed length, random token correlating the calls of one operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; SESSION_ID_LEN];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| Error::Encoding(format!("bad session id: {e}")))?;
        Ok(Self(out))
    }
}

/// Hands out fresh session identifiers.
///
/// The randomness source is injected, so tests can use a seeded generator.
/// It must be cryptographically secure: a predictable or repeated session id
/// lets an observer replay or confuse calls at the node layer.
pub struct SessionCoordinator {
    rng: Mutex<Box<dyn CryptoRngCore + Send>>,
}

impl SessionCoordinator {
    pub fn new(rng: impl CryptoRngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Draw the identifier for a new logical operation.
    pub fn next_session(&self) -> SessionId {
        let mut out = [0u8; SESSION_ID_LEN];
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(&mut out);
        SessionId(out)
    }
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new(OsRng)
    }
}

impl fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCoordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashSet;

    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn test_sessions_are_fresh() {
        let sessions = SessionCoordinator::default();
        let seen: HashSet<_> = (0..64).map(|_| sessions.next_session()).collect();
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_seeded_sessions_are_reproducible() {
        let a = SessionCoordinator::new(ChaCha20Rng::seed_from_u64(7));
        let b = SessionCoordinator::new(ChaCha20Rng::seed_from_u64(7));
        assert_eq!(a.next_session(), b.next_session());
        assert_ne!(a.next_session(), a.next_session());
    }

    #[test]
    fn test_hex_round_trip() -> Result<(), Error> {
        let session = SessionCoordinator::default().next_session();
        assert_eq!(session.to_string().parse::<SessionId>()?, session);
        assert!("abcd".parse::<SessionId>().is_err());
        Ok(())
    }
}
