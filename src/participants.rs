//! This module holds some utilities for working with participants.
//!
//! A participant is a player of the cluster, identified by its position in
//! the topology. Orchestrators talk about sets of participants all the time:
//! the quorum chosen for a signature, the players whose recovery shares were
//! collected, and so on. Those sets need an agreed order, no duplicates, and
//! Lagrange coefficients for recombining shares.

use std::{collections::HashSet, fmt};

use k256::Scalar;
use serde::{Deserialize, Serialize};

/// Represents a participant in the cluster.
///
/// The number is the player's index in the cluster topology, starting at 0.
/// It is the stable identity used in every call made on that player's behalf.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Participant(u32);

impl Participant {
    /// The position of this participant in the topology.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Return the scalar associated with this participant.
    ///
    /// Shares are evaluations of a polynomial at this point, which is never zero.
    pub fn scalar(&self) -> Scalar {
        Scalar::from(u64::from(self.0) + 1)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player {}", self.0)
    }
}

impl From<Participant> for u32 {
    fn from(p: Participant) -> Self {
        p.0
    }
}

impl From<u32> for Participant {
    fn from(x: u32) -> Self {
        Participant(x)
    }
}

/// Represents a sorted list of participants, without duplicates.
///
/// This is how a quorum is expressed: every node taking part in a signature
/// receives the same list, and since everybody agrees on its order it can be
/// hashed into the signing context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Participant>", into = "Vec<Participant>")]
pub struct ParticipantList {
    participants: Vec<Participant>,
}

/// The set of players taking part in a signing or recovery operation.
pub type QuorumSelection = ParticipantList;

impl ParticipantList {
    /// Create a participant list from a slice of participants.
    ///
    /// This will return None if the participants have duplicates.
    pub fn new(participants: &[Participant]) -> Option<Self> {
        let mut out = participants.to_owned();
        out.sort();

        let unique: HashSet<_> = out.iter().collect();
        if unique.len() < out.len() {
            return None;
        }

        Some(Self { participants: out })
    }

    /// Build a list from raw player indices.
    pub fn from_indices(indices: &[u32]) -> Option<Self> {
        let participants: Vec<Participant> = indices.iter().map(|&i| i.into()).collect();
        Self::new(&participants)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Check if this list has a given participant.
    pub fn contains(&self, participant: Participant) -> bool {
        self.participants.binary_search(&participant).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Participant> + '_ {
        self.participants.iter().copied()
    }

    /// Iterate over the other participants
    pub fn others(&self, me: Participant) -> impl Iterator<Item = Participant> + '_ {
        self.participants.iter().filter(move |x| **x != me).copied()
    }

    /// Get the lagrange coefficient for a participant, relative to this list.
    ///
    /// Weighting each participant's share by this coefficient and summing
    /// recovers the value of the shared polynomial at zero.
    pub fn lagrange(&self, p: Participant) -> Scalar {
        self.lagrange_at(p, &Scalar::ZERO)
    }

    /// Get the lagrange coefficient for a participant, when interpolating at an arbitrary point.
    pub fn lagrange_at(&self, p: Participant, at: &Scalar) -> Scalar {
        let p_scalar = p.scalar();

        let mut top = Scalar::ONE;
        let mut bot = Scalar::ONE;
        for q in self.others(p) {
            let q_scalar = q.scalar();
            top *= *at - q_scalar;
            bot *= p_scalar - q_scalar;
        }

        // The participants are distinct, so the denominator is never zero.
        top * bot.invert().unwrap()
    }
}

impl TryFrom<Vec<Participant>> for ParticipantList {
    type Error = String;

    fn try_from(participants: Vec<Participant>) -> Result<Self, Self::Error> {
        Self::new(&participants).ok_or_else(|| "participant list contains duplicates".to_string())
    }
}

impl From<ParticipantList> for Vec<Participant> {
    fn from(list: ParticipantList) -> Self {
        list.participants
    }
}

impl fmt::Display for ParticipantList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indices: Vec<String> = self.participants.iter().map(|p| p.0.to_string()).collect();
        write!(f, "{{{}}}", indices.join(", "))
    }
}
