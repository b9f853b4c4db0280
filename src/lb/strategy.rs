//! Backend selection strategies.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::Error;

/// The seven supported selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    IpHash,
    LeastConnections,
    ResponseTime,
    Random,
    WeightedRandom,
}

impl Strategy {
    /// All strategy names, for diagnostics.
    pub const ALL: [Strategy; 7] = [
        Strategy::RoundRobin,
        Strategy::WeightedRoundRobin,
        Strategy::IpHash,
        Strategy::LeastConnections,
        Strategy::ResponseTime,
        Strategy::Random,
        Strategy::WeightedRandom,
    ];

    /// Whether the given name parses to a supported strategy.
    pub fn is_supported(name: &str) -> bool {
        name.parse::<Strategy>().is_ok()
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "ip_hash" => Ok(Self::IpHash),
            "least_connections" => Ok(Self::LeastConnections),
            "response_time" => Ok(Self::ResponseTime),
            "random" => Ok(Self::Random),
            "weighted_random" => Ok(Self::WeightedRandom),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::IpHash => "ip_hash",
            Self::LeastConnections => "least_connections",
            Self::ResponseTime => "response_time",
            Self::Random => "random",
            Self::WeightedRandom => "weighted_random",
        };
        f.write_str(name)
    }
}

/// Hash a key to an index in `0..len`: SHA-256, first four bytes as a
/// big-endian u32, modulo the slot count. Used by `ip_hash` and session
/// affinity so the same key lands on the same backend while the active set
/// is unchanged.
pub fn hash_index(key: &str, len: usize) -> usize {
    debug_assert!(len > 0);
    let digest = Sha256::digest(key.as_bytes());
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (value as usize) % len
}
