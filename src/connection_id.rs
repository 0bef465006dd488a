use std::fmt::{Display, Formatter};
use rand::Rng;

/// The id half of a connection's identity - the other half is the peer's address/port. Ids
///  are picked randomly by the connecting side, so two clients behind the same NAT can reach
///  the same server without coordination (collisions are disambiguated by the address part).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnectionId(u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConnectionId {
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// Generate a random id in the configured (inclusive) range.
    pub fn random(min: u32, max: u32) -> ConnectionId {
        ConnectionId(rand::thread_rng().gen_range(min..=max))
    }
}
