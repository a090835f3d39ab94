//! Tier handoff tickets.
//!
//! When a session is sent from one tier to another, the source tier records a
//! [`Redirect`] and tells the client its id. The client reconnects to the
//! destination and presents the id together with the name, key and seed it was
//! given; the destination claims the redirect only if all of them match, and a
//! claimed redirect is gone for good.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::service::session::Session;
use crate::service::tier::ProtocolTier;

#[derive(Clone)]
pub struct Redirect {
    pub id: u32,
    /// Session that requested the handoff
    pub origin: Arc<Session>,
    pub source: ProtocolTier,
    pub destination: ProtocolTier,
    pub name: String,
    pub seed: u8,
    pub key: Vec<u8>,
    pub created_at: Instant,
}

impl Redirect {
    pub fn origin_connection(&self) -> u64 {
        self.origin.id()
    }

    /// Whether a join presenting these credentials may claim this redirect.
    pub fn matches(&self, name: &str, key: &[u8], seed: u8) -> bool {
        self.key.len() == key.len() && self.key == key && self.name == name && self.seed == seed
    }
}

impl fmt::Debug for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redirect")
            .field("id", &self.id)
            .field("origin", &self.origin.id())
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("name", &self.name)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}
