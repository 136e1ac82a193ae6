//! Audit stamps: who did something, and when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ActorId;

/// Actor + business time of an action.
///
/// Threaded explicitly through every command; there is no ambient "current user".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub actor_id: ActorId,
    pub at: DateTime<Utc>,
}

impl Stamp {
    pub fn new(actor_id: ActorId, at: DateTime<Utc>) -> Self {
        Self { actor_id, at }
    }

    /// Stamp with the current wall-clock time.
    pub fn now(actor_id: ActorId) -> Self {
        Self::new(actor_id, Utc::now())
    }
}
