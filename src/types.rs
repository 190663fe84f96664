//! Connection identity
//!
//! The registry is keyed by username, but a username outlives any single
//! connection: a user can drop and reconnect under the same name while the
//! old connection's death report is still in flight. `SessionId` tells the
//! two apart so cleanup only ever removes the connection that died.

use uuid::Uuid;

/// Identity of one accepted connection
///
/// Assigned when the session is built and never reused. Used by
/// `Registry::remove` to check that the stored session is the one
/// reporting, and as the tag on every per-connection log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
