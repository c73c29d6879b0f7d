use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one transport connection.
///
/// Every message delivered to a connection's mailbox is stamped with it, which
/// is how the engine tells its own messages apart from anyone else's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Weak view of a live connection handle.
///
/// The pool keeps one per checked-out connection so it can forget handles
/// that were dropped instead of checked in or released.
#[derive(Clone, Debug)]
pub struct ConnectionWatch {
    id: ConnectionId,
    alive: Weak<()>,
}

impl ConnectionWatch {
    pub(crate) fn new(id: ConnectionId, lease: &Arc<()>) -> Self {
        Self {
            id,
            alive: Arc::downgrade(lease),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// False once the watched handle has been dropped or closed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

/// Correlation token for one request issued on a connection.
///
/// Unique per request on a given connection; events produced for that request
/// carry the same reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestRef {
    connection: ConnectionId,
    sequence: u64,
}

impl RequestRef {
    pub(crate) fn new(connection: ConnectionId, sequence: u64) -> Self {
        Self {
            connection,
            sequence,
        }
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for RequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/req#{}", self.connection, self.sequence)
    }
}
