//! Connection-scoped context.

/// Per-connection execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Monotonic id assigned by the acceptor.
    pub client_id: u64,
    /// Selected logical DB index for this client.
    pub db_index: u16,
    /// Whether `AUTH` succeeded (always true when no password is configured).
    pub authenticated: bool,
    /// Client name set through `CLIENT SETNAME`.
    pub name: String,
    /// Whether this connection belongs to a replication peer.
    pub replica_conn: bool,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self {
            client_id: 0,
            db_index: 0,
            authenticated: true,
            name: String::new(),
            replica_conn: false,
        }
    }
}

impl ConnectionContext {
    /// Creates a context for a freshly accepted client.
    ///
    /// `requires_auth` reflects whether the server has a password configured.
    #[must_use]
    pub fn new(requires_auth: bool) -> Self {
        Self {
            authenticated: !requires_auth,
            ..Self::default()
        }
    }
}
