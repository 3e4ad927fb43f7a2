//! Process-wide network mode.

/// Which role this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Not started, or stopped.
    #[default]
    None,
    /// Values are local-only; no networking.
    Local,
    /// Accepts many peer connections.
    Server,
    /// Maintains one outbound connection.
    Client,
}

/// Coarse status of the active role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeStatus {
    /// No role running.
    #[default]
    Idle,
    /// Role is starting up.
    Starting,
    /// Role is operating normally.
    Running,
    /// The most recent operation for this role failed. For a client this is
    /// transient (the connect loop keeps retrying); for a server it is
    /// terminal (the acceptor could not start).
    Failed,
}

/// Role plus status, readable from any task.
///
/// This is a hint for user code, not a synchronization primitive: it is
/// written only by the loop that owns the role and may lag the underlying
/// events by one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkMode {
    /// The role.
    pub role: Role,
    /// The role's status.
    pub status: ModeStatus,
}

impl NetworkMode {
    /// Compose a mode value.
    pub fn new(role: Role, status: ModeStatus) -> Self {
        Self { role, status }
    }

    /// True when operating (or starting) as a server.
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// True when operating (or starting) as a client.
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:?}", self.role, self.status)
    }
}
