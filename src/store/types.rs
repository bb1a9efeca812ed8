//! Public types for the store facade.

/// Store lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Accepting operations.
    Open,
    /// `close()` began: new operations are refused while sessions drain.
    Closing,
    /// All sessions closed.
    Closed,
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Cheap health snapshot for host `/health`-style endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub state: StoreState,
    /// Live sessions, any state.
    pub sessions: usize,
    /// Sessions currently accepting operations.
    pub ready: usize,
    /// Sessions terminal after losing their lease.
    pub lost: usize,
    /// Shard documents awaiting deletion; `None` if the queue read failed.
    pub orphans_queued: Option<usize>,
}
