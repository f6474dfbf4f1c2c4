//! Replicator state types.
//!
//! Defines the state machine for the replicator lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ──────────────→ Connecting ──(bind failed)──→ Failed
//!    │                        │
//!    │                        │ (subscription bound)
//!    │                        ↓
//!    │                    CatchingUp ──(backfill done)──→ Running
//!    │                        │                             │
//!    │             shutdown() │                  shutdown() │
//!    │                        ↓                             │
//!    └──────────────────→ ShuttingDown ←────────────────────┘
//!                             │
//!                             ↓
//!                          Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after construction. Nothing bound.
//! - **Connecting**: `start()` called, binding the live subscription.
//! - **CatchingUp**: Live tail running, backfill in progress. Queries are
//!   served but the replica may be behind.
//! - **Running**: Backfill complete; the replica is fed by the live tail alone.
//! - **ShuttingDown**: `shutdown()` called. Tasks draining.
//! - **Stopped**: Shutdown complete. Safe to drop.
//! - **Failed**: The live subscription could not be bound.

/// State of the replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Constructed but not started.
    Created,

    /// Binding the live subscription.
    Connecting,

    /// Live tail running, backfill in progress.
    CatchingUp,

    /// Backfill complete, live tail running.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,

    /// Could not start.
    Failed,
}

impl ReplicatorState {
    /// Whether the replicator has stopped (or is stopping) for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicatorState::ShuttingDown | ReplicatorState::Stopped | ReplicatorState::Failed
        )
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorState::Created => write!(f, "Created"),
            ReplicatorState::Connecting => write!(f, "Connecting"),
            ReplicatorState::CatchingUp => write!(f, "CatchingUp"),
            ReplicatorState::Running => write!(f, "Running"),
            ReplicatorState::ShuttingDown => write!(f, "ShuttingDown"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
            ReplicatorState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot. Collected without I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ReplicatorState,
    /// Backfill completed.
    pub ready: bool,
    /// Running and ready.
    pub healthy: bool,
    pub high_water_mark: Option<u64>,
    /// Queries parked on positions not yet seen.
    pub pending_waiters: usize,
    /// Backfill attempts started so far (1 on a clean first run).
    pub backfill_attempts: u64,
    /// Live deliveries received.
    pub live_delivered: u64,
    /// Live deliveries dropped as undecodable.
    pub live_dropped: u64,
    /// Live deliveries whose store write failed.
    pub live_store_failures: u64,
}
