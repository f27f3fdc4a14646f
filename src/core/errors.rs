use thiserror::Error;

use super::types::WorkshopId;

/// Result type for chain operations
pub type Result<T> = std::result::Result<T, ChainError>;

/// Errors raised while building, running or tearing down a chain
#[derive(Debug, Error)]
pub enum ChainError {
    /// Invalid workshop or chain configuration, rejected before any task starts
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A broker lookup did not resolve within the bounded wait
    #[error(
        "topology error: no downstream workshop registered with workshop {workshop} \
         within {waited_ms} ms"
    )]
    Topology { workshop: WorkshopId, waited_ms: u64 },

    /// A link transferred something other than what the protocol expects
    #[error("channel failure at workshop {workshop}: {reason}")]
    ChannelIo { workshop: WorkshopId, reason: String },

    /// Raw stock would exceed the buffer
    #[error("workshop {workshop} cannot take {incoming} raw units ({raw}/{capacity} held)")]
    CapacityExceeded {
        workshop: WorkshopId,
        raw: u64,
        incoming: u64,
        capacity: u64,
    },

    /// Customer order quantity must be positive and its raw requirement representable
    #[error("order quantity {quantity} is out of range")]
    InvalidOrder { quantity: u64 },

    /// The task was cancelled by chain termination
    #[error("chain is shut down")]
    Shutdown,

    /// Termination was requested; no new orders are accepted
    #[error("chain is shutting down, order refused")]
    ShuttingDown,

    /// The order was lost because a fault tore the chain down
    #[error("chain aborted: {reason}")]
    Aborted { reason: String },

    #[error("failed to spawn {task}: {reason}")]
    Spawn { task: String, reason: String },

    #[error("task {task} panicked")]
    TaskPanicked { task: String },

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl ChainError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn channel_io(workshop: WorkshopId, reason: impl Into<String>) -> Self {
        Self::ChannelIo {
            workshop,
            reason: reason.into(),
        }
    }

    /// Cancellation is the normal way tasks end, everything else is a fault
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ChainError::Shutdown)
    }
}
