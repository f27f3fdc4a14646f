pub mod core;

// Re-export commonly used types
pub use crate::core::config::{ChainConfig, ShutdownPolicy, StageSpec, WorkshopConfig};
pub use crate::core::customer::CustomerSession;
pub use crate::core::errors::{ChainError, Result};
pub use crate::core::event::{
    ChainEvent, ChainEventKind, ChainObserver, EventBus, EventLog, LoggingObserver,
};
pub use crate::core::monitor::StockSnapshot;
pub use crate::core::supervisor::{ShutdownReport, Supervisor, Terminator};
pub use crate::core::types::{BufferCapacity, ChainRole, DeliveryMessage, WorkshopId};
