use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a workshop in the chain (1..N)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkshopId(pub u32);

impl WorkshopId {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkshopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a workshop in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainRole {
    /// Faces the customer; receives the order quantity directly
    ClientEnd,
    /// Unlimited raw material, no upstream neighbor
    SupplyEnd,
    Intermediate,
}

impl ChainRole {
    /// Whether this workshop pulls material from an upstream neighbor
    pub fn has_upstream(&self) -> bool {
        !matches!(self, ChainRole::SupplyEnd)
    }

    /// Whether this workshop ships to a downstream workshop
    pub fn has_downstream(&self) -> bool {
        !matches!(self, ChainRole::ClientEnd)
    }
}

impl std::fmt::Display for ChainRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainRole::ClientEnd => write!(f, "client-end"),
            ChainRole::SupplyEnd => write!(f, "supply-end"),
            ChainRole::Intermediate => write!(f, "intermediate"),
        }
    }
}

/// Raw material buffer size of a workshop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferCapacity {
    Bounded(u64),
    Unbounded,
}

impl BufferCapacity {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, BufferCapacity::Unbounded)
    }

    /// Whether `amount` raw units fit in this buffer
    pub fn fits(&self, amount: u64) -> bool {
        match self {
            BufferCapacity::Bounded(capacity) => amount <= *capacity,
            BufferCapacity::Unbounded => true,
        }
    }
}

impl std::fmt::Display for BufferCapacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferCapacity::Bounded(capacity) => write!(f, "{}", capacity),
            BufferCapacity::Unbounded => write!(f, "infinite"),
        }
    }
}

/// Request sent upstream on the order link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderMessage {
    pub quantity: u64,
}

/// Shipment sent downstream on the goods link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialMessage {
    pub quantity: u64,
}

/// Order handed by the customer to the client-end workshop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomerOrder {
    pub cycle_id: Uuid,
    pub quantity: u64,
}

/// Final notification sent to the customer when an order completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMessage {
    pub cycle_id: Uuid,
    pub quantity: u64,
}
