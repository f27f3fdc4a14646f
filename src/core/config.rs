//! Chain configuration
//!
//! One `WorkshopConfig` per workshop, supplied once at startup, plus the
//! chain-wide settings that control handshake timeouts and teardown.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::errors::{ChainError, Result};
use super::types::{BufferCapacity, ChainRole, WorkshopId};

/// What happens to an order still in flight when termination is requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Let the current cycle reach its delivery, then stop
    #[default]
    Drain,
    /// Cancel every wait immediately
    Abort,
}

/// Immutable description of one workshop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkshopConfig {
    pub id: WorkshopId,
    pub name: String,
    pub buffer_capacity: BufferCapacity,
    /// Raw units consumed per finished unit
    pub units_per_product: u64,
    /// Simulated time to manufacture one unit, in milliseconds
    pub production_latency_ms: u64,
    pub role: ChainRole,
    /// Workshop nearer the supply end, `None` for the supply end itself
    pub upstream: Option<WorkshopId>,
    /// Raw units already buffered when the chain starts
    #[serde(default)]
    pub initial_raw_stock: u64,
}

impl WorkshopConfig {
    pub fn new(id: u32, name: &str, role: ChainRole) -> Self {
        Self {
            id: WorkshopId(id),
            name: name.to_string(),
            buffer_capacity: match role {
                ChainRole::SupplyEnd => BufferCapacity::Unbounded,
                _ => BufferCapacity::Bounded(1),
            },
            units_per_product: 1,
            production_latency_ms: 0,
            role,
            upstream: None,
            initial_raw_stock: 0,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.buffer_capacity = BufferCapacity::Bounded(capacity);
        self
    }

    pub fn with_units_per_product(mut self, units: u64) -> Self {
        self.units_per_product = units;
        self
    }

    pub fn with_latency_ms(mut self, millis: u64) -> Self {
        self.production_latency_ms = millis;
        self
    }

    pub fn with_upstream(mut self, upstream: u32) -> Self {
        self.upstream = Some(WorkshopId(upstream));
        self
    }

    pub fn with_initial_raw_stock(mut self, raw: u64) -> Self {
        self.initial_raw_stock = raw;
        self
    }

    pub fn production_latency(&self) -> Duration {
        Duration::from_millis(self.production_latency_ms)
    }

    /// Tag used as log prefix, e.g. `Press#2`
    pub fn label(&self) -> String {
        format!("{}#{}", self.name, self.id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.get() == 0 {
            return Err(ChainError::config(format!(
                "workshop '{}' has id 0, ids start at 1",
                self.name
            )));
        }

        if self.name.trim().is_empty() {
            return Err(ChainError::config(format!("workshop {} has an empty name", self.id)));
        }

        if self.units_per_product == 0 {
            return Err(ChainError::config(format!(
                "workshop {} needs at least one raw unit per product",
                self.label()
            )));
        }

        match (self.role, self.buffer_capacity) {
            (ChainRole::SupplyEnd, BufferCapacity::Bounded(_)) => {
                return Err(ChainError::config(format!(
                    "supply-end workshop {} must have unbounded capacity",
                    self.label()
                )));
            }
            (ChainRole::SupplyEnd, BufferCapacity::Unbounded) => {}
            (_, BufferCapacity::Unbounded) => {
                return Err(ChainError::config(format!(
                    "only the supply end may have unbounded capacity, {} is {}",
                    self.label(),
                    self.role
                )));
            }
            (_, BufferCapacity::Bounded(capacity)) => {
                if capacity == 0 {
                    return Err(ChainError::config(format!(
                        "workshop {} has zero buffer capacity",
                        self.label()
                    )));
                }
                if self.units_per_product > capacity {
                    return Err(ChainError::config(format!(
                        "workshop {} needs {} raw units per product but only holds {}",
                        self.label(),
                        self.units_per_product,
                        capacity
                    )));
                }
                if self.initial_raw_stock > capacity {
                    return Err(ChainError::config(format!(
                        "workshop {} starts with {} raw units, more than its capacity {}",
                        self.label(),
                        self.initial_raw_stock,
                        capacity
                    )));
                }
            }
        }

        match (self.role.has_upstream(), self.upstream) {
            (false, Some(upstream)) => Err(ChainError::config(format!(
                "supply-end workshop {} cannot have upstream {}",
                self.label(),
                upstream
            ))),
            (true, None) => Err(ChainError::config(format!(
                "{} workshop {} has no upstream neighbor",
                self.role,
                self.label()
            ))),
            (true, Some(upstream)) if upstream == self.id => Err(ChainError::config(format!(
                "workshop {} names itself as upstream",
                self.label()
            ))),
            _ => Ok(()),
        }
    }
}

/// Spec of one entry for `ChainConfig::linear`
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    /// Ignored for the first (supply-end) stage
    pub capacity: u64,
    pub units_per_product: u64,
    pub latency_ms: u64,
}

impl StageSpec {
    pub fn new(name: &str, capacity: u64, units_per_product: u64, latency_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            units_per_product,
            latency_ms,
        }
    }
}

/// Configuration of the whole chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub workshops: Vec<WorkshopConfig>,
    /// Bounded wait for a broker rendezvous before reporting a topology error
    #[serde(default = "default_broker_timeout_ms")]
    pub broker_timeout_ms: u64,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
    /// Upper bound on draining an in-flight order at shutdown
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_broker_timeout_ms() -> u64 {
    2_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

impl ChainConfig {
    pub fn new(workshops: Vec<WorkshopConfig>) -> Self {
        Self {
            workshops,
            broker_timeout_ms: default_broker_timeout_ms(),
            shutdown_policy: ShutdownPolicy::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }

    /// Build a straight chain from an ordered list, supply end first.
    ///
    /// Ids are assigned 1..N, the first stage becomes the supply end with
    /// unbounded capacity and the last one the client end.
    pub fn linear(stages: &[StageSpec]) -> Self {
        let last = stages.len().saturating_sub(1);
        let workshops = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let id = index as u32 + 1;
                let role = if index == 0 {
                    ChainRole::SupplyEnd
                } else if index == last {
                    ChainRole::ClientEnd
                } else {
                    ChainRole::Intermediate
                };
                let mut workshop = WorkshopConfig::new(id, &stage.name, role)
                    .with_units_per_product(stage.units_per_product)
                    .with_latency_ms(stage.latency_ms);
                if index > 0 {
                    workshop = workshop.with_capacity(stage.capacity).with_upstream(id - 1);
                }
                workshop
            })
            .collect();
        Self::new(workshops)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ChainConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_broker_timeout(mut self, timeout: Duration) -> Self {
        self.broker_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn workshop(&self, id: WorkshopId) -> Option<&WorkshopConfig> {
        self.workshops.iter().find(|w| w.id == id)
    }

    pub fn client_end(&self) -> Option<&WorkshopConfig> {
        self.workshops.iter().find(|w| w.role == ChainRole::ClientEnd)
    }

    /// Checks every workshop and the chain shape. Whether each upstream id
    /// names a live peer is left to the broker rendezvous.
    pub fn validate(&self) -> Result<()> {
        if self.workshops.len() < 2 {
            return Err(ChainError::config(format!(
                "a chain needs at least 2 workshops, got {}",
                self.workshops.len()
            )));
        }

        if self.broker_timeout_ms == 0 {
            return Err(ChainError::config("broker timeout must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for workshop in &self.workshops {
            workshop.validate()?;
            if !seen.insert(workshop.id) {
                return Err(ChainError::config(format!("duplicate workshop id {}", workshop.id)));
            }
        }

        let count_role = |role: ChainRole| self.workshops.iter().filter(|w| w.role == role).count();
        let supply = count_role(ChainRole::SupplyEnd);
        if supply != 1 {
            return Err(ChainError::config(format!(
                "expected exactly one supply-end workshop, found {}",
                supply
            )));
        }
        let client = count_role(ChainRole::ClientEnd);
        if client != 1 {
            return Err(ChainError::config(format!(
                "expected exactly one client-end workshop, found {}",
                client
            )));
        }

        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::linear(&[
            StageSpec::new("Foundry", 0, 1, 10),
            StageSpec::new("Press", 6, 2, 20),
            StageSpec::new("Assembly", 4, 1, 30),
        ])
    }
}
