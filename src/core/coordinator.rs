//! Demand-pull coordinator
//!
//! One coordinator per workshop turns an incoming quantity into a sequence
//! of capacity-bounded batch requests toward the supply end, triggers its
//! production engine, and ships the finished quantity downstream (or
//! delivers it to the customer at the client end).

use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::broker::ChannelBroker;
use super::channel::{open_stage_channel, DownstreamLink, UpstreamLink};
use super::config::WorkshopConfig;
use super::errors::{ChainError, Result};
use super::event::{ChainEventKind, EventBus};
use super::monitor::WorkshopMonitor;
use super::production::ProductionRun;
use super::shutdown::Halt;
use super::types::{
    BufferCapacity, CustomerOrder, DeliveryMessage, MaterialMessage, OrderMessage, WorkshopId,
};

/// Largest multiple of `unit` that fits in `capacity`
pub fn floor_to_multiple(capacity: u64, unit: u64) -> u64 {
    if unit == 0 {
        return capacity;
    }
    capacity / unit * unit
}

/// Raw units to pull from upstream for `quantity` products given what is held.
/// `None` when the raw requirement does not fit in a `u64`.
pub fn raw_needed(quantity: u64, units_per_product: u64, raw_on_hand: u64) -> Option<u64> {
    quantity
        .checked_mul(units_per_product)
        .map(|raw| raw.saturating_sub(raw_on_hand))
}

/// Upstream round trips for `needed` raw units with batches of at most `max_batch`
pub fn batch_count(needed: u64, max_batch: u64) -> u64 {
    if max_batch == 0 {
        return 0;
    }
    needed.div_ceil(max_batch)
}

/// Where a coordinator's orders come from and its output goes
pub enum Demand {
    /// Client end: orders from the customer, deliveries back to it
    Customer {
        orders: Receiver<CustomerOrder>,
        deliveries: Sender<DeliveryMessage>,
    },
    Downstream(DownstreamLink),
}

/// Where a coordinator's raw material comes from
pub enum Supply {
    /// Supply end: raw material never runs out
    Unlimited,
    Upstream(UpstreamLink),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    AwaitingOrder,
    RequestingMaterial,
    AwaitingDelivery,
    Shipping,
}

/// Shared view of a coordinator's current state
#[derive(Clone)]
pub struct CoordinatorStatus {
    state: Arc<Mutex<CoordinatorState>>,
}

impl CoordinatorStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::Idle)),
        }
    }

    pub fn get(&self) -> CoordinatorState {
        *self.state.lock()
    }

    fn set(&self, state: CoordinatorState) {
        *self.state.lock() = state;
    }
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Links a workshop obtains from the broker handshake
pub struct StageLinks {
    pub upstream: Option<UpstreamLink>,
    pub downstream: Option<DownstreamLink>,
}

/// Wire `config`'s workshop to its neighbors through the broker.
///
/// Registration toward the upstream neighbor never blocks; claiming the
/// downstream neighbor's registration waits at most `timeout`.
pub fn handshake(
    config: &WorkshopConfig,
    broker: &ChannelBroker,
    timeout: Duration,
) -> Result<StageLinks> {
    let upstream = match config.upstream {
        Some(upstream_id) if config.role.has_upstream() => {
            let (up, down) = open_stage_channel(upstream_id, config.id);
            broker.register(upstream_id, down)?;
            Some(up)
        }
        _ => None,
    };

    let downstream = if config.role.has_downstream() {
        Some(broker.claim(config.id, timeout)?)
    } else {
        None
    };

    debug!(
        "[Workshop:{}] links established (upstream: {:?}, downstream: {:?})",
        config.label(),
        upstream.as_ref().map(|l| l.peer),
        downstream.as_ref().map(|l| l.peer)
    );
    Ok(StageLinks { upstream, downstream })
}

/// One incoming request, from the customer or the downstream neighbor
#[derive(Debug, Clone, Copy)]
struct Request {
    cycle_id: Option<Uuid>,
    quantity: u64,
}

pub struct OrderCoordinator {
    id: WorkshopId,
    label: String,
    capacity: BufferCapacity,
    units_per_product: u64,
    monitor: Arc<WorkshopMonitor>,
    production: Sender<ProductionRun>,
    demand: Demand,
    supply: Supply,
    halt: Halt,
    events: EventBus,
    status: CoordinatorStatus,
}

impl OrderCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &WorkshopConfig,
        monitor: Arc<WorkshopMonitor>,
        production: Sender<ProductionRun>,
        demand: Demand,
        supply: Supply,
        halt: Halt,
        events: EventBus,
        status: CoordinatorStatus,
    ) -> Self {
        Self {
            id: config.id,
            label: config.label(),
            capacity: config.buffer_capacity,
            units_per_product: config.units_per_product,
            monitor,
            production,
            demand,
            supply,
            halt,
            events,
            status,
        }
    }

    /// Serve requests until the demand side closes or the chain halts
    pub fn run(self) -> Result<()> {
        loop {
            self.transition(CoordinatorState::AwaitingOrder);
            let Some(request) = self.next_request()? else {
                break;
            };
            let served = self.fulfil(request.quantity).and_then(|()| self.ship(request));
            if let Err(err) = served {
                // A neighbor that vanished after the halt is not a fault of its own
                return Err(if self.halt.is_halted() { ChainError::Shutdown } else { err });
            }
            self.transition(CoordinatorState::Idle);
        }
        self.transition(CoordinatorState::Idle);
        debug!("[Workshop:{}] coordinator stopped", self.label);
        Ok(())
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.status.get();
        if previous != next {
            debug!("[Workshop:{}] {:?} -> {:?}", self.label, previous, next);
            self.status.set(next);
        }
    }

    fn next_request(&self) -> Result<Option<Request>> {
        match &self.demand {
            Demand::Downstream(link) => {
                let order = link.receive_order(&self.halt)?;
                if let Some(order) = order {
                    info!(
                        "[Workshop:{}] received a request for {} piece(s) from workshop {}",
                        self.label, order.quantity, link.peer
                    );
                }
                Ok(order.map(|o| Request {
                    cycle_id: None,
                    quantity: o.quantity,
                }))
            }
            Demand::Customer { orders, .. } => {
                let received = select! {
                    recv(orders) -> order => Some(order),
                    recv(self.halt.listener()) -> _ => None,
                };
                match received {
                    None => Err(ChainError::Shutdown),
                    Some(Ok(order)) => {
                        info!(
                            "[Workshop:{}] customer ordered {} piece(s)",
                            self.label, order.quantity
                        );
                        Ok(Some(Request {
                            cycle_id: Some(order.cycle_id),
                            quantity: order.quantity,
                        }))
                    }
                    Some(Err(_)) if self.halt.is_halted() => Err(ChainError::Shutdown),
                    Some(Err(_)) => Ok(None),
                }
            }
        }
    }

    /// Produce `quantity` finished units, pulling raw material as needed
    fn fulfil(&self, quantity: u64) -> Result<()> {
        let raw_on_hand = self.monitor.raw_stock().unwrap_or(0);
        let needed = raw_needed(quantity, self.units_per_product, raw_on_hand)
            .ok_or(ChainError::InvalidOrder { quantity })?;
        self.monitor.begin_cycle(quantity)?;
        self.production
            .send(ProductionRun { quantity })
            .map_err(|_| {
                if self.halt.is_halted() {
                    ChainError::Shutdown
                } else {
                    ChainError::channel_io(self.id, "production engine is gone")
                }
            })?;

        let Supply::Upstream(link) = &self.supply else {
            return Ok(());
        };
        let BufferCapacity::Bounded(capacity) = self.capacity else {
            return Ok(());
        };

        let max_batch = floor_to_multiple(capacity, self.units_per_product);
        let mut remaining = needed;
        debug!(
            "[Workshop:{}] {} raw held, {} to pull in about {} batch(es) of up to {}",
            self.label,
            raw_on_hand,
            remaining,
            batch_count(remaining, max_batch),
            max_batch
        );

        while remaining > 0 {
            self.transition(CoordinatorState::RequestingMaterial);
            let batch = self.monitor.reserve_room(remaining.min(max_batch))?;
            link.send_order(self.id, OrderMessage { quantity: batch })?;
            info!(
                "[Workshop:{}] --> ordered {} raw unit(s) from workshop {}",
                self.label, batch, link.peer
            );
            self.events.emit(self.id, ChainEventKind::OrderPlaced, batch);

            self.transition(CoordinatorState::AwaitingDelivery);
            let material = link.receive_material(self.id, batch, &self.halt)?;
            self.monitor.add_raw_material(material.quantity)?;
            info!(
                "[Workshop:{}] received {} raw unit(s) (stock: {:?})",
                self.label,
                material.quantity,
                self.monitor.raw_stock()
            );
            self.events.emit(self.id, ChainEventKind::MaterialReceived, material.quantity);
            remaining -= material.quantity;
        }
        Ok(())
    }

    fn ship(&self, request: Request) -> Result<()> {
        self.transition(CoordinatorState::Shipping);
        self.monitor.take_finished(request.quantity)?;
        self.monitor.end_cycle();

        match &self.demand {
            Demand::Downstream(link) => {
                link.ship(self.id, MaterialMessage { quantity: request.quantity })?;
                info!(
                    "[Workshop:{}] --> shipped {} piece(s) to workshop {}",
                    self.label, request.quantity, link.peer
                );
                self.events.emit(self.id, ChainEventKind::ShipmentSent, request.quantity);
            }
            Demand::Customer { deliveries, .. } => {
                let delivery = DeliveryMessage {
                    cycle_id: request.cycle_id.unwrap_or_else(Uuid::new_v4),
                    quantity: request.quantity,
                };
                info!(
                    "[Workshop:{}] !! ORDER OF {} PIECE(S) COMPLETED !!",
                    self.label, request.quantity
                );
                self.events.emit(self.id, ChainEventKind::ShipmentSent, request.quantity);
                self.events.emit(self.id, ChainEventKind::DeliveryCompleted, request.quantity);
                deliveries.send(delivery).map_err(|_| {
                    ChainError::channel_io(self.id, "customer delivery link is closed")
                })?;
            }
        }
        Ok(())
    }
}
