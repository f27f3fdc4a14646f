//! Per-workshop synchronization monitor
//!
//! Owns the workshop's stock state behind one lock and three conditions:
//! `material_available` (raw stock grew), `goods_ready` (finished stock
//! reached the pending order) and `space_available` (raw stock shrank).
//! Every wait loops on its predicate and on the `closed` flag, so a spurious
//! wakeup never passes a guard and `close()` releases every waiter.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::config::WorkshopConfig;
use super::errors::{ChainError, Result};
use super::event::{ChainEventKind, EventBus};
use super::types::{BufferCapacity, WorkshopId};

#[derive(Debug)]
struct WorkshopState {
    raw_stock: u64,
    finished_stock: u64,
    pending_order_qty: u64,
    produced_total: u64,
    delivered_total: u64,
    closed: bool,
}

/// Point-in-time copy of a workshop's stock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockSnapshot {
    /// `None` when raw material is unlimited
    pub raw_stock: Option<u64>,
    pub finished_stock: u64,
    pub pending_order_qty: u64,
    pub produced_total: u64,
    pub delivered_total: u64,
}

pub struct WorkshopMonitor {
    id: WorkshopId,
    label: String,
    capacity: BufferCapacity,
    units_per_product: u64,
    state: Mutex<WorkshopState>,
    material_available: Condvar,
    goods_ready: Condvar,
    space_available: Condvar,
    events: EventBus,
}

impl WorkshopMonitor {
    pub fn new(config: &WorkshopConfig, events: EventBus) -> Self {
        Self {
            id: config.id,
            label: config.label(),
            capacity: config.buffer_capacity,
            units_per_product: config.units_per_product,
            state: Mutex::new(WorkshopState {
                raw_stock: config.initial_raw_stock,
                finished_stock: 0,
                pending_order_qty: 0,
                produced_total: 0,
                delivered_total: 0,
                closed: false,
            }),
            material_available: Condvar::new(),
            goods_ready: Condvar::new(),
            space_available: Condvar::new(),
            events,
        }
    }

    pub fn id(&self) -> WorkshopId {
        self.id
    }

    /// Add a shipment to raw stock and wake the production engine
    pub fn add_raw_material(&self, qty: u64) -> Result<()> {
        let BufferCapacity::Bounded(capacity) = self.capacity else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChainError::Shutdown);
        }
        let total = state.raw_stock.saturating_add(qty);
        if !self.capacity.fits(total) {
            return Err(ChainError::CapacityExceeded {
                workshop: self.id,
                raw: state.raw_stock,
                incoming: qty,
                capacity,
            });
        }
        state.raw_stock = total;
        debug!("[Workshop:{}] raw stock now {}", self.label, state.raw_stock);
        self.material_available.notify_all();
        Ok(())
    }

    /// Reserve buffer room for an incoming batch of up to `want` raw units.
    ///
    /// Blocks while the batch does not fit and production can still free
    /// room. When production is starved (less than one product's worth held)
    /// the batch is cut down to the free room instead, so a leftover that is
    /// not a multiple of `units_per_product` can never wedge the cycle.
    pub fn reserve_room(&self, want: u64) -> Result<u64> {
        let BufferCapacity::Bounded(capacity) = self.capacity else {
            return Ok(want);
        };
        let mut state = self.state.lock();
        let mut reported = false;
        loop {
            if state.closed {
                return Err(ChainError::Shutdown);
            }
            if self.capacity.fits(state.raw_stock.saturating_add(want)) {
                return Ok(want);
            }
            if state.raw_stock < self.units_per_product {
                let granted = capacity - state.raw_stock;
                debug!(
                    "[Workshop:{}] starved with {} raw, batch cut from {} to {}",
                    self.label, state.raw_stock, want, granted
                );
                return Ok(granted);
            }
            if !reported {
                warn!(
                    "[Workshop:{}] buffer full ({} raw, {} incoming), waiting for production",
                    self.label, state.raw_stock, want
                );
                reported = true;
            }
            self.space_available.wait(&mut state);
        }
    }

    /// Take one product's worth of raw units, blocking while stock is short
    pub fn consume_raw_for_one_unit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.capacity.is_unbounded() {
            return if state.closed { Err(ChainError::Shutdown) } else { Ok(()) };
        }
        let mut reported = false;
        while !state.closed && state.raw_stock < self.units_per_product {
            if !reported {
                warn!(
                    "[Workshop:{}] STOCK SHORTAGE: {} raw, {} needed",
                    self.label, state.raw_stock, self.units_per_product
                );
                self.events.emit(self.id, ChainEventKind::StockShortage, state.raw_stock);
                reported = true;
            }
            self.material_available.wait(&mut state);
        }
        if state.closed {
            return Err(ChainError::Shutdown);
        }
        state.raw_stock -= self.units_per_product;
        self.space_available.notify_all();
        Ok(())
    }

    /// Record one finished unit; wakes the shipper once the order is covered
    pub fn add_finished_unit(&self) {
        let mut state = self.state.lock();
        state.finished_stock += 1;
        state.produced_total += 1;
        if state.finished_stock >= state.pending_order_qty {
            self.goods_ready.notify_all();
        }
    }

    /// Block until `qty` finished units exist, then remove them
    pub fn take_finished(&self, qty: u64) -> Result<()> {
        let mut state = self.state.lock();
        while !state.closed && state.finished_stock < qty {
            debug!(
                "[Workshop:{}] waiting for production before shipping ({}/{})",
                self.label, state.finished_stock, qty
            );
            self.goods_ready.wait(&mut state);
        }
        if state.closed {
            return Err(ChainError::Shutdown);
        }
        state.finished_stock -= qty;
        state.delivered_total += qty;
        Ok(())
    }

    /// Set the quantity the production engine works toward
    pub fn begin_cycle(&self, qty: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChainError::Shutdown);
        }
        state.pending_order_qty = qty;
        Ok(())
    }

    /// Reset per-order fields; leftover raw stock is kept
    pub fn end_cycle(&self) {
        let mut state = self.state.lock();
        state.pending_order_qty = 0;
        state.finished_stock = 0;
    }

    /// Whether the current order still needs units
    pub fn production_outstanding(&self) -> Result<bool> {
        let state = self.state.lock();
        if state.closed {
            return Err(ChainError::Shutdown);
        }
        Ok(state.finished_stock < state.pending_order_qty)
    }

    /// Raw units currently buffered, `None` when unlimited
    pub fn raw_stock(&self) -> Option<u64> {
        if self.capacity.is_unbounded() {
            None
        } else {
            Some(self.state.lock().raw_stock)
        }
    }

    pub fn snapshot(&self) -> StockSnapshot {
        let state = self.state.lock();
        StockSnapshot {
            raw_stock: if self.capacity.is_unbounded() { None } else { Some(state.raw_stock) },
            finished_stock: state.finished_stock,
            pending_order_qty: state.pending_order_qty,
            produced_total: state.produced_total,
            delivered_total: state.delivered_total,
        }
    }

    /// Release every waiter; all later blocking calls fail with `Shutdown`
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.material_available.notify_all();
        self.goods_ready.notify_all();
        self.space_available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventLog;
    use crate::core::types::ChainRole;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn bounded_monitor(capacity: u64, units: u64) -> WorkshopMonitor {
        let config = WorkshopConfig::new(2, "Press", ChainRole::ClientEnd)
            .with_capacity(capacity)
            .with_units_per_product(units)
            .with_upstream(1);
        WorkshopMonitor::new(&config, EventBus::default())
    }

    #[test]
    fn test_consume_and_produce() {
        let monitor = bounded_monitor(4, 2);
        monitor.add_raw_material(4).unwrap();
        monitor.begin_cycle(2).unwrap();
        assert!(monitor.production_outstanding().unwrap());

        monitor.consume_raw_for_one_unit().unwrap();
        monitor.add_finished_unit();
        monitor.consume_raw_for_one_unit().unwrap();
        monitor.add_finished_unit();

        assert!(!monitor.production_outstanding().unwrap());
        let snap = monitor.snapshot();
        assert_eq!(snap.raw_stock, Some(0));
        assert_eq!(snap.finished_stock, 2);
        assert_eq!(snap.produced_total, 2);

        monitor.take_finished(2).unwrap();
        monitor.end_cycle();
        let snap = monitor.snapshot();
        assert_eq!(snap.finished_stock, 0);
        assert_eq!(snap.pending_order_qty, 0);
        assert_eq!(snap.delivered_total, 2);
    }

    #[test]
    fn test_capacity_exceeded() {
        let monitor = bounded_monitor(3, 1);
        monitor.add_raw_material(2).unwrap();
        assert!(matches!(
            monitor.add_raw_material(2),
            Err(ChainError::CapacityExceeded { raw: 2, incoming: 2, capacity: 3, .. })
        ));
        assert_eq!(monitor.raw_stock(), Some(2));
    }

    #[test]
    fn test_shortage_blocks_until_material_arrives() {
        let log = Arc::new(EventLog::new());
        let mut bus = EventBus::default();
        bus.subscribe(log.clone());
        let config = WorkshopConfig::new(2, "Press", ChainRole::ClientEnd)
            .with_capacity(4)
            .with_units_per_product(2)
            .with_upstream(1);
        let monitor = Arc::new(WorkshopMonitor::new(&config, bus));
        monitor.add_raw_material(1).unwrap();

        let consumer = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.consume_raw_for_one_unit())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!consumer.is_finished());

        monitor.add_raw_material(1).unwrap();
        consumer.join().unwrap().unwrap();
        assert_eq!(monitor.raw_stock(), Some(0));
        assert_eq!(log.count(WorkshopId(2), ChainEventKind::StockShortage), 1);
    }

    #[test]
    fn test_take_finished_waits_for_goods() {
        let monitor = Arc::new(bounded_monitor(2, 1));
        monitor.begin_cycle(2).unwrap();
        let shipper = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.take_finished(2))
        };
        monitor.add_finished_unit();
        thread::sleep(Duration::from_millis(20));
        assert!(!shipper.is_finished());
        monitor.add_finished_unit();
        shipper.join().unwrap().unwrap();
        assert_eq!(monitor.snapshot().finished_stock, 0);
    }

    #[test]
    fn test_reserve_room_waits_for_production() {
        let monitor = Arc::new(bounded_monitor(3, 2));
        monitor.add_raw_material(2).unwrap();
        let requester = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.reserve_room(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!requester.is_finished());
        monitor.consume_raw_for_one_unit().unwrap();
        assert_eq!(requester.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn test_reserve_room_cuts_batch_when_starved() {
        let config = WorkshopConfig::new(2, "Lathe", ChainRole::ClientEnd)
            .with_capacity(4)
            .with_units_per_product(3)
            .with_upstream(1)
            .with_initial_raw_stock(2);
        let monitor = WorkshopMonitor::new(&config, EventBus::default());
        assert_eq!(monitor.reserve_room(3).unwrap(), 2);
        assert_eq!(monitor.reserve_room(1).unwrap(), 1);
    }

    #[test]
    fn test_close_releases_waiters() {
        let monitor = Arc::new(bounded_monitor(2, 2));
        let consumer = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.consume_raw_for_one_unit())
        };
        let shipper = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.take_finished(1))
        };
        thread::sleep(Duration::from_millis(20));
        monitor.close();
        assert!(matches!(consumer.join().unwrap(), Err(ChainError::Shutdown)));
        assert!(matches!(shipper.join().unwrap(), Err(ChainError::Shutdown)));
        assert!(monitor.is_closed());
        assert!(matches!(monitor.begin_cycle(1), Err(ChainError::Shutdown)));
    }

    #[test]
    fn test_unbounded_never_blocks() {
        let config = WorkshopConfig::new(1, "Mine", ChainRole::SupplyEnd).with_units_per_product(3);
        let monitor = WorkshopMonitor::new(&config, EventBus::default());
        assert_eq!(monitor.raw_stock(), None);
        for _ in 0..5 {
            monitor.consume_raw_for_one_unit().unwrap();
        }
        monitor.add_raw_material(100).unwrap();
        assert_eq!(monitor.snapshot().raw_stock, None);
    }
}
