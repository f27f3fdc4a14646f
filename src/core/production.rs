use crossbeam_channel::{select, Receiver};
use log::{debug, info};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::errors::{ChainError, Result};
use super::event::{ChainEventKind, EventBus};
use super::monitor::WorkshopMonitor;
use super::shutdown::Halt;

/// Start trigger sent by the coordinator once per order cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductionRun {
    pub quantity: u64,
}

/// Background task converting raw stock into finished units
pub struct ProductionEngine {
    label: String,
    monitor: Arc<WorkshopMonitor>,
    latency: Duration,
    triggers: Receiver<ProductionRun>,
    halt: Halt,
    events: EventBus,
}

impl ProductionEngine {
    pub fn new(
        label: String,
        monitor: Arc<WorkshopMonitor>,
        latency: Duration,
        triggers: Receiver<ProductionRun>,
        halt: Halt,
        events: EventBus,
    ) -> Self {
        Self {
            label,
            monitor,
            latency,
            triggers,
            halt,
            events,
        }
    }

    /// Serve production runs until the chain halts or the trigger link closes
    pub fn run(self) -> Result<()> {
        loop {
            let next = select! {
                recv(self.triggers) -> run => run.ok(),
                recv(self.halt.listener()) -> _ => None,
            };
            let Some(run) = next else {
                break;
            };

            match self.produce(run) {
                Ok(()) => {}
                Err(ChainError::Shutdown) => break,
                Err(err) => return Err(err),
            }
        }
        debug!("[Production:{}] stopped", self.label);
        Ok(())
    }

    fn produce(&self, run: ProductionRun) -> Result<()> {
        // An earlier run may already have covered this cycle
        if !self.monitor.production_outstanding()? {
            debug!("[Production:{}] run of {} already covered", self.label, run.quantity);
            return Ok(());
        }
        info!("[Production:{}] production of {} unit(s) started", self.label, run.quantity);
        self.events.emit(self.monitor.id(), ChainEventKind::ProductionStarted, run.quantity);

        while self.monitor.production_outstanding()? {
            self.monitor.consume_raw_for_one_unit()?;
            if !self.latency.is_zero() {
                thread::sleep(self.latency);
            }
            self.monitor.add_finished_unit();
            self.events.emit(self.monitor.id(), ChainEventKind::UnitProduced, 1);
        }

        debug!("[Production:{}] run of {} complete", self.label, run.quantity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WorkshopConfig;
    use crate::core::event::EventLog;
    use crate::core::types::{ChainRole, WorkshopId};
    use crossbeam_channel::unbounded;

    fn spawn_engine(
        config: &WorkshopConfig,
        log: Arc<EventLog>,
    ) -> (
        Arc<WorkshopMonitor>,
        crossbeam_channel::Sender<ProductionRun>,
        Halt,
        thread::JoinHandle<Result<()>>,
    ) {
        let mut bus = EventBus::default();
        bus.subscribe(log);
        let monitor = Arc::new(WorkshopMonitor::new(config, bus.clone()));
        let (trigger_tx, trigger_rx) = unbounded();
        let halt = Halt::new();
        let engine = ProductionEngine::new(
            config.label(),
            monitor.clone(),
            config.production_latency(),
            trigger_rx,
            halt.clone(),
            bus,
        );
        let handle = thread::spawn(move || engine.run());
        (monitor, trigger_tx, halt, handle)
    }

    #[test]
    fn test_produces_requested_quantity() {
        let config = WorkshopConfig::new(2, "Press", ChainRole::ClientEnd)
            .with_capacity(6)
            .with_units_per_product(2)
            .with_upstream(1)
            .with_initial_raw_stock(6)
            .with_latency_ms(1);
        let log = Arc::new(EventLog::new());
        let (monitor, trigger, halt, handle) = spawn_engine(&config, log.clone());

        monitor.begin_cycle(3).unwrap();
        trigger.send(ProductionRun { quantity: 3 }).unwrap();
        monitor.take_finished(3).unwrap();

        let snap = monitor.snapshot();
        assert_eq!(snap.raw_stock, Some(0));
        assert_eq!(snap.produced_total, 3);
        assert_eq!(log.count(WorkshopId(2), ChainEventKind::ProductionStarted), 1);
        assert_eq!(log.count(WorkshopId(2), ChainEventKind::UnitProduced), 3);

        halt.fire();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_resumes_after_shortage() {
        let config = WorkshopConfig::new(2, "Press", ChainRole::ClientEnd)
            .with_capacity(2)
            .with_units_per_product(2)
            .with_upstream(1);
        let log = Arc::new(EventLog::new());
        let (monitor, trigger, halt, handle) = spawn_engine(&config, log.clone());

        monitor.begin_cycle(2).unwrap();
        trigger.send(ProductionRun { quantity: 2 }).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(log.count(WorkshopId(2), ChainEventKind::StockShortage), 1);

        for _ in 0..2 {
            let batch = monitor.reserve_room(2).unwrap();
            monitor.add_raw_material(batch).unwrap();
        }
        monitor.take_finished(2).unwrap();
        assert_eq!(monitor.snapshot().produced_total, 2);

        halt.fire();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_halt_while_blocked_on_material() {
        let config = WorkshopConfig::new(2, "Press", ChainRole::ClientEnd)
            .with_capacity(2)
            .with_units_per_product(2)
            .with_upstream(1);
        let (monitor, trigger, halt, handle) = spawn_engine(&config, Arc::new(EventLog::new()));

        monitor.begin_cycle(1).unwrap();
        trigger.send(ProductionRun { quantity: 1 }).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());

        halt.fire();
        monitor.close();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_stops_when_trigger_link_closes() {
        let config = WorkshopConfig::new(1, "Mine", ChainRole::SupplyEnd);
        let (_monitor, trigger, _halt, handle) = spawn_engine(&config, Arc::new(EventLog::new()));
        drop(trigger);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_stale_trigger_starts_nothing() {
        let config = WorkshopConfig::new(2, "Press", ChainRole::ClientEnd)
            .with_capacity(4)
            .with_upstream(1)
            .with_initial_raw_stock(4);
        let log = Arc::new(EventLog::new());
        let (monitor, trigger, _halt, handle) = spawn_engine(&config, log.clone());

        monitor.begin_cycle(1).unwrap();
        trigger.send(ProductionRun { quantity: 1 }).unwrap();
        trigger.send(ProductionRun { quantity: 1 }).unwrap();
        monitor.take_finished(1).unwrap();
        monitor.end_cycle();

        drop(trigger);
        handle.join().unwrap().unwrap();
        assert_eq!(log.count(WorkshopId(2), ChainEventKind::ProductionStarted), 1);
        assert_eq!(log.count(WorkshopId(2), ChainEventKind::UnitProduced), 1);
        assert_eq!(monitor.raw_stock(), Some(3));
    }
}
