use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use super::types::WorkshopId;

/// Kind of observable chain event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainEventKind {
    /// A production run was triggered
    ProductionStarted,
    /// Production is due but raw stock is below one product's worth
    StockShortage,
    /// One finished unit left the line
    UnitProduced,
    /// A shipment from upstream was added to raw stock
    MaterialReceived,
    /// A batch request was sent upstream
    OrderPlaced,
    /// Finished units were shipped downstream
    ShipmentSent,
    /// The client end completed a customer order
    DeliveryCompleted,
}

/// Event published by a workshop, tagged with identity and quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEvent {
    pub workshop: WorkshopId,
    pub kind: ChainEventKind,
    pub quantity: u64,
}

impl ChainEvent {
    pub fn new(workshop: WorkshopId, kind: ChainEventKind, quantity: u64) -> Self {
        Self {
            workshop,
            kind,
            quantity,
        }
    }
}

/// Observer trait for chain events
pub trait ChainObserver: Send + Sync {
    /// Called for every event, on the thread that produced it
    fn on_event(&self, event: &ChainEvent);
}

/// Fan-out of chain events to the registered observers
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Vec<Arc<dyn ChainObserver>>,
}

impl EventBus {
    pub fn subscribe(&mut self, observer: Arc<dyn ChainObserver>) {
        self.observers.push(observer);
    }

    pub fn emit(&self, workshop: WorkshopId, kind: ChainEventKind, quantity: u64) {
        let event = ChainEvent::new(workshop, kind, quantity);
        for observer in self.observers.iter() {
            observer.on_event(&event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// Records every event in order
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ChainEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind emitted by one workshop
    pub fn filter(&self, workshop: WorkshopId, kind: ChainEventKind) -> Vec<ChainEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.workshop == workshop && e.kind == kind)
            .copied()
            .collect()
    }

    pub fn count(&self, workshop: WorkshopId, kind: ChainEventKind) -> usize {
        self.filter(workshop, kind).len()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ChainObserver for EventLog {
    fn on_event(&self, event: &ChainEvent) {
        self.events.lock().push(*event);
    }
}

/// Writes the notable events to the log
pub struct LoggingObserver;

impl ChainObserver for LoggingObserver {
    fn on_event(&self, event: &ChainEvent) {
        match event.kind {
            ChainEventKind::StockShortage => {
                warn!("[Workshop#{}] stock shortage ({} raw held)", event.workshop, event.quantity)
            }
            ChainEventKind::DeliveryCompleted => {
                let (workshop, quantity) = (event.workshop, event.quantity);
                info!("[Workshop#{}] order of {} piece(s) completed", workshop, quantity)
            }
            ChainEventKind::UnitProduced => {}
            kind => info!("[Workshop#{}] {:?} x{}", event.workshop, kind, event.quantity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_records_in_order() {
        let log = Arc::new(EventLog::new());
        let mut bus = EventBus::default();
        bus.subscribe(log.clone());
        bus.emit(WorkshopId(1), ChainEventKind::OrderPlaced, 4);
        bus.emit(WorkshopId(2), ChainEventKind::MaterialReceived, 4);
        bus.emit(WorkshopId(1), ChainEventKind::OrderPlaced, 2);

        let events = log.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], ChainEvent::new(WorkshopId(2), ChainEventKind::MaterialReceived, 4));
        assert_eq!(log.count(WorkshopId(1), ChainEventKind::OrderPlaced), 2);

        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_empty_bus() {
        let bus = EventBus::default();
        assert_eq!(bus.observer_count(), 0);
        bus.emit(WorkshopId(1), ChainEventKind::ShipmentSent, 1);
    }
}
