use crossbeam_channel::{select, Receiver, Sender};
use log::info;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::errors::{ChainError, Result};
use super::shutdown::{FaultSlot, Halt};
use super::supervisor::Terminator;
use super::types::{CustomerOrder, DeliveryMessage, WorkshopId};

#[derive(Debug)]
struct GateState {
    accepting: bool,
    in_flight: bool,
}

/// Admission control for customer orders: one in flight, none after termination
pub struct OrderGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl OrderGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                accepting: true,
                in_flight: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Admit a new order
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(ChainError::ShuttingDown);
        }
        state.in_flight = true;
        Ok(())
    }

    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        self.idle.notify_all();
    }

    pub fn stop_accepting(&self) {
        self.state.lock().accepting = false;
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Wait for the in-flight order to finish. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_flight {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.in_flight;
            }
        }
        true
    }
}

impl Default for OrderGate {
    fn default() -> Self {
        Self::new()
    }
}

/// The customer's handle on a running chain
///
/// Orders go straight to the client-end workshop; each call blocks until
/// the matching delivery arrives.
pub struct CustomerSession {
    client_end: WorkshopId,
    /// Largest quantity whose raw requirement at the client end fits in a `u64`
    max_quantity: u64,
    orders: Sender<CustomerOrder>,
    deliveries: Receiver<DeliveryMessage>,
    terminator: Terminator,
    halt: Halt,
    faults: FaultSlot,
    delivered_total: u64,
}

impl CustomerSession {
    pub(crate) fn new(
        client_end: WorkshopId,
        max_quantity: u64,
        orders: Sender<CustomerOrder>,
        deliveries: Receiver<DeliveryMessage>,
        terminator: Terminator,
        halt: Halt,
        faults: FaultSlot,
    ) -> Self {
        Self {
            client_end,
            max_quantity,
            orders,
            deliveries,
            terminator,
            halt,
            faults,
            delivered_total: 0,
        }
    }

    /// Submit `quantity` pieces and wait for the delivery
    pub fn order(&mut self, quantity: u64) -> Result<DeliveryMessage> {
        if quantity == 0 || quantity > self.max_quantity {
            return Err(ChainError::InvalidOrder { quantity });
        }
        let gate = self.terminator.gate();
        gate.begin()?;
        let result = self.exchange(quantity);
        gate.finish();

        let delivery = result?;
        self.delivered_total += delivery.quantity;
        info!("[Customer] received the order of {} piece(s)", delivery.quantity);
        Ok(delivery)
    }

    fn exchange(&self, quantity: u64) -> Result<DeliveryMessage> {
        let cycle_id = Uuid::new_v4();
        info!("[Customer] ordering {} piece(s) (cycle {})", quantity, cycle_id);
        if self.orders.send(CustomerOrder { cycle_id, quantity }).is_err() {
            return Err(self.halted_error(Some("client-end workshop is gone")));
        }

        let received = select! {
            recv(self.deliveries) -> delivery => Some(delivery),
            recv(self.halt.listener()) -> _ => None,
        };
        let delivery = match received {
            Some(Ok(delivery)) => delivery,
            Some(Err(_)) => return Err(self.halted_error(Some("delivery link is closed"))),
            None => return Err(self.halted_error(None)),
        };

        if delivery.cycle_id != cycle_id || delivery.quantity != quantity {
            return Err(ChainError::channel_io(
                self.client_end,
                format!(
                    "delivery of {} for cycle {} does not answer order of {} for cycle {}",
                    delivery.quantity, delivery.cycle_id, quantity, cycle_id
                ),
            ));
        }
        Ok(delivery)
    }

    fn halted_error(&self, link_failure: Option<&str>) -> ChainError {
        if let Some(reason) = self.faults.describe() {
            return ChainError::Aborted { reason };
        }
        match link_failure {
            Some(reason) if !self.halt.is_halted() => {
                ChainError::channel_io(self.client_end, reason)
            }
            _ => ChainError::Shutdown,
        }
    }

    /// Pieces delivered over the whole session
    pub fn delivered_total(&self) -> u64 {
        self.delivered_total
    }

    /// Stop ordering and ask the supervisor to tear the chain down
    pub fn terminate(self) {
        info!("[Customer] no more orders, {} piece(s) delivered in total", self.delivered_total);
        self.terminator.request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_gate_refuses_after_stop() {
        let gate = OrderGate::new();
        gate.begin().unwrap();
        assert!(gate.in_flight());
        gate.finish();
        gate.stop_accepting();
        assert!(!gate.is_accepting());
        assert!(matches!(gate.begin(), Err(ChainError::ShuttingDown)));
    }

    #[test]
    fn test_wait_idle() {
        let gate = Arc::new(OrderGate::new());
        assert!(gate.wait_idle(Duration::from_millis(1)));

        gate.begin().unwrap();
        assert!(!gate.wait_idle(Duration::from_millis(10)));

        let finisher = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate.finish();
            })
        };
        assert!(gate.wait_idle(Duration::from_secs(5)));
        finisher.join().unwrap();
    }
}
