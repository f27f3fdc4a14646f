//! Chain-wide termination token and fault reporting
//!
//! `Halt` wraps a zero-capacity channel whose only sender is dropped when
//! the chain is halted. Every blocked `select!` that includes
//! `halt.listener()` then wakes with a disconnect, so no task is left parked
//! on a channel after termination.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::errors::ChainError;

struct HaltInner {
    halted: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    listener: Receiver<()>,
}

/// Cancellable termination token shared by every task of a chain
#[derive(Clone)]
pub struct Halt {
    inner: Arc<HaltInner>,
}

impl Halt {
    pub fn new() -> Self {
        let (trigger, listener) = bounded(0);
        Self {
            inner: Arc::new(HaltInner {
                halted: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                listener,
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn fire(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once the token fires
    pub fn listener(&self) -> &Receiver<()> {
        &self.inner.listener
    }
}

impl Default for Halt {
    fn default() -> Self {
        Self::new()
    }
}

/// First fatal error raised by any task; recording it halts the chain
#[derive(Clone)]
pub struct FaultSlot {
    fault: Arc<Mutex<Option<ChainError>>>,
    halt: Halt,
}

impl FaultSlot {
    pub fn new(halt: Halt) -> Self {
        Self {
            fault: Arc::new(Mutex::new(None)),
            halt,
        }
    }

    /// Record the outcome of a task. Cancellation is not a fault.
    pub fn report(&self, task: &str, result: Result<(), ChainError>) {
        match result {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => {}
            Err(err) => {
                error!("[Supervisor] {} failed: {} - tearing down the chain", task, err);
                let mut slot = self.fault.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
                drop(slot);
                self.halt.fire();
            }
        }
    }

    /// Description of the recorded fault, if any
    pub fn describe(&self) -> Option<String> {
        self.fault.lock().as_ref().map(|err| err.to_string())
    }

    pub fn take(&self) -> Option<ChainError> {
        self.fault.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{select, TryRecvError};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fire_wakes_listener() {
        let halt = Halt::new();
        assert!(!halt.is_halted());
        assert_eq!(halt.listener().try_recv(), Err(TryRecvError::Empty));

        let waiter = {
            let halt = halt.clone();
            thread::spawn(move || {
                let (_tx, rx) = crossbeam_channel::unbounded::<u32>();
                select! {
                    recv(rx) -> _ => false,
                    recv(halt.listener()) -> _ => true,
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        halt.fire();
        halt.fire();
        assert!(waiter.join().unwrap());
        assert!(halt.is_halted());
        assert_eq!(halt.listener().try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_fault_slot_keeps_first_fault() {
        let halt = Halt::new();
        let faults = FaultSlot::new(halt.clone());

        faults.report("ok task", Ok(()));
        faults.report("cancelled task", Err(ChainError::Shutdown));
        assert!(!halt.is_halted());
        assert!(faults.describe().is_none());

        faults.report("coordinator", Err(ChainError::config("first")));
        faults.report("coordinator", Err(ChainError::config("second")));
        assert!(halt.is_halted());
        assert!(faults.describe().unwrap().contains("first"));
        assert!(matches!(faults.take(), Some(ChainError::Config { reason }) if reason == "first"));
        assert!(faults.take().is_none());
    }
}
