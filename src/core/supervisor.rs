//! Chain supervisor
//!
//! Builds the workshop topology, starts every task, and drives teardown:
//! stop admitting orders, drain or abort the in-flight cycle, fire the halt
//! token, close monitors and the broker registry, then join every thread.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::broker::ChannelBroker;
use super::config::{ChainConfig, ShutdownPolicy, WorkshopConfig};
use super::coordinator::{
    handshake, CoordinatorState, CoordinatorStatus, Demand, OrderCoordinator, Supply,
};
use super::customer::{CustomerSession, OrderGate};
use super::errors::{ChainError, Result};
use super::event::EventBus;
use super::monitor::{StockSnapshot, WorkshopMonitor};
use super::production::{ProductionEngine, ProductionRun};
use super::shutdown::{FaultSlot, Halt};
use super::types::{ChainRole, CustomerOrder, DeliveryMessage, WorkshopId};

/// Handle that requests termination; safe to call from a signal handler thread
#[derive(Clone)]
pub struct Terminator {
    requested: Halt,
    gate: Arc<OrderGate>,
    halt: Halt,
    policy: ShutdownPolicy,
}

impl Terminator {
    fn new(gate: Arc<OrderGate>, halt: Halt, policy: ShutdownPolicy) -> Self {
        Self {
            requested: Halt::new(),
            gate,
            halt,
            policy,
        }
    }

    /// Stop admitting orders. Under `Abort` every blocked task is cancelled at once.
    pub fn request(&self) {
        if !self.requested.is_halted() {
            info!("[Supervisor] termination requested ({:?})", self.policy);
        }
        self.gate.stop_accepting();
        self.requested.fire();
        if self.policy == ShutdownPolicy::Abort {
            self.halt.fire();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_halted()
    }

    pub(crate) fn gate(&self) -> &Arc<OrderGate> {
        &self.gate
    }
}

/// Outcome of a clean teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub policy: ShutdownPolicy,
    /// False when an in-flight order was abandoned
    pub drained: bool,
    pub tasks_joined: usize,
}

struct Task {
    name: String,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    config: ChainConfig,
    broker: Arc<ChannelBroker>,
    monitors: HashMap<WorkshopId, Arc<WorkshopMonitor>>,
    statuses: HashMap<WorkshopId, CoordinatorStatus>,
    tasks: Vec<Task>,
    halt: Halt,
    faults: FaultSlot,
    terminator: Terminator,
}

/// Customer-facing ends of the client-end workshop
type CustomerEnds = (Receiver<CustomerOrder>, Sender<DeliveryMessage>);

impl Supervisor {
    /// Validate `config`, start the chain and return it with its customer session.
    ///
    /// Returns only once every workshop completed its broker handshake; a
    /// handshake that times out tears the chain down and surfaces as
    /// `ChainError::Topology`.
    pub fn start(config: ChainConfig, events: EventBus) -> Result<(Supervisor, CustomerSession)> {
        Self::start_on(config, events, Arc::new(ChannelBroker::new()))
    }

    /// Like `start`, with the rendezvous done through `broker`
    pub(crate) fn start_on(
        config: ChainConfig,
        events: EventBus,
        broker: Arc<ChannelBroker>,
    ) -> Result<(Supervisor, CustomerSession)> {
        config.validate()?;
        let (client_end, max_quantity) = config
            .client_end()
            .map(|w| (w.id, u64::MAX / w.units_per_product))
            .ok_or_else(|| ChainError::config("chain has no client end"))?;

        let halt = Halt::new();
        let gate = Arc::new(OrderGate::new());
        let mut supervisor = Supervisor {
            broker,
            monitors: HashMap::new(),
            statuses: HashMap::new(),
            tasks: Vec::new(),
            faults: FaultSlot::new(halt.clone()),
            terminator: Terminator::new(gate, halt.clone(), config.shutdown_policy),
            halt,
            config,
        };

        info!(
            "[Supervisor] setting up a chain of {} workshops",
            supervisor.config.workshops.len()
        );
        let (order_tx, order_rx) = unbounded();
        let (delivery_tx, delivery_rx) = unbounded();

        if let Err(err) = supervisor.launch(&events, (order_rx, delivery_tx)) {
            error!("[Supervisor] startup failed: {}", err);
            supervisor.teardown();
            return Err(err);
        }
        info!("[Supervisor] all workshops linked, production chain running");

        let customer = CustomerSession::new(
            client_end,
            max_quantity,
            order_tx,
            delivery_rx,
            supervisor.terminator.clone(),
            supervisor.halt.clone(),
            supervisor.faults.clone(),
        );
        Ok((supervisor, customer))
    }

    fn launch(&mut self, events: &EventBus, customer_ends: CustomerEnds) -> Result<()> {
        let mut customer_ends = Some(customer_ends);
        let (ready_tx, ready_rx) = unbounded::<(WorkshopId, Result<()>)>();
        let workshops = self.config.workshops.clone();

        for workshop in &workshops {
            let monitor = Arc::new(WorkshopMonitor::new(workshop, events.clone()));
            self.monitors.insert(workshop.id, monitor.clone());

            let (trigger_tx, trigger_rx) = unbounded();
            let engine = ProductionEngine::new(
                workshop.label(),
                monitor.clone(),
                workshop.production_latency(),
                trigger_rx,
                self.halt.clone(),
                events.clone(),
            );
            self.spawn(format!("workshop-{}-production", workshop.id), move || engine.run())?;

            let status = CoordinatorStatus::new();
            self.statuses.insert(workshop.id, status.clone());
            let customer = if workshop.role == ChainRole::ClientEnd {
                customer_ends.take()
            } else {
                None
            };
            let ctx = CoordinatorContext {
                config: workshop.clone(),
                monitor,
                production: trigger_tx,
                customer,
                broker: self.broker.clone(),
                halt: self.halt.clone(),
                events: events.clone(),
                status,
                ready: ready_tx.clone(),
                broker_timeout: self.config.broker_timeout(),
            };
            self.spawn(format!("workshop-{}-coordinator", workshop.id), move || ctx.run())?;
        }
        drop(ready_tx);

        let mut linked = 0;
        while linked < workshops.len() {
            match ready_rx.recv() {
                Ok((id, Ok(()))) => {
                    debug!("[Supervisor] workshop {} linked", id);
                    linked += 1;
                }
                Ok((_, Err(err))) => return Err(err),
                Err(_) => {
                    return Err(ChainError::Spawn {
                        task: "coordinator".to_string(),
                        reason: "exited before completing its handshake".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Start a named task. Its error, or its panic, is reported as a fault.
    fn spawn<F>(&mut self, name: String, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let faults = self.faults.clone();
        let task_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
                    Err(ChainError::TaskPanicked {
                        task: task_name.clone(),
                    })
                });
                faults.report(&task_name, outcome);
            })
            .map_err(|e| ChainError::Spawn {
                task: name.clone(),
                reason: e.to_string(),
            })?;
        self.tasks.push(Task { name, handle });
        Ok(())
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    pub fn broker(&self) -> Arc<ChannelBroker> {
        self.broker.clone()
    }

    pub fn snapshot(&self, id: WorkshopId) -> Option<StockSnapshot> {
        self.monitors.get(&id).map(|m| m.snapshot())
    }

    pub fn coordinator_state(&self, id: WorkshopId) -> Option<CoordinatorState> {
        self.statuses.get(&id).map(|s| s.get())
    }

    /// Whether a fault has torn the chain down
    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    /// Request termination, apply the shutdown policy and release every resource
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        let policy = self.config.shutdown_policy;
        self.terminator.request();

        let gate = self.terminator.gate().clone();
        let drained = match policy {
            ShutdownPolicy::Drain => gate.wait_idle(self.config.drain_timeout()),
            ShutdownPolicy::Abort => !gate.in_flight(),
        };
        if !drained {
            warn!("[Supervisor] in-flight order abandoned at shutdown");
        }

        let tasks_joined = self.teardown();
        info!("[Supervisor] production chain stopped, {} task(s) joined", tasks_joined);

        if let Some(fault) = self.faults.take() {
            return Err(fault);
        }
        Ok(ShutdownReport {
            policy,
            drained,
            tasks_joined,
        })
    }

    fn teardown(&mut self) -> usize {
        self.terminator.gate().stop_accepting();
        self.halt.fire();
        for monitor in self.monitors.values() {
            monitor.close();
        }
        self.broker.close();

        let mut joined = 0;
        for task in self.tasks.drain(..) {
            match task.handle.join() {
                Ok(()) => joined += 1,
                Err(_) => {
                    let err = ChainError::TaskPanicked {
                        task: task.name.clone(),
                    };
                    self.faults.report(&task.name, Err(err));
                }
            }
        }
        joined
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.teardown();
        }
    }
}

/// Everything a coordinator thread needs to link up and serve orders
struct CoordinatorContext {
    config: WorkshopConfig,
    monitor: Arc<WorkshopMonitor>,
    production: Sender<ProductionRun>,
    customer: Option<CustomerEnds>,
    broker: Arc<ChannelBroker>,
    halt: Halt,
    events: EventBus,
    status: CoordinatorStatus,
    ready: Sender<(WorkshopId, Result<()>)>,
    broker_timeout: Duration,
}

impl CoordinatorContext {
    fn run(self) -> Result<()> {
        let id = self.config.id;
        let ready = self.ready;
        let links = match handshake(&self.config, &self.broker, self.broker_timeout) {
            Ok(links) => links,
            Err(err) => {
                let _ = ready.send((id, Err(err)));
                return Ok(());
            }
        };

        let demand = match (self.customer, links.downstream) {
            (Some((orders, deliveries)), _) => Demand::Customer { orders, deliveries },
            (None, Some(link)) => Demand::Downstream(link),
            (None, None) => {
                let err = ChainError::config(format!("workshop {} has nowhere to ship", id));
                let _ = ready.send((id, Err(err)));
                return Ok(());
            }
        };
        let supply = match links.upstream {
            Some(link) => Supply::Upstream(link),
            None => Supply::Unlimited,
        };
        let _ = ready.send((id, Ok(())));
        drop(ready);

        let coordinator = OrderCoordinator::new(
            &self.config,
            self.monitor,
            self.production,
            demand,
            supply,
            self.halt,
            self.events,
            self.status,
        );
        coordinator.run()
    }
}
