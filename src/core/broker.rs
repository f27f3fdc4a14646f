use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::channel::DownstreamLink;
use super::errors::{ChainError, Result};
use super::types::WorkshopId;

struct Registry {
    /// Downstream ends waiting for their upstream workshop, keyed by its id
    pending: HashMap<WorkshopId, DownstreamLink>,
    closed: bool,
}

/// Rendezvous registry for the stage handshake
///
/// A downstream workshop registers the ends its upstream neighbor must use
/// under that neighbor's id; the upstream workshop claims them under its own
/// id. Either side may come online first.
pub struct ChannelBroker {
    registry: Mutex<Registry>,
    registered: Condvar,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                pending: HashMap::new(),
                closed: false,
            }),
            registered: Condvar::new(),
        }
    }

    /// Publish `link` for the workshop `upstream`
    pub fn register(&self, upstream: WorkshopId, link: DownstreamLink) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(ChainError::Shutdown);
        }
        if registry.pending.contains_key(&upstream) {
            return Err(ChainError::config(format!(
                "workshop {} is named as upstream by more than one workshop",
                upstream
            )));
        }
        debug!("[Broker] workshop {} registered links for workshop {}", link.peer, upstream);
        registry.pending.insert(upstream, link);
        self.registered.notify_all();
        Ok(())
    }

    /// Take the links registered for `me`, waiting at most `timeout`
    pub fn claim(&self, me: WorkshopId, timeout: Duration) -> Result<DownstreamLink> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut registry = self.registry.lock();
        loop {
            if registry.closed {
                return Err(ChainError::Shutdown);
            }
            if let Some(link) = registry.pending.remove(&me) {
                debug!("[Broker] workshop {} claimed links from workshop {}", me, link.peer);
                return Ok(link);
            }
            if self.registered.wait_until(&mut registry, deadline).timed_out() {
                if let Some(link) = registry.pending.remove(&me) {
                    return Ok(link);
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("[Broker] workshop {} found no downstream peer after {} ms", me, waited_ms);
                return Err(ChainError::Topology { workshop: me, waited_ms });
            }
        }
    }

    /// Number of registrations nobody has claimed yet
    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    /// Drop every registration and fail pending and future claims
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        let dropped = registry.pending.len();
        registry.pending.clear();
        self.registered.notify_all();
        if dropped > 0 {
            debug!("[Broker] closed with {} unclaimed registration(s)", dropped);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::open_stage_channel;
    use crate::core::shutdown::Halt;
    use crate::core::types::{MaterialMessage, OrderMessage};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_register_then_claim() {
        let broker = ChannelBroker::new();
        let (up, down) = open_stage_channel(WorkshopId(1), WorkshopId(2));
        broker.register(WorkshopId(1), down).unwrap();
        assert_eq!(broker.pending_count(), 1);

        let claimed = broker.claim(WorkshopId(1), Duration::from_millis(100)).unwrap();
        assert_eq!(claimed.peer, WorkshopId(2));
        assert_eq!(broker.pending_count(), 0);

        let halt = Halt::new();
        up.send_order(WorkshopId(2), OrderMessage { quantity: 3 }).unwrap();
        assert_eq!(claimed.receive_order(&halt).unwrap(), Some(OrderMessage { quantity: 3 }));
        claimed.ship(WorkshopId(1), MaterialMessage { quantity: 3 }).unwrap();
        assert_eq!(up.receive_material(WorkshopId(2), 3, &halt).unwrap().quantity, 3);
    }

    #[test]
    fn test_claim_before_register() {
        let broker = Arc::new(ChannelBroker::new());
        let claimer = {
            let broker = broker.clone();
            thread::spawn(move || broker.claim(WorkshopId(1), Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        let (_up, down) = open_stage_channel(WorkshopId(1), WorkshopId(2));
        broker.register(WorkshopId(1), down).unwrap();
        assert_eq!(claimer.join().unwrap().unwrap().peer, WorkshopId(2));
    }

    #[test]
    fn test_missing_peer_is_topology_error() {
        let broker = ChannelBroker::new();
        let (_up, down) = open_stage_channel(WorkshopId(7), WorkshopId(2));
        broker.register(WorkshopId(7), down).unwrap();
        assert!(matches!(
            broker.claim(WorkshopId(1), Duration::from_millis(30)),
            Err(ChainError::Topology { workshop: WorkshopId(1), .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let broker = ChannelBroker::new();
        let (_a, first) = open_stage_channel(WorkshopId(1), WorkshopId(2));
        let (_b, second) = open_stage_channel(WorkshopId(1), WorkshopId(3));
        broker.register(WorkshopId(1), first).unwrap();
        assert!(matches!(
            broker.register(WorkshopId(1), second),
            Err(ChainError::Config { .. })
        ));
    }

    #[test]
    fn test_close_releases_claimers() {
        let broker = Arc::new(ChannelBroker::new());
        let claimer = {
            let broker = broker.clone();
            thread::spawn(move || broker.claim(WorkshopId(1), Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        broker.close();
        assert!(matches!(claimer.join().unwrap(), Err(ChainError::Shutdown)));
        assert!(broker.is_closed());

        let (_up, down) = open_stage_channel(WorkshopId(1), WorkshopId(2));
        assert!(matches!(broker.register(WorkshopId(1), down), Err(ChainError::Shutdown)));
        assert_eq!(broker.pending_count(), 0);
    }
}
