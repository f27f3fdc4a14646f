//! Stage links between adjacent workshops
//!
//! Each adjacent pair shares two unidirectional, ordered, lossless links:
//! the order link (downstream -> upstream) and the goods link
//! (upstream -> downstream). The downstream workshop allocates both and
//! keeps the ends it uses; the complementary ends go to the broker.

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use super::errors::{ChainError, Result};
use super::shutdown::Halt;
use super::types::{MaterialMessage, OrderMessage, WorkshopId};

/// Ends held by the downstream workshop, facing its upstream neighbor
pub struct UpstreamLink {
    pub peer: WorkshopId,
    orders: Sender<OrderMessage>,
    goods: Receiver<MaterialMessage>,
}

/// Ends held by the upstream workshop, facing its downstream neighbor
pub struct DownstreamLink {
    pub peer: WorkshopId,
    orders: Receiver<OrderMessage>,
    goods: Sender<MaterialMessage>,
}

/// Allocate the link pair between `upstream` and `downstream`
pub fn open_stage_channel(
    upstream: WorkshopId,
    downstream: WorkshopId,
) -> (UpstreamLink, DownstreamLink) {
    let (order_tx, order_rx) = unbounded();
    let (goods_tx, goods_rx) = unbounded();
    (
        UpstreamLink {
            peer: upstream,
            orders: order_tx,
            goods: goods_rx,
        },
        DownstreamLink {
            peer: downstream,
            orders: order_rx,
            goods: goods_tx,
        },
    )
}

impl UpstreamLink {
    pub fn send_order(&self, me: WorkshopId, order: OrderMessage) -> Result<()> {
        self.orders.send(order).map_err(|_| {
            ChainError::channel_io(me, format!("order link to workshop {} is closed", self.peer))
        })
    }

    /// Wait for the shipment answering `expected` units
    pub fn receive_material(
        &self,
        me: WorkshopId,
        expected: u64,
        halt: &Halt,
    ) -> Result<MaterialMessage> {
        let received = select! {
            recv(self.goods) -> msg => Some(msg),
            recv(halt.listener()) -> _ => None,
        };
        let Some(received) = received else {
            return Err(ChainError::Shutdown);
        };
        let material = received.map_err(|_| {
            if halt.is_halted() {
                ChainError::Shutdown
            } else {
                let reason = format!("goods link from workshop {} is closed", self.peer);
                ChainError::channel_io(me, reason)
            }
        })?;
        if material.quantity != expected {
            return Err(ChainError::channel_io(
                me,
                format!(
                    "workshop {} shipped {} units, {} were ordered",
                    self.peer, material.quantity, expected
                ),
            ));
        }
        Ok(material)
    }
}

impl DownstreamLink {
    /// Wait for the next order. `Ok(None)` once the downstream side closed cleanly.
    pub fn receive_order(&self, halt: &Halt) -> Result<Option<OrderMessage>> {
        let received = select! {
            recv(self.orders) -> msg => Some(msg),
            recv(halt.listener()) -> _ => None,
        };
        match received {
            None => Err(ChainError::Shutdown),
            Some(Ok(order)) => Ok(Some(order)),
            Some(Err(_)) if halt.is_halted() => Err(ChainError::Shutdown),
            Some(Err(_)) => Ok(None),
        }
    }

    pub fn ship(&self, me: WorkshopId, material: MaterialMessage) -> Result<()> {
        self.goods.send(material).map_err(|_| {
            ChainError::channel_io(me, format!("goods link to workshop {} is closed", self.peer))
        })
    }
}
