//! Broadcast Dispatcher
//!
//! Fans engine events out to session writers. Delivery never blocks: a
//! session whose queue is full is evicted instead of stalling the others,
//! which closes its connection and forfeits any pending bet.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::game::events::{Delivery, Outbound};
use crate::game::state::PlayerId;
use crate::network::protocol::ServerMessage;
use crate::network::registry::{SessionHandle, SessionRegistry};

/// Routes engine output to connected sessions.
pub struct BroadcastDispatcher {
    registry: Arc<SessionRegistry>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver events until the engine side closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(event) = events.recv().await {
            self.dispatch(&event).await;
        }
        debug!("Dispatcher stopped");
    }

    /// Deliver one event. Returns the number of sessions it reached.
    pub async fn dispatch(&self, event: &Outbound) -> usize {
        let message = ServerMessage::from_engine_event(&event.data);

        match event.delivery {
            Delivery::All => {
                let mut delivered = 0;
                for handle in self.registry.snapshot().await {
                    if self.deliver(&handle, message.clone()).await {
                        delivered += 1;
                    }
                }
                delivered
            }
            Delivery::To(player_id) => match self.registry.lookup(player_id).await {
                Some(handle) => usize::from(self.deliver(&handle, message).await),
                None => {
                    debug!("{} left before its reply was delivered", player_id);
                    0
                }
            },
        }
    }

    async fn deliver(&self, handle: &SessionHandle, message: ServerMessage) -> bool {
        match handle.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "{} at {} is not keeping up; disconnecting",
                    handle.player_id, handle.addr
                );
                self.drop_session(handle.player_id).await;
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.drop_session(handle.player_id).await;
                false
            }
        }
    }

    async fn drop_session(&self, player_id: PlayerId) {
        if self.registry.evict(player_id).await {
            debug!("Evicted {}", player_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::events::EngineEventData;
    use crate::game::state::RoundId;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn update(multiplier: f64) -> Outbound {
        Outbound::broadcast(EngineEventData::Update {
            round_id: RoundId(1),
            multiplier,
        })
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn signal() -> Arc<Notify> {
        Arc::new(Notify::new())
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order() {
        let registry = Arc::new(SessionRegistry::new(4));
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(addr(), tx, signal()).await.unwrap();

        let dispatcher = BroadcastDispatcher::new(registry);
        for m in [1.0, 1.1, 1.2] {
            assert_eq!(dispatcher.dispatch(&update(m)).await, 1);
        }

        for expected in [1.0, 1.1, 1.2] {
            match rx.recv().await {
                Some(ServerMessage::Update { value, .. }) => assert_eq!(value, expected),
                other => panic!("Wrong message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_is_isolated() {
        let registry = Arc::new(SessionRegistry::new(4));
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let fast = registry.register(addr(), fast_tx, signal()).await.unwrap();
        let slow_evicted = signal();
        let slow = registry
            .register(addr(), slow_tx, slow_evicted.clone())
            .await
            .unwrap();

        let dispatcher = BroadcastDispatcher::new(registry.clone());
        assert_eq!(dispatcher.dispatch(&update(1.0)).await, 2);
        // Slow queue is now full
        assert_eq!(dispatcher.dispatch(&update(1.1)).await, 1);
        assert_eq!(dispatcher.dispatch(&update(1.2)).await, 1);

        assert!(registry.lookup(slow).await.is_none());
        assert!(registry.lookup(fast).await.is_some());

        // The slow session's tasks are told to stop
        tokio::time::timeout(Duration::from_secs(1), slow_evicted.notified())
            .await
            .unwrap();

        let mut received = 0;
        while let Ok(ServerMessage::Update { .. }) = fast_rx.try_recv() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_addressed_delivery() {
        let registry = Arc::new(SessionRegistry::new(4));
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = registry.register(addr(), tx_a, signal()).await.unwrap();
        registry.register(addr(), tx_b, signal()).await.unwrap();

        let dispatcher = BroadcastDispatcher::new(registry);
        let event = Outbound::to(
            a,
            EngineEventData::BetAccepted {
                round_id: RoundId(1),
                stake: 5.0,
            },
        );
        assert_eq!(dispatcher.dispatch(&event).await, 1);

        assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::Info { .. })));
        assert!(rx_b.try_recv().is_err());

        // Unknown recipient is dropped quietly
        let gone = Outbound::to(
            PlayerId::new(99),
            EngineEventData::Update {
                round_id: RoundId(1),
                multiplier: 1.0,
            },
        );
        assert_eq!(dispatcher.dispatch(&gone).await, 0);
    }

    #[tokio::test]
    async fn test_closed_writer_is_evicted() {
        let registry = Arc::new(SessionRegistry::new(4));
        let (tx, rx) = mpsc::channel(8);
        let evicted = signal();
        let id = registry.register(addr(), tx, evicted.clone()).await.unwrap();
        drop(rx);

        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let event = Outbound::to(
            id,
            EngineEventData::Update {
                round_id: RoundId(1),
                multiplier: 1.0,
            },
        );
        assert_eq!(dispatcher.dispatch(&event).await, 0);

        assert!(registry.lookup(id).await.is_none());
        tokio::time::timeout(Duration::from_secs(1), evicted.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_drains_until_closed() {
        let registry = Arc::new(SessionRegistry::new(4));
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(addr(), tx, signal()).await.unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx.send(update(1.5)).unwrap();
        drop(events_tx);

        BroadcastDispatcher::new(registry).run(events_rx).await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Update { .. })));
    }
}
