//! Event bridge: the ordered, bounded transport between the engine and the
//! presentation layer.
//!
//! Outbound events go through [`outbound`]'s telemetry-first drop queue.
//! Inbound commands use a plain bounded channel so they reach the engine in
//! arrival order.

pub mod outbound;

pub use outbound::{outbound_queue, BridgeStats, OutboundReceiver, OutboundSender, TryRecvError};

use hostdeck_core::{DeckError, DeckResult, Inbound};
use tokio::sync::mpsc;

/// Queue sizes for both directions.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub capacity: usize,
    pub inbound_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            inbound_capacity: 256,
        }
    }
}

/// The engine's half: emits events, receives commands.
#[derive(Debug)]
pub struct EngineSide {
    pub outbound: OutboundSender,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// The presentation layer's half: receives events, sends commands.
#[derive(Debug)]
pub struct PresentationSide {
    pub events: OutboundReceiver,
    pub commands: CommandSender,
}

/// Sends commands to the engine.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Inbound>,
}

impl CommandSender {
    pub async fn send(&self, command: Inbound) -> DeckResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DeckError::BridgeClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Build both halves of a bridge.
pub fn event_bridge(config: BridgeConfig) -> (EngineSide, PresentationSide) {
    let (outbound, events) = outbound_queue(config.capacity);
    let (tx, inbound) = mpsc::channel(config.inbound_capacity.max(1));
    (
        EngineSide { outbound, inbound },
        PresentationSide {
            events,
            commands: CommandSender { tx },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdeck_core::SessionId;

    #[tokio::test]
    async fn commands_arrive_in_order() {
        let (mut engine, ui) = event_bridge(BridgeConfig::default());
        for n in 0..5u8 {
            ui.commands
                .send(Inbound::SessionInput {
                    id: SessionId(1),
                    bytes: vec![n],
                })
                .await
                .unwrap();
        }
        for n in 0..5u8 {
            match engine.inbound.recv().await {
                Some(Inbound::SessionInput { bytes, .. }) => assert_eq!(bytes, vec![n]),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn command_send_fails_after_engine_side_dropped() {
        let (engine, ui) = event_bridge(BridgeConfig::default());
        drop(engine);
        assert!(ui.commands.is_closed());
        assert!(matches!(
            ui.commands.send(Inbound::ListSessions).await,
            Err(DeckError::BridgeClosed)
        ));
    }
}
