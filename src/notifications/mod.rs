use tokio::sync::mpsc;
use tracing::{error, info};

use crate::types::{Position, Workload};

/// A notification record addressed to the account owner. Delivery transport
/// lives behind `EventService`; the trading core only produces these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub account_email: String,
    pub payload: String,
}

/// Fire-and-forget event publication. Runners never wait for the result and
/// a failed publish must never terminate a workload.
pub trait EventService: Send + Sync {
    fn publish(&self, event: Event);
}

pub fn position_opened_event(workload: &Workload, position: &Position) -> Event {
    Event {
        account_email: workload.account.email.clone(),
        payload: format!(
            "Position {} opened on {} {}: size {}, entry {}, tp {}, sl {}",
            position.id,
            workload.account.exchange,
            workload.pair,
            position.size,
            position.entry_price,
            position.take_profit_price,
            position.stop_loss_price,
        ),
    }
}

pub fn position_closed_event(workload: &Workload, position: &Position) -> Event {
    Event {
        account_email: workload.account.email.clone(),
        payload: format!(
            "Position {} closed on {} {}",
            position.id, workload.account.exchange, workload.pair,
        ),
    }
}

/// Publishes events into a bounded channel drained by a background task.
/// A full channel drops the event with a log line instead of blocking.
pub struct ChannelEventService {
    tx: mpsc::Sender<Event>,
}

impl ChannelEventService {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Spawns the default drain task, which logs each event. A real delivery
    /// integration consumes the receiver instead.
    pub fn spawn_logging_drain(mut rx: mpsc::Receiver<Event>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                info!(
                    account = %event.account_email,
                    "notification: {}",
                    event.payload,
                );
            }
        });
    }
}

impl EventService for ChannelEventService {
    fn publish(&self, event: Event) {
        if let Err(err) = self.tx.try_send(event) {
            error!("could not publish trading event: {}", err);
        }
    }
}
