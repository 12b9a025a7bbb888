use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use uuid::Uuid;

use crate::database::{OrderRepository, PositionRepository};
use crate::notifications::{position_closed_event, position_opened_event, EventService};
use crate::strategies::Signal;
use crate::types::{
    AccountWalletItem, Order, Position, PositionFilter, PositionStatus, PositionType, Workload,
};

/// Half-away-from-zero rounding applied uniformly to entry, size, tp and sl.
pub fn round_to_precision(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

/// Outcome of an attempt to open a position: either a persisted position or
/// the reason the signal was dropped. Dropping is not an error.
#[derive(Debug)]
pub enum OpenOutcome {
    Opened(Position),
    Dropped(&'static str),
}

/// Validates a signal against the account's wallet snapshot, sizes the
/// position, persists it and announces it.
pub struct PositionOpener {
    workload: Workload,
    positions: Arc<dyn PositionRepository>,
    events: Arc<dyn EventService>,
    price_precision: u32,
}

impl PositionOpener {
    pub fn new(
        workload: Workload,
        positions: Arc<dyn PositionRepository>,
        events: Arc<dyn EventService>,
        price_precision: u32,
    ) -> Self {
        Self {
            workload,
            positions,
            events,
            price_precision,
        }
    }

    pub async fn open_position(
        &self,
        signal: &Signal,
        wallet: &AccountWalletItem,
    ) -> Result<OpenOutcome> {
        if signal.position_type != PositionType::Long {
            return Ok(OpenOutcome::Dropped("only LONG signals are currently supported"));
        }

        let open_positions_count = self
            .positions
            .positions_count(PositionFilter {
                workload_id: self.workload.id,
                status: PositionStatus::Open,
            })
            .await
            .context("could not count open positions")?;

        if open_positions_count >= wallet.account.open_positions_limit {
            return Ok(OpenOutcome::Dropped("open position limit violated"));
        }

        let trade_risk = signal.entry_target - signal.stop_loss_target;
        if signal.entry_target <= Decimal::ZERO || trade_risk <= Decimal::ZERO {
            return Ok(OpenOutcome::Dropped("signal targets are malformed"));
        }

        let account_risk = wallet.balance * wallet.account.risk_factor;
        let mut position_size = account_risk / trade_risk;

        let max_position_size = wallet.balance / signal.entry_target;
        if position_size > max_position_size {
            position_size = max_position_size;
        }

        if position_size.is_zero() {
            return Ok(OpenOutcome::Dropped("insufficient funds"));
        }

        let take_profit_price =
            signal.take_profit_target * (Decimal::ONE + wallet.taker_commission);
        let stop_loss_price = signal.stop_loss_target * (Decimal::ONE - wallet.taker_commission);

        let position = Position {
            id: Uuid::new_v4(),
            workload_id: self.workload.id,
            position_type: signal.position_type,
            status: PositionStatus::Open,
            entry_price: round_to_precision(signal.entry_target, self.price_precision),
            size: round_to_precision(position_size, self.price_precision),
            take_profit_price: round_to_precision(take_profit_price, self.price_precision),
            stop_loss_price: round_to_precision(stop_loss_price, self.price_precision),
            time: Utc::now(),
            orders: Vec::new(),
        };

        self.positions
            .create_position(&position)
            .await
            .context("could not persist position")?;

        self.events
            .publish(position_opened_event(&self.workload, &position));

        Ok(OpenOutcome::Opened(position))
    }
}

pub struct PositionCloser {
    workload: Workload,
    positions: Arc<dyn PositionRepository>,
    events: Arc<dyn EventService>,
}

impl PositionCloser {
    pub fn new(
        workload: Workload,
        positions: Arc<dyn PositionRepository>,
        events: Arc<dyn EventService>,
    ) -> Self {
        Self {
            workload,
            positions,
            events,
        }
    }

    pub async fn close_position(&self, position: &mut Position) -> Result<()> {
        position.status = PositionStatus::Closed;

        self.positions
            .update_position(position)
            .await
            .context("could not update position")?;

        self.events
            .publish(position_closed_event(&self.workload, position));

        Ok(())
    }
}

/// Creates persisted orders whose IDs double as exchange client-order IDs.
pub struct OrderFactory {
    orders: Arc<dyn OrderRepository>,
}

impl OrderFactory {
    pub fn new(orders: Arc<dyn OrderRepository>) -> Self {
        Self { orders }
    }

    pub async fn create_entry_order(&self, position: &Position) -> Result<Order> {
        let order = Order {
            id: Uuid::new_v4(),
            position_id: position.id,
            side: position.position_type.entry_order_side(),
            price: position.entry_price,
            size: position.size,
            time: Utc::now(),
            executed: false,
        };

        self.orders
            .create_order(&order)
            .await
            .context("could not persist order")?;

        Ok(order)
    }

    pub async fn create_exit_order(&self, position: &Position, price: Decimal) -> Result<Order> {
        let order = Order {
            id: Uuid::new_v4(),
            position_id: position.id,
            side: position.position_type.exit_order_side(),
            price,
            size: position.size,
            time: Utc::now(),
            executed: false,
        };

        self.orders
            .create_order(&order)
            .await
            .context("could not persist order")?;

        Ok(order)
    }
}

/// Marks an order as executed once the exchange side has actually filled.
pub struct OrderExecutionRecorder {
    orders: Arc<dyn OrderRepository>,
}

impl OrderExecutionRecorder {
    pub fn new(orders: Arc<dyn OrderRepository>) -> Self {
        Self { orders }
    }

    pub async fn record_execution(&self, order: &mut Order) -> Result<()> {
        order.executed = true;

        self.orders
            .update_order(order)
            .await
            .context("could not update order")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::notifications::{ChannelEventService, Event};
    use crate::types::{Account, Asset, Pair, Side};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    fn workload() -> Workload {
        Workload {
            id: Uuid::new_v4(),
            account: Account {
                id: Uuid::new_v4(),
                email: "trader@example.com".to_string(),
                exchange: "BINANCE".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
                risk_factor: dec!(0.02),
                open_positions_limit: 1,
            },
            pair: Pair::new("ETH", "USDT"),
        }
    }

    fn long_signal() -> Signal {
        Signal {
            position_type: PositionType::Long,
            entry_target: dec!(2000),
            take_profit_target: dec!(2050),
            stop_loss_target: dec!(1950),
        }
    }

    fn wallet(workload: &Workload, balance: Decimal) -> AccountWalletItem {
        AccountWalletItem {
            account: workload.account.clone(),
            asset: Asset::new("USDT"),
            balance,
            taker_commission: dec!(0.0010),
        }
    }

    fn services(
        workload: &Workload,
        store: &Arc<MemoryStore>,
    ) -> (PositionOpener, mpsc::Receiver<Event>) {
        let (events, rx) = ChannelEventService::new(16);
        let opener = PositionOpener::new(
            workload.clone(),
            store.clone() as Arc<dyn PositionRepository>,
            Arc::new(events),
            4,
        );
        (opener, rx)
    }

    #[tokio::test]
    async fn opens_risk_sized_position_with_adjusted_targets() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, mut events) = services(&workload, &store);

        let outcome = opener
            .open_position(&long_signal(), &wallet(&workload, dec!(1000)))
            .await
            .unwrap();

        let position = match outcome {
            OpenOutcome::Opened(position) => position,
            other => panic!("unexpected outcome: {:?}", other),
        };

        // size = min(1000 * 0.02 / 50, 1000 / 2000) = min(0.4, 0.5)
        assert_eq!(position.size, dec!(0.4));
        assert_eq!(position.entry_price, dec!(2000));
        assert_eq!(position.take_profit_price, dec!(2052.0500));
        assert_eq!(position.stop_loss_price, dec!(1948.0500));
        assert_eq!(position.status, PositionStatus::Open);

        let count = store
            .positions_count(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();
        assert_eq!(count, 1);

        let event = events.try_recv().unwrap();
        assert!(event.payload.contains("opened"));
    }

    #[tokio::test]
    async fn caps_size_at_available_balance() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, _events) = services(&workload, &store);

        // Tight stop makes the risk-derived size exceed what the balance
        // can buy: 1000 * 0.02 / 2 = 10 > 1000 / 2000 = 0.5.
        let signal = Signal {
            position_type: PositionType::Long,
            entry_target: dec!(2000),
            take_profit_target: dec!(2004),
            stop_loss_target: dec!(1998),
        };

        let outcome = opener
            .open_position(&signal, &wallet(&workload, dec!(1000)))
            .await
            .unwrap();

        match outcome {
            OpenOutcome::Opened(position) => {
                assert_eq!(position.size, dec!(0.5));
                assert!(position.size * position.entry_price <= dec!(1000));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn drops_short_signals() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, mut events) = services(&workload, &store);

        let signal = Signal {
            position_type: PositionType::Short,
            ..long_signal()
        };

        let outcome = opener
            .open_position(&signal, &wallet(&workload, dec!(1000)))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            OpenOutcome::Dropped("only LONG signals are currently supported"),
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn drops_signal_when_limit_reached() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, mut events) = services(&workload, &store);

        match opener
            .open_position(&long_signal(), &wallet(&workload, dec!(1000)))
            .await
            .unwrap()
        {
            OpenOutcome::Opened(_) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        let _ = events.try_recv();

        let outcome = opener
            .open_position(&long_signal(), &wallet(&workload, dec!(1000)))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            OpenOutcome::Dropped("open position limit violated"),
        ));
        assert!(events.try_recv().is_err());

        let count = store
            .positions_count(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn drops_signal_on_zero_balance() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, _events) = services(&workload, &store);

        let outcome = opener
            .open_position(&long_signal(), &wallet(&workload, Decimal::ZERO))
            .await
            .unwrap();

        assert!(matches!(outcome, OpenOutcome::Dropped("insufficient funds")));
    }

    #[tokio::test]
    async fn close_persists_status_and_emits_event() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, _open_events) = services(&workload, &store);

        let mut position = match opener
            .open_position(&long_signal(), &wallet(&workload, dec!(1000)))
            .await
            .unwrap()
        {
            OpenOutcome::Opened(position) => position,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let (events, mut rx) = ChannelEventService::new(16);
        let closer = PositionCloser::new(
            workload.clone(),
            store.clone() as Arc<dyn PositionRepository>,
            Arc::new(events),
        );

        closer.close_position(&mut position).await.unwrap();

        assert_eq!(position.status, PositionStatus::Closed);
        let open_count = store
            .positions_count(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();
        assert_eq!(open_count, 0);

        let event = rx.try_recv().unwrap();
        assert!(event.payload.contains("closed"));
    }

    #[tokio::test]
    async fn entry_and_exit_orders_take_sides_from_position_type() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, _events) = services(&workload, &store);

        let position = match opener
            .open_position(&long_signal(), &wallet(&workload, dec!(1000)))
            .await
            .unwrap()
        {
            OpenOutcome::Opened(position) => position,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let factory = OrderFactory::new(store.clone() as Arc<dyn OrderRepository>);

        let entry = factory.create_entry_order(&position).await.unwrap();
        assert_eq!(entry.side, Side::Buy);
        assert_eq!(entry.price, position.entry_price);
        assert_eq!(entry.size, position.size);
        assert!(!entry.executed);

        let exit = factory.create_exit_order(&position, dec!(2052)).await.unwrap();
        assert_eq!(exit.side, Side::Sell);
        assert_eq!(exit.price, dec!(2052));
        assert_eq!(exit.size, position.size);
    }

    #[tokio::test]
    async fn recording_execution_is_idempotent() {
        let workload = workload();
        let store = Arc::new(MemoryStore::new());
        let (opener, _events) = services(&workload, &store);

        let position = match opener
            .open_position(&long_signal(), &wallet(&workload, dec!(1000)))
            .await
            .unwrap()
        {
            OpenOutcome::Opened(position) => position,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let factory = OrderFactory::new(store.clone() as Arc<dyn OrderRepository>);
        let mut entry = factory.create_entry_order(&position).await.unwrap();

        let recorder = OrderExecutionRecorder::new(store.clone() as Arc<dyn OrderRepository>);
        recorder.record_execution(&mut entry).await.unwrap();
        recorder.record_execution(&mut entry).await.unwrap();

        let positions = store
            .positions(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();
        assert!(positions[0].orders[0].executed);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_to_precision(dec!(1.00005), 4), dec!(1.0001));
        assert_eq!(round_to_precision(dec!(1.00004), 4), dec!(1.0000));
        assert_eq!(round_to_precision(dec!(2052.05), 4), dec!(2052.05));
    }
}
