use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candles::CandleStore;
use crate::config::EngineSettings;
use crate::database::{OrderRepository, PositionRepository};
use crate::exchange::ExchangeService;
use crate::notifications::EventService;
use crate::strategies::{Signal, SignalGenerator};
use crate::trade::{
    OpenOutcome, OrderExecutionRecorder, OrderFactory, PositionCloser, PositionOpener,
};
use crate::types::{
    AccountWalletItem, Order, PositionFilter, PositionStatus, TradingError, Workload,
};

/// Per-workload actor: a data loop feeding the candle window and an action
/// loop trading on it. The loops share a child cancellation token and a
/// single-slot error channel; the first terminal error wins and brings the
/// whole runner down.
pub struct WorkloadRunner {
    err_rx: mpsc::Receiver<anyhow::Error>,
}

impl WorkloadRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        parent: &CancellationToken,
        workload: Workload,
        exchange: Arc<dyn ExchangeService>,
        store: Arc<CandleStore>,
        signal_generator: Arc<dyn SignalGenerator>,
        positions: Arc<dyn PositionRepository>,
        orders: Arc<dyn OrderRepository>,
        events: Arc<dyn EventService>,
        settings: &EngineSettings,
    ) -> Self {
        let token = parent.child_token();
        let (err_tx, err_rx) = mpsc::channel(1);

        let data_loop = DataLoop {
            workload_id: workload.id,
            exchange: exchange.clone(),
            store: store.clone(),
            window_size: settings.candle_window_size,
            interval_minutes: settings
                .interval()
                .map(|i| i.to_minutes() as i64)
                .unwrap_or(1),
            idle_timeout: settings.ticker_idle_timeout(),
        };

        let data_token = token.clone();
        let data_err_tx = err_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = data_token.cancelled() => Ok(()),
                result = data_loop.run() => result,
            };

            data_loop.store.delete_candles(data_loop.workload_id);

            if let Err(err) = result {
                let _ = data_err_tx.try_send(err);
            }
            data_token.cancel();
        });

        let mut core = ActionCore::new(
            workload, exchange, store, signal_generator, positions, orders, events, settings,
        );
        let action_tick = settings.action_tick();

        let action_token = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = action_token.cancelled() => Ok(()),
                result = core.run(action_tick) => result,
            };

            if let Err(err) = result {
                let _ = err_tx.try_send(err);
            }
            action_token.cancel();
        });

        Self { err_rx }
    }

    /// Resolves with the runner's terminal error, or `None` once both loops
    /// stopped through cancellation.
    pub async fn join(mut self) -> Option<anyhow::Error> {
        self.err_rx.recv().await
    }
}

struct DataLoop {
    workload_id: Uuid,
    exchange: Arc<dyn ExchangeService>,
    store: Arc<CandleStore>,
    window_size: usize,
    interval_minutes: i64,
    idle_timeout: Duration,
}

impl DataLoop {
    async fn run(&self) -> Result<()> {
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(self.window_size as i64 * self.interval_minutes);

        let candles = self
            .exchange
            .candles(start, end)
            .await
            .context("failed to get candles")?;

        debug!("fetched [{}] historical candles", candles.len());

        self.store.save_candles(self.workload_id, candles);

        let (mut ticks, mut errors) = self
            .exchange
            .candles_ticker()
            .await
            .context("failed to open candles ticker")?;

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                maybe_tick = ticks.recv() => match maybe_tick {
                    Some(tick) => {
                        debug!("received candle tick [{}]", tick);

                        self.store.save_candles(self.workload_id, [tick.candle]);

                        idle.as_mut().reset(tokio::time::Instant::now() + self.idle_timeout);
                    }
                    None => return Err(anyhow!("ticker stream closed")),
                },
                maybe_err = errors.recv() => {
                    return match maybe_err {
                        Some(err) => Err(anyhow!("ticker error: [{}]", err)),
                        None => Err(anyhow!("ticker stream closed")),
                    };
                }
                _ = &mut idle => return Err(anyhow!("ticker idle timeout expired")),
            }
        }
    }
}

/// The action loop's state and logic, separated from its timer so the state
/// machine is exercised tick by tick in tests.
pub(crate) struct ActionCore {
    workload: Workload,
    exchange: Arc<dyn ExchangeService>,
    store: Arc<CandleStore>,
    signal_generator: Arc<dyn SignalGenerator>,
    positions: Arc<dyn PositionRepository>,
    opener: PositionOpener,
    closer: PositionCloser,
    order_factory: OrderFactory,
    recorder: OrderExecutionRecorder,
    entry_order_validity: chrono::Duration,
    signal_pause: chrono::Duration,
    pub(crate) last_signal_time: DateTime<Utc>,
}

impl ActionCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workload: Workload,
        exchange: Arc<dyn ExchangeService>,
        store: Arc<CandleStore>,
        signal_generator: Arc<dyn SignalGenerator>,
        positions: Arc<dyn PositionRepository>,
        orders: Arc<dyn OrderRepository>,
        events: Arc<dyn EventService>,
        settings: &EngineSettings,
    ) -> Self {
        let opener = PositionOpener::new(
            workload.clone(),
            positions.clone(),
            events.clone(),
            settings.price_precision,
        );
        let closer = PositionCloser::new(workload.clone(), positions.clone(), events);
        let order_factory = OrderFactory::new(orders.clone());
        let recorder = OrderExecutionRecorder::new(orders);

        Self {
            workload,
            exchange,
            store,
            signal_generator,
            positions,
            opener,
            closer,
            order_factory,
            recorder,
            entry_order_validity: settings.entry_order_validity(),
            signal_pause: settings.signal_pause(),
            last_signal_time: Utc::now(),
        }
    }

    async fn run(&mut self, tick: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.action_tick().await?;
        }
    }

    pub(crate) async fn action_tick(&mut self) -> Result<()> {
        self.poll_signal()
            .await
            .context("error while processing new signal")?;

        let mut pending_orders = self
            .refresh_orders_queue()
            .await
            .context("error while refreshing orders queue")?;

        self.drive_orders(&mut pending_orders).await?;

        Ok(())
    }

    /// Polls the signal generator unless it is still paused after the last
    /// signal. The pause starts before the signal is processed so
    /// back-to-back ticks cannot double-trigger on the same window.
    async fn poll_signal(&mut self) -> Result<()> {
        if Utc::now() < self.last_signal_time + self.signal_pause {
            return Ok(());
        }

        let candles = self.store.candles(self.workload.id);

        if let Some(signal) = self.signal_generator.evaluate(&candles) {
            self.last_signal_time = Utc::now();
            self.process_signal(&signal).await?;
        }

        Ok(())
    }

    async fn process_signal(&self, signal: &Signal) -> Result<()> {
        info!("received signal [{}]", signal);

        let balances = self
            .exchange
            .account_balances()
            .await
            .context("could not get account balances")?;

        let taker_commission = self
            .exchange
            .account_taker_commission()
            .await
            .context("could not get account commission")?;

        let wallet_item = AccountWalletItem {
            account: self.workload.account.clone(),
            asset: self.workload.pair.quote.clone(),
            balance: balances.balance_of(&self.workload.pair.quote),
            taker_commission,
        };

        let position = match self
            .opener
            .open_position(signal, &wallet_item)
            .await
            .context("could not open position")?
        {
            OpenOutcome::Opened(position) => position,
            OpenOutcome::Dropped(reason) => {
                warn!("dropping signal because: [{}]", reason);
                return Ok(());
            }
        };

        self.order_factory
            .create_entry_order(&position)
            .await
            .with_context(|| {
                format!("could not create entry order for position [{}]", position.id)
            })?;

        info!(
            "position [{}] based on signal [{}] has been opened successfully",
            position.id, signal,
        );

        Ok(())
    }

    fn last_close_price(&self) -> Result<Decimal, TradingError> {
        self.store
            .candles(self.workload.id)
            .last()
            .map(|candle| candle.close)
            .ok_or(TradingError::EmptyCandleWindow)
    }

    /// Walks every open position through one state-machine step and returns
    /// the orders that still need driving against the exchange.
    async fn refresh_orders_queue(&self) -> Result<Vec<Order>> {
        let mut open_positions = self
            .positions
            .positions(PositionFilter {
                workload_id: self.workload.id,
                status: PositionStatus::Open,
            })
            .await
            .context("could not get open positions")?;

        open_positions.sort_by_key(|position| position.time);

        let last_close_price = match self.last_close_price() {
            Ok(price) => price,
            Err(TradingError::EmptyCandleWindow) => {
                // Nothing ingested yet; there is no price to manage exits
                // against, so skip this tick.
                debug!("candle window is empty; skipping orders queue refresh");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut pending_orders = Vec::new();

        for mut position in open_positions {
            let (entry_order, exit_order) = position.orders_breakdown().map_err(|err| {
                anyhow!(
                    "inconsistent orders state for position [{}]: {}",
                    position.id,
                    err,
                )
            })?;
            let entry_order = entry_order.cloned();
            let exit_order = exit_order.cloned();

            match (entry_order, exit_order) {
                // The entry order was never created; close without trying to
                // recover it.
                (None, _) => {
                    self.close_position(&mut position).await?;
                }
                (Some(entry), None) if !entry.executed => {
                    if Utc::now() - entry.time > self.entry_order_validity {
                        self.close_position(&mut position).await?;
                    } else {
                        pending_orders.push(entry);
                    }
                }
                (Some(_), None) => {
                    let should_exit = last_close_price <= position.stop_loss_price
                        || last_close_price >= position.take_profit_price;

                    if should_exit {
                        let exit = self
                            .order_factory
                            .create_exit_order(&position, last_close_price)
                            .await
                            .with_context(|| {
                                format!(
                                    "could not create exit order for position [{}]",
                                    position.id,
                                )
                            })?;

                        pending_orders.push(exit);
                    }
                }
                (Some(_), Some(exit)) if !exit.executed => {
                    pending_orders.push(exit);
                }
                (Some(_), Some(_)) => {
                    self.close_position(&mut position).await?;
                }
            }
        }

        Ok(pending_orders)
    }

    async fn close_position(&self, position: &mut crate::types::Position) -> Result<()> {
        self.closer
            .close_position(position)
            .await
            .with_context(|| format!("could not close position [{}]", position.id))
    }

    /// The "already executed?" probe precedes every submit: exchange
    /// execution and the DB update are not atomic, so a crash between them
    /// must not lead to a duplicate submission.
    async fn drive_orders(&self, orders: &mut [Order]) -> Result<()> {
        for order in orders {
            let already_executed = self
                .exchange
                .is_order_executed(order)
                .await
                .context("error while checking order execution")?;

            if already_executed {
                self.record_order_execution(order).await?;
                continue;
            }

            let executed = self
                .exchange
                .execute_order(order)
                .await
                .context("error while executing order")?;

            if executed {
                self.record_order_execution(order).await?;
            }
            // A fill-or-kill cancellation is not an error; the next tick
            // re-evaluates the order.
        }

        Ok(())
    }

    async fn record_order_execution(&self, order: &mut Order) -> Result<()> {
        info!("recording order [{}] execution", order.id);

        self.recorder
            .record_execution(order)
            .await
            .with_context(|| format!("could not record order [{}] execution", order.id))
    }
}
