use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::candles::CandleStore;
use crate::config::EngineSettings;
use crate::database::{OrderRepository, PositionRepository, WorkloadRepository};
use crate::exchange::ExchangeConnector;
use crate::notifications::EventService;
use crate::strategies::SignalGenerator;
use crate::engine::WorkloadRunner;

/// Supervisor over the workload runners. Each tick it reconciles the
/// authoritative workload set from persistence with the set of live runners
/// and starts what is missing. A runner that dies is deregistered by its
/// sentinel, so the next tick simply recreates it; the restart backoff is
/// bounded by one controller tick.
pub struct WorkloadController {
    workloads: Arc<dyn WorkloadRepository>,
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<CandleStore>,
    signal_generator: Arc<dyn SignalGenerator>,
    positions: Arc<dyn PositionRepository>,
    orders: Arc<dyn OrderRepository>,
    events: Arc<dyn EventService>,
    settings: EngineSettings,
    running: Mutex<HashSet<Uuid>>,
}

impl WorkloadController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workloads: Arc<dyn WorkloadRepository>,
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<CandleStore>,
        signal_generator: Arc<dyn SignalGenerator>,
        positions: Arc<dyn PositionRepository>,
        orders: Arc<dyn OrderRepository>,
        events: Arc<dyn EventService>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            workloads,
            connector,
            store,
            signal_generator,
            positions,
            orders,
            events,
            settings,
            running: Mutex::new(HashSet::new()),
        })
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.controller_tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            let workloads = match self.workloads.workloads().await {
                Ok(workloads) => workloads,
                Err(err) => {
                    error!("could not get workloads: {}", err);
                    continue;
                }
            };

            for workload in workloads {
                if self.is_running(workload.id) {
                    continue;
                }

                let exchange = match self.connector.connect(&workload).await {
                    Ok(exchange) => exchange,
                    Err(err) => {
                        error!(
                            workload_id = %workload.id,
                            "could not connect exchange service: {}",
                            err,
                        );
                        continue;
                    }
                };

                info!(
                    workload_id = %workload.id,
                    pair = %workload.pair,
                    exchange = exchange.exchange_name(),
                    "starting workload runner",
                );

                let workload_id = workload.id;
                let runner = WorkloadRunner::run(
                    &token,
                    workload,
                    exchange,
                    self.store.clone(),
                    self.signal_generator.clone(),
                    self.positions.clone(),
                    self.orders.clone(),
                    self.events.clone(),
                    &self.settings,
                );

                self.register(workload_id);

                let controller = self.clone();
                tokio::spawn(async move {
                    match runner.join().await {
                        Some(err) => error!(
                            workload_id = %workload_id,
                            "workload terminated with error: {}",
                            err,
                        ),
                        None => info!(workload_id = %workload_id, "workload runner stopped"),
                    }

                    controller.deregister(workload_id);
                });
            }

            debug!("active workloads: {}", self.active_workloads());
        }
    }

    pub fn active_workloads(&self) -> usize {
        self.running.lock().expect("controller lock poisoned").len()
    }

    fn is_running(&self, workload_id: Uuid) -> bool {
        self.running
            .lock()
            .expect("controller lock poisoned")
            .contains(&workload_id)
    }

    fn register(&self, workload_id: Uuid) {
        self.running
            .lock()
            .expect("controller lock poisoned")
            .insert(workload_id);
    }

    fn deregister(&self, workload_id: Uuid) {
        self.running
            .lock()
            .expect("controller lock poisoned")
            .remove(&workload_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::MemoryStore;
    use crate::exchange::ExchangeService;
    use crate::notifications::ChannelEventService;
    use crate::strategies::{Signal, SignalGenerator};
    use crate::types::{
        Account, Balances, Candle, CandleTick, Order, Pair, Workload,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NeverSignals;

    impl SignalGenerator for NeverSignals {
        fn evaluate(&self, _candles: &[Candle]) -> Option<Signal> {
            None
        }
    }

    /// Exchange whose bootstrap always fails, killing the runner right away.
    struct FailingBootstrapExchange;

    #[async_trait]
    impl ExchangeService for FailingBootstrapExchange {
        async fn candles(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<Vec<Candle>> {
            Err(anyhow!("bootstrap failed"))
        }

        async fn candles_ticker(
            &self,
        ) -> Result<(mpsc::Receiver<CandleTick>, mpsc::Receiver<anyhow::Error>)> {
            Err(anyhow!("not used"))
        }

        async fn account_balances(&self) -> Result<Balances> {
            Err(anyhow!("not used"))
        }

        async fn account_taker_commission(&self) -> Result<Decimal> {
            Err(anyhow!("not used"))
        }

        async fn execute_order(&self, _: &Order) -> Result<bool> {
            Err(anyhow!("not used"))
        }

        async fn is_order_executed(&self, _: &Order) -> Result<bool> {
            Err(anyhow!("not used"))
        }

        fn exchange_name(&self) -> &'static str {
            "STUB"
        }
    }

    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeConnector for CountingConnector {
        async fn connect(&self, _: &Workload) -> Result<Arc<dyn ExchangeService>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FailingBootstrapExchange))
        }
    }

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

    #[tokio::test(start_paused = true)]
    async fn restarts_failed_workloads_on_subsequent_ticks() {
        let db = Arc::new(MemoryStore::new());
        db.create_workload(&workload()).await.unwrap();

        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
        });

        let (events, rx) = ChannelEventService::new(16);
        ChannelEventService::spawn_logging_drain(rx);

        let controller = WorkloadController::new(
            db.clone(),
            connector.clone(),
            Arc::new(CandleStore::new(720)),
            Arc::new(NeverSignals),
            db.clone(),
            db.clone(),
            Arc::new(events),
            Config::default().engine,
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(token.clone()));

        // Each runner dies on its failed bootstrap; two controller ticks
        // should therefore connect (at least) twice.
        tokio::time::sleep(Duration::from_secs(150)).await;

        assert!(connector.connects.load(Ordering::SeqCst) >= 2);

        token.cancel();
        handle.await.unwrap();

        // Sentinels settle after cancellation.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.active_workloads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_start_a_second_runner_for_a_live_workload() {
        struct HealthyExchange;

        #[async_trait]
        impl ExchangeService for HealthyExchange {
            async fn candles(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<Vec<Candle>> {
                Ok(vec![])
            }

            async fn candles_ticker(
                &self,
            ) -> Result<(mpsc::Receiver<CandleTick>, mpsc::Receiver<anyhow::Error>)> {
                let (tick_tx, tick_rx) = mpsc::channel(16);
                let (err_tx, err_rx) = mpsc::channel(1);
                // Feed a tick every few seconds so the stream never idles out.
                tokio::spawn(async move {
                    let _err_tx = err_tx;
                    loop {
                        let now = Utc::now();
                        let tick = CandleTick {
                            candle: Candle {
                                open_time: now,
                                close_time: now + chrono::Duration::seconds(59),
                                open: dec!(2000),
                                close: dec!(2000),
                                high: dec!(2000),
                                low: dec!(2000),
                                volume: dec!(1),
                                trade_count: 1,
                            },
                            tick_time: now,
                        };
                        if tick_tx.send(tick).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                });
                Ok((tick_rx, err_rx))
            }

            async fn account_balances(&self) -> Result<Balances> {
                Ok(Balances::default())
            }

            async fn account_taker_commission(&self) -> Result<Decimal> {
                Ok(dec!(0.001))
            }

            async fn execute_order(&self, _: &Order) -> Result<bool> {
                Ok(false)
            }

            async fn is_order_executed(&self, _: &Order) -> Result<bool> {
                Ok(false)
            }

            fn exchange_name(&self) -> &'static str {
                "STUB"
            }
        }

        struct HealthyConnector {
            connects: AtomicUsize,
        }

        #[async_trait]
        impl ExchangeConnector for HealthyConnector {
            async fn connect(&self, _: &Workload) -> Result<Arc<dyn ExchangeService>> {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(HealthyExchange))
            }
        }

        let db = Arc::new(MemoryStore::new());
        db.create_workload(&workload()).await.unwrap();

        let connector = Arc::new(HealthyConnector {
            connects: AtomicUsize::new(0),
        });

        let (events, rx) = ChannelEventService::new(16);
        ChannelEventService::spawn_logging_drain(rx);

        let controller = WorkloadController::new(
            db.clone(),
            connector.clone(),
            Arc::new(CandleStore::new(720)),
            Arc::new(NeverSignals),
            db.clone(),
            db.clone(),
            Arc::new(events),
            Config::default().engine,
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(token.clone()));

        tokio::time::sleep(Duration::from_secs(150)).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(controller.active_workloads(), 1);

        token.cancel();
        handle.await.unwrap();
    }
}
