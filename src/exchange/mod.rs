pub mod binance;
pub mod websocket;

pub use binance::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::{Balances, Candle, CandleTick, Order, Workload};

/// The full capability set a workload runner needs from its exchange:
/// candle history and live ticks, account introspection and order
/// submission. New exchanges plug in by implementing this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeService: Send + Sync {
    /// Historical candles for the workload's pair at the fixed interval.
    /// Bounded to ~1000 candles per call by the exchange.
    async fn candles(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Candle>>;

    /// Live candle stream plus its error side-channel. Either channel
    /// closing means the connection dropped.
    async fn candles_ticker(
        &self,
    ) -> Result<(mpsc::Receiver<CandleTick>, mpsc::Receiver<anyhow::Error>)>;

    /// Free balance per asset.
    async fn account_balances(&self) -> Result<Balances>;

    /// Taker commission rate, e.g. 0.001 for 10 bps.
    async fn account_taker_commission(&self) -> Result<Decimal>;

    /// Submits the order as a limit fill-or-kill with the order's ID as the
    /// client-order ID. Returns true iff the exchange reports FILLED; a
    /// FOK cancellation is reported as false, not as an error.
    async fn execute_order(&self, order: &Order) -> Result<bool>;

    /// Looks the order up by client-order ID. Returns false when the
    /// exchange has no such order.
    async fn is_order_executed(&self, order: &Order) -> Result<bool>;

    fn exchange_name(&self) -> &'static str;
}

/// Builds a per-workload exchange service from the workload's account
/// credentials and pair.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn connect(&self, workload: &Workload) -> Result<Arc<dyn ExchangeService>>;
}

pub struct BinanceConnector {
    testnet: bool,
    request_timeout: Duration,
}

impl BinanceConnector {
    pub fn new(testnet: bool, request_timeout: Duration) -> Self {
        Self {
            testnet,
            request_timeout,
        }
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    async fn connect(&self, workload: &Workload) -> Result<Arc<dyn ExchangeService>> {
        match workload.account.exchange.as_str() {
            "BINANCE" => Ok(Arc::new(BinanceExchange::new(
                workload,
                self.testnet,
                self.request_timeout,
            )?)),
            other => Err(anyhow::anyhow!("unknown exchange: [{}]", other)),
        }
    }
}
