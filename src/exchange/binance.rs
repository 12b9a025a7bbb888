use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::websocket::run_kline_stream;
use super::ExchangeService;
use crate::types::{Asset, Balances, Candle, CandleTick, Order, TimeFrame, Workload};

const BINANCE_API: &str = "https://api.binance.com";
const BINANCE_TESTNET_API: &str = "https://testnet.binance.vision";
const BINANCE_WS: &str = "wss://stream.binance.com:9443/ws";
const BINANCE_TESTNET_WS: &str = "wss://testnet.binance.vision/ws";

// NO_SUCH_ORDER per the Binance spot error code table.
const NO_SUCH_ORDER_CODE: i64 = -2013;

type HmacSha256 = Hmac<Sha256>;

/// Binance exchange service bound to a single workload's pair and account
/// credentials.
pub struct BinanceExchange {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    ws_url: String,
    symbol: String,
    interval: TimeFrame,
}

impl BinanceExchange {
    pub fn new(workload: &Workload, testnet: bool, request_timeout: Duration) -> Result<Self> {
        let (base_url, ws_url) = if testnet {
            (BINANCE_TESTNET_API, BINANCE_TESTNET_WS)
        } else {
            (BINANCE_API, BINANCE_WS)
        };

        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            api_key: workload.account.api_key.clone(),
            secret_key: workload.account.api_secret.clone(),
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            symbol: workload.pair.symbol(),
            interval: TimeFrame::M1,
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let mut query_parts: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        query_parts.push(format!("timestamp={}", timestamp));
        query_parts.push("recvWindow=5000".to_string());
        let query = query_parts.join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn fetch_account(&self) -> Result<AccountResponse> {
        let url = format!("{}/api/v3/account", self.base_url);
        let query = self.build_signed_query(&[]);

        let resp = self
            .client
            .get(format!("{}?{}", url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("account query failed: {}", error_text));
        }

        Ok(resp.json().await?)
    }

    fn parse_kline_row(&self, row: &[serde_json::Value]) -> Result<Candle> {
        let open_time = row.first().and_then(|v| v.as_i64()).unwrap_or(0);
        let open = row.get(1).and_then(|v| v.as_str()).unwrap_or("0");
        let high = row.get(2).and_then(|v| v.as_str()).unwrap_or("0");
        let low = row.get(3).and_then(|v| v.as_str()).unwrap_or("0");
        let close = row.get(4).and_then(|v| v.as_str()).unwrap_or("0");
        let volume = row.get(5).and_then(|v| v.as_str()).unwrap_or("0");
        let close_time = row.get(6).and_then(|v| v.as_i64()).unwrap_or(0);
        let trades = row.get(8).and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(Candle {
            open_time: parse_millis(open_time)?,
            close_time: parse_millis(close_time)?,
            open: Decimal::from_str(open)?,
            close: Decimal::from_str(close)?,
            high: Decimal::from_str(high)?,
            low: Decimal::from_str(low)?,
            volume: Decimal::from_str(volume)?,
            trade_count: trades,
        })
    }
}

#[async_trait]
impl ExchangeService for BinanceExchange {
    async fn candles(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit=1000",
            self.base_url,
            self.symbol,
            self.interval.as_str(),
            start.timestamp_millis(),
            end.timestamp_millis(),
        );

        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("klines query failed: {}", error_text));
        }

        let rows: Vec<Vec<serde_json::Value>> = resp.json().await?;

        rows.iter().map(|row| self.parse_kline_row(row)).collect()
    }

    async fn candles_ticker(
        &self,
    ) -> Result<(mpsc::Receiver<CandleTick>, mpsc::Receiver<anyhow::Error>)> {
        let (tick_tx, tick_rx) = mpsc::channel(1000);
        let (err_tx, err_rx) = mpsc::channel(1);

        let url = format!(
            "{}/{}@kline_{}",
            self.ws_url,
            self.symbol.to_lowercase(),
            self.interval.as_str(),
        );

        tokio::spawn(run_kline_stream(url, tick_tx, err_tx));

        Ok((tick_rx, err_rx))
    }

    async fn account_balances(&self) -> Result<Balances> {
        let account = self.fetch_account().await?;

        let mut balances = Balances::default();

        for balance in account.balances {
            let free = Decimal::from_str(&balance.free)
                .map_err(|e| anyhow!("could not parse balance for [{}]: {}", balance.asset, e))?;

            if free.is_zero() {
                continue;
            }

            balances.0.insert(Asset::new(balance.asset), free);
        }

        Ok(balances)
    }

    async fn account_taker_commission(&self) -> Result<Decimal> {
        let account = self.fetch_account().await?;

        // Reported in basis points, e.g. 10 -> 0.0010.
        Ok(Decimal::from(account.taker_commission) / Decimal::from(10_000))
    }

    async fn execute_order(&self, order: &Order) -> Result<bool> {
        let url = format!("{}/api/v3/order", self.base_url);

        let params = [
            ("symbol", self.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            // Fill-or-kill orders either fill immediately and fully, or the
            // exchange cancels them; there is no resting state.
            ("timeInForce", "FOK".to_string()),
            ("quantity", order.size.to_string()),
            ("price", order.price.to_string()),
            ("newClientOrderId", order.id.to_string()),
        ];

        let query = self.build_signed_query(&params);

        debug!(order_id = %order.id, "submitting order");

        let resp = self
            .client
            .post(format!("{}?{}", url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("order submission failed: {}", error_text));
        }

        let order_resp: OrderResponse = resp.json().await?;

        Ok(order_resp.status == "FILLED")
    }

    async fn is_order_executed(&self, order: &Order) -> Result<bool> {
        let url = format!("{}/api/v3/order", self.base_url);

        let params = [
            ("symbol", self.symbol.clone()),
            ("origClientOrderId", order.id.to_string()),
        ];

        let query = self.build_signed_query(&params);

        let resp = self
            .client
            .get(format!("{}?{}", url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;

            // The order never reached the book; for a fresh client order ID
            // that simply means "not executed".
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&error_text) {
                if api_error.code == NO_SUCH_ORDER_CODE {
                    return Ok(false);
                }
            }

            return Err(anyhow!("order status query failed: {}", error_text));
        }

        let order_resp: OrderResponse = resp.json().await?;

        // Orders are submitted FOK, so an executed order is always FILLED.
        Ok(order_resp.status == "FILLED")
    }

    fn exchange_name(&self) -> &'static str {
        "BINANCE"
    }
}

fn parse_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: [{}]", millis))
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(rename = "takerCommission")]
    taker_commission: i64,
    balances: Vec<BalanceEntry>,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[allow(dead_code)]
    msg: String,
}
