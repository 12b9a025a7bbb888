use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::types::{Candle, CandleTick};

/// Consumes a single kline stream and forwards each update as a candle tick.
/// The task ends on disconnect or error, reporting through the error channel;
/// reconnection is the workload supervisor's restart, not the socket's.
pub async fn run_kline_stream(
    url: String,
    tick_tx: mpsc::Sender<CandleTick>,
    err_tx: mpsc::Sender<anyhow::Error>,
) {
    if let Err(err) = stream_klines(&url, &tick_tx).await {
        let _ = err_tx.try_send(err);
    }
}

async fn stream_klines(url: &str, tick_tx: &mpsc::Sender<CandleTick>) -> Result<()> {
    info!("connecting to kline stream: {}", url);

    let (ws_stream, _) = connect_async(url).await?;
    let (_, mut read) = ws_stream.split();

    info!("kline stream connected");

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => {
                let tick = parse_kline_event(&text)?;
                if tick_tx.send(tick).await.is_err() {
                    // Receiver dropped; the runner is tearing down.
                    return Ok(());
                }
            }
            Message::Ping(_) => {
                debug!("received ping");
            }
            Message::Close(_) => {
                return Err(anyhow!("kline stream closed by server"));
            }
            _ => {}
        }
    }

    Err(anyhow!("kline stream ended"))
}

fn parse_kline_event(text: &str) -> Result<CandleTick> {
    let event: KlineEvent = serde_json::from_str(text)
        .map_err(|e| anyhow!("could not parse kline event: {}", e))?;

    Ok(CandleTick {
        candle: Candle {
            open_time: parse_millis(event.kline.start_time)?,
            close_time: parse_millis(event.kline.end_time)?,
            open: Decimal::from_str(&event.kline.open)?,
            close: Decimal::from_str(&event.kline.close)?,
            high: Decimal::from_str(&event.kline.high)?,
            low: Decimal::from_str(&event.kline.low)?,
            volume: Decimal::from_str(&event.kline.volume)?,
            trade_count: event.kline.trade_count,
        },
        tick_time: parse_millis(event.event_time)?,
    })
}

fn parse_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: [{}]", millis))
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "k")]
    kline: KlineData,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(rename = "t")]
    start_time: i64,
    #[serde(rename = "T")]
    end_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
}
