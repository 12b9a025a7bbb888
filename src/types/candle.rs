use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A finished price bar for the workload's pair at the fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
}

impl Candle {
    /// Two candles are the same candle iff both boundary times match.
    /// The remaining fields keep updating until the bar is final.
    pub fn is_same_bar(&self, other: &Candle) -> bool {
        self.open_time == other.open_time && self.close_time == other.close_time
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time: {}, close: {}",
            self.open_time.to_rfc3339(),
            self.close,
        )
    }
}

/// A live candle observation from the exchange stream.
#[derive(Debug, Clone)]
pub struct CandleTick {
    pub candle: Candle,
    pub tick_time: DateTime<Utc>,
}

impl fmt::Display for CandleTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.candle)
    }
}
