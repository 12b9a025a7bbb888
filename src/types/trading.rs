use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::TradingError;

/// A single asset symbol, e.g. "ETH" or "USDT".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset(pub String);

impl Asset {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trading pair: base asset priced in the quote asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub base: Asset,
    pub quote: Asset,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: Asset::new(base),
            quote: Asset::new(quote),
        }
    }

    /// The exchange symbol, e.g. "ETHUSDT" for ETH/USDT.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl FromStr for Pair {
    type Err = TradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok(Pair::new(base, quote))
            }
            _ => Err(TradingError::InvalidPair(s.to_string())),
        }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TradingError> {
        match value {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(TradingError::UnknownOrderSide(other.to_string())),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M1,
    M5,
    M15,
    H1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M1 => "1m",
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::H1 => "1h",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TradingError> {
        match value {
            "1m" => Ok(TimeFrame::M1),
            "5m" => Ok(TimeFrame::M5),
            "15m" => Ok(TimeFrame::M15),
            "1h" => Ok(TimeFrame::H1),
            other => Err(TradingError::UnknownInterval(other.to_string())),
        }
    }

    pub fn to_minutes(&self) -> u64 {
        match self {
            TimeFrame::M1 => 1,
            TimeFrame::M5 => 5,
            TimeFrame::M15 => 15,
            TimeFrame::H1 => 60,
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Free balances per asset as reported by the exchange.
#[derive(Debug, Clone, Default)]
pub struct Balances(pub HashMap<Asset, Decimal>);

impl Balances {
    pub fn balance_of(&self, asset: &Asset) -> Decimal {
        self.0.get(asset).copied().unwrap_or(Decimal::ZERO)
    }
}
