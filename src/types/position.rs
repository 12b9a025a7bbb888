use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Order, Side, TradingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    Long,
    Short,
}

impl PositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionType::Long => "LONG",
            PositionType::Short => "SHORT",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TradingError> {
        match value {
            "LONG" => Ok(PositionType::Long),
            "SHORT" => Ok(PositionType::Short),
            other => Err(TradingError::UnknownPositionType(other.to_string())),
        }
    }

    pub fn entry_order_side(&self) -> Side {
        match self {
            PositionType::Long => Side::Buy,
            PositionType::Short => Side::Sell,
        }
    }

    pub fn exit_order_side(&self) -> Side {
        match self {
            PositionType::Long => Side::Sell,
            PositionType::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for PositionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TradingError> {
        match value {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            other => Err(TradingError::UnknownPositionStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stateful record of an intended or live market exposure. Persistence is
/// authoritative; the runner re-reads it on every action tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub workload_id: Uuid,
    pub position_type: PositionType,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub time: DateTime<Utc>,
    pub orders: Vec<Order>,
}

impl Position {
    /// Splits the position's orders into (entry, exit), validating the shape
    /// an open position is allowed to have. With two orders present, the
    /// earlier one is the entry and must already be executed.
    pub fn orders_breakdown(&self) -> Result<(Option<&Order>, Option<&Order>), TradingError> {
        match self.orders.len() {
            0 => Ok((None, None)),
            1 => {
                let entry = &self.orders[0];

                if entry.side != self.position_type.entry_order_side() {
                    return Err(TradingError::EntryOrderWrongSide);
                }

                Ok((Some(entry), None))
            }
            2 => {
                let (entry, exit) = if self.orders[0].time <= self.orders[1].time {
                    (&self.orders[0], &self.orders[1])
                } else {
                    (&self.orders[1], &self.orders[0])
                };

                if entry.side != self.position_type.entry_order_side() {
                    return Err(TradingError::EntryOrderWrongSide);
                }

                if !entry.executed {
                    return Err(TradingError::ExitBeforeEntryExecuted);
                }

                if exit.side != self.position_type.exit_order_side() {
                    return Err(TradingError::ExitOrderWrongSide);
                }

                Ok((Some(entry), Some(exit)))
            }
            count => Err(TradingError::WrongOrdersCount(count)),
        }
    }
}

/// Filter used when querying positions from persistence.
#[derive(Debug, Clone, Copy)]
pub struct PositionFilter {
    pub workload_id: Uuid,
    pub status: PositionStatus,
}
