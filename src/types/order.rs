use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Side;

/// A persisted limit order belonging to a position. The order ID doubles as
/// the exchange client-order ID, so submission and lookup are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub position_id: Uuid,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub time: DateTime<Utc>,
    pub executed: bool,
}
