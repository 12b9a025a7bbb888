use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Asset, Pair};

/// An exchange account operated by the service. Read-only from the runner's
/// perspective; credentials are consumed by the exchange connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub exchange: String,
    pub api_key: String,
    pub api_secret: String,
    pub risk_factor: Decimal,
    pub open_positions_limit: i64,
}

/// A workload assigns an account to a trading pair. One runner per workload.
#[derive(Debug, Clone)]
pub struct Workload {
    pub id: Uuid,
    pub account: Account,
    pub pair: Pair,
}

/// Snapshot of the account's quote-asset wallet taken at signal time.
#[derive(Debug, Clone)]
pub struct AccountWalletItem {
    pub account: Account,
    pub asset: Asset,
    pub balance: Decimal,
    pub taker_commission: Decimal,
}
