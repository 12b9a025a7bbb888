pub mod ema_cross;

pub use ema_cross::*;

use rust_decimal::Decimal;
use std::fmt;

use crate::types::{Candle, PositionType};

/// An instantaneous trade recommendation with entry/TP/SL targets.
#[derive(Debug, Clone)]
pub struct Signal {
    pub position_type: PositionType,
    pub entry_target: Decimal,
    pub take_profit_target: Decimal,
    pub stop_loss_target: Decimal,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, entry: {:.2}, tp: {:.2}, sl: {:.2}",
            self.position_type,
            self.entry_target,
            self.take_profit_target,
            self.stop_loss_target,
        )
    }
}

/// A deterministic rule over a candle window snapshot. Returns `None` when
/// the window is too short or the rule is not satisfied.
pub trait SignalGenerator: Send + Sync {
    fn evaluate(&self, candles: &[Candle]) -> Option<Signal>;
}
