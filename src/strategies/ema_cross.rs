#![allow(dead_code)]
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use super::{Signal, SignalGenerator};
use crate::indicators::calculate_ema_series;
use crate::types::{Candle, PositionType};

const DEFAULT_EMA_PERIOD: usize = 50;

/// LONG entries on a close-price "near cross-up" of its own EMA. The rule is
/// inspected at the second-to-last candle; the last one is still mutating and
/// treated as not yet stable.
pub struct EmaCrossStrategy {
    ema_period: usize,
    price_change_factor: Decimal,
}

impl EmaCrossStrategy {
    pub fn new() -> Self {
        Self {
            ema_period: DEFAULT_EMA_PERIOD,
            price_change_factor: dec!(0.025),
        }
    }

    pub fn with_period(ema_period: usize) -> Self {
        Self {
            ema_period,
            ..Self::new()
        }
    }

    fn min_candles_required(&self) -> usize {
        // The rule reads the two indices before the last candle, and both
        // need a seeded EMA value underneath them.
        self.ema_period + 2
    }
}

impl Default for EmaCrossStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalGenerator for EmaCrossStrategy {
    fn evaluate(&self, candles: &[Candle]) -> Option<Signal> {
        if candles.len() < self.min_candles_required() {
            return None;
        }

        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let ema = calculate_ema_series(&closes, self.ema_period);

        // `ema[j]` corresponds to `closes[j + period - 1]`.
        let offset = self.ema_period - 1;
        let current = closes.len() - 2;
        let previous = current - 1;

        debug!(
            close = %closes[current],
            ema = %ema[current - offset],
            "evaluating ema cross",
        );

        let crossed_up = closes[current] >= ema[current - offset]
            && closes[previous] <= ema[previous - offset];

        if !crossed_up {
            return None;
        }

        let entry_target = *closes.last().expect("window is non-empty");
        let stop_loss_target = entry_target * (Decimal::ONE - self.price_change_factor);
        let take_profit_target =
            entry_target * (Decimal::ONE + self.price_change_factor * dec!(2));

        Some(Signal {
            position_type: PositionType::Long,
            entry_target,
            take_profit_target,
            stop_loss_target,
        })
    }
}
