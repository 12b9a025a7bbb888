use rust_decimal::Decimal;

/// Exponential moving average over a full price series, seeded with the SMA
/// of the first `period` values. The result starts at index `period - 1` of
/// the input, so `result[j]` corresponds to `prices[j + period - 1]`.
pub fn calculate_ema_series(prices: &[Decimal], period: usize) -> Vec<Decimal> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let multiplier = Decimal::from(2) / Decimal::from(period as u32 + 1);
    let seed = prices[..period].iter().sum::<Decimal>() / Decimal::from(period as u32);

    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(seed);

    for price in &prices[period..] {
        let previous = *series.last().expect("series is seeded");
        series.push((*price - previous) * multiplier + previous);
    }

    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn too_short_input_yields_nothing() {
        assert!(calculate_ema_series(&[dec!(1), dec!(2)], 3).is_empty());
        assert!(calculate_ema_series(&[], 3).is_empty());
    }

    #[test]
    fn seeds_with_sma_of_first_period() {
        let series = calculate_ema_series(&[dec!(1), dec!(2), dec!(3)], 3);

        assert_eq!(series, vec![dec!(2)]);
    }

    #[test]
    fn smooths_after_seed() {
        // multiplier = 2 / 4 = 0.5; (5 - 2) * 0.5 + 2 = 3.5
        let series = calculate_ema_series(&[dec!(1), dec!(2), dec!(3), dec!(5)], 3);

        assert_eq!(series, vec![dec!(2), dec!(3.5)]);
    }

    #[test]
    fn series_is_offset_by_period() {
        let prices = vec![dec!(1), dec!(2), dec!(3), dec!(5), dec!(4)];
        let series = calculate_ema_series(&prices, 3);

        assert_eq!(series.len(), prices.len() - 2);
        // series[j] tracks prices[j + 2]: the last entry smooths the last
        // price against the previous EMA value.
        assert_eq!(series[2], (dec!(4) - dec!(3.5)) * dec!(0.5) + dec!(3.5));
    }
}
