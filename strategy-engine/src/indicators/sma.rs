/// Simple moving average over the last `period` values, `None` until enough
/// data is available
pub fn latest_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    mean(&prices[prices.len() - period..])
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_sma_uses_trailing_values() {
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(latest_sma(&prices, 3), Some(4.0)); // (3+4+5)/3
        assert_eq!(latest_sma(&prices, 5), Some(3.0));
    }

    #[test]
    fn test_period_larger_than_data() {
        let prices = vec![1.0, 2.0, 3.0];
        assert!(latest_sma(&prices, 5).is_none());
        assert!(latest_sma(&prices, 0).is_none());
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[2.0, 4.0]), Some(3.0));
        assert!(mean(&[]).is_none());
    }
}
