/// Calculate RSI using Wilder's Smoothing (Exponential Moving Average)
///
/// # Arguments
/// * `prices` - Slice of closing prices
/// * `period` - RSI period (14 for the sentiment score)
///
/// # Returns
/// Vector of RSI values (same length as input, with warmup period values set to 50.0).
/// A series without any movement reads as neutral (50.0).
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    let n = prices.len();
    if period == 0 || n < period + 1 {
        return vec![50.0; n];
    }

    let mut rsi = vec![50.0; n];
    let alpha = 1.0 / period as f64;

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += delta.abs();
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    rsi[period] = rsi_value(avg_gain, avg_loss);

    // Wilder's Smoothing for subsequent values
    for i in (period + 1)..n {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = avg_gain * (1.0 - alpha) + gain * alpha;
        avg_loss = avg_loss * (1.0 - alpha) + loss * alpha;

        rsi[i] = rsi_value(avg_gain, avg_loss);
    }

    rsi
}

/// RSI of the last price, or `None` while still warming up
pub fn latest_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }
    calculate_rsi(prices, period).last().copied()
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}
