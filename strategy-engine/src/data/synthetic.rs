use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use common::MarketSnapshot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{trading_days, InMemoryProvider};

const BASE_VOLUME: u64 = 5_000_000;

/// Close-of-session timestamp for a trading date
pub fn session_close(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(15, 0, 0).unwrap_or_default())
}

/// Deterministic synthetic universe: `symbols_per_sector` symbols in each sector
#[derive(Debug, Clone)]
pub struct SyntheticUniverse {
    pub sectors: Vec<String>,
    pub symbols_per_sector: usize,
    pub start: NaiveDate,
    pub days: usize,
    pub initial_price: f64,
    pub seed: u64,
}

impl SyntheticUniverse {
    pub fn new(sectors: Vec<String>, start: NaiveDate, days: usize) -> Self {
        Self {
            sectors,
            symbols_per_sector: 10,
            start,
            days,
            initial_price: 20.0,
            seed: 7,
        }
    }

    pub fn with_symbols_per_sector(mut self, n: usize) -> Self {
        self.symbols_per_sector = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> InMemoryProvider {
        let mut provider = InMemoryProvider::new();
        for sector in &self.sectors {
            for i in 0..self.symbols_per_sector {
                let symbol = format!("{}-{:03}", sector, i);
                let bars = generate_synthetic_series(
                    &symbol,
                    sector,
                    self.start,
                    self.days,
                    self.initial_price,
                    self.seed,
                );
                provider.insert_series(sector, &symbol, bars);
            }
        }
        provider
    }
}

/// Generate a reproducible daily series with occasional momentum bursts,
/// volume spikes and sharp dips so every strategy has something to react to
pub fn generate_synthetic_series(
    symbol: &str,
    sector: &str,
    start: NaiveDate,
    days: usize,
    initial_price: f64,
    seed: u64,
) -> Vec<MarketSnapshot> {
    let mut rng = StdRng::seed_from_u64(seed ^ symbol_hash(symbol));
    let mut bars = Vec::with_capacity(days);
    let mut price = initial_price;

    let daily_volatility = 0.015;
    let drift = 0.0003;

    for date in trading_days(start, None).take(days) {
        let roll: f64 = rng.gen();
        let (daily_return, volume_multiplier) = if roll < 0.04 {
            // Momentum burst on heavy volume
            (rng.gen_range(0.055..0.09), rng.gen_range(3.2..4.5))
        } else if roll < 0.08 {
            // Sharp dip
            (rng.gen_range(-0.05..-0.025), rng.gen_range(1.0..1.8))
        } else {
            let noise: f64 = rng.gen_range(-1.0..1.0);
            (drift + daily_volatility * noise, rng.gen_range(0.8..1.2))
        };

        let open = price;
        let close = price * (1.0 + daily_return);
        let range = price * rng.gen_range(0.005..0.02);
        let high = open.max(close) + range;
        let low = (open.min(close) - range).max(0.01);
        let volume = (BASE_VOLUME as f64 * volume_multiplier) as u64;

        bars.push(MarketSnapshot::new(
            symbol,
            sector,
            session_close(date),
            open,
            high,
            low,
            close,
            volume,
        ));

        price = close;
    }

    bars
}

/// Generate a quiet series with scripted moves: `(day index, return, volume multiplier)`
pub fn generate_series_with_moves(
    symbol: &str,
    sector: &str,
    start: NaiveDate,
    days: usize,
    initial_price: f64,
    moves: &[(usize, f64, f64)],
) -> Vec<MarketSnapshot> {
    let mut bars = Vec::with_capacity(days);
    let mut price = initial_price;

    for (i, date) in trading_days(start, None).take(days).enumerate() {
        let (daily_return, volume_multiplier) = moves
            .iter()
            .find(|(day, _, _)| *day == i)
            .map(|(_, r, v)| (*r, *v))
            .unwrap_or((0.0, 1.0));

        let close = price * (1.0 + daily_return);
        bars.push(MarketSnapshot::new(
            symbol,
            sector,
            session_close(date),
            price,
            price.max(close),
            price.min(close),
            close,
            (BASE_VOLUME as f64 * volume_multiplier) as u64,
        ));

        price = close;
    }

    bars
}

/// Constant-price series
pub fn flat_series(
    symbol: &str,
    sector: &str,
    start: NaiveDate,
    days: usize,
    price: f64,
) -> Vec<MarketSnapshot> {
    generate_series_with_moves(symbol, sector, start, days, price, &[])
}

fn symbol_hash(symbol: &str) -> u64 {
    // FNV-1a, stable across runs and platforms
    symbol.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}
