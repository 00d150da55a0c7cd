pub mod rsi;
pub mod sma;

pub use rsi::{calculate_rsi, latest_rsi};
pub use sma::{latest_sma, mean};
