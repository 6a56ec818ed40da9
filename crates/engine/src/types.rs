//! Market data and trade types shared by simulators and the evaluator

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use crate::error::{OptimizeError, OptimizeResult};

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Read-only candle series for one symbol/timeframe.
///
/// Cloning shares the underlying candles; evaluation workers never copy them.
#[derive(Debug, Clone)]
pub struct HistoricalDataset {
    symbol: Arc<str>,
    timeframe: Arc<str>,
    klines: Arc<[Kline]>,
}

impl HistoricalDataset {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>, klines: Vec<Kline>) -> Self {
        Self {
            symbol: Arc::from(symbol.into()),
            timeframe: Arc::from(timeframe.into()),
            klines: Arc::from(klines),
        }
    }

    /// Load a JSON array of klines from disk
    pub fn from_json_file(
        path: impl AsRef<Path>,
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
    ) -> OptimizeResult<Self> {
        let path = path.as_ref();
        let symbol = symbol.into();
        let raw = std::fs::read_to_string(path).map_err(|e| OptimizeError::Data {
            strategy_id: symbol.clone(),
            reason: format!("{}: {e}", path.display()),
        })?;
        let klines: Vec<Kline> = serde_json::from_str(&raw).map_err(|e| OptimizeError::Data {
            strategy_id: symbol.clone(),
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(Self::new(symbol, timeframe, klines))
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn klines(&self) -> &[Kline] {
        &self.klines
    }

    /// True when both handles point at the same candle buffer
    pub fn shares_buffer_with(&self, other: &HistoricalDataset) -> bool {
        Arc::ptr_eq(&self.klines, &other.klines)
    }
}

impl Deref for HistoricalDataset {
    type Target = [Kline];

    fn deref(&self) -> &[Kline] {
        &self.klines
    }
}

/// Side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One simulated round trip produced by a strategy simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub entry_time: i64,
    pub exit_time: i64,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rust_decimal_macros::dec;

    /// Candles whose close follows `prices`, 15-minute spacing
    pub fn make_klines(prices: &[f64]) -> Vec<Kline> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
                Kline {
                    open_time: (i as i64) * 900_000,
                    open: price,
                    high: price + dec!(1),
                    low: price - dec!(1),
                    close: price,
                    volume: dec!(100),
                    close_time: ((i + 1) as i64) * 900_000 - 1,
                }
            })
            .collect()
    }

    /// `bars` candles with strictly ascending closes
    pub fn ascending_dataset(bars: usize) -> HistoricalDataset {
        let prices: Vec<f64> = (0..bars).map(|i| 100.0 + i as f64).collect();
        HistoricalDataset::new("BTCUSDT", "15m", make_klines(&prices))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_dataset_clone_shares_candles() {
        let ds = ascending_dataset(100);
        let copy = ds.clone();
        assert!(ds.shares_buffer_with(&copy));
        assert_eq!(copy.len(), 100);
        assert_eq!(copy.symbol(), "BTCUSDT");
    }

    #[test]
    fn test_dataset_from_json_file() {
        let klines = make_klines(&[100.0, 101.5, 99.25]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&klines).unwrap()).unwrap();

        let ds = HistoricalDataset::from_json_file(file.path(), "ETHUSDT", "1h").unwrap();
        assert_eq!(ds.klines(), klines.as_slice());
        assert_eq!(ds.timeframe(), "1h");
    }

    #[test]
    fn test_dataset_from_missing_file_is_data_error() {
        let err = HistoricalDataset::from_json_file("/nonexistent/candles.json", "X", "1m")
            .unwrap_err();
        assert!(matches!(err, OptimizeError::Data { .. }));
    }
}
