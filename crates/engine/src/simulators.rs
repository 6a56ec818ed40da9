//! Built-in strategy simulators
//!
//! Three reference strategies replayed bar by bar over a dataset, long only,
//! with optional stop-loss and take-profit exits. Each exposes its parameter
//! space and registers itself with a [`ParameterSpace`] and a
//! [`SimulatorRegistry`]. Anything else plugs in through
//! [`StrategySimulator`] directly.

use anyhow::{anyhow, Context};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use ta::indicators::{
    ExponentialMovingAverage, MovingAverageConvergenceDivergence, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::Next;
use tracing::debug;

use crate::error::OptimizeResult;
use crate::evaluator::{ScoreWeights, SimulatorRegistry, StrategySimulator};
use crate::space::{ParameterSet, ParameterSpace, ParameterSpec};
use crate::types::{HistoricalDataset, Kline, TradeOutcome, TradeSide};

/// Quote value committed to every entry
const STAKE: Decimal = dec!(1000);

const RSI_PERIOD: usize = 14;

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Buy,
    Sell,
    Hold,
}

trait SignalGenerator {
    fn on_bar(&mut self, kline: &Kline) -> Signal;
}

fn close_f64(kline: &Kline) -> f64 {
    kline.close.to_f64().unwrap_or(0.0)
}

fn param(params: &ParameterSet, name: &str) -> anyhow::Result<f64> {
    params
        .get(name)
        .ok_or_else(|| anyhow!("missing parameter {name}"))
}

fn period(params: &ParameterSet, name: &str) -> anyhow::Result<usize> {
    let value = params
        .get_int(name)
        .ok_or_else(|| anyhow!("missing parameter {name}"))?;
    usize::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| anyhow!("{name} must be a positive period, got {value}"))
}

/// RSI dip below a moving average; exit when RSI recovers
struct SafeTemplateSignals {
    rsi: RelativeStrengthIndex,
    sma: SimpleMovingAverage,
    buy_threshold: f64,
    sell_threshold: f64,
    warmup: usize,
    bars_seen: usize,
}

impl SafeTemplateSignals {
    fn from_params(params: &ParameterSet) -> anyhow::Result<Self> {
        let sma_period = period(params, "sma_period")?;
        Ok(Self {
            rsi: RelativeStrengthIndex::new(RSI_PERIOD)
                .map_err(|e| anyhow!("invalid RSI period: {e:?}"))?,
            sma: SimpleMovingAverage::new(sma_period)
                .map_err(|e| anyhow!("invalid SMA period {sma_period}: {e:?}"))?,
            buy_threshold: param(params, "rsi_buy_threshold")?,
            sell_threshold: param(params, "rsi_sell_threshold")?,
            warmup: sma_period.max(RSI_PERIOD),
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for SafeTemplateSignals {
    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = close_f64(kline);
        let rsi = self.rsi.next(close);
        let sma = self.sma.next(close);
        self.bars_seen += 1;

        if self.bars_seen <= self.warmup {
            Signal::Hold
        } else if rsi < self.buy_threshold && close < sma {
            Signal::Buy
        } else if rsi > self.sell_threshold {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}

/// EMA crossover filtered by RSI
struct EmaRsiSignals {
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    rsi: RelativeStrengthIndex,
    rsi_buy: f64,
    rsi_sell: f64,
    slow_period: usize,
    prev_fast: f64,
    prev_slow: f64,
    bars_seen: usize,
}

impl EmaRsiSignals {
    fn from_params(params: &ParameterSet) -> anyhow::Result<Self> {
        let fast = period(params, "ema_fast")?;
        let slow = period(params, "ema_slow")?;
        Ok(Self {
            ema_fast: ExponentialMovingAverage::new(fast)
                .map_err(|e| anyhow!("invalid fast EMA period {fast}: {e:?}"))?,
            ema_slow: ExponentialMovingAverage::new(slow)
                .map_err(|e| anyhow!("invalid slow EMA period {slow}: {e:?}"))?,
            rsi: RelativeStrengthIndex::new(RSI_PERIOD)
                .map_err(|e| anyhow!("invalid RSI period: {e:?}"))?,
            rsi_buy: param(params, "rsi_buy")?,
            rsi_sell: param(params, "rsi_sell")?,
            slow_period: slow,
            prev_fast: 0.0,
            prev_slow: 0.0,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for EmaRsiSignals {
    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = close_f64(kline);
        let fast = self.ema_fast.next(close);
        let slow = self.ema_slow.next(close);
        let rsi = self.rsi.next(close);
        self.bars_seen += 1;

        let signal = if self.bars_seen <= self.slow_period {
            Signal::Hold
        } else if (self.prev_fast <= self.prev_slow && fast > slow && rsi < self.rsi_sell)
            || (fast > slow && rsi < self.rsi_buy)
        {
            Signal::Buy
        } else if (self.prev_fast >= self.prev_slow && fast < slow) || rsi > self.rsi_sell {
            Signal::Sell
        } else {
            Signal::Hold
        };

        self.prev_fast = fast;
        self.prev_slow = slow;
        signal
    }
}

/// MACD histogram crossings, entries gated by RSI and quote volume
struct MacdSignals {
    macd: MovingAverageConvergenceDivergence,
    rsi: RelativeStrengthIndex,
    rsi_filter: f64,
    volume_threshold: f64,
    slow_period: usize,
    prev_histogram: f64,
    bars_seen: usize,
}

impl MacdSignals {
    fn from_params(params: &ParameterSet) -> anyhow::Result<Self> {
        let fast = period(params, "macd_fast")?;
        let slow = period(params, "macd_slow")?;
        let signal = period(params, "macd_signal")?;
        Ok(Self {
            macd: MovingAverageConvergenceDivergence::new(fast, slow, signal)
                .map_err(|e| anyhow!("invalid MACD periods {fast}/{slow}/{signal}: {e:?}"))?,
            rsi: RelativeStrengthIndex::new(RSI_PERIOD)
                .map_err(|e| anyhow!("invalid RSI period: {e:?}"))?,
            rsi_filter: param(params, "rsi_filter")?,
            volume_threshold: param(params, "volume_threshold")?,
            slow_period: slow,
            prev_histogram: 0.0,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for MacdSignals {
    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = close_f64(kline);
        let histogram = self.macd.next(close).histogram;
        let rsi = self.rsi.next(close);
        let quote_volume = (kline.volume * kline.close).to_f64().unwrap_or(0.0);
        self.bars_seen += 1;

        let warmed_up = self.bars_seen > self.slow_period;
        let signal = if warmed_up
            && self.prev_histogram <= 0.0
            && histogram > 0.0
            && rsi < self.rsi_filter
            && quote_volume >= self.volume_threshold
        {
            Signal::Buy
        } else if warmed_up && self.prev_histogram >= 0.0 && histogram < 0.0 {
            Signal::Sell
        } else {
            Signal::Hold
        };

        self.prev_histogram = histogram;
        signal
    }
}

// ============================================================================
// Replay
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct RiskExits {
    stoploss_pct: Option<f64>,
    take_profit_pct: Option<f64>,
}

struct OpenPosition {
    entry_time: i64,
    entry_price: Decimal,
    size: Decimal,
}

fn close_position(pos: OpenPosition, exit_time: i64, exit_price: Decimal) -> TradeOutcome {
    let pnl = (exit_price - pos.entry_price) * pos.size;
    let pnl_pct = if pos.entry_price > Decimal::ZERO {
        (exit_price - pos.entry_price) / pos.entry_price * dec!(100)
    } else {
        Decimal::ZERO
    };
    TradeOutcome {
        entry_time: pos.entry_time,
        exit_time,
        side: TradeSide::Buy,
        entry_price: pos.entry_price,
        exit_price,
        size: pos.size,
        pnl,
        pnl_pct,
    }
}

fn pct(value: Option<f64>) -> anyhow::Result<Option<Decimal>> {
    value
        .map(|v| {
            v.to_string()
                .parse::<Decimal>()
                .with_context(|| format!("exit percentage {v} is not representable"))
        })
        .transpose()
}

/// Long-only replay. Stop-loss is checked before take-profit on each bar;
/// a position still open at the end is closed at the last close.
fn replay(
    generator: &mut dyn SignalGenerator,
    klines: &[Kline],
    exits: RiskExits,
) -> anyhow::Result<Vec<TradeOutcome>> {
    let stoploss = pct(exits.stoploss_pct)?;
    let take_profit = pct(exits.take_profit_pct)?;

    let mut trades = Vec::new();
    let mut position: Option<OpenPosition> = None;

    for kline in klines {
        let signal = generator.on_bar(kline);

        if let Some(pos) = position.take() {
            let stop_price = stoploss.map(|sl| pos.entry_price * (Decimal::ONE - sl));
            let target_price = take_profit.map(|tp| pos.entry_price * (Decimal::ONE + tp));

            if let Some(stop) = stop_price.filter(|stop| kline.low <= *stop) {
                trades.push(close_position(pos, kline.close_time, stop));
            } else if let Some(target) = target_price.filter(|target| kline.high >= *target) {
                trades.push(close_position(pos, kline.close_time, target));
            } else if signal == Signal::Sell {
                trades.push(close_position(pos, kline.close_time, kline.close));
            } else {
                position = Some(pos);
            }
            continue;
        }

        if signal == Signal::Buy && kline.close > Decimal::ZERO {
            position = Some(OpenPosition {
                entry_time: kline.open_time,
                entry_price: kline.close,
                size: STAKE / kline.close,
            });
        }
    }

    if let (Some(pos), Some(last)) = (position, klines.last()) {
        trades.push(close_position(pos, last.close_time, last.close));
    }
    Ok(trades)
}

// ============================================================================
// Built-in strategies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinStrategy {
    SafeTemplate,
    EmaRsi,
    Macd,
}

impl BuiltinStrategy {
    pub const ALL: [BuiltinStrategy; 3] = [
        BuiltinStrategy::SafeTemplate,
        BuiltinStrategy::EmaRsi,
        BuiltinStrategy::Macd,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BuiltinStrategy::SafeTemplate => "safe_template",
            BuiltinStrategy::EmaRsi => "ema_rsi",
            BuiltinStrategy::Macd => "macd",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn specs(&self) -> OptimizeResult<Vec<ParameterSpec>> {
        Ok(match self {
            BuiltinStrategy::SafeTemplate => vec![
                ParameterSpec::integer("rsi_buy_threshold", 20, 40)?,
                ParameterSpec::integer("rsi_sell_threshold", 60, 80)?,
                ParameterSpec::integer("sma_period", 10, 30)?,
                ParameterSpec::real("stoploss_pct", 0.01, 0.05)?,
                ParameterSpec::real("take_profit_pct", 0.02, 0.10)?,
            ],
            BuiltinStrategy::EmaRsi => vec![
                ParameterSpec::integer("ema_fast", 8, 20)?,
                ParameterSpec::integer("ema_slow", 20, 50)?,
                ParameterSpec::integer("rsi_buy", 25, 40)?,
                ParameterSpec::integer("rsi_sell", 60, 75)?,
                ParameterSpec::real("stoploss_pct", 0.02, 0.08)?,
            ],
            BuiltinStrategy::Macd => vec![
                ParameterSpec::integer("macd_fast", 8, 20)?,
                ParameterSpec::integer("macd_slow", 20, 35)?,
                ParameterSpec::integer("macd_signal", 5, 15)?,
                ParameterSpec::integer("rsi_filter", 30, 70)?,
                ParameterSpec::real("volume_threshold", 1_000_000.0, 10_000_000.0)?,
            ],
        })
    }
}

impl StrategySimulator for BuiltinStrategy {
    fn simulate(
        &self,
        params: &ParameterSet,
        dataset: &HistoricalDataset,
    ) -> anyhow::Result<Vec<TradeOutcome>> {
        let (mut generator, exits) = match self {
            BuiltinStrategy::SafeTemplate => (
                Box::new(SafeTemplateSignals::from_params(params)?) as Box<dyn SignalGenerator>,
                RiskExits {
                    stoploss_pct: Some(param(params, "stoploss_pct")?),
                    take_profit_pct: Some(param(params, "take_profit_pct")?),
                },
            ),
            BuiltinStrategy::EmaRsi => (
                Box::new(EmaRsiSignals::from_params(params)?) as Box<dyn SignalGenerator>,
                RiskExits {
                    stoploss_pct: Some(param(params, "stoploss_pct")?),
                    take_profit_pct: None,
                },
            ),
            BuiltinStrategy::Macd => (
                Box::new(MacdSignals::from_params(params)?) as Box<dyn SignalGenerator>,
                RiskExits::default(),
            ),
        };

        let trades = replay(generator.as_mut(), dataset.klines(), exits)?;
        debug!(
            strategy = self.id(),
            bars = dataset.len(),
            trades = trades.len(),
            "Simulation complete"
        );
        Ok(trades)
    }
}

/// Register the spaces and simulators of every built-in strategy
pub fn register_builtin_strategies(
    space: &ParameterSpace,
    registry: &SimulatorRegistry,
    weights: ScoreWeights,
) -> OptimizeResult<()> {
    for strategy in BuiltinStrategy::ALL {
        space.register_strategy(strategy.id(), strategy.specs()?)?;
        registry.register(strategy.id(), Arc::new(strategy), weights)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::make_klines;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sine_dataset(bars: usize) -> HistoricalDataset {
        let prices: Vec<f64> = (0..bars)
            .map(|i| 100.0 + 10.0 * (i as f64 / 8.0).sin() + i as f64 * 0.05)
            .collect();
        HistoricalDataset::new("BTCUSDT", "1h", make_klines(&prices))
    }

    struct Scripted(Vec<Signal>, usize);

    impl SignalGenerator for Scripted {
        fn on_bar(&mut self, _kline: &Kline) -> Signal {
            let s = self.0.get(self.1).copied().unwrap_or(Signal::Hold);
            self.1 += 1;
            s
        }
    }

    #[test]
    fn test_replay_closes_on_sell_and_at_end() {
        let klines = make_klines(&[100.0, 110.0, 120.0, 90.0, 95.0]);
        let mut gen = Scripted(
            vec![Signal::Buy, Signal::Hold, Signal::Sell, Signal::Buy, Signal::Hold],
            0,
        );
        let trades = replay(&mut gen, &klines, RiskExits::default()).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].entry_price, dec!(100));
        assert_eq!(trades[0].exit_price, dec!(120));
        assert_eq!(trades[0].pnl, dec!(200));
        // Second position closed at the last close
        assert_eq!(trades[1].exit_price, dec!(95));
    }

    #[test]
    fn test_replay_stop_loss_hits_before_signal() {
        // make_klines: low = close - 1
        let klines = make_klines(&[100.0, 98.5, 120.0]);
        let mut gen = Scripted(vec![Signal::Buy, Signal::Sell, Signal::Hold], 0);
        let exits = RiskExits {
            stoploss_pct: Some(0.02),
            take_profit_pct: None,
        };
        let trades = replay(&mut gen, &klines, exits).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, dec!(98));
        assert!(trades[0].pnl < Decimal::ZERO);
    }

    #[test]
    fn test_builtin_strategies_simulate_sampled_params() {
        let space = ParameterSpace::new();
        let registry = SimulatorRegistry::new();
        register_builtin_strategies(&space, &registry, ScoreWeights::default()).unwrap();
        assert_eq!(space.strategies(), vec!["ema_rsi", "macd", "safe_template"]);

        let dataset = sine_dataset(400);
        let mut rng = StdRng::seed_from_u64(21);
        for strategy in BuiltinStrategy::ALL {
            assert!(registry.contains(strategy.id()));
            for params in space.sample_uniform(strategy.id(), 5, &mut rng).unwrap() {
                let trades = strategy.simulate(&params, &dataset).unwrap();
                assert!(trades.iter().all(|t| t.exit_time >= t.entry_time));
            }
        }
    }

    #[test]
    fn test_missing_parameter_is_error() {
        let space = ParameterSpace::new();
        space
            .register_strategy("ema_rsi", vec![ParameterSpec::integer("ema_fast", 8, 20).unwrap()])
            .unwrap();
        let params = space
            .sample_uniform("ema_rsi", 1, &mut StdRng::seed_from_u64(0))
            .unwrap()
            .remove(0);
        let err = BuiltinStrategy::EmaRsi
            .simulate(&params, &sine_dataset(50))
            .unwrap_err();
        assert!(err.to_string().contains("ema_slow"));
    }

    #[test]
    fn test_from_id() {
        assert_eq!(BuiltinStrategy::from_id("macd"), Some(BuiltinStrategy::Macd));
        assert_eq!(BuiltinStrategy::from_id("gabagool"), None);
    }
}
