// Streaming technical indicators used to annotate price bars at fetch time.
// Every indicator yields `None` until it has seen enough input.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;

/// The `Next` trait is used for indicators that consume one value at a time
pub trait Next<T> {
    type Output;
    fn next(&mut self, input: T) -> Self::Output;
}

fn check_period(period: usize) -> Result<()> {
    if period == 0 {
        return Err(anyhow!("Period must be greater than 0"));
    }
    Ok(())
}

/// Simple Moving Average over a fixed window
pub struct SimpleMovingAverage {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl SimpleMovingAverage {
    pub fn new(period: usize) -> Result<Self> {
        check_period(period)?;
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        })
    }
}

impl Next<f64> for SimpleMovingAverage {
    type Output = Option<f64>;

    fn next(&mut self, input: f64) -> Self::Output {
        self.window.push_back(input);
        self.sum += input;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        (self.window.len() == self.period).then(|| self.sum / self.period as f64)
    }
}

/// Exponential Moving Average, seeded with the SMA of the first `period` inputs
pub struct ExponentialMovingAverage {
    period: usize,
    alpha: f64,
    value: Option<f64>,
    seed: Vec<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(period: usize) -> Result<Self> {
        check_period(period)?;
        Ok(Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            value: None,
            seed: Vec::with_capacity(period),
        })
    }
}

impl Next<f64> for ExponentialMovingAverage {
    type Output = Option<f64>;

    fn next(&mut self, input: f64) -> Self::Output {
        let value = match self.value {
            Some(prev) => input * self.alpha + prev * (1.0 - self.alpha),
            None => {
                self.seed.push(input);
                if self.seed.len() < self.period {
                    return None;
                }
                self.seed.iter().sum::<f64>() / self.period as f64
            }
        };
        self.value = Some(value);
        self.value
    }
}

/// Relative Strength Index with Wilder smoothing
pub struct RelativeStrengthIndex {
    period: usize,
    prev_value: Option<f64>,
    gains: f64,
    losses: f64,
    avg: Option<(f64, f64)>,
    seen: usize,
}

impl RelativeStrengthIndex {
    pub fn new(period: usize) -> Result<Self> {
        check_period(period)?;
        Ok(Self {
            period,
            prev_value: None,
            gains: 0.0,
            losses: 0.0,
            avg: None,
            seen: 0,
        })
    }
}

impl Next<f64> for RelativeStrengthIndex {
    type Output = Option<f64>;

    fn next(&mut self, input: f64) -> Self::Output {
        let prev = self.prev_value.replace(input)?;
        let change = input - prev;
        let (gain, loss) = if change >= 0.0 { (change, 0.0) } else { (0.0, -change) };
        let period = self.period as f64;

        self.avg = match self.avg {
            Some((avg_gain, avg_loss)) => Some((
                (avg_gain * (period - 1.0) + gain) / period,
                (avg_loss * (period - 1.0) + loss) / period,
            )),
            None => {
                self.gains += gain;
                self.losses += loss;
                self.seen += 1;
                if self.seen < self.period {
                    return None;
                }
                Some((self.gains / period, self.losses / period))
            }
        };

        let (avg_gain, avg_loss) = self.avg?;
        if avg_loss == 0.0 {
            Some(100.0)
        } else {
            let rs = avg_gain / avg_loss;
            Some(100.0 - (100.0 / (1.0 + rs)))
        }
    }
}

/// MACD (Moving Average Convergence Divergence) output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Moving Average Convergence Divergence
pub struct MovingAverageConvergenceDivergence {
    fast_ema: ExponentialMovingAverage,
    slow_ema: ExponentialMovingAverage,
    signal_ema: ExponentialMovingAverage,
}

impl MovingAverageConvergenceDivergence {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Result<Self> {
        if fast_period >= slow_period {
            return Err(anyhow!("Fast period must be less than slow period"));
        }
        Ok(Self {
            fast_ema: ExponentialMovingAverage::new(fast_period)?,
            slow_ema: ExponentialMovingAverage::new(slow_period)?,
            signal_ema: ExponentialMovingAverage::new(signal_period)?,
        })
    }
}

impl Next<f64> for MovingAverageConvergenceDivergence {
    type Output = Option<MacdOutput>;

    fn next(&mut self, input: f64) -> Self::Output {
        let fast = self.fast_ema.next(input);
        let slow = self.slow_ema.next(input)?;
        let macd = fast? - slow;
        let signal = self.signal_ema.next(macd)?;
        Some(MacdOutput {
            macd,
            signal,
            histogram: macd - signal,
        })
    }
}

/// Population standard deviation over a fixed window
pub struct StandardDeviation {
    period: usize,
    values: VecDeque<f64>,
}

impl StandardDeviation {
    pub fn new(period: usize) -> Result<Self> {
        check_period(period)?;
        Ok(Self {
            period,
            values: VecDeque::with_capacity(period + 1),
        })
    }
}

impl Next<f64> for StandardDeviation {
    type Output = Option<f64>;

    fn next(&mut self, input: f64) -> Self::Output {
        self.values.push_back(input);
        if self.values.len() > self.period {
            self.values.pop_front();
        }
        if self.values.len() < self.period {
            return None;
        }
        let mean = self.values.iter().sum::<f64>() / self.period as f64;
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.period as f64;
        Some(variance.sqrt())
    }
}
