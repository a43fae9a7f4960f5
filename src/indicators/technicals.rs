use crate::database::models::PricePoint;
use crate::indicators::ta::{
    MovingAverageConvergenceDivergence, Next, RelativeStrengthIndex, SimpleMovingAverage,
};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Which indicators an adapter stores in each bar's dynamic metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSet {
    pub sma_periods: Vec<usize>,
    pub rsi_period: Option<usize>,
    pub macd: Option<(usize, usize, usize)>,
    /// With fewer bars than this, no indicators are computed at all.
    pub min_history: usize,
}

impl IndicatorSet {
    /// Daily crypto bars: each indicator fills in once its own window is met.
    pub fn crypto() -> Self {
        Self {
            sma_periods: vec![20, 50, 200],
            rsi_period: Some(14),
            macd: Some((12, 26, 9)),
            min_history: 0,
        }
    }

    /// Equities and commodities: long averages only, and only with a full
    /// 200-bar history.
    pub fn traditional() -> Self {
        Self {
            sma_periods: vec![50, 200],
            rsi_period: None,
            macd: None,
            min_history: 200,
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Writes indicator values into `dynamic_metadata` of bars sorted oldest first.
/// Values the window cannot support yet are stored as null.
pub fn annotate(bars: &mut [PricePoint], set: &IndicatorSet) {
    if bars.len() < set.min_history {
        debug!(
            "Skipping indicators: {} bars below minimum history of {}",
            bars.len(),
            set.min_history
        );
        return;
    }

    let mut smas: Vec<(usize, SimpleMovingAverage)> = set
        .sma_periods
        .iter()
        .filter_map(|p| SimpleMovingAverage::new(*p).ok().map(|s| (*p, s)))
        .collect();
    let mut rsi = set.rsi_period.and_then(|p| RelativeStrengthIndex::new(p).ok());
    let mut macd = set
        .macd
        .and_then(|(f, s, g)| MovingAverageConvergenceDivergence::new(f, s, g).ok());

    let mut prev_close: Option<f64> = None;
    for bar in bars.iter_mut() {
        let mut fields = match bar.dynamic_metadata.take() {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        for (period, sma) in smas.iter_mut() {
            let value = sma.next(bar.close).map(round4);
            fields.insert(format!("sma_{}", period), json!(value));
        }
        if let (Some(period), Some(rsi)) = (set.rsi_period, rsi.as_mut()) {
            fields.insert(format!("rsi_{}", period), json!(rsi.next(bar.close).map(round4)));
        }
        if let Some(macd) = macd.as_mut() {
            let value = macd.next(bar.close).map(|m| {
                json!({
                    "macd": round4(m.macd),
                    "signal": round4(m.signal),
                    "histogram": round4(m.histogram),
                })
            });
            fields.insert("macd".to_string(), value.unwrap_or(Value::Null));
        }

        let pct_change = prev_close
            .filter(|p| *p != 0.0)
            .map(|p| round4((bar.close - p) / p));
        fields.insert("pct_change".to_string(), json!(pct_change));
        prev_close = Some(bar.close);

        bar.dynamic_metadata = Value::Object(fields);
    }
}

/// Stores the market cap snapshot on the newest bar only.
pub fn attach_market_cap(bars: &mut [PricePoint], market_cap: Option<f64>) {
    let Some(cap) = market_cap else { return };
    if let Some(Value::Object(fields)) = bars.last_mut().map(|b| &mut b.dynamic_metadata) {
        fields.insert("market_cap".to_string(), json!(cap));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(n: usize) -> Vec<PricePoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                PricePoint::daily(start + Duration::days(i as i64), close, close, close, close, 1.0)
            })
            .collect()
    }

    #[test]
    fn crypto_indicators_fill_in_as_windows_complete() {
        let mut bars = series(60);
        annotate(&mut bars, &IndicatorSet::crypto());

        let first = &bars[0].dynamic_metadata;
        assert!(first["sma_20"].is_null());
        assert!(first["pct_change"].is_null());

        let last = &bars[59].dynamic_metadata;
        assert_eq!(last["sma_20"], json!(149.5));
        assert_eq!(last["sma_50"], json!(134.5));
        assert!(last["sma_200"].is_null());
        assert_eq!(last["rsi_14"], json!(100.0));
        assert!(last["macd"].is_object());
    }

    #[test]
    fn traditional_short_history_skips_indicators_but_keeps_bars() {
        let mut bars = series(150);
        annotate(&mut bars, &IndicatorSet::traditional());
        assert_eq!(bars.len(), 150);
        assert!(bars[149].dynamic_metadata.get("sma_50").is_none());

        let mut bars = series(200);
        annotate(&mut bars, &IndicatorSet::traditional());
        assert_eq!(bars[199].dynamic_metadata["sma_200"], json!(199.5));
        assert!(bars[199].dynamic_metadata.get("rsi_14").is_none());
    }

    #[test]
    fn market_cap_goes_on_latest_bar() {
        let mut bars = series(3);
        annotate(&mut bars, &IndicatorSet::crypto());
        attach_market_cap(&mut bars, Some(1.5e12));
        assert_eq!(bars[2].dynamic_metadata["market_cap"], json!(1.5e12));
        assert!(bars[1].dynamic_metadata.get("market_cap").is_none());
    }
}
