// Descriptive statistics over close series, used to build portfolio context.

use rayon::prelude::*;
use std::collections::BTreeMap;

/// Simple daily returns of a close series (oldest first).
pub fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Percent change between the latest close and the close `days` bars earlier.
pub fn change_over(closes: &[f64], days: usize) -> Option<f64> {
    if closes.len() <= days {
        return None;
    }
    let last = *closes.last()?;
    let base = closes[closes.len() - 1 - days];
    (base != 0.0).then(|| (last - base) / base * 100.0)
}

/// Sample standard deviation of the last `window` daily returns, in percent.
pub fn volatility(closes: &[f64], window: usize) -> Option<f64> {
    let returns = daily_returns(closes);
    if returns.len() < window || window < 2 {
        return None;
    }
    let recent = &returns[returns.len() - window..];
    let mean = recent.iter().sum::<f64>() / window as f64;
    let var = recent.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
    Some(var.sqrt() * 100.0)
}

/// Latest volume relative to the mean of the preceding `window` volumes.
pub fn volume_ratio(volumes: &[f64], window: usize) -> Option<f64> {
    if volumes.len() <= window {
        return None;
    }
    let last = *volumes.last()?;
    let prior = &volumes[volumes.len() - 1 - window..volumes.len() - 1];
    let mean = prior.iter().sum::<f64>() / window as f64;
    (mean > 0.0).then(|| last / mean)
}

/// Pearson correlation over the common tail of two series.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationPair {
    pub first: String,
    pub second: String,
    pub correlation: f64,
}

/// Pairwise return correlations, strongest (by magnitude) first.
pub fn top_correlations(
    returns: &BTreeMap<String, Vec<f64>>,
    limit: usize,
) -> Vec<CorrelationPair> {
    let symbols: Vec<&String> = returns.keys().collect();
    let mut pairs: Vec<CorrelationPair> = (0..symbols.len())
        .into_par_iter()
        .flat_map_iter(|i| {
            let symbols = &symbols;
            (i + 1..symbols.len()).filter_map(move |j| {
                let correlation = pearson(&returns[symbols[i]], &returns[symbols[j]])?;
                Some(CorrelationPair {
                    first: symbols[i].clone(),
                    second: symbols[j].clone(),
                    correlation,
                })
            })
        })
        .collect();

    pairs.sort_by(|x, y| {
        y.correlation
            .abs()
            .total_cmp(&x.correlation.abs())
            .then_with(|| x.first.cmp(&y.first))
            .then_with(|| x.second.cmp(&y.second))
    });
    pairs.truncate(limit);
    pairs
}
