//! Structured-output decoder for model responses.
//!
//! Responses are cleaned (code fences, `@[` annotation lines), parsed as
//! JSON and validated against the shape each stage expects. Validation
//! failures come back as a specific [`DecodeError`] so callers can retry.

use crate::database::models::{Allocation, KeyLevels, PortfolioPick, TrendSignal};
use crate::error::DecodeError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Removes markdown fences and citation lines models like to add.
pub fn clean_response(raw: &str) -> String {
    raw.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.starts_with("```") && !trimmed.starts_with("@[")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Parses the cleaned response. When prose surrounds the payload, the
/// outermost object or array is tried as a fallback.
pub fn parse_json(raw: &str) -> Result<Value, DecodeError> {
    let cleaned = clean_response(raw);
    if let Ok(value) = serde_json::from_str(&cleaned) {
        return Ok(value);
    }
    let bounds = |open: char, close: char| {
        let start = cleaned.find(open)?;
        let end = cleaned.rfind(close)?;
        (end > start).then(|| &cleaned[start..=end])
    };
    bounds('{', '}')
        .into_iter()
        .chain(bounds('[', ']'))
        .find_map(|candidate| serde_json::from_str(candidate).ok())
        .ok_or_else(|| {
            let preview: String = cleaned.chars().take(80).collect();
            DecodeError::Unparseable(preview)
        })
}

fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Result<&'a Value, DecodeError> {
    object
        .get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| DecodeError::MissingField(name.to_string()))
}

fn as_object<'a>(value: &'a Value, name: &str) -> Result<&'a Map<String, Value>, DecodeError> {
    value.as_object().ok_or_else(|| DecodeError::InvalidEnum {
        field: name.to_string(),
        value: "expected an object".to_string(),
    })
}

fn number(value: &Value, name: &str) -> Result<f64, DecodeError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
    .ok_or_else(|| DecodeError::InvalidEnum {
        field: name.to_string(),
        value: value.to_string(),
    })
}

fn text(object: &Map<String, Value>, name: &str) -> Result<String, DecodeError> {
    match field(object, name)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(DecodeError::MissingField(name.to_string())),
    }
}

fn optional_text(object: &Map<String, Value>, name: &str) -> Option<String> {
    object
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Batch summaries: a JSON array of strings, in article order. A shorter
/// array is accepted (missing entries count as failures); a longer one is not.
pub fn decode_summaries(raw: &str, expected: usize) -> Result<Vec<String>, DecodeError> {
    let value = parse_json(raw)?;
    let items = value.as_array().ok_or_else(|| DecodeError::InvalidEnum {
        field: "summaries".to_string(),
        value: "expected a JSON array".to_string(),
    })?;
    if items.len() > expected {
        return Err(DecodeError::CountMismatch {
            expected,
            actual: items.len(),
        });
    }
    Ok(items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.trim().to_string(),
            Value::Object(o) => optional_text(o, "summary").unwrap_or_default(),
            _ => String::new(),
        })
        .collect())
}

/// One validated entry of a top-news ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedArticle {
    /// 1-based index into the candidate list shown to the model.
    pub article_number: usize,
    pub importance_score: i32,
}

/// Validates `{"top_news":[{article_number, importance_score}]}`.
///
/// References outside `1..=candidates` and repeats are discarded, scores are
/// clamped into 1..=10, and exactly `required` entries must remain. The
/// result keeps the response order, which is the rank order.
pub fn decode_top_news(
    raw: &str,
    candidates: usize,
    required: usize,
) -> Result<Vec<RankedArticle>, DecodeError> {
    let value = parse_json(raw)?;
    let object = as_object(&value, "top_news")?;
    let entries = field(object, "top_news")?
        .as_array()
        .ok_or_else(|| DecodeError::MissingField("top_news".to_string()))?;

    let mut seen = BTreeSet::new();
    let mut ranked = Vec::with_capacity(required);
    for entry in entries {
        let Some(entry) = entry.as_object() else { continue };
        let Some(article_no) = entry
            .get("article_number")
            .and_then(|v| number(v, "article_number").ok())
            .filter(|n: &f64| n.fract() == 0.0 && *n >= 1.0 && *n <= candidates as f64)
            .map(|n| n as usize)
        else {
            continue;
        };
        if !seen.insert(article_no) {
            continue;
        }
        let score: f64 = entry
            .get("importance_score")
            .and_then(|v| number(v, "importance_score").ok())
            .unwrap_or(1.0);
        ranked.push(RankedArticle {
            article_number: article_no,
            importance_score: score.round().clamp(1.0, 10.0) as i32,
        });
    }

    if ranked.len() != required {
        return Err(DecodeError::CountMismatch {
            expected: required,
            actual: ranked.len(),
        });
    }
    Ok(ranked)
}

/// Per-asset technical verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub trend_signal: TrendSignal,
    pub key_levels: KeyLevels,
    pub summary_text: String,
}

fn levels(object: &Map<String, Value>, name: &str) -> Result<Vec<f64>, DecodeError> {
    let items = field(object, name)?
        .as_array()
        .ok_or_else(|| DecodeError::MissingField(name.to_string()))?;
    items.iter().map(|v| number(v, name)).collect()
}

pub fn decode_verdict(raw: &str) -> Result<Verdict, DecodeError> {
    let value = parse_json(raw)?;
    let object = as_object(&value, "verdict")?;

    let signal = match field(object, "trend_signal")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let trend_signal = TrendSignal::from_str(signal.trim()).map_err(|_| DecodeError::InvalidEnum {
        field: "trend_signal".to_string(),
        value: signal.clone(),
    })?;

    let key_levels = as_object(field(object, "key_levels")?, "key_levels")?;
    let key_levels = KeyLevels {
        support: levels(key_levels, "support")?,
        resistance: levels(key_levels, "resistance")?,
    };

    Ok(Verdict {
        trend_signal,
        key_levels,
        summary_text: text(object, "summary_text")?,
    })
}

/// Model-produced part of a portfolio recommendation.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioDraft {
    pub allocation: Allocation,
    pub top_picks: Vec<PortfolioPick>,
    pub sector_exposure: BTreeMap<String, f64>,
    pub diversification_score: Option<f64>,
    pub correlation_analysis: Option<String>,
    pub overall_rationale: String,
    pub news_impact: Option<String>,
    pub risks: Vec<String>,
    pub rebalance_frequency: Option<String>,
}

const ALLOCATION_TOTAL: f64 = 100.0;
const ALLOCATION_TOLERANCE: f64 = 1e-6;

pub fn decode_portfolio(raw: &str) -> Result<PortfolioDraft, DecodeError> {
    let value = parse_json(raw)?;
    let object = as_object(&value, "recommendation")?;

    let allocation_obj = as_object(field(object, "allocation")?, "allocation")?;
    let share = |name: &str| -> Result<f64, DecodeError> {
        let v = number(field(allocation_obj, name)?, name)?;
        if !(0.0..=100.0).contains(&v) {
            return Err(DecodeError::OutOfRange {
                field: format!("allocation.{}", name),
                value: v,
            });
        }
        Ok(v)
    };
    let allocation = Allocation {
        stocks: share("stocks")?,
        crypto: share("crypto")?,
        commodities: share("commodities")?,
    };
    if (allocation.total() - ALLOCATION_TOTAL).abs() >= ALLOCATION_TOLERANCE {
        return Err(DecodeError::SumMismatch {
            field: "allocation".to_string(),
            expected: ALLOCATION_TOTAL,
            actual: allocation.total(),
        });
    }

    let picks = field(object, "top_picks")?
        .as_array()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| DecodeError::MissingField("top_picks".to_string()))?;
    let top_picks = picks
        .iter()
        .map(|pick| {
            let pick_obj = as_object(pick, "top_picks")?;
            let weight = number(field(pick_obj, "weight")?, "weight")?;
            if weight <= 0.0 || weight > 100.0 {
                return Err(DecodeError::OutOfRange {
                    field: "top_picks.weight".to_string(),
                    value: weight,
                });
            }
            let symbol = text(pick_obj, "symbol")?;
            Ok(PortfolioPick {
                name: optional_text(pick_obj, "name").unwrap_or_else(|| symbol.clone()),
                symbol,
                weight,
                rationale: text(pick_obj, "rationale")?,
                sector: optional_text(pick_obj, "sector"),
                correlation_notes: optional_text(pick_obj, "correlation_notes"),
                price_momentum: optional_text(pick_obj, "price_momentum"),
                volatility: optional_text(pick_obj, "volatility"),
                volume_status: optional_text(pick_obj, "volume_status"),
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    let sector_exposure = as_object(field(object, "sector_exposure")?, "sector_exposure")?
        .iter()
        .map(|(sector, v)| Ok((sector.clone(), number(v, "sector_exposure")?)))
        .collect::<Result<BTreeMap<_, _>, DecodeError>>()?;

    let risks: Vec<String> = field(object, "risks")?
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if risks.is_empty() {
        return Err(DecodeError::MissingField("risks".to_string()));
    }

    Ok(PortfolioDraft {
        allocation,
        top_picks,
        sector_exposure,
        diversification_score: object
            .get("diversification_score")
            .and_then(|v| number(v, "diversification_score").ok()),
        correlation_analysis: optional_text(object, "correlation_analysis"),
        overall_rationale: text(object, "overall_rationale")?,
        news_impact: optional_text(object, "news_impact"),
        risks,
        rebalance_frequency: optional_text(object, "rebalance_frequency"),
    })
}
