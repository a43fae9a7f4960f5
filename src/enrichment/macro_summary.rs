use crate::database::models::{MacroColumn, MacroIndicatorRow, MacroSummary};
use crate::database::warehouse::SharedWarehouse;
use crate::enrichment::decoder::clean_response;
use crate::enrichment::{EnrichmentStage, StageReport};
use crate::error::NodeError;
use crate::processor::calendar::is_us_trading_day;
use crate::processor::job::RunContext;
use crate::sources::LanguageModel;
use crate::utils::utils::truncate_chars;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

pub const HISTORY_DAYS: i64 = 365;
const SHORT_FALLBACK_CHARS: usize = 150;

/// Year-in-review macro narrative plus a dashboard-sized condensation.
pub struct MacroSummaryStage {
    warehouse: SharedWarehouse,
    llm: Arc<dyn LanguageModel>,
    model: String,
    pause: Duration,
}

impl MacroSummaryStage {
    pub fn new(
        warehouse: SharedWarehouse,
        llm: Arc<dyn LanguageModel>,
        model: &str,
        pause: Duration,
    ) -> Self {
        Self {
            warehouse,
            llm,
            model: model.to_string(),
            pause,
        }
    }
}

/// Fixed-width table of the history, oldest first.
pub fn macro_table(rows: &[MacroIndicatorRow]) -> String {
    let mut table = String::from("date      ");
    for column in MacroColumn::ALL {
        let _ = write!(table, " {:>17}", column.name());
    }
    table.push('\n');
    for row in rows {
        let _ = write!(table, "{}", row.date);
        for column in MacroColumn::ALL {
            match row.get(column) {
                Some(v) => {
                    let _ = write!(table, " {:>17.2}", v);
                }
                None => {
                    let _ = write!(table, " {:>17}", "NaN");
                }
            }
        }
        table.push('\n');
    }
    table
}

fn long_prompt(table: &str, days: usize) -> String {
    format!(
        "You are a Senior Macroeconomic Analyst. Analyze the following {days} days of macro data \
and provide a comprehensive market summary.

MACRO DATA:
{table}
INSTRUCTIONS:
1. Identify the overall macro trend (Risk-On, Risk-Off, Transitioning)
2. Highlight key turning points in the data
3. Assess the current market regime (Bull, Bear, Sideways)
4. Note relationships between indicators (VIX vs S&P 500, rates vs dollar)
5. Provide a 2-3 paragraph executive summary

Write a cohesive narrative with specific numbers and dates, focused on insights usable for asset analysis.",
        days = days,
        table = table
    )
}

fn short_prompt(long: &str) -> String {
    format!(
        "Condense the following macro analysis into a 100-150 word executive summary for a dashboard.

FULL ANALYSIS:
{}

Include the current market regime (1 sentence), the key macro drivers (1-2 sentences) and the \
primary risk or opportunity (1 sentence). Be direct.",
        long
    )
}

#[async_trait]
impl EnrichmentStage for MacroSummaryStage {
    fn name(&self) -> &'static str {
        "macro_summary"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<StageReport, NodeError> {
        let date = ctx.run_date;
        if !is_us_trading_day(date) {
            info!("{} is not a trading day - skipping macro summary", date);
            return Ok(StageReport::noted("markets closed"));
        }
        if self.warehouse.macro_summary_for(date).await?.is_some() {
            info!("Macro summary already exists for {}", date);
            return Ok(StageReport::noted("summary already exists"));
        }

        let since = date - ChronoDuration::days(HISTORY_DAYS);
        let history: Vec<MacroIndicatorRow> = self
            .warehouse
            .macro_history(since)
            .await?
            .into_iter()
            .filter(|row| row.date <= date)
            .collect();
        let (Some(first), Some(last)) = (history.first(), history.last()) else {
            error!("No macro data found since {}", since);
            return Err(NodeError::PreconditionMissing(format!(
                "no macro indicators since {}",
                since
            )));
        };
        let (period_start, period_end) = (first.date, last.date);
        info!("Analyzing period: {} to {}", period_start, period_end);

        let table = macro_table(&history);
        let long = self
            .llm
            .generate(&self.model, &long_prompt(&table, history.len()))
            .await
            .map(|raw| clean_response(&raw))?;
        if long.is_empty() {
            return Err(NodeError::Malformed("empty macro summary".to_string()));
        }

        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }

        let short = match self.llm.generate(&self.model, &short_prompt(&long)).await {
            Ok(raw) if !clean_response(&raw).is_empty() => clean_response(&raw),
            Ok(_) => {
                warn!("Short summary came back empty, truncating the long one");
                format!("{}...", truncate_chars(&long, SHORT_FALLBACK_CHARS))
            }
            Err(e) => {
                warn!("Failed to generate short summary: {}", e);
                format!("{}...", truncate_chars(&long, SHORT_FALLBACK_CHARS))
            }
        };

        let inserted = self
            .warehouse
            .insert_macro_summary(&MacroSummary {
                date,
                period_start,
                period_end,
                model_name: self.model.clone(),
                summary_text: long,
                summary_short: short,
            })
            .await?;
        if !inserted {
            warn!("Summary for {} already exists (conflict)", date);
        } else {
            info!("Macro summaries saved successfully");
        }

        Ok(StageReport {
            processed: 1,
            succeeded: u64::from(inserted),
            failed: 0,
            note: (!inserted).then(|| "summary already existed".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryWarehouse;
    use crate::database::warehouse::Warehouse;
    use crate::test_support::{run_ctx, run_ctx_on, trading_day, ScriptedLlm};
    use chrono::NaiveDate;

    async fn seeded() -> Arc<MemoryWarehouse> {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let rows: Vec<_> = (0..30)
            .map(|i| {
                let mut row = MacroIndicatorRow::empty(trading_day() - ChronoDuration::days(29 - i));
                row.set(MacroColumn::Vix, Some(14.0 + i as f64 * 0.1));
                row.set(MacroColumn::Cpi, Some(310.5));
                row
            })
            .collect();
        warehouse.insert_macro_rows(&rows).await.unwrap();
        warehouse
    }

    fn long_text() -> String {
        "Risk-on regime. ".repeat(20)
    }

    #[tokio::test]
    async fn writes_long_and_short_once_per_day() {
        let warehouse = seeded().await;
        let llm = Arc::new(ScriptedLlm::replies([
            format!("@[source 1]\n{}", long_text()),
            "Short take.".to_string(),
        ]));
        let stage = MacroSummaryStage::new(warehouse.clone(), llm.clone(), "gemma", Duration::ZERO);

        let report = stage.run(&run_ctx()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let stored = warehouse.macro_summary_for(trading_day()).await.unwrap().unwrap();
        assert_eq!(stored.summary_short, "Short take.");
        assert!(!stored.summary_text.contains("@["));
        assert_eq!(stored.period_end, trading_day());
        assert_eq!(stored.period_start, trading_day() - ChronoDuration::days(29));

        let again = stage.run(&run_ctx()).await.unwrap();
        assert_eq!(again.note.as_deref(), Some("summary already exists"));
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn short_failure_falls_back_to_truncation() {
        let warehouse = seeded().await;
        let llm = Arc::new(ScriptedLlm::replies([long_text()]).then_fail());
        MacroSummaryStage::new(warehouse.clone(), llm, "gemma", Duration::ZERO)
            .run(&run_ctx())
            .await
            .unwrap();
        let stored = warehouse.macro_summary_for(trading_day()).await.unwrap().unwrap();
        assert_eq!(stored.summary_short.chars().count(), 153);
        assert!(stored.summary_short.ends_with("..."));
    }

    #[tokio::test]
    async fn missing_history_is_a_precondition_failure() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let llm = Arc::new(ScriptedLlm::replies([long_text()]));
        let err = MacroSummaryStage::new(warehouse, llm.clone(), "gemma", Duration::ZERO)
            .run(&run_ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "precondition_missing");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn weekends_are_skipped() {
        let saturday = NaiveDate::from_ymd_opt(2024, 5, 4).unwrap();
        let llm = Arc::new(ScriptedLlm::replies([long_text()]));
        let report = MacroSummaryStage::new(seeded().await, llm.clone(), "gemma", Duration::ZERO)
            .run(&run_ctx_on(saturday))
            .await
            .unwrap();
        assert_eq!(report.note.as_deref(), Some("markets closed"));
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn table_lists_every_column() {
        let mut row = MacroIndicatorRow::empty(trading_day());
        row.set(MacroColumn::Dxy, Some(104.256));
        let table = macro_table(&[row]);
        assert!(table.starts_with("date"));
        assert!(table.contains("treasury_10y"));
        assert!(table.contains("104.26"));
        assert!(table.contains("NaN"));
    }
}
