use crate::database::models::{
    ArticleDraft, Asset, AssetAnalysis, AssetClass, CoverageRow, DateDimension,
    MacroIndicatorRow, MacroSummary, MonitoredTable, NewsArticle, PortfolioRecommendation,
    PricePoint, SentimentPoint, TopNewsEntry,
};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

pub type StorageResult<T> = Result<T, StorageError>;

/// Summaries shorter than this are treated as missing.
pub const MIN_SUMMARY_LEN: usize = 20;

/// Storage handle shared by every adapter and stage.
///
/// Every write method is a single transaction: either all rows of the call
/// commit or none do. Conflict semantics follow the natural key of each
/// entity: prices, macro rows, sentiment, articles and macro summaries keep
/// the first write; analyses and portfolio recommendations keep the latest;
/// the daily top-news set is replaced wholesale.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn get_or_create_asset(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        name: &str,
    ) -> StorageResult<Asset>;

    async fn list_assets(&self, asset_class: Option<AssetClass>) -> StorageResult<Vec<Asset>>;

    /// Returns false when no asset carries `symbol`.
    async fn set_asset_sector(&self, symbol: &str, sector: &str) -> StorageResult<bool>;

    /// Returns the number of rows actually inserted.
    async fn insert_prices(&self, asset_id: i32, bars: &[PricePoint]) -> StorageResult<u64>;

    /// Most recent `limit` bars, oldest first.
    async fn recent_prices(&self, asset_id: i32, limit: usize) -> StorageResult<Vec<PricePoint>>;

    async fn insert_macro_rows(&self, rows: &[MacroIndicatorRow]) -> StorageResult<u64>;

    async fn macro_history(&self, since: NaiveDate) -> StorageResult<Vec<MacroIndicatorRow>>;

    async fn insert_sentiment(&self, points: &[SentimentPoint]) -> StorageResult<u64>;

    /// Most recent `limit` points, newest first.
    async fn recent_sentiment(&self, limit: usize) -> StorageResult<Vec<SentimentPoint>>;

    async fn insert_articles(&self, articles: &[ArticleDraft]) -> StorageResult<u64>;

    /// Articles with no usable summary, optionally limited to those published
    /// on or after `since`. Oldest first.
    async fn unsummarized_articles(
        &self,
        since: Option<NaiveDate>,
    ) -> StorageResult<Vec<NewsArticle>>;

    async fn update_summaries(&self, summaries: &[(i64, String)]) -> StorageResult<u64>;

    /// Articles published at or after `since` that carry a usable summary,
    /// newest first.
    async fn summarized_articles_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<NewsArticle>>;

    async fn recent_articles_for_tag(
        &self,
        tag: &str,
        limit: usize,
    ) -> StorageResult<Vec<NewsArticle>>;

    /// All articles published at or after `since`, newest first.
    async fn articles_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<NewsArticle>>;

    async fn top_news_exists(&self, date: NaiveDate) -> StorageResult<bool>;

    async fn replace_top_news(
        &self,
        date: NaiveDate,
        entries: &[TopNewsEntry],
    ) -> StorageResult<()>;

    async fn top_news_for(&self, date: NaiveDate) -> StorageResult<Vec<TopNewsEntry>>;

    async fn latest_macro_summary(&self) -> StorageResult<Option<MacroSummary>>;

    async fn macro_summary_for(&self, date: NaiveDate) -> StorageResult<Option<MacroSummary>>;

    /// Returns false when a summary for that date already existed.
    async fn insert_macro_summary(&self, summary: &MacroSummary) -> StorageResult<bool>;

    async fn analysis_exists(&self, asset_id: i32, date: NaiveDate) -> StorageResult<bool>;

    async fn upsert_analysis(&self, analysis: &AssetAnalysis) -> StorageResult<()>;

    /// Newest analysis per asset.
    async fn latest_analyses(&self) -> StorageResult<Vec<AssetAnalysis>>;

    async fn upsert_recommendation(
        &self,
        recommendation: &PortfolioRecommendation,
    ) -> StorageResult<()>;

    async fn upsert_date_dimension(&self, rows: &[DateDimension]) -> StorageResult<u64>;

    async fn latest_timestamp(&self, table: MonitoredTable)
        -> StorageResult<Option<DateTime<Utc>>>;

    async fn row_count(&self, table: MonitoredTable) -> StorageResult<i64>;

    /// Assets per class and how many of them have a price bar on `date`.
    async fn asset_coverage(&self, date: NaiveDate) -> StorageResult<Vec<CoverageRow>>;

    /// Operator tooling: run a read-only statement and return rows as JSON.
    async fn read_only_query(&self, sql: &str) -> StorageResult<Vec<serde_json::Value>>;

    async fn close(&self);
}

pub type SharedWarehouse = Arc<dyn Warehouse>;

/// Accepts only statements that cannot write.
pub fn check_read_only(sql: &str) -> StorageResult<()> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.contains(';') {
        return Err(StorageError::RejectedQuery(
            "multiple statements are not allowed".to_string(),
        ));
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    match first.as_str() {
        "select" | "with" | "values" => Ok(()),
        "" => Err(StorageError::RejectedQuery("empty statement".to_string())),
        other => Err(StorageError::RejectedQuery(format!(
            "only read statements are allowed, got '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_guard() {
        assert!(check_read_only("SELECT 1").is_ok());
        assert!(check_read_only("  with x as (select 1) select * from x;").is_ok());
        assert!(check_read_only("DELETE FROM dipsignal.dim_assets").is_err());
        assert!(check_read_only("select 1; drop table x").is_err());
        assert!(check_read_only("   ").is_err());
    }
}
