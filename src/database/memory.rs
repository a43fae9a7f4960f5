use crate::database::models::{
    ArticleDraft, Asset, AssetAnalysis, AssetClass, CoverageRow, DateDimension,
    MacroIndicatorRow, MacroSummary, MonitoredTable, NewsArticle, PortfolioRecommendation,
    PricePoint, RiskProfile, SentimentPoint, TopNewsEntry,
};
use crate::database::warehouse::{StorageResult, Warehouse, MIN_SUMMARY_LEN};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct State {
    assets: Vec<Asset>,
    prices: BTreeMap<(i32, DateTime<Utc>, String), PricePoint>,
    macro_rows: BTreeMap<NaiveDate, MacroIndicatorRow>,
    sentiment: BTreeMap<NaiveDate, SentimentPoint>,
    articles: Vec<NewsArticle>,
    top_news: BTreeMap<NaiveDate, Vec<TopNewsEntry>>,
    macro_summaries: BTreeMap<NaiveDate, MacroSummary>,
    analyses: HashMap<(i32, NaiveDate), AssetAnalysis>,
    recommendations: BTreeMap<(NaiveDate, RiskProfile), PortfolioRecommendation>,
    dates: BTreeMap<i32, DateDimension>,
}

/// In-process warehouse with the same conflict semantics as the Postgres one.
/// Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryWarehouse {
    state: RwLock<State>,
    fail_writes: AtomicBool,
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn has_summary(article: &NewsArticle) -> bool {
    article
        .summary
        .as_deref()
        .map(|s| s.chars().count() >= MIN_SUMMARY_LEN)
        .unwrap_or(false)
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, for exercising storage-error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Integrity("writes disabled".to_string()));
        }
        Ok(())
    }

    pub fn price_count(&self, asset_id: i32) -> usize {
        self.state
            .read()
            .prices
            .keys()
            .filter(|(id, _, _)| *id == asset_id)
            .count()
    }

    pub fn analysis_for(&self, asset_id: i32, date: NaiveDate) -> Option<AssetAnalysis> {
        self.state.read().analyses.get(&(asset_id, date)).cloned()
    }

    pub fn recommendation_for(
        &self,
        date: NaiveDate,
        profile: RiskProfile,
    ) -> Option<PortfolioRecommendation> {
        self.state.read().recommendations.get(&(date, profile)).cloned()
    }

    pub fn article_by_url(&self, url: &str) -> Option<NewsArticle> {
        self.state
            .read()
            .articles
            .iter()
            .find(|a| a.url == url)
            .cloned()
    }

    pub fn sentiment_for(&self, date: NaiveDate) -> Option<SentimentPoint> {
        self.state.read().sentiment.get(&date).cloned()
    }

    pub fn macro_row(&self, date: NaiveDate) -> Option<MacroIndicatorRow> {
        self.state.read().macro_rows.get(&date).cloned()
    }

    pub fn date_row(&self, date_id: i32) -> Option<DateDimension> {
        self.state.read().dates.get(&date_id).cloned()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn get_or_create_asset(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        name: &str,
    ) -> StorageResult<Asset> {
        if let Some(existing) = self.state.read().assets.iter().find(|a| a.symbol == symbol) {
            return Ok(existing.clone());
        }
        self.check_writable()?;
        let mut state = self.state.write();
        // Re-check under the write lock.
        if let Some(existing) = state.assets.iter().find(|a| a.symbol == symbol) {
            return Ok(existing.clone());
        }
        let asset = Asset {
            asset_id: state.assets.len() as i32 + 1,
            symbol: symbol.to_string(),
            asset_class,
            name: name.to_string(),
            sector: None,
        };
        state.assets.push(asset.clone());
        Ok(asset)
    }

    async fn list_assets(&self, asset_class: Option<AssetClass>) -> StorageResult<Vec<Asset>> {
        let state = self.state.read();
        let mut assets: Vec<Asset> = state
            .assets
            .iter()
            .filter(|a| asset_class.map_or(true, |c| a.asset_class == c))
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(assets)
    }

    async fn set_asset_sector(&self, symbol: &str, sector: &str) -> StorageResult<bool> {
        self.check_writable()?;
        let mut state = self.state.write();
        match state.assets.iter_mut().find(|a| a.symbol == symbol) {
            Some(asset) => {
                asset.sector = Some(sector.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_prices(&self, asset_id: i32, bars: &[PricePoint]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        if !state.assets.iter().any(|a| a.asset_id == asset_id) {
            return Err(StorageError::Integrity(format!("unknown asset {}", asset_id)));
        }
        if let Some(bad) = bars.iter().find_map(|b| b.validate().err()) {
            return Err(StorageError::Integrity(bad));
        }
        let mut inserted = 0;
        for bar in bars {
            let key = (asset_id, bar.timestamp, bar.interval.clone());
            if !state.prices.contains_key(&key) {
                state.prices.insert(key, bar.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn recent_prices(&self, asset_id: i32, limit: usize) -> StorageResult<Vec<PricePoint>> {
        let state = self.state.read();
        let mut bars: Vec<PricePoint> = state
            .prices
            .iter()
            .filter(|((id, _, _), _)| *id == asset_id)
            .map(|(_, bar)| bar.clone())
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.split_off(skip))
    }

    async fn insert_macro_rows(&self, rows: &[MacroIndicatorRow]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        let mut inserted = 0;
        for row in rows {
            if !state.macro_rows.contains_key(&row.date) {
                state.macro_rows.insert(row.date, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn macro_history(&self, since: NaiveDate) -> StorageResult<Vec<MacroIndicatorRow>> {
        Ok(self
            .state
            .read()
            .macro_rows
            .range(since..)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn insert_sentiment(&self, points: &[SentimentPoint]) -> StorageResult<u64> {
        self.check_writable()?;
        if let Some(bad) = points.iter().find_map(|p| p.validate().err()) {
            return Err(StorageError::Integrity(bad));
        }
        let mut state = self.state.write();
        let mut inserted = 0;
        for point in points {
            if !state.sentiment.contains_key(&point.date) {
                state.sentiment.insert(point.date, point.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn recent_sentiment(&self, limit: usize) -> StorageResult<Vec<SentimentPoint>> {
        Ok(self
            .state
            .read()
            .sentiment
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_articles(&self, articles: &[ArticleDraft]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        let mut inserted = 0;
        for draft in articles {
            if state.articles.iter().any(|a| a.url == draft.url) {
                continue;
            }
            let article_id = state.articles.len() as i64 + 1;
            state.articles.push(NewsArticle {
                article_id,
                url: draft.url.clone(),
                source: draft.source.clone(),
                title: draft.title.clone(),
                summary: draft.summary.clone(),
                published_at: draft.published_at,
                related_tickers: draft.related_tickers.clone(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn unsummarized_articles(
        &self,
        since: Option<NaiveDate>,
    ) -> StorageResult<Vec<NewsArticle>> {
        let state = self.state.read();
        let mut pending: Vec<NewsArticle> = state
            .articles
            .iter()
            .filter(|a| !has_summary(a))
            .filter(|a| since.map_or(true, |d| a.date() >= d))
            .cloned()
            .collect();
        pending.sort_by_key(|a| (a.published_at, a.article_id));
        Ok(pending)
    }

    async fn update_summaries(&self, summaries: &[(i64, String)]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        if let Some((missing, _)) = summaries
            .iter()
            .find(|(id, _)| !state.articles.iter().any(|a| a.article_id == *id))
        {
            return Err(StorageError::Integrity(format!("unknown article {}", missing)));
        }
        for (id, text) in summaries {
            if let Some(article) = state.articles.iter_mut().find(|a| a.article_id == *id) {
                article.summary = Some(text.clone());
            }
        }
        Ok(summaries.len() as u64)
    }

    async fn summarized_articles_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<NewsArticle>> {
        let mut articles: Vec<NewsArticle> = self
            .state
            .read()
            .articles
            .iter()
            .filter(|a| a.published_at >= since && has_summary(a))
            .cloned()
            .collect();
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(articles)
    }

    async fn recent_articles_for_tag(
        &self,
        tag: &str,
        limit: usize,
    ) -> StorageResult<Vec<NewsArticle>> {
        let mut articles: Vec<NewsArticle> = self
            .state
            .read()
            .articles
            .iter()
            .filter(|a| a.related_tickers.iter().any(|t| t == tag))
            .cloned()
            .collect();
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        articles.truncate(limit);
        Ok(articles)
    }

    async fn articles_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<NewsArticle>> {
        let mut articles: Vec<NewsArticle> = self
            .state
            .read()
            .articles
            .iter()
            .filter(|a| a.published_at >= since)
            .cloned()
            .collect();
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(articles)
    }

    async fn top_news_exists(&self, date: NaiveDate) -> StorageResult<bool> {
        Ok(self
            .state
            .read()
            .top_news
            .get(&date)
            .map_or(false, |entries| !entries.is_empty()))
    }

    async fn replace_top_news(
        &self,
        date: NaiveDate,
        entries: &[TopNewsEntry],
    ) -> StorageResult<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        if let Some(missing) = entries
            .iter()
            .find(|e| !state.articles.iter().any(|a| a.article_id == e.article_id))
        {
            return Err(StorageError::Integrity(format!(
                "unknown article {}",
                missing.article_id
            )));
        }
        state.top_news.insert(date, entries.to_vec());
        Ok(())
    }

    async fn top_news_for(&self, date: NaiveDate) -> StorageResult<Vec<TopNewsEntry>> {
        Ok(self
            .state
            .read()
            .top_news
            .get(&date)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_macro_summary(&self) -> StorageResult<Option<MacroSummary>> {
        Ok(self
            .state
            .read()
            .macro_summaries
            .values()
            .next_back()
            .cloned())
    }

    async fn macro_summary_for(&self, date: NaiveDate) -> StorageResult<Option<MacroSummary>> {
        Ok(self.state.read().macro_summaries.get(&date).cloned())
    }

    async fn insert_macro_summary(&self, summary: &MacroSummary) -> StorageResult<bool> {
        self.check_writable()?;
        let mut state = self.state.write();
        if state.macro_summaries.contains_key(&summary.date) {
            return Ok(false);
        }
        state.macro_summaries.insert(summary.date, summary.clone());
        Ok(true)
    }

    async fn analysis_exists(&self, asset_id: i32, date: NaiveDate) -> StorageResult<bool> {
        Ok(self.state.read().analyses.contains_key(&(asset_id, date)))
    }

    async fn upsert_analysis(&self, analysis: &AssetAnalysis) -> StorageResult<()> {
        self.check_writable()?;
        self.state
            .write()
            .analyses
            .insert((analysis.asset_id, analysis.date), analysis.clone());
        Ok(())
    }

    async fn latest_analyses(&self) -> StorageResult<Vec<AssetAnalysis>> {
        let state = self.state.read();
        let mut latest: BTreeMap<i32, AssetAnalysis> = BTreeMap::new();
        for analysis in state.analyses.values() {
            let newer = latest
                .get(&analysis.asset_id)
                .map_or(true, |current| analysis.date > current.date);
            if newer {
                latest.insert(analysis.asset_id, analysis.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn upsert_recommendation(
        &self,
        recommendation: &PortfolioRecommendation,
    ) -> StorageResult<()> {
        self.check_writable()?;
        self.state.write().recommendations.insert(
            (recommendation.date, recommendation.risk_profile),
            recommendation.clone(),
        );
        Ok(())
    }

    async fn upsert_date_dimension(&self, rows: &[DateDimension]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        for row in rows {
            match state.dates.get_mut(&row.date_id) {
                Some(existing) => {
                    existing.is_weekend = row.is_weekend;
                    existing.is_us_market_open = row.is_us_market_open;
                }
                None => {
                    state.dates.insert(row.date_id, row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn latest_timestamp(
        &self,
        table: MonitoredTable,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        let state = self.state.read();
        let latest = match table {
            MonitoredTable::AssetPrices => state.prices.values().map(|p| p.timestamp).max(),
            MonitoredTable::NewsArticles => state.articles.iter().map(|a| a.published_at).max(),
            MonitoredTable::MacroIndicators => state.macro_rows.keys().next_back().copied().map(midnight),
            MonitoredTable::SentimentIndex => state.sentiment.keys().next_back().copied().map(midnight),
            MonitoredTable::AiAnalysis => state.analyses.keys().map(|(_, d)| *d).max().map(midnight),
            MonitoredTable::MacroSummary => {
                state.macro_summaries.keys().next_back().copied().map(midnight)
            }
            MonitoredTable::TopNews => state
                .top_news
                .iter()
                .filter(|(_, entries)| !entries.is_empty())
                .map(|(d, _)| *d)
                .max()
                .map(midnight),
            MonitoredTable::PortfolioRecommendations => {
                state.recommendations.keys().map(|(d, _)| *d).max().map(midnight)
            }
        };
        Ok(latest)
    }

    async fn row_count(&self, table: MonitoredTable) -> StorageResult<i64> {
        let state = self.state.read();
        let count = match table {
            MonitoredTable::AssetPrices => state.prices.len(),
            MonitoredTable::MacroIndicators => state.macro_rows.len(),
            MonitoredTable::SentimentIndex => state.sentiment.len(),
            MonitoredTable::NewsArticles => state.articles.len(),
            MonitoredTable::AiAnalysis => state.analyses.len(),
            MonitoredTable::MacroSummary => state.macro_summaries.len(),
            MonitoredTable::TopNews => state.top_news.values().map(Vec::len).sum(),
            MonitoredTable::PortfolioRecommendations => state.recommendations.len(),
        };
        Ok(count as i64)
    }

    async fn asset_coverage(&self, date: NaiveDate) -> StorageResult<Vec<CoverageRow>> {
        let state = self.state.read();
        let mut rows = Vec::new();
        for class in AssetClass::ALL {
            let ids: Vec<i32> = state
                .assets
                .iter()
                .filter(|a| a.asset_class == class)
                .map(|a| a.asset_id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            let with_data = ids
                .iter()
                .filter(|id| {
                    state
                        .prices
                        .keys()
                        .any(|(asset_id, ts, _)| asset_id == *id && ts.date_naive() == date)
                })
                .count();
            rows.push(CoverageRow {
                asset_class: class,
                total_assets: ids.len() as i64,
                assets_with_data: with_data as i64,
            });
        }
        Ok(rows)
    }

    async fn read_only_query(&self, _sql: &str) -> StorageResult<Vec<serde_json::Value>> {
        Err(StorageError::Unsupported("ad-hoc SQL against the in-memory warehouse"))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn price_insert_keeps_first_value() {
        let warehouse = MemoryWarehouse::new();
        let asset = warehouse
            .get_or_create_asset("BTC", AssetClass::Crypto, "Bitcoin")
            .await
            .unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();

        let first = PricePoint::daily(ts, 100.0, 110.0, 95.0, 105.0, 10.0);
        let second = PricePoint::daily(ts, 200.0, 210.0, 195.0, 205.0, 20.0);

        assert_eq!(warehouse.insert_prices(asset.asset_id, &[first]).await.unwrap(), 1);
        assert_eq!(warehouse.insert_prices(asset.asset_id, &[second]).await.unwrap(), 0);

        let stored = warehouse.recent_prices(asset.asset_id, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, 105.0);
    }

    #[tokio::test]
    async fn invalid_bar_rejects_whole_batch() {
        let warehouse = MemoryWarehouse::new();
        let asset = warehouse
            .get_or_create_asset("ETH", AssetClass::Crypto, "Ethereum")
            .await
            .unwrap();
        let good = PricePoint::daily(
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
            10.0,
            11.0,
            9.0,
            10.5,
            1.0,
        );
        let bad = PricePoint::daily(
            Utc.with_ymd_and_hms(2025, 5, 2, 0, 0, 0).unwrap(),
            10.0,
            9.0,
            9.5,
            10.5,
            1.0,
        );
        assert!(warehouse.insert_prices(asset.asset_id, &[good, bad]).await.is_err());
        assert_eq!(warehouse.price_count(asset.asset_id), 0);
    }

    #[tokio::test]
    async fn asset_identity_is_stable() {
        let warehouse = MemoryWarehouse::new();
        let first = warehouse
            .get_or_create_asset("AAPL", AssetClass::Equity, "Apple")
            .await
            .unwrap();
        let again = warehouse
            .get_or_create_asset("AAPL", AssetClass::Equity, "Apple Inc.")
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn sector_update_targets_existing_symbol() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .get_or_create_asset("MSFT", AssetClass::Equity, "MSFT")
            .await
            .unwrap();
        assert!(warehouse.set_asset_sector("MSFT", "Information Technology").await.unwrap());
        assert!(!warehouse.set_asset_sector("XOM", "Energy").await.unwrap());

        let assets = warehouse.list_assets(Some(AssetClass::Equity)).await.unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].sector.as_deref(), Some("Information Technology"));
    }

    #[tokio::test]
    async fn macro_summary_first_write_wins() {
        let warehouse = MemoryWarehouse::new();
        let date = NaiveDate::from_ymd_opt(2025, 5, 5).unwrap();
        let summary = |text: &str| MacroSummary {
            date,
            period_start: date,
            period_end: date,
            model_name: "m".into(),
            summary_text: text.into(),
            summary_short: text.into(),
        };
        assert!(warehouse.insert_macro_summary(&summary("first")).await.unwrap());
        assert!(!warehouse.insert_macro_summary(&summary("second")).await.unwrap());
        let stored = warehouse.macro_summary_for(date).await.unwrap().unwrap();
        assert_eq!(stored.summary_text, "first");
    }

    #[tokio::test]
    async fn coverage_counts_assets_with_bars_on_date() {
        let warehouse = MemoryWarehouse::new();
        let btc = warehouse
            .get_or_create_asset("BTC", AssetClass::Crypto, "Bitcoin")
            .await
            .unwrap();
        warehouse
            .get_or_create_asset("ETH", AssetClass::Crypto, "Ethereum")
            .await
            .unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        warehouse
            .insert_prices(btc.asset_id, &[PricePoint::daily(ts, 1.0, 1.0, 1.0, 1.0, 0.0)])
            .await
            .unwrap();

        let rows = warehouse.asset_coverage(ts.date_naive()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_assets, 2);
        assert_eq!(rows[0].assets_with_data, 1);
    }
}
