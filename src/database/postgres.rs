use crate::database::models::{
    ArticleDraft, Asset, AssetAnalysis, AssetClass, CoverageRow, DateDimension, KeyLevels,
    MacroIndicatorRow, MacroSummary, MonitoredTable, NewsArticle, PortfolioRecommendation,
    PricePoint, SentimentPoint, TopNewsEntry,
};
use crate::database::schema;
use crate::database::warehouse::{check_read_only, StorageResult, Warehouse, MIN_SUMMARY_LEN};
use crate::error::StorageError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .context("Failed to create database connection pool")?;

        info!("Connected to warehouse (max {} connections)", max_connections);
        Ok(Self { pool })
    }

    /// Create the schema and tables if they don't exist.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in schema::ALL_STATEMENTS {
            self.pool
                .execute(statement)
                .await
                .with_context(|| format!("Failed to apply DDL: {}", first_line(statement)))?;
        }
        info!("Warehouse schema '{}' initialized", schema::SCHEMA_NAME);
        Ok(())
    }
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or("")
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn asset_from_row(row: &PgRow) -> StorageResult<Asset> {
    let class: String = row.try_get("asset_class")?;
    Ok(Asset {
        asset_id: row.try_get("asset_id")?,
        symbol: row.try_get("symbol")?,
        asset_class: class.parse().map_err(StorageError::Integrity)?,
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
    })
}

fn article_from_row(row: &PgRow) -> StorageResult<NewsArticle> {
    let tickers: Value = row.try_get("related_tickers")?;
    Ok(NewsArticle {
        article_id: row.try_get("article_id")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        published_at: row.try_get("published_at")?,
        related_tickers: serde_json::from_value(tickers)?,
    })
}

fn analysis_from_row(row: &PgRow) -> StorageResult<AssetAnalysis> {
    let signal: String = row.try_get("trend_signal")?;
    let levels: Value = row.try_get("key_levels")?;
    Ok(AssetAnalysis {
        asset_id: row.try_get("asset_id")?,
        date: row.try_get("date")?,
        model_name: row.try_get("model_name")?,
        trend_signal: signal.parse().map_err(StorageError::Integrity)?,
        key_levels: serde_json::from_value::<KeyLevels>(levels)?,
        summary_text: row.try_get("summary_text")?,
    })
}

fn summary_from_row(row: &PgRow) -> StorageResult<MacroSummary> {
    Ok(MacroSummary {
        date: row.try_get("date")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        model_name: row.try_get("model_name")?,
        summary_text: row.try_get("summary_text")?,
        summary_short: row.try_get("summary_short")?,
    })
}

const ARTICLE_COLUMNS: &str =
    "article_id, url, source, title, summary, published_at, related_tickers";

const SUMMARY_COLUMNS: &str =
    "date, period_start, period_end, model_name, summary_text, summary_short";

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn get_or_create_asset(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        name: &str,
    ) -> StorageResult<Asset> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(
            "INSERT INTO dipsignal.dim_assets (symbol, asset_class, name)
             VALUES ($1, $2, $3)
             ON CONFLICT (symbol) DO UPDATE SET symbol = EXCLUDED.symbol
             RETURNING asset_id, symbol, asset_class, name, sector",
        )
        .bind(symbol)
        .bind(asset_class.as_str())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        asset_from_row(&row)
    }

    async fn list_assets(&self, asset_class: Option<AssetClass>) -> StorageResult<Vec<Asset>> {
        let rows = sqlx::query(
            "SELECT asset_id, symbol, asset_class, name, sector
             FROM dipsignal.dim_assets
             WHERE $1::varchar IS NULL OR asset_class = $1
             ORDER BY symbol",
        )
        .bind(asset_class.map(|c| c.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(asset_from_row).collect()
    }

    async fn set_asset_sector(&self, symbol: &str, sector: &str) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE dipsignal.dim_assets SET sector = $2 WHERE symbol = $1")
            .bind(symbol)
            .bind(sector)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_prices(&self, asset_id: i32, bars: &[PricePoint]) -> StorageResult<u64> {
        if bars.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = bars.iter().find_map(|b| b.validate().err()) {
            return Err(StorageError::Integrity(bad));
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for bar in bars {
            let result = sqlx::query(
                "INSERT INTO dipsignal.fact_asset_prices
                 (asset_id, timestamp, interval, price_open, price_high, price_low,
                  price_close, volume, dynamic_metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (asset_id, timestamp, interval) DO NOTHING",
            )
            .bind(asset_id)
            .bind(bar.timestamp)
            .bind(&bar.interval)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(&bar.dynamic_metadata)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        debug!("Inserted {} of {} bars for asset {}", inserted, bars.len(), asset_id);
        Ok(inserted)
    }

    async fn recent_prices(&self, asset_id: i32, limit: usize) -> StorageResult<Vec<PricePoint>> {
        let rows = sqlx::query(
            "SELECT timestamp, interval, price_open, price_high, price_low, price_close,
                    volume, dynamic_metadata
             FROM dipsignal.fact_asset_prices
             WHERE asset_id = $1
             ORDER BY timestamp DESC
             LIMIT $2",
        )
        .bind(asset_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = rows
            .iter()
            .map(|row| {
                Ok(PricePoint {
                    timestamp: row.try_get("timestamp")?,
                    interval: row.try_get("interval")?,
                    open: row.try_get("price_open")?,
                    high: row.try_get("price_high")?,
                    low: row.try_get("price_low")?,
                    close: row.try_get("price_close")?,
                    volume: row.try_get("volume")?,
                    dynamic_metadata: row.try_get("dynamic_metadata")?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    async fn insert_macro_rows(&self, rows: &[MacroIndicatorRow]) -> StorageResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO dipsignal.fact_macro_indicators
                 (date, dxy, sp500, cpi, interest_rate, vix, treasury_10y,
                  unemployment_rate, gdp, market_closed)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (date) DO NOTHING",
            )
            .bind(row.date)
            .bind(row.dxy)
            .bind(row.sp500)
            .bind(row.cpi)
            .bind(row.interest_rate)
            .bind(row.vix)
            .bind(row.treasury_10y)
            .bind(row.unemployment_rate)
            .bind(row.gdp)
            .bind(row.market_closed)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn macro_history(&self, since: NaiveDate) -> StorageResult<Vec<MacroIndicatorRow>> {
        let rows = sqlx::query(
            "SELECT date, dxy, sp500, cpi, interest_rate, vix, treasury_10y,
                    unemployment_rate, gdp, market_closed
             FROM dipsignal.fact_macro_indicators
             WHERE date >= $1
             ORDER BY date",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MacroIndicatorRow {
                    date: row.try_get("date")?,
                    dxy: row.try_get("dxy")?,
                    sp500: row.try_get("sp500")?,
                    cpi: row.try_get("cpi")?,
                    interest_rate: row.try_get("interest_rate")?,
                    vix: row.try_get("vix")?,
                    treasury_10y: row.try_get("treasury_10y")?,
                    unemployment_rate: row.try_get("unemployment_rate")?,
                    gdp: row.try_get("gdp")?,
                    market_closed: row.try_get("market_closed")?,
                })
            })
            .collect()
    }

    async fn insert_sentiment(&self, points: &[SentimentPoint]) -> StorageResult<u64> {
        if points.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = points.iter().find_map(|p| p.validate().err()) {
            return Err(StorageError::Integrity(bad));
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for point in points {
            let result = sqlx::query(
                "INSERT INTO dipsignal.fact_sentiment_index (date, fgi_value, classification)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (date) DO NOTHING",
            )
            .bind(point.date)
            .bind(point.value)
            .bind(&point.classification)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn recent_sentiment(&self, limit: usize) -> StorageResult<Vec<SentimentPoint>> {
        let rows = sqlx::query(
            "SELECT date, fgi_value, classification
             FROM dipsignal.fact_sentiment_index
             ORDER BY date DESC
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SentimentPoint {
                    date: row.try_get("date")?,
                    value: row.try_get("fgi_value")?,
                    classification: row.try_get("classification")?,
                })
            })
            .collect()
    }

    async fn insert_articles(&self, articles: &[ArticleDraft]) -> StorageResult<u64> {
        if articles.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for article in articles {
            let result = sqlx::query(
                "INSERT INTO dipsignal.fact_news_articles
                 (url, source, title, summary, published_at, date, related_tickers)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (url) DO NOTHING",
            )
            .bind(&article.url)
            .bind(&article.source)
            .bind(&article.title)
            .bind(&article.summary)
            .bind(article.published_at)
            .bind(article.published_at.date_naive())
            .bind(serde_json::to_value(&article.related_tickers)?)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn unsummarized_articles(
        &self,
        since: Option<NaiveDate>,
    ) -> StorageResult<Vec<NewsArticle>> {
        let sql = format!(
            "SELECT {} FROM dipsignal.fact_news_articles
             WHERE (summary IS NULL OR LENGTH(summary) < $1)
               AND ($2::date IS NULL OR date >= $2)
             ORDER BY published_at, article_id",
            ARTICLE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(MIN_SUMMARY_LEN as i32)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn update_summaries(&self, summaries: &[(i64, String)]) -> StorageResult<u64> {
        if summaries.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (article_id, summary) in summaries {
            let result = sqlx::query(
                "UPDATE dipsignal.fact_news_articles SET summary = $1 WHERE article_id = $2",
            )
            .bind(summary)
            .bind(article_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn summarized_articles_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<NewsArticle>> {
        let sql = format!(
            "SELECT {} FROM dipsignal.fact_news_articles
             WHERE published_at >= $1 AND summary IS NOT NULL AND LENGTH(summary) >= $2
             ORDER BY published_at DESC",
            ARTICLE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(MIN_SUMMARY_LEN as i32)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn recent_articles_for_tag(
        &self,
        tag: &str,
        limit: usize,
    ) -> StorageResult<Vec<NewsArticle>> {
        let sql = format!(
            "SELECT {} FROM dipsignal.fact_news_articles
             WHERE related_tickers ? $1
             ORDER BY published_at DESC
             LIMIT $2",
            ARTICLE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tag)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn articles_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<NewsArticle>> {
        let sql = format!(
            "SELECT {} FROM dipsignal.fact_news_articles
             WHERE published_at >= $1
             ORDER BY published_at DESC",
            ARTICLE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn top_news_exists(&self, date: NaiveDate) -> StorageResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) FROM dipsignal.fact_top_news WHERE date = $1")
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count > 0)
    }

    async fn replace_top_news(
        &self,
        date: NaiveDate,
        entries: &[TopNewsEntry],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dipsignal.fact_top_news WHERE date = $1")
            .bind(date)
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO dipsignal.fact_top_news
                 (date, article_id, importance_score, rank_position, model_name)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(entry.date)
            .bind(entry.article_id)
            .bind(entry.importance_score)
            .bind(entry.rank_position)
            .bind(&entry.model_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn top_news_for(&self, date: NaiveDate) -> StorageResult<Vec<TopNewsEntry>> {
        let rows = sqlx::query(
            "SELECT date, article_id, importance_score, rank_position, model_name
             FROM dipsignal.fact_top_news
             WHERE date = $1
             ORDER BY rank_position",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TopNewsEntry {
                    date: row.try_get("date")?,
                    article_id: row.try_get("article_id")?,
                    importance_score: row.try_get("importance_score")?,
                    rank_position: row.try_get("rank_position")?,
                    model_name: row.try_get("model_name")?,
                })
            })
            .collect()
    }

    async fn latest_macro_summary(&self) -> StorageResult<Option<MacroSummary>> {
        let sql = format!(
            "SELECT {} FROM dipsignal.fact_macro_summary ORDER BY date DESC LIMIT 1",
            SUMMARY_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(summary_from_row).transpose()
    }

    async fn macro_summary_for(&self, date: NaiveDate) -> StorageResult<Option<MacroSummary>> {
        let sql = format!(
            "SELECT {} FROM dipsignal.fact_macro_summary WHERE date = $1",
            SUMMARY_COLUMNS
        );
        let row = sqlx::query(&sql).bind(date).fetch_optional(&self.pool).await?;
        row.as_ref().map(summary_from_row).transpose()
    }

    async fn insert_macro_summary(&self, summary: &MacroSummary) -> StorageResult<bool> {
        let result = sqlx::query(
            "INSERT INTO dipsignal.fact_macro_summary
             (date, period_start, period_end, model_name, summary_text, summary_short)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (date) DO NOTHING",
        )
        .bind(summary.date)
        .bind(summary.period_start)
        .bind(summary.period_end)
        .bind(&summary.model_name)
        .bind(&summary.summary_text)
        .bind(&summary.summary_short)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn analysis_exists(&self, asset_id: i32, date: NaiveDate) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM dipsignal.fact_ai_analysis WHERE asset_id = $1 AND date = $2",
        )
        .bind(asset_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count > 0)
    }

    async fn upsert_analysis(&self, analysis: &AssetAnalysis) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO dipsignal.fact_ai_analysis
             (asset_id, date, model_name, trend_signal, key_levels, summary_text)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (asset_id, date) DO UPDATE SET
                model_name = EXCLUDED.model_name,
                trend_signal = EXCLUDED.trend_signal,
                key_levels = EXCLUDED.key_levels,
                summary_text = EXCLUDED.summary_text,
                created_at = NOW()",
        )
        .bind(analysis.asset_id)
        .bind(analysis.date)
        .bind(&analysis.model_name)
        .bind(analysis.trend_signal.as_str())
        .bind(serde_json::to_value(&analysis.key_levels)?)
        .bind(&analysis.summary_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_analyses(&self) -> StorageResult<Vec<AssetAnalysis>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (asset_id)
                    asset_id, date, model_name, trend_signal, key_levels, summary_text
             FROM dipsignal.fact_ai_analysis
             ORDER BY asset_id, date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(analysis_from_row).collect()
    }

    async fn upsert_recommendation(
        &self,
        rec: &PortfolioRecommendation,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO dipsignal.fact_portfolio_recommendations
             (date, risk_profile, model_name, allocation, top_picks, sector_exposure,
              diversification_score, correlation_analysis, overall_rationale, news_impact,
              risks, rebalance_frequency, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (date, risk_profile) DO UPDATE SET
                model_name = EXCLUDED.model_name,
                allocation = EXCLUDED.allocation,
                top_picks = EXCLUDED.top_picks,
                sector_exposure = EXCLUDED.sector_exposure,
                diversification_score = EXCLUDED.diversification_score,
                correlation_analysis = EXCLUDED.correlation_analysis,
                overall_rationale = EXCLUDED.overall_rationale,
                news_impact = EXCLUDED.news_impact,
                risks = EXCLUDED.risks,
                rebalance_frequency = EXCLUDED.rebalance_frequency,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()",
        )
        .bind(rec.date)
        .bind(rec.risk_profile.as_str())
        .bind(&rec.model_name)
        .bind(serde_json::to_value(rec.allocation)?)
        .bind(serde_json::to_value(&rec.top_picks)?)
        .bind(serde_json::to_value(&rec.sector_exposure)?)
        .bind(rec.diversification_score)
        .bind(&rec.correlation_analysis)
        .bind(&rec.overall_rationale)
        .bind(&rec.news_impact)
        .bind(serde_json::to_value(&rec.risks)?)
        .bind(&rec.rebalance_frequency)
        .bind(&rec.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_date_dimension(&self, rows: &[DateDimension]) -> StorageResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO dipsignal.dim_date
                 (date_id, date, year, quarter, month, week, day_of_week, day_name,
                  is_weekend, is_us_market_open, is_crypto_open)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (date_id) DO UPDATE SET
                    is_weekend = EXCLUDED.is_weekend,
                    is_us_market_open = EXCLUDED.is_us_market_open",
            )
            .bind(row.date_id)
            .bind(row.date)
            .bind(row.year)
            .bind(row.quarter)
            .bind(row.month)
            .bind(row.week)
            .bind(row.day_of_week)
            .bind(&row.day_name)
            .bind(row.is_weekend)
            .bind(row.is_us_market_open)
            .bind(row.is_crypto_open)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn latest_timestamp(
        &self,
        table: MonitoredTable,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX({}) FROM dipsignal.{}",
            table.time_column(),
            table.table_name()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        if table.is_date_column() {
            let date: Option<NaiveDate> = row.try_get(0)?;
            Ok(date.map(midnight))
        } else {
            Ok(row.try_get(0)?)
        }
    }

    async fn row_count(&self, table: MonitoredTable) -> StorageResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM dipsignal.{}", table.table_name());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    async fn asset_coverage(&self, date: NaiveDate) -> StorageResult<Vec<CoverageRow>> {
        let rows = sqlx::query(
            "SELECT a.asset_class,
                    COUNT(DISTINCT a.asset_id) AS total_assets,
                    COUNT(DISTINCT p.asset_id) AS assets_with_data
             FROM dipsignal.dim_assets a
             LEFT JOIN dipsignal.fact_asset_prices p
               ON p.asset_id = a.asset_id AND DATE(p.timestamp AT TIME ZONE 'UTC') = $1
             GROUP BY a.asset_class
             ORDER BY a.asset_class",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let class: String = row.try_get("asset_class")?;
                Ok(CoverageRow {
                    asset_class: class.parse().map_err(StorageError::Integrity)?,
                    total_assets: row.try_get("total_assets")?,
                    assets_with_data: row.try_get("assets_with_data")?,
                })
            })
            .collect()
    }

    async fn read_only_query(&self, sql: &str) -> StorageResult<Vec<Value>> {
        check_read_only(sql)?;
        let statement = sql.trim().trim_end_matches(';');
        let wrapped = format!("SELECT COALESCE(json_agg(q), '[]'::json) FROM ({}) q", statement);

        let mut tx = self.pool.begin().await?;
        tx.execute("SET TRANSACTION READ ONLY").await?;
        let row = sqlx::query(&wrapped).fetch_one(&mut *tx).await?;
        tx.rollback().await?;

        let rows: Value = row.try_get(0)?;
        match rows {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Warehouse connection pool closed");
    }
}
