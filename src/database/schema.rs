// DDL for the dipsignal warehouse, applied in order by `PostgresWarehouse::init_schema`.

pub const SCHEMA_NAME: &str = "dipsignal";

pub const CREATE_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS dipsignal";

pub const CREATE_ASSETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.dim_assets (
    asset_id SERIAL PRIMARY KEY,
    symbol VARCHAR NOT NULL UNIQUE,
    asset_class VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    sector VARCHAR,
    static_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

pub const CREATE_DATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.dim_date (
    date_id INTEGER PRIMARY KEY,
    date DATE NOT NULL UNIQUE,
    year INTEGER NOT NULL,
    quarter INTEGER NOT NULL,
    month INTEGER NOT NULL,
    week INTEGER NOT NULL,
    day_of_week INTEGER NOT NULL,
    day_name VARCHAR NOT NULL,
    is_weekend BOOLEAN NOT NULL,
    is_us_market_open BOOLEAN NOT NULL,
    is_crypto_open BOOLEAN NOT NULL DEFAULT TRUE
);
"#;

pub const CREATE_PRICES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_asset_prices (
    asset_id INTEGER NOT NULL REFERENCES dipsignal.dim_assets(asset_id),
    timestamp TIMESTAMPTZ NOT NULL,
    interval VARCHAR NOT NULL,
    price_open DOUBLE PRECISION NOT NULL,
    price_high DOUBLE PRECISION NOT NULL,
    price_low DOUBLE PRECISION NOT NULL,
    price_close DOUBLE PRECISION NOT NULL,
    volume DOUBLE PRECISION NOT NULL CHECK (volume >= 0),
    dynamic_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    UNIQUE(asset_id, timestamp, interval),
    CHECK (price_high >= price_open AND price_high >= price_close),
    CHECK (price_low <= price_open AND price_low <= price_close)
);
"#;

pub const CREATE_MACRO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_macro_indicators (
    date DATE PRIMARY KEY,
    dxy DOUBLE PRECISION,
    sp500 DOUBLE PRECISION,
    cpi DOUBLE PRECISION,
    interest_rate DOUBLE PRECISION,
    vix DOUBLE PRECISION,
    treasury_10y DOUBLE PRECISION,
    unemployment_rate DOUBLE PRECISION,
    gdp DOUBLE PRECISION,
    market_closed BOOLEAN NOT NULL DEFAULT FALSE
);
"#;

pub const CREATE_SENTIMENT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_sentiment_index (
    date DATE PRIMARY KEY,
    fgi_value INTEGER NOT NULL CHECK (fgi_value BETWEEN 0 AND 100),
    classification VARCHAR NOT NULL
);
"#;

pub const CREATE_NEWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_news_articles (
    article_id BIGSERIAL PRIMARY KEY,
    url VARCHAR NOT NULL UNIQUE,
    source VARCHAR NOT NULL,
    title VARCHAR NOT NULL,
    summary TEXT,
    published_at TIMESTAMPTZ NOT NULL,
    date DATE NOT NULL,
    related_tickers JSONB NOT NULL DEFAULT '[]'::jsonb
);
"#;

pub const CREATE_TOP_NEWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_top_news (
    date DATE NOT NULL,
    article_id BIGINT NOT NULL REFERENCES dipsignal.fact_news_articles(article_id),
    importance_score INTEGER NOT NULL CHECK (importance_score BETWEEN 1 AND 10),
    rank_position INTEGER NOT NULL,
    model_name VARCHAR NOT NULL,
    UNIQUE(date, rank_position)
);
"#;

pub const CREATE_ANALYSIS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_ai_analysis (
    analysis_id BIGSERIAL PRIMARY KEY,
    asset_id INTEGER NOT NULL REFERENCES dipsignal.dim_assets(asset_id),
    date DATE NOT NULL,
    model_name VARCHAR NOT NULL,
    trend_signal VARCHAR NOT NULL CHECK (trend_signal IN ('Bullish', 'Bearish', 'Neutral')),
    key_levels JSONB NOT NULL,
    summary_text TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(asset_id, date)
);
"#;

pub const CREATE_MACRO_SUMMARY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_macro_summary (
    date DATE PRIMARY KEY,
    period_start DATE NOT NULL,
    period_end DATE NOT NULL,
    model_name VARCHAR NOT NULL,
    summary_text TEXT NOT NULL,
    summary_short TEXT NOT NULL
);
"#;

pub const CREATE_PORTFOLIO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dipsignal.fact_portfolio_recommendations (
    date DATE NOT NULL,
    risk_profile VARCHAR NOT NULL,
    model_name VARCHAR NOT NULL,
    allocation JSONB NOT NULL,
    top_picks JSONB NOT NULL,
    sector_exposure JSONB NOT NULL,
    diversification_score DOUBLE PRECISION,
    correlation_analysis TEXT,
    overall_rationale TEXT NOT NULL,
    news_impact TEXT,
    risks JSONB NOT NULL,
    rebalance_frequency VARCHAR,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(date, risk_profile)
);
"#;

pub const CREATE_INDICES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_asset_prices_timestamp ON dipsignal.fact_asset_prices(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_news_articles_published ON dipsignal.fact_news_articles(published_at DESC);
CREATE INDEX IF NOT EXISTS idx_ai_analysis_date ON dipsignal.fact_ai_analysis(date DESC);
"#;

/// Statements in dependency order.
pub const ALL_STATEMENTS: [&str; 12] = [
    CREATE_SCHEMA,
    CREATE_ASSETS_TABLE,
    CREATE_DATE_TABLE,
    CREATE_PRICES_TABLE,
    CREATE_MACRO_TABLE,
    CREATE_SENTIMENT_TABLE,
    CREATE_NEWS_TABLE,
    CREATE_TOP_NEWS_TABLE,
    CREATE_ANALYSIS_TABLE,
    CREATE_MACRO_SUMMARY_TABLE,
    CREATE_PORTFOLIO_TABLE,
    CREATE_INDICES,
];
