pub mod coverage;
pub mod freshness;

pub use coverage::{check_coverage, table_counts, CoverageReport};
pub use freshness::{check_freshness, overall_status, FreshnessReport, FreshnessStatus};
