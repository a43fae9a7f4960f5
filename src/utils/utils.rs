use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Awaits `f` and returns its output together with the elapsed wall time.
pub async fn measure_time<F, T>(operation_name: &str, f: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    debug!("{} completed in {:.2?}", operation_name, elapsed);

    (result, elapsed)
}

// Format a timestamp for logging
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Keeps at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// Utility to truncate long strings for logging
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    let cut = truncate_chars(s, max_chars);
    if cut.len() == s.len() {
        s.to_string()
    } else {
        format!("{}...", cut)
    }
}

/// Rough token estimate used in prompt metadata (four characters per token).
pub fn approx_token_count(text: &str) -> usize {
    text.chars().count() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_string("abcdef", 3), "abc...");
        assert_eq!(truncate_string("abc", 3), "abc");
    }

    #[test]
    fn token_estimate() {
        assert_eq!(approx_token_count(&"x".repeat(400)), 100);
    }

    #[tokio::test]
    async fn measures_future() {
        let (value, elapsed) = measure_time("noop", async { 7 }).await;
        assert_eq!(value, 7);
        assert!(elapsed < Duration::from_secs(1));
    }
}
