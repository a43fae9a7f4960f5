pub mod stats;
pub mod ta;
pub mod technicals;

pub use self::technicals::{annotate, attach_market_cap, IndicatorSet};
