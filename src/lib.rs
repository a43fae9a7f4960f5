pub mod cli;
pub mod daemon;

pub mod cache;
pub mod collectors;
pub mod config;
pub mod database;
pub mod enrichment;
pub mod error;
pub mod indicators;
pub mod monitor;
pub mod processor;
pub mod sources;
pub mod utils;

#[cfg(test)]
mod test_support;
