#![forbid(unsafe_code)]

pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod fetcher;
pub mod ledger;
pub mod ledger_db;
pub mod pipeline;
pub mod progress;
