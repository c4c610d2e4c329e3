pub mod config;
pub mod dedupe;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod judge;
pub mod model;
pub mod optimizer;
pub mod plan;
pub mod providers;
pub mod storage;
pub mod verdict;
