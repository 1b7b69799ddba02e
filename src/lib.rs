pub mod aggregator;
pub mod api;         // HTTP routes and query validation
pub mod cache;
pub mod chain;       // RPC reads: balances, logs, pool reserves
pub mod clock;
pub mod config;
pub mod error;
pub mod holders;     // Request orchestration and pagination policy
pub mod kv;
pub mod metrics;
pub mod names;
pub mod price;
pub mod utils;
