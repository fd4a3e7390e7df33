pub mod chain;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod normalize;
pub mod oracle;
pub mod pipeline;
pub mod stats;
pub mod sweeper;
