pub mod audit;
pub mod connection;
pub mod dns;
pub mod error;
pub mod import;
pub mod mapping;
pub mod metrics;
pub mod model;
pub mod parse;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod webhook;
