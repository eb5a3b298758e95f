pub mod analyzer;
pub mod app;
pub mod cli;
pub mod config;
pub mod event;
pub mod git;
pub mod metrics;
pub mod parser;
pub mod processor;
pub mod session;
pub mod state;
pub mod store;
pub mod util;
