pub mod alerts;
pub mod cache;
pub mod config;
pub mod detection;
pub mod error;
pub mod latency;
pub mod notifier;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod resilience;
pub mod service;
pub mod simulator;
pub mod store;
pub mod throttle;
pub mod tui;
pub mod types;
pub mod web;

pub use error::{Error, Result};
