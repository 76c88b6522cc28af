pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod geo;
pub mod models;
pub mod observability;
pub mod state;
