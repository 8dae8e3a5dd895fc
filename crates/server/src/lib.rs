//! Prediction server: HTTP surface over the resolved model

pub mod api;
pub mod config;
