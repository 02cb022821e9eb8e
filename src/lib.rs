//! Card identification orchestrator
//!
//! Fans scanned trading-card images out to a fast primary inference node,
//! escalates uncertain or high-value cards to a verification node, merges
//! both opinions and hands one final result per card to a persistence sink.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
