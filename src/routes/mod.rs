pub mod cards;
pub mod health;
pub mod metrics;
