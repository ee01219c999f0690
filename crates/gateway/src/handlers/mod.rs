//! API handlers module

pub mod feedback;
pub mod health;
pub mod metrics;
pub mod query;
