//! Bucketed, condition-gated metric aggregation.
//!
//! Producers turn pulled or pushed [`sample::Sample`]s into fixed-width
//! buckets per dimension, gated by an external condition, and feed sealed
//! buckets to [`anomaly::AnomalyTracker`]s.

pub mod anomaly;
pub mod bucket;
pub mod config;
pub mod dimension;
pub mod health;
pub mod producer;
pub mod puller;
pub mod replay;
pub mod report;
pub mod sample;
