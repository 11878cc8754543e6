// =============================================================================
// Scoring Module
// =============================================================================
//
// Reality-score mechanics: lazy decay toward neutral, per-event impact cap,
// EWMA smoothing, and log-growth confidence.

pub mod reality_engine;

pub use reality_engine::{RealityEngine, ScoreView};
