// =============================================================================
// Matching Module
// =============================================================================
//
// Per-symbol in-memory limit order books with price-time priority matching,
// durable write-behind, and the pressure signal the blender consumes.

pub mod book;
pub mod engine;
pub mod pressure;

pub use book::{DepthLevel, Order, OrderBook, TopOfBook, Trade};
pub use engine::MatchingEngine;
pub use pressure::MarketPressure;
