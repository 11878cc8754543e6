// =============================================================================
// Ingest Module
// =============================================================================
//
// The authenticated event intake path: canonical signing form, fail-fast
// validation pipeline, and the anti-manipulation gate.

pub mod canonical;
pub mod gateway;
pub mod suspicion;

pub use gateway::{IngestGateway, IngestOutcome};
