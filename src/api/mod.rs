// =============================================================================
// API Module
// =============================================================================
//
// HTTP surface: signed event ingress, admin operations, public reads, the
// matching endpoints, and the WebSocket feed.

pub mod auth;
pub mod error;
pub mod rest;
pub mod ws;
