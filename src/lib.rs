//! Real-time cross-exchange arbitrage monitoring backend.
//!
//! The pipeline, end to end:
//!
//! ```text
//! venue WS → collector → symbol registry → top-of-book store
//!                                              │ change events
//!                                              ▼
//!                          detector → opportunity cache → hub → dashboard WS
//! ```
//!
//! Each module represents a well-defined responsibility:
//!
//! - `config`:    Configuration structs (JSON file + env overrides)
//! - `error`:     Typed error taxonomy
//! - `schema`:    Shared pipeline and wire message definitions
//! - `util`:      Shared helper utilities (time, gzip)
//! - `metrics`:   Global runtime counters
//! - `symbols`:   Canonical symbol registry
//! - `store`:     Shared top-of-book store
//! - `orderbook`: Per-connection book reconstruction
//! - `exchanges`: Venue adapters and adapter registry
//! - `collector`: Venue runtime (connection + subscription logic)
//! - `detector`:  Cross-venue arbitrage detection
//! - `cache`:     Opportunity dedup / TTL / best tracking
//! - `hub`:       Dashboard broadcast hub
//! - `mirror`:    Optional redis write-through of snapshots

pub mod cache;
pub mod collector;
pub mod config;
pub mod detector;
pub mod error;
pub mod exchanges;
pub mod hub;
pub mod metrics;
pub mod mirror;
pub mod orderbook;
pub mod schema;
pub mod store;
pub mod symbols;
pub mod util;
