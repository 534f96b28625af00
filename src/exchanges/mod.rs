//! Exchange adapter registry and factory
//!
//! This module provides:
//! - Central registration of all supported venues
//! - A factory function to resolve adapters by exchange
//!
//! All venue-specific logic must live in dedicated adapter modules.
//! The rest of the application interacts exclusively through the
//! `ExchangeAdapter` trait.

pub mod adapter;
pub mod bingx;
pub mod ramzinex;
pub mod wallex;

use std::sync::Arc;

use adapter::ExchangeAdapter;

use crate::schema::Exchange;

/// Returns the adapter instance for a venue.
///
/// DESIGN:
/// - Keeps adapter creation in one place
/// - Compile-time visibility of supported venues: a new `Exchange`
///   variant will not build until it is matched here
///
/// THREADING:
/// - Adapters are wrapped in `Arc` and shared across every socket
///   task of the venue.
pub fn get_adapter(exchange: Exchange) -> Arc<dyn ExchangeAdapter> {
    match exchange {
        Exchange::Bingx => Arc::new(bingx::BingxAdapter),
        Exchange::Wallex => Arc::new(wallex::WallexAdapter),
        Exchange::Ramzinex => Arc::new(ramzinex::RamzinexAdapter),
    }
}
