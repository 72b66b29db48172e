//! Cost accounting
//!
//! Amounts are kept in nanodollars (1e-9 USD) so that repeated additions stay
//! exact; conversion to USD happens at the edges.

pub mod meter;
pub mod pricing;

pub use meter::{CostEstimate, CostMeter, ModelEstimate, SharedCostMeter};
pub use pricing::{get_pricing, ModelPricing, PricingTable};

/// Nanodollars per USD
pub const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Convert USD to nanodollars; non-finite or negative amounts become zero
pub fn usd_to_nanos(usd: f64) -> i64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * NANOS_PER_USD).round() as i64
}

/// Convert nanodollars to USD
pub fn nanos_to_usd(nanos: i64) -> f64 {
    nanos as f64 / NANOS_PER_USD
}
