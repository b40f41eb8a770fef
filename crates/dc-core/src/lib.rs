//! dc-core: shared foundation for the collocation workspace.
//!
//! Contains:
//! - numeric (Real + float helpers)
//! - ids (compact stable IDs for classified symbols)
//! - timing (evaluation hot-path counters)

pub mod ids;
pub mod numeric;
pub mod timing;

pub use ids::*;
pub use numeric::*;
