//! Event enrichment applied before a chain runs

pub mod geo;
pub mod ua;

pub use geo::{CachedGeoResolver, GeoResolver, StaticGeoResolver};
pub use ua::UserAgent;
