//! Grid asset map engine: coordinate normalization, proximity assignment,
//! a monthly map-load quota, and differential marker reconciliation against
//! a pluggable map surface.

pub mod assign;
pub mod braille;
pub mod config;
pub mod data;
pub mod error;
pub mod geo;
pub mod map;
pub mod model;
pub mod quota;
pub mod reconcile;
pub mod session;
pub mod surface;

pub use error::GridError;
