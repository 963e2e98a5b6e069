//! Client-side data cache and change-feed invalidation for a catalog storefront.

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
