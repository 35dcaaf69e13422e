//! Community health scores and nudges: location-based risk scores built from
//! nearby self-reports, kept fresh by long-running per-account and per-POI
//! loops that notify people when their surroundings change.

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod geo;
pub mod help;
pub mod i18n;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod notify;
pub mod nudge;
pub mod report;
pub mod runtime;
pub mod score_loop;
pub mod scoring;
pub mod store;
#[cfg(test)]
mod testing;
