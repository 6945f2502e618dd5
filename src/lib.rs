//! Collocation ("matchup") of pixels between A-Train satellite instruments.
//!
//! A matchup pairs each pixel of a primary instrument granule with the pixel(s)
//! of a secondary instrument that lie within a distance and time tolerance of it,
//! and writes the resulting index as a netCDF product.
pub mod accumulate;
pub mod coarse;
pub mod config;
pub mod error;
pub mod fine;
pub mod granule;
pub mod grid;
pub mod matchup;
pub mod output;
pub mod reader;
pub mod select;
pub mod utils;
