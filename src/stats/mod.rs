//! Streaming statistics primitives shared by the profile layer.
//!
//! Everything here is incremental, allocation-light, and serializable to a
//! compact text form with a lossless round trip.

mod bloom;
mod ema;
mod histogram;
mod quantile;
mod running;

pub use bloom::{BloomFilter, CountingBloomFilter};
pub use ema::Ema;
pub use histogram::HourHistogram;
pub use quantile::{P2Quantile, QuantileSet};
pub use running::RunningStats;
