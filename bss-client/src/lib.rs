//! Upstream fetcher for the APS scheduling bridge.
//!
//! [`Upstream`] is the contract; [`HttpUpstream`] talks to the facility
//! services and [`StaticUpstream`] answers from memory. [`document`] turns
//! upstream JSON into the `bss-core` record model.

pub mod document;
pub mod error;
pub mod http;
pub mod upstream;

pub use error::RecordError;
pub use http::HttpUpstream;
pub use upstream::{FetchBatch, StaticUpstream, Upstream};
