//! Client for the crop-health prediction API
//!
//! Sends a crop image to the binary, single-HLT and multi-HLT classification
//! models and reports the class confidences each one returns.

pub mod app;
pub mod client;
pub mod error;
pub mod mime;
pub mod models;

pub use error::{Error, Result};
